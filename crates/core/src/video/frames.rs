//! Frame file naming convention shared by the decoder and encoder.
//!
//! Frames are `frame_NNNNNNNN.png` with an 8-digit zero-padded index, so
//! lexicographic order equals frame order and the encoder can recover the
//! starting index from the first file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const FRAME_PREFIX: &str = "frame_";
pub const FRAME_DIGITS: usize = 8;
pub const FRAME_EXT: &str = "png";

pub fn frame_filename(index: u64) -> String {
    format!("{FRAME_PREFIX}{index:0width$}.{FRAME_EXT}", width = FRAME_DIGITS)
}

/// ffmpeg image2 pattern matching [`frame_filename`].
pub fn frame_pattern() -> String {
    format!("{FRAME_PREFIX}%0{FRAME_DIGITS}d.{FRAME_EXT}")
}

/// Recover the index from a frame filename; `None` for anything that does
/// not follow the convention.
pub fn parse_frame_index(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(FRAME_PREFIX)?
        .strip_suffix(&format!(".{FRAME_EXT}"))?;
    if digits.len() != FRAME_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// All frame files in `dir`, ordered by index. Non-conforming files are
/// ignored.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<(u64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read frame directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if let Some(index) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_frame_index)
        {
            frames.push((index, path));
        }
    }
    frames.sort_by_key(|(index, _)| *index);
    Ok(frames.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_round_trip() {
        let name = frame_filename(42);
        assert_eq!(name, "frame_00000042.png");
        assert_eq!(parse_frame_index(&name), Some(42));
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert_eq!(parse_frame_index("frame_0001.png"), None);
        assert_eq!(parse_frame_index("frame_0000004x.png"), None);
        assert_eq!(parse_frame_index("other_00000001.png"), None);
        assert_eq!(parse_frame_index("frame_00000001.jpg"), None);
    }

    #[test]
    fn test_pattern_matches_convention() {
        assert_eq!(frame_pattern(), "frame_%08d.png");
    }

    #[test]
    fn test_list_frames_ordered_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for index in [3u64, 1, 2] {
            std::fs::write(dir.path().join(frame_filename(index)), b"x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let frames = list_frames(dir.path()).unwrap();
        let names: Vec<_> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["frame_00000001.png", "frame_00000002.png", "frame_00000003.png"]
        );
    }
}
