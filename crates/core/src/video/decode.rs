//! Frame extraction: one PNG per frame into a working directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{frames, process};

/// Decode every frame of `input` into `frames_dir` following the
/// [`frames`] naming convention. `duration_secs` (from the probe) drives
/// the progress fraction; 0 disables it. Returns the extracted frame
/// paths in order.
pub fn extract_frames(
    input: &Path,
    frames_dir: &Path,
    hw_decode: bool,
    duration_secs: f64,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(f32),
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(frames_dir)?;

    let mut args: Vec<String> = vec!["-nostdin".into(), "-y".into()];
    if hw_decode {
        args.push("-hwaccel".into());
        args.push("auto".into());
    }
    args.push("-i".into());
    args.push(input.to_string_lossy().into_owned());
    args.push("-fps_mode".into());
    args.push("passthrough".into());
    args.push("-progress".into());
    args.push("pipe:1".into());
    args.push(
        frames_dir
            .join(frames::frame_pattern())
            .to_string_lossy()
            .into_owned(),
    );

    process::run_ffmpeg_with_progress(&args, cancel, |key, value| {
        if let Some(elapsed) = process::progress_elapsed_secs(key, value) {
            if duration_secs > 0.0 {
                on_progress((elapsed / duration_secs).clamp(0.0, 1.0) as f32);
            }
        }
    })?;

    let extracted = frames::list_frames(frames_dir)?;
    if extracted.is_empty() {
        bail!("decoder produced no frames from {}", input.display());
    }
    info!(
        input = %input.display(),
        frames = extracted.len(),
        "frame extraction complete"
    );
    Ok(extracted)
}
