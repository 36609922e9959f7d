//! Re-encode upscaled frames, muxing audio back in from the source.
//!
//! Two fallback chains, tried as a grid: the preferred hardware encoder
//! falls back to software exactly once, and audio passthrough falls back
//! to AAC re-encode, then to dropping the track. Cancellation short
//! circuits the whole grid.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{frames, process};
use crate::error::is_canceled;
use crate::types::EncoderPreference;

pub const SOFTWARE_ENCODER: &str = "libx264";

pub fn encoder_id(preference: EncoderPreference) -> &'static str {
    match preference {
        EncoderPreference::Auto | EncoderPreference::Nvenc => "h264_nvenc",
        EncoderPreference::Qsv => "h264_qsv",
        EncoderPreference::Software => SOFTWARE_ENCODER,
    }
}

/// Preferred encoder first, software second; software is never listed
/// twice.
pub fn encoder_chain(preference: EncoderPreference) -> Vec<&'static str> {
    let chosen = encoder_id(preference);
    if chosen == SOFTWARE_ENCODER {
        vec![SOFTWARE_ENCODER]
    } else {
        vec![chosen, SOFTWARE_ENCODER]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    Copy,
    Aac,
    Drop,
}

impl std::fmt::Display for AudioMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioMode::Copy => write!(f, "copy"),
            AudioMode::Aac => write!(f, "aac"),
            AudioMode::Drop => write!(f, "drop"),
        }
    }
}

pub fn audio_chain(has_audio: bool) -> Vec<AudioMode> {
    if has_audio {
        vec![AudioMode::Copy, AudioMode::Aac, AudioMode::Drop]
    } else {
        vec![AudioMode::Drop]
    }
}

/// Walk the encoder × audio fallback grid until one attempt succeeds.
/// Returns the winning combination. Cancellation aborts immediately; any
/// other failure logs and moves on, and the last error is returned when
/// the grid is exhausted.
pub fn encode_with_fallback(
    preference: EncoderPreference,
    has_audio: bool,
    mut attempt: impl FnMut(&'static str, AudioMode) -> Result<()>,
) -> Result<(&'static str, AudioMode)> {
    let mut last_err = None;
    for encoder in encoder_chain(preference) {
        for audio in audio_chain(has_audio) {
            match attempt(encoder, audio) {
                Ok(()) => return Ok((encoder, audio)),
                Err(err) if is_canceled(&err) => return Err(err),
                Err(err) => {
                    warn!(%encoder, %audio, error = %err, "encode attempt failed");
                    last_err = Some(err);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no encoder available")))
}

pub struct EncodeJob {
    pub frames_dir: PathBuf,
    pub start_index: u64,
    /// Rational frame rate string from the probe, e.g. `24000/1001`.
    pub fps: String,
    /// Original video, used as the audio source when muxing.
    pub audio_source: PathBuf,
    pub output: PathBuf,
}

impl EncodeJob {
    fn build_args(&self, encoder: &str, audio: AudioMode) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-framerate".into(),
            self.fps.clone(),
            "-start_number".into(),
            self.start_index.to_string(),
            "-i".into(),
            self.frames_dir
                .join(frames::frame_pattern())
                .to_string_lossy()
                .into_owned(),
        ];
        if audio != AudioMode::Drop {
            args.push("-i".into());
            args.push(self.audio_source.to_string_lossy().into_owned());
        }
        args.push("-map".into());
        args.push("0:v:0".into());
        match audio {
            AudioMode::Copy => {
                args.push("-map".into());
                args.push("1:a?".into());
                args.push("-c:a".into());
                args.push("copy".into());
            }
            AudioMode::Aac => {
                args.push("-map".into());
                args.push("1:a?".into());
                args.push("-c:a".into());
                args.push("aac".into());
                args.push("-b:a".into());
                args.push("192k".into());
            }
            AudioMode::Drop => {
                args.push("-an".into());
            }
        }
        args.push("-c:v".into());
        args.push(encoder.into());
        match encoder {
            "h264_nvenc" => {
                args.extend(["-preset".into(), "p5".into(), "-cq".into(), "19".into()]);
            }
            "h264_qsv" => {
                args.extend(["-global_quality".into(), "19".into()]);
            }
            _ => {
                args.extend([
                    "-preset".into(),
                    "medium".into(),
                    "-crf".into(),
                    "18".into(),
                ]);
            }
        }
        args.push("-pix_fmt".into());
        args.push("yuv420p".into());
        args.push("-progress".into());
        args.push("pipe:1".into());
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Encode `job` with the fallback grid, reporting progress as a fraction
/// of `duration_secs`.
pub fn encode_video(
    job: &EncodeJob,
    preference: EncoderPreference,
    has_audio: bool,
    duration_secs: f64,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(f32),
) -> Result<(&'static str, AudioMode)> {
    let (encoder, audio) = encode_with_fallback(preference, has_audio, |encoder, audio| {
        let args = job.build_args(encoder, audio);
        process::run_ffmpeg_with_progress(&args, cancel, |key, value| {
            if let Some(elapsed) = process::progress_elapsed_secs(key, value) {
                if duration_secs > 0.0 {
                    on_progress((elapsed / duration_secs).clamp(0.0, 1.0) as f32);
                }
            }
        })
    })?;
    info!(
        %encoder,
        %audio,
        output = %job.output.display(),
        "encode complete"
    );
    Ok((encoder, audio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Canceled;

    fn job() -> EncodeJob {
        EncodeJob {
            frames_dir: PathBuf::from("/work/out"),
            start_index: 1,
            fps: "24000/1001".into(),
            audio_source: PathBuf::from("/in/clip.mkv"),
            output: PathBuf::from("/out/clip.mp4"),
        }
    }

    #[test]
    fn test_encoder_id_mapping() {
        assert_eq!(encoder_id(EncoderPreference::Auto), "h264_nvenc");
        assert_eq!(encoder_id(EncoderPreference::Nvenc), "h264_nvenc");
        assert_eq!(encoder_id(EncoderPreference::Qsv), "h264_qsv");
        assert_eq!(encoder_id(EncoderPreference::Software), "libx264");
    }

    #[test]
    fn test_encoder_chain_dedupes_software() {
        assert_eq!(encoder_chain(EncoderPreference::Software), vec!["libx264"]);
        assert_eq!(
            encoder_chain(EncoderPreference::Nvenc),
            vec!["h264_nvenc", "libx264"]
        );
    }

    #[test]
    fn test_audio_chain() {
        assert_eq!(
            audio_chain(true),
            vec![AudioMode::Copy, AudioMode::Aac, AudioMode::Drop]
        );
        assert_eq!(audio_chain(false), vec![AudioMode::Drop]);
    }

    #[test]
    fn test_fallback_software_tried_exactly_once() {
        let mut attempts = Vec::new();
        let result = encode_with_fallback(EncoderPreference::Nvenc, false, |enc, audio| {
            attempts.push((enc, audio));
            if enc == "h264_nvenc" {
                Err(anyhow!("no nvenc device"))
            } else {
                Ok(())
            }
        });
        assert_eq!(result.unwrap(), ("libx264", AudioMode::Drop));
        assert_eq!(
            attempts,
            vec![
                ("h264_nvenc", AudioMode::Drop),
                ("libx264", AudioMode::Drop)
            ]
        );
    }

    #[test]
    fn test_fallback_audio_copy_to_aac() {
        let mut attempts = Vec::new();
        let result = encode_with_fallback(EncoderPreference::Software, true, |enc, audio| {
            attempts.push((enc, audio));
            if audio == AudioMode::Copy {
                Err(anyhow!("codec not supported in mp4"))
            } else {
                Ok(())
            }
        });
        assert_eq!(result.unwrap(), ("libx264", AudioMode::Aac));
        assert_eq!(attempts.len(), 2);
    }

    #[test]
    fn test_fallback_exhausted_returns_last_error() {
        let result = encode_with_fallback(EncoderPreference::Nvenc, true, |_, _| {
            Err(anyhow!("boom"))
        });
        assert!(result.is_err());
        assert!(!is_canceled(&result.unwrap_err()));
    }

    #[test]
    fn test_fallback_cancel_stops_immediately() {
        let mut attempts = 0;
        let result = encode_with_fallback(EncoderPreference::Nvenc, true, |_, _| {
            attempts += 1;
            Err(anyhow::Error::new(Canceled))
        });
        assert!(is_canceled(&result.unwrap_err()));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_build_args_copy_audio() {
        let args = job().build_args("h264_nvenc", AudioMode::Copy);
        let has = |flag: &str| args.iter().any(|a| a == flag);
        assert!(has("-framerate"));
        assert!(args.contains(&"/work/out/frame_%08d.png".to_string()));
        assert!(args.contains(&"/in/clip.mkv".to_string()));
        assert!(has("copy"));
        assert!(has("h264_nvenc"));
        assert!(has("yuv420p"));
        assert!(!has("-an"));
    }

    #[test]
    fn test_build_args_drop_audio_has_single_input() {
        let args = job().build_args("libx264", AudioMode::Drop);
        let inputs = args.iter().filter(|a| *a == "-i").count();
        assert_eq!(inputs, 1);
        assert!(args.iter().any(|a| a == "-an"));
        assert!(args.iter().any(|a| a == "-crf"));
    }
}
