//! Video pipeline: probe → decode to frames → upscale each frame →
//! re-encode with the original audio.
//!
//! Frames live in temporary directories that are removed on every exit
//! path, success, error, or cancellation alike.

pub mod decode;
pub mod encode;
pub mod frames;
pub mod probe;
mod process;

use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::pipeline::ImagePipeline;
use crate::progress::{emit, ProgressEvent, ProgressSender, Stage};
use crate::types::{OutputFormat, VideoUpscaleRequest};

// share of overall progress given to decode / frame upscale / encode
const DECODE_WEIGHT: f32 = 0.15;
const UPSCALE_WEIGHT: f32 = 0.70;
const ENCODE_WEIGHT: f32 = 0.15;

pub struct VideoPipeline<'a> {
    frames: ImagePipeline<'a>,
}

impl<'a> VideoPipeline<'a> {
    pub fn new(frames: ImagePipeline<'a>) -> Self {
        Self { frames }
    }

    /// Returns the path of the encoded output file.
    pub fn run(
        &self,
        request: &VideoUpscaleRequest,
        progress: Option<&ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let info = probe::probe(&request.input)?;
        info!(
            input = %request.input.display(),
            width = info.width,
            height = info.height,
            fps = %info.fps,
            duration_secs = info.duration_secs,
            has_audio = info.has_audio,
            "probed input video"
        );

        let decoded_dir = tempfile::tempdir().context("failed to create frame directory")?;
        let upscaled_dir = tempfile::tempdir().context("failed to create frame directory")?;

        let decoded = decode::extract_frames(
            &request.input,
            decoded_dir.path(),
            request.hw_decode,
            info.duration_secs,
            cancel,
            |frac| {
                emit(
                    progress,
                    ProgressEvent::Progress {
                        stage: Stage::Decode,
                        overall: frac * DECODE_WEIGHT,
                    },
                );
            },
        )?;

        let mut frame_request = request.frame_options.clone();
        frame_request.inputs = decoded;
        frame_request.output_dir = upscaled_dir.path().to_path_buf();
        frame_request.format = OutputFormat::Png;

        self.run_frame_batch(&frame_request, progress, cancel)?;

        let upscaled = frames::list_frames(upscaled_dir.path())?;
        let Some(first) = upscaled.first() else {
            bail!("frame upscale produced no output");
        };
        let start_index = first
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(frames::parse_frame_index)
            .unwrap_or(1);

        let output = output_path(request)?;
        let job = encode::EncodeJob {
            frames_dir: upscaled_dir.path().to_path_buf(),
            start_index,
            fps: info.fps.clone(),
            audio_source: request.input.clone(),
            output: output.clone(),
        };
        encode::encode_video(
            &job,
            request.encoder,
            info.has_audio,
            info.duration_secs,
            cancel,
            |frac| {
                emit(
                    progress,
                    ProgressEvent::Progress {
                        stage: Stage::Encode,
                        overall: DECODE_WEIGHT + UPSCALE_WEIGHT + frac * ENCODE_WEIGHT,
                    },
                );
            },
        )?;

        info!(output = %output.display(), "video upscale complete");
        Ok(output)
    }

    /// Run the image pipeline over the frame batch, re-scaling its [0,1]
    /// progress into the middle band of the video job.
    fn run_frame_batch(
        &self,
        frame_request: &crate::types::UpscaleRequest,
        progress: Option<&ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match progress {
            None => {
                self.frames.run(frame_request, None, cancel)?;
            }
            Some(outer) => {
                let outer = outer.clone();
                let (inner_tx, inner_rx) = mpsc::channel();
                let forwarder = std::thread::spawn(move || {
                    for event in inner_rx {
                        let mapped = match event {
                            ProgressEvent::Progress { stage, overall } => ProgressEvent::Progress {
                                stage,
                                overall: DECODE_WEIGHT + overall * UPSCALE_WEIGHT,
                            },
                            other => other,
                        };
                        let _ = outer.send(mapped);
                    }
                });
                let result = self.frames.run(frame_request, Some(&inner_tx), cancel);
                drop(inner_tx);
                let _ = forwarder.join();
                result?;
            }
        }
        Ok(())
    }
}

fn output_path(request: &VideoUpscaleRequest) -> Result<PathBuf> {
    let stem = request
        .input
        .file_stem()
        .context("input video has no file name")?;
    let dir = &request.frame_options.output_dir;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory: {}", dir.display()))?;
    let mut name = stem.to_os_string();
    name.push(".mp4");
    Ok(dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_weights_cover_unit_interval() {
        assert!((DECODE_WEIGHT + UPSCALE_WEIGHT + ENCODE_WEIGHT - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_upscale_band_mapping() {
        let mapped = |overall: f32| DECODE_WEIGHT + overall * UPSCALE_WEIGHT;
        assert_eq!(mapped(0.0), 0.15);
        assert!((mapped(1.0) - 0.85).abs() < 1e-6);
        assert!((mapped(0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_output_path_uses_input_stem() {
        let dir = tempfile::tempdir().unwrap();
        let request = VideoUpscaleRequest {
            input: PathBuf::from("/media/clip.mkv"),
            frame_options: crate::types::UpscaleRequest::new(
                vec![],
                dir.path().to_path_buf(),
                2,
                "general-x2".into(),
            ),
            hw_decode: false,
            encoder: crate::types::EncoderPreference::Auto,
        };
        let path = output_path(&request).unwrap();
        assert_eq!(path, dir.path().join("clip.mp4"));
    }
}
