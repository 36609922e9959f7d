//! Image batch pipeline: Load → (Denoise) → Split → Infer → Merge →
//! (RefineFaces) → (TemporalBlend) → Save, per input, in request order.
//!
//! A single item failure fails the whole batch; outputs already written
//! stay on disk. Cancellation is observed once per item at the top of the
//! loop and per tile inside inference.

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::UpscaleEngine;
use crate::error::Canceled;
use crate::face::FaceRefiner;
use crate::imageio;
use crate::progress::{emit, ProgressEvent, ProgressSender, Stage};
use crate::tiling::{split_tiles, TileMerger};
use crate::types::{PixelTensor, UpscaleRequest, UpscaleResult};

pub struct ImagePipeline<'a> {
    engine: &'a UpscaleEngine,
    refiner: Option<&'a FaceRefiner>,
}

impl<'a> ImagePipeline<'a> {
    pub fn new(engine: &'a UpscaleEngine) -> Self {
        Self {
            engine,
            refiner: None,
        }
    }

    pub fn with_refiner(mut self, refiner: &'a FaceRefiner) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn run(
        &self,
        request: &UpscaleRequest,
        progress: Option<&ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<UpscaleResult> {
        if request.inputs.is_empty() {
            bail!("no input files");
        }
        std::fs::create_dir_all(&request.output_dir).with_context(|| {
            format!(
                "failed to create output directory: {}",
                request.output_dir.display()
            )
        })?;

        if self.engine.cpu_fallback() {
            emit(
                progress,
                ProgressEvent::Warning("GPU unavailable — running inference on CPU".into()),
            );
        }

        let tile_size = match request.tile_size {
            0 => self.engine.preferred_tile_size().unwrap_or(0),
            explicit => explicit,
        };

        let total = request.inputs.len();
        let mut result = UpscaleResult::default();
        let mut previous: Option<PixelTensor> = None;

        for (index, input) in request.inputs.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(anyhow::Error::new(Canceled));
            }

            let report = |stage: Stage, item_frac: f32| {
                emit(
                    progress,
                    ProgressEvent::Progress {
                        stage,
                        overall: (index as f32 + item_frac) / total as f32,
                    },
                );
            };

            let mut tensor = imageio::load(input)?;
            report(Stage::Load, 0.0);

            if let Some(crop) = &request.crop {
                if crop.x + crop.width <= tensor.width && crop.y + crop.height <= tensor.height {
                    tensor = tensor.crop(crop);
                } else {
                    bail!(
                        "preview crop {crop:?} exceeds image bounds {}x{}",
                        tensor.width,
                        tensor.height
                    );
                }
            }

            if let Some(strength) = request.denoise {
                if strength > 0.0 {
                    tensor = denoise(&tensor, strength.min(1.0));
                    report(Stage::Denoise, 0.0);
                }
            }

            let tiles = split_tiles(&tensor, tile_size, request.tile_overlap);
            report(Stage::Split, 0.0);

            // tile-at-a-time so progress and cancellation both stay at tile
            // granularity
            let mut out_tiles = Vec::with_capacity(tiles.len());
            let mut ratio = 1.0f32;
            for (done, tile) in tiles.iter().enumerate() {
                let batch = self.engine.infer(std::slice::from_ref(tile), cancel)?;
                ratio = batch.ratio;
                out_tiles.extend(batch.tiles);
                report(Stage::Infer, (done + 1) as f32 / tiles.len().max(1) as f32);
            }

            if (ratio - request.scale as f32).abs() > f32::EPSILON {
                warn!(
                    nominal = request.scale,
                    actual = ratio,
                    "model output ratio differs from requested scale — using model ratio"
                );
            }

            let out_w = (tensor.width as f32 * ratio).round() as u32;
            let out_h = (tensor.height as f32 * ratio).round() as u32;
            let out_overlap = (request.tile_overlap as f32 * ratio).round() as u32;
            let mut merger = TileMerger::new(out_w, out_h, out_overlap);
            for tile in &out_tiles {
                merger.add(tile);
            }
            let mut output = merger.finish();
            output.icc_profile = tensor.icc_profile.clone();
            report(Stage::Merge, 1.0);

            if request.refine_faces {
                if let Some(refiner) = self.refiner {
                    refiner.refine_image(&mut output, &tensor, ratio);
                    report(Stage::RefineFaces, 1.0);
                }
            }

            if let Some(alpha) = request.temporal_blend {
                if let Some(prev) = &previous {
                    match temporal_blend(&output, prev, alpha) {
                        Some(blended) => {
                            output = blended;
                            report(Stage::TemporalBlend, 1.0);
                        }
                        None => {
                            let msg = format!(
                                "temporal blend skipped: size {}x{} does not match previous {}x{}",
                                output.width, output.height, prev.width, prev.height
                            );
                            warn!("{msg}");
                            emit(progress, ProgressEvent::Warning(msg));
                        }
                    }
                }
            }

            let out_path = imageio::output_path(input, &request.output_dir, request.format);
            imageio::save(&output, &out_path, request.encode_quality)?;
            report(Stage::Save, 1.0);

            debug!(
                input = %input.display(),
                output = %out_path.display(),
                "item complete"
            );

            if request.temporal_blend.is_some() {
                previous = Some(output);
            }
            result.outputs.push(out_path);
        }

        info!(items = total, "upscale batch complete");
        Ok(result)
    }
}

/// Mild 3×3 smoothing mixed in by `strength` (0 = identity, 1 = full mean).
pub fn denoise(tensor: &PixelTensor, strength: f32) -> PixelTensor {
    let mut out = tensor.clone();
    if tensor.width < 3 || tensor.height < 3 {
        return out;
    }
    for c in 0..3 {
        for y in 0..tensor.height {
            for x in 0..tensor.width {
                let mut sum = 0.0;
                let mut count = 0.0;
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let nx = x as i64 + dx;
                        let ny = y as i64 + dy;
                        if nx >= 0 && ny >= 0 && nx < tensor.width as i64 && ny < tensor.height as i64
                        {
                            sum += tensor.get(nx as u32, ny as u32, c);
                            count += 1.0;
                        }
                    }
                }
                let mean = sum / count;
                let v = tensor.get(x, y, c);
                out.set(x, y, c, v * (1.0 - strength) + mean * strength);
            }
        }
    }
    out
}

/// `current * (1 - alpha) + previous * alpha`; `None` when dimensions
/// differ (the caller skips blending with a warning, never an error).
pub fn temporal_blend(current: &PixelTensor, previous: &PixelTensor, alpha: f32) -> Option<PixelTensor> {
    if current.width != previous.width || current.height != previous.height {
        return None;
    }
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = current.clone();
    for (o, p) in out.data.iter_mut().zip(previous.data.iter()) {
        *o = *o * (1.0 - alpha) + *p * alpha;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_with(width: u32, height: u32, fill: f32) -> PixelTensor {
        let mut t = PixelTensor::new(width, height);
        t.data.fill(fill);
        t
    }

    #[test]
    fn test_temporal_blend_alpha_zero_keeps_current() {
        let current = tensor_with(4, 4, 0.8);
        let previous = tensor_with(4, 4, 0.2);
        let out = temporal_blend(&current, &previous, 0.0).unwrap();
        assert_eq!(out.data, current.data);
    }

    #[test]
    fn test_temporal_blend_alpha_one_keeps_previous() {
        let current = tensor_with(4, 4, 0.8);
        let previous = tensor_with(4, 4, 0.2);
        let out = temporal_blend(&current, &previous, 1.0).unwrap();
        assert_eq!(out.data, previous.data);
    }

    #[test]
    fn test_temporal_blend_mismatched_sizes_skip() {
        let current = tensor_with(4, 4, 0.8);
        let previous = tensor_with(5, 4, 0.2);
        assert!(temporal_blend(&current, &previous, 0.5).is_none());
    }

    #[test]
    fn test_denoise_zero_strength_is_identity() {
        let mut t = PixelTensor::new(5, 5);
        t.set(2, 2, 0, 1.0);
        let out = denoise(&t, 0.0);
        assert_eq!(out.data, t.data);
    }

    #[test]
    fn test_denoise_smooths_spike() {
        let mut t = PixelTensor::new(5, 5);
        t.set(2, 2, 0, 1.0);
        let out = denoise(&t, 1.0);
        assert!(out.get(2, 2, 0) < 1.0);
        assert!(out.get(1, 2, 0) > 0.0);
    }

    #[test]
    fn test_denoise_constant_image_unchanged() {
        let t = tensor_with(6, 6, 0.4);
        let out = denoise(&t, 0.7);
        for v in &out.data {
            assert!((v - 0.4).abs() < 1e-6);
        }
    }

    #[test]
    fn test_overall_progress_math() {
        // (completed items + fractional) / total
        let overall = |index: usize, frac: f32, total: usize| (index as f32 + frac) / total as f32;
        assert_eq!(overall(0, 0.0, 4), 0.0);
        assert_eq!(overall(1, 0.5, 4), 0.375);
        assert_eq!(overall(3, 1.0, 4), 1.0);
    }
}
