//! Inference engine adapter: cached ort sessions, model metadata, and
//! per-tile super-resolution execution.
//!
//! Sessions are cached per model file path and shared across requests; the
//! cache is the only cross-request state in the process and is released
//! explicitly on shutdown or model change.

pub mod backend;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD};
use ort::{session::Session, value::Tensor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Canceled;
use crate::types::Tile;

use backend::{build_session, InferenceBackend, SessionConfig};

/// Tensor names and declared shapes read from the session once at load.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub input_name: String,
    pub output_names: Vec<String>,
    pub is_fp16: bool,
    /// Declared input dims, NCHW; -1 for dynamic axes.
    pub input_dims: Vec<i64>,
}

#[derive(Debug)]
struct SessionEntry {
    session: Mutex<Session>,
    meta: ModelMeta,
    cpu_fallback: bool,
}

fn session_cache() -> &'static DashMap<PathBuf, Arc<SessionEntry>> {
    static CACHE: OnceLock<DashMap<PathBuf, Arc<SessionEntry>>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Drop every cached session. Called on application shutdown.
pub fn clear_sessions() {
    let cache = session_cache();
    let count = cache.len();
    cache.clear();
    if count > 0 {
        info!(count, "released all cached inference sessions");
    }
}

fn extract_meta(session: &Session) -> Result<ModelMeta> {
    let inputs = session.inputs();
    let outputs = session.outputs();
    if inputs.is_empty() || outputs.is_empty() {
        bail!("model must have at least one input and one output tensor");
    }

    let input_name = inputs[0].name().to_string();
    let output_names = outputs.iter().map(|o| o.name().to_string()).collect();

    let (is_fp16, input_dims) = match inputs[0].dtype() {
        ort::value::ValueType::Tensor { ty, shape, .. } => {
            let dims: Vec<i64> = shape.iter().copied().collect();
            (*ty == ort::tensor::TensorElementType::Float16, dims)
        }
        other => bail!("expected tensor input, got {other:?}"),
    };

    Ok(ModelMeta {
        input_name,
        output_names,
        is_fp16,
        input_dims,
    })
}

/// A cached session handle usable by any network in the app (super-res,
/// face detector, face refiner). Inputs and outputs are NCHW f32 in the
/// model's native value range; FP16 models are converted transparently.
#[derive(Clone, Debug)]
pub struct NetSession {
    model_path: PathBuf,
    entry: Arc<SessionEntry>,
}

impl NetSession {
    pub fn load(
        model_path: &Path,
        backend: InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        if !model_path.is_file() {
            bail!("model file not found: {}", model_path.display());
        }

        if let Some(entry) = session_cache().get(model_path) {
            debug!(model = %model_path.display(), "session cache hit");
            return Ok(Self {
                model_path: model_path.to_path_buf(),
                entry: entry.clone(),
            });
        }

        let built = build_session(&SessionConfig {
            model_path,
            backend,
            trt_cache_dir,
        })?;
        let meta = extract_meta(&built.session)?;
        debug!(
            model = %model_path.display(),
            input = %meta.input_name,
            outputs = meta.output_names.len(),
            is_fp16 = meta.is_fp16,
            cpu_fallback = built.cpu_fallback,
            "session loaded"
        );

        let entry = Arc::new(SessionEntry {
            session: Mutex::new(built.session),
            meta,
            cpu_fallback: built.cpu_fallback,
        });
        session_cache().insert(model_path.to_path_buf(), entry.clone());
        Ok(Self {
            model_path: model_path.to_path_buf(),
            entry,
        })
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.entry.meta
    }

    /// True when the accelerated backend was unavailable and this session
    /// executes on CPU. A status for the caller to surface, not an error.
    pub fn cpu_fallback(&self) -> bool {
        self.entry.cpu_fallback
    }

    /// Declared static spatial input size, when the model has one.
    pub fn input_hw(&self) -> Option<(u32, u32)> {
        let dims = &self.entry.meta.input_dims;
        if dims.len() == 4 && dims[2] > 0 && dims[3] > 0 {
            Some((dims[2] as u32, dims[3] as u32))
        } else {
            None
        }
    }

    /// Pixel value scale of the model: FP16 models take [0,1], FP32 models
    /// take [0,255] (Real-ESRGAN convention).
    pub fn value_scale(&self) -> f32 {
        if self.entry.meta.is_fp16 {
            1.0
        } else {
            255.0
        }
    }

    /// Remove this model's entry from the shared cache. Other live handles
    /// keep their session until dropped.
    pub fn release(self) {
        session_cache().remove(&self.model_path);
        debug!(model = %self.model_path.display(), "session released from cache");
    }

    /// Run one NCHW f32 batch through the model; returns all outputs in
    /// declared order, converted back to f32.
    pub fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let meta = &self.entry.meta;
        let mut session = self.entry.session.lock().unwrap();

        if meta.is_fp16 {
            let f32_slice = input
                .as_slice()
                .context("input must be contiguous for f16 conversion")?;
            let mut f16_data = vec![f16::ZERO; f32_slice.len()];
            f16_data.convert_from_f32_slice(f32_slice);
            let f16_array = ArrayD::from_shape_vec(input.shape().to_vec(), f16_data)?;
            let tensor = Tensor::from_array(f16_array)?;
            let outputs = session.run(ort::inputs![meta.input_name.as_str() => &tensor])?;

            meta.output_names
                .iter()
                .map(|name| {
                    let view = outputs[name.as_str()].try_extract_array::<f16>()?;
                    let owned;
                    let slice = if let Some(s) = view.as_slice() {
                        s
                    } else {
                        owned = view.as_standard_layout().into_owned();
                        owned.as_slice().unwrap()
                    };
                    let mut f32_data = vec![0.0f32; slice.len()];
                    slice.convert_to_f32_slice(&mut f32_data);
                    Ok(ArrayD::from_shape_vec(view.shape().to_vec(), f32_data)?)
                })
                .collect()
        } else {
            let tensor = Tensor::from_array(input)?;
            let outputs = session.run(ort::inputs![meta.input_name.as_str() => &tensor])?;

            meta.output_names
                .iter()
                .map(|name| {
                    let view = outputs[name.as_str()].try_extract_array::<f32>()?;
                    Ok(view.to_owned())
                })
                .collect()
        }
    }
}

/// Output tiles of one inference batch plus the pixel ratio the model
/// actually produced. The merger must trust this ratio, not the request's
/// nominal scale: fixed-ratio models may disagree with the request.
pub struct InferredBatch {
    pub tiles: Vec<Tile>,
    pub ratio: f32,
}

/// Super-resolution adapter over a cached [`NetSession`].
pub struct UpscaleEngine {
    net: NetSession,
}

impl UpscaleEngine {
    pub fn load(
        model_path: &Path,
        backend: InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        Ok(Self {
            net: NetSession::load(model_path, backend, trt_cache_dir)?,
        })
    }

    pub fn cpu_fallback(&self) -> bool {
        self.net.cpu_fallback()
    }

    /// Tile size derived from the model's declared square input, when the
    /// declared height equals the declared width. Otherwise the caller's
    /// tile size is authoritative.
    pub fn preferred_tile_size(&self) -> Option<u32> {
        preferred_tile_size_from_dims(&self.net.meta().input_dims)
    }

    pub fn release(self) {
        self.net.release();
    }

    /// Run each tile through the model sequentially. Cancellation is
    /// checked between tiles; a mid-batch cancellation discards all partial
    /// output.
    pub fn infer(&self, tiles: &[Tile], cancel: &CancellationToken) -> Result<InferredBatch> {
        let value_scale = self.net.value_scale();
        let mut out_tiles = Vec::with_capacity(tiles.len());
        let mut ratio: Option<f32> = None;

        for tile in tiles {
            if cancel.is_cancelled() {
                return Err(anyhow::Error::new(Canceled));
            }

            let h = tile.height as usize;
            let w = tile.width as usize;
            let scaled: Vec<f32> = tile.data.iter().map(|&v| v * value_scale).collect();
            let input = Array4::from_shape_vec((1, 3, h, w), scaled)
                .context("tile buffer does not match its declared size")?;

            let outputs = self.net.run(input)?;
            let output = outputs
                .into_iter()
                .next()
                .context("model produced no output tensor")?;

            let shape = output.shape().to_vec();
            if shape.len() != 4 || shape[1] != 3 {
                bail!("expected NCHW RGB output, got shape {shape:?}");
            }
            let (out_h, out_w) = (shape[2], shape[3]);
            let tile_ratio = out_h as f32 / h as f32;
            match ratio {
                None => ratio = Some(tile_ratio),
                Some(r) if (r - tile_ratio).abs() > f32::EPSILON => {
                    warn!(r, tile_ratio, "model output ratio changed between tiles");
                }
                _ => {}
            }

            let mut out = Tile::new(
                (tile.x as f32 * tile_ratio).round() as u32,
                (tile.y as f32 * tile_ratio).round() as u32,
                out_w as u32,
                out_h as u32,
            );
            let contiguous;
            let slice = if let Some(s) = output.as_slice() {
                s
            } else {
                contiguous = output.as_standard_layout().into_owned();
                contiguous.as_slice().unwrap()
            };
            for (dst, &src) in out.data.iter_mut().zip(slice.iter()) {
                *dst = (src / value_scale).clamp(0.0, 1.0);
            }
            out_tiles.push(out);
        }

        Ok(InferredBatch {
            tiles: out_tiles,
            ratio: ratio.unwrap_or(1.0),
        })
    }
}

fn preferred_tile_size_from_dims(dims: &[i64]) -> Option<u32> {
    if dims.len() == 4 && dims[2] > 0 && dims[2] == dims[3] {
        Some(dims[2] as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_tile_size_square_static() {
        assert_eq!(preferred_tile_size_from_dims(&[1, 3, 128, 128]), Some(128));
    }

    #[test]
    fn test_preferred_tile_size_dynamic_or_rectangular() {
        assert_eq!(preferred_tile_size_from_dims(&[1, 3, -1, -1]), None);
        assert_eq!(preferred_tile_size_from_dims(&[1, 3, 128, 256]), None);
        assert_eq!(preferred_tile_size_from_dims(&[1, 3]), None);
    }

    #[test]
    fn test_missing_model_file_is_fatal() {
        let err = NetSession::load(
            Path::new("/nonexistent/model.onnx"),
            InferenceBackend::Cpu,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("model file not found"));
    }
}
