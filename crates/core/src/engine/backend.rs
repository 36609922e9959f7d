//! ort session construction: CUDA/TensorRT execution providers with a CPU
//! fallback that is reported as a status, never as an error.

use std::path::Path;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, warn};

/// Inference backend selection. `Tensorrt` requires the TensorRT runtime
/// libraries; if unavailable the session falls back to CUDA, and if CUDA
/// initialization fails the build retries on CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Unknown values mean `Cuda`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }

    /// `Fast` trades startup time for throughput via the TensorRT engine
    /// cache; the other modes run on the CUDA EP directly.
    pub fn for_quality(quality: crate::types::QualityMode) -> Self {
        match quality {
            crate::types::QualityMode::Fast => Self::Tensorrt,
            crate::types::QualityMode::Balanced | crate::types::QualityMode::Quality => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// A built session plus whether the requested accelerator was unavailable
/// and the session runs on CPU instead.
pub struct BuiltSession {
    pub session: Session,
    pub cpu_fallback: bool,
}

/// Build a session for `config.backend`, falling back to CPU execution when
/// accelerator initialization fails. The fallback is recorded on the result
/// so callers can surface it to the user; it is not an error.
pub fn build_session(config: &SessionConfig<'_>) -> Result<BuiltSession> {
    if config.backend == InferenceBackend::Cpu {
        return Ok(BuiltSession {
            session: build_cpu(config.model_path)?,
            cpu_fallback: false,
        });
    }

    match build_accelerated(config) {
        Ok(session) => Ok(BuiltSession {
            session,
            cpu_fallback: false,
        }),
        Err(e) => {
            warn!(
                backend = %config.backend,
                model = %config.model_path.display(),
                error = %e,
                "accelerated session initialization failed — falling back to CPU"
            );
            Ok(BuiltSession {
                session: build_cpu(config.model_path)?,
                cpu_fallback: true,
            })
        }
    }
}

fn builder() -> Result<ort::session::builder::SessionBuilder> {
    Ok(Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?)
}

fn build_cpu(model_path: &Path) -> Result<Session> {
    debug!(backend = "cpu", "building session");
    builder()?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
}

fn build_accelerated(config: &SessionConfig<'_>) -> Result<Session> {
    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config.trt_cache_dir.unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(dir = %cache_dir.display(), error = %e, "failed to create TRT cache directory");
            }
            let cache_path = cache_dir.to_string_lossy().to_string();

            debug!(
                backend = "tensorrt",
                cache_dir = %cache_dir.display(),
                "building session with TensorRT EP (CUDA EP fallback)"
            );

            // TRT EP may fail at runtime when libnvinfer is not installed;
            // the CUDA EP in the chain keeps inference on the GPU.
            builder()?
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cuda | InferenceBackend::Cpu => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                anyhow::bail!("CUDA EP is not available");
            }

            debug!(backend = "cuda", "building session with CUDA EP");

            builder()?
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("failed to load ONNX model: {}", config.model_path.display())
                })?
        }
    };

    Ok(session)
}
