//! Core crate: ONNX super-resolution for images and video.

pub mod config;
pub mod engine;
pub mod error;
pub mod face;
pub mod imageio;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod runtime;
pub mod tiling;
pub mod types;
pub mod video;
