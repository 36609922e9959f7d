//! Shared pixel-buffer and request types.
//!
//! All image data moves through the pipeline as [`PixelTensor`]: three
//! contiguous channel planes (R, G, B), each `width * height` f32 values
//! normalized to [0,1].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Planar RGB float image.
#[derive(Clone)]
pub struct PixelTensor {
    pub width: u32,
    pub height: u32,
    /// R plane, then G plane, then B plane; `width * height * 3` values in [0,1].
    pub data: Vec<f32>,
    /// Opaque color-profile bytes carried through to the encoder untouched.
    pub icc_profile: Option<Vec<u8>>,
}

impl PixelTensor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize * 3],
            icc_profile: None,
        }
    }

    pub fn plane_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Sample one channel at (x, y). Caller guarantees bounds.
    #[inline]
    pub fn get(&self, x: u32, y: u32, channel: usize) -> f32 {
        let plane = self.plane_len();
        self.data[channel * plane + y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, channel: usize, value: f32) {
        let plane = self.plane_len();
        let w = self.width as usize;
        self.data[channel * plane + y as usize * w + x as usize] = value;
    }

    /// Copy out a sub-rectangle. Must lie fully inside the tensor.
    pub fn crop(&self, crop: &Crop) -> PixelTensor {
        let mut out = PixelTensor::new(crop.width, crop.height);
        for c in 0..3 {
            for y in 0..crop.height {
                for x in 0..crop.width {
                    out.set(x, y, c, self.get(crop.x + x, crop.y + y, c));
                }
            }
        }
        out.icc_profile = self.icc_profile.clone();
        out
    }
}

/// A rectangular sub-region of a parent tensor, with its own planar buffer.
///
/// `x`/`y` are in the parent's coordinate space; the buffer length matches
/// the tile's own width/height, not the parent's.
#[derive(Clone)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl Tile {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            data: vec![0.0; width as usize * height as usize * 3],
        }
    }
}

/// Sub-region selection applied before processing (preview).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Output container format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Keep the input's extension when it is a supported encode target,
    /// otherwise fall back to PNG.
    #[default]
    Original,
    Png,
    Jpeg,
    Webp,
}

/// Speed/quality trade-off. Selects the inference backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    Fast,
    #[default]
    Balanced,
    Quality,
}

/// One batch upscale job over still images (or extracted video frames).
#[derive(Debug, Clone)]
pub struct UpscaleRequest {
    /// Processed in order; outputs are produced in the same order.
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    /// Nominal integer scale factor. The engine's actual output ratio is
    /// authoritative and may differ; see `engine::InferredBatch`.
    pub scale: u32,
    pub quality: QualityMode,
    /// Model reference resolved through the `ModelStore`.
    pub model: String,
    /// Tile edge in pixels; 0 means auto (model-preferred, or whole image).
    pub tile_size: u32,
    pub tile_overlap: u32,
    pub format: OutputFormat,
    /// Lossy encode quality, 1–100.
    pub encode_quality: u8,
    pub crop: Option<Crop>,
    /// 0.0–1.0 smoothing strength; `None` disables the stage.
    pub denoise: Option<f32>,
    /// Blend alpha against the previous output in the batch; `None` disables.
    pub temporal_blend: Option<f32>,
    pub refine_faces: bool,
}

impl UpscaleRequest {
    pub fn new(inputs: Vec<PathBuf>, output_dir: PathBuf, scale: u32, model: String) -> Self {
        Self {
            inputs,
            output_dir,
            scale,
            quality: QualityMode::default(),
            model,
            tile_size: 0,
            tile_overlap: 16,
            format: OutputFormat::default(),
            encode_quality: 90,
            crop: None,
            denoise: None,
            temporal_blend: None,
            refine_faces: false,
        }
    }
}

/// Produced output paths, one per input, in input order.
#[derive(Debug, Clone, Default)]
pub struct UpscaleResult {
    pub outputs: Vec<PathBuf>,
}

/// Hardware encoder preference, mapped to a concrete FFmpeg encoder id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderPreference {
    #[default]
    Auto,
    Nvenc,
    Qsv,
    Software,
}

/// One video upscale job.
#[derive(Debug, Clone)]
pub struct VideoUpscaleRequest {
    pub input: PathBuf,
    /// Per-frame options; `inputs` is ignored and replaced by the extracted
    /// frame sequence, `output_dir` receives the final video.
    pub frame_options: UpscaleRequest,
    pub hw_decode: bool,
    pub encoder: EncoderPreference,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_tensor_invariant() {
        let t = PixelTensor::new(7, 5);
        assert_eq!(t.data.len(), 7 * 5 * 3);
        assert_eq!(t.plane_len(), 35);
    }

    #[test]
    fn test_get_set_round_trip() {
        let mut t = PixelTensor::new(4, 4);
        t.set(2, 3, 1, 0.5);
        assert_eq!(t.get(2, 3, 1), 0.5);
        assert_eq!(t.get(2, 3, 0), 0.0);
    }

    #[test]
    fn test_crop_copies_sub_region() {
        let mut t = PixelTensor::new(8, 8);
        t.set(3, 2, 0, 1.0);
        let c = t.crop(&Crop {
            x: 2,
            y: 1,
            width: 4,
            height: 4,
        });
        assert_eq!(c.width, 4);
        assert_eq!(c.height, 4);
        assert_eq!(c.get(1, 1, 0), 1.0);
    }

    #[test]
    fn test_tile_buffer_matches_own_size() {
        let tile = Tile::new(100, 200, 32, 16);
        assert_eq!(tile.data.len(), 32 * 16 * 3);
    }

    #[test]
    fn test_output_format_serde() {
        let f: OutputFormat = serde_json::from_str("\"original\"").unwrap();
        assert_eq!(f, OutputFormat::Original);
        assert_eq!(serde_json::to_string(&OutputFormat::Jpeg).unwrap(), "\"jpeg\"");
    }
}
