//! Face-region refinement: detect, align, refine, blend back.
//!
//! The detector and refiner are both best-effort: any failure is logged and
//! the face (or the whole pass) is skipped, never fatal to the upscale.

pub mod align;
pub mod detect;
pub mod refine;

pub use align::AffineTransform;
pub use detect::{DetectedFace, FaceDetector};
pub use refine::{FaceRefiner, FaceRegion};

use crate::types::PixelTensor;

/// 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Bilinear sample of one channel; `None` when (x, y) falls outside the
/// tensor.
pub(crate) fn sample_bilinear(tensor: &PixelTensor, x: f32, y: f32, channel: usize) -> Option<f32> {
    if x < 0.0 || y < 0.0 || x > (tensor.width - 1) as f32 || y > (tensor.height - 1) as f32 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(tensor.width - 1);
    let y1 = (y0 + 1).min(tensor.height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let top = tensor.get(x0, y0, channel) * (1.0 - fx) + tensor.get(x1, y0, channel) * fx;
    let bottom = tensor.get(x0, y1, channel) * (1.0 - fx) + tensor.get(x1, y1, channel) * fx;
    Some(top * (1.0 - fy) + bottom * fy)
}

/// Bilinear resize to the given dimensions.
pub(crate) fn resize_bilinear(tensor: &PixelTensor, width: u32, height: u32) -> PixelTensor {
    let mut out = PixelTensor::new(width, height);
    if width == 0 || height == 0 || tensor.width == 0 || tensor.height == 0 {
        return out;
    }
    let sx = tensor.width as f32 / width as f32;
    let sy = tensor.height as f32 / height as f32;
    for c in 0..3 {
        for y in 0..height {
            let src_y = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
            for x in 0..width {
                let src_x = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
                let v = sample_bilinear(tensor, src_x, src_y, c).unwrap_or(0.0);
                out.set(x, y, c, v);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_bilinear_interpolates() {
        let mut t = PixelTensor::new(2, 1);
        t.set(0, 0, 0, 0.0);
        t.set(1, 0, 0, 1.0);
        let v = sample_bilinear(&t, 0.5, 0.0, 0).unwrap();
        assert!((v - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sample_bilinear_out_of_bounds() {
        let t = PixelTensor::new(2, 2);
        assert!(sample_bilinear(&t, -0.1, 0.0, 0).is_none());
        assert!(sample_bilinear(&t, 0.0, 1.5, 0).is_none());
    }

    #[test]
    fn test_resize_constant_image() {
        let mut t = PixelTensor::new(4, 4);
        t.data.fill(0.3);
        let out = resize_bilinear(&t, 8, 2);
        assert_eq!((out.width, out.height), (8, 2));
        for v in &out.data {
            assert!((v - 0.3).abs() < 1e-6);
        }
    }
}
