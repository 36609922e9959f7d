//! Lightweight face detector: stride-grid decode plus non-maximum
//! suppression.
//!
//! The network emits one tensor per stride (8/16/32), shaped `[1, 16, H, W]`
//! with channels `[cls, obj, dx, dy, dw, dh, lm0x, lm0y, .., lm4y]`. Boxes
//! decode as `center = (grid + offset) * stride`, `size = exp(raw) * stride`,
//! landmarks as `(grid + offset) * stride`.

use anyhow::{bail, Result};
use ndarray::{Array4, ArrayD};
use tracing::debug;

use crate::types::PixelTensor;

use super::{resize_bilinear, Point};

pub const STRIDES: [u32; 3] = [8, 16, 32];
pub const SCORE_THRESHOLD: f32 = 0.6;
pub const NMS_IOU_THRESHOLD: f32 = 0.3;
pub const MAX_FACES: usize = 8;
pub const MAX_RAW_CANDIDATES: usize = 5000;

/// Detector input resolution when the model does not declare a static one.
const DEFAULT_INPUT_SIZE: u32 = 640;

/// Axis-aligned box in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Self) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if intersection <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// One detected face. Landmarks are right eye, left eye, nose tip, right
/// mouth corner, left mouth corner; models without a landmark head emit
/// `None` and such faces take the unaligned refinement path.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub score: f32,
    pub landmarks: Option<[Point; 5]>,
}

pub struct FaceDetector {
    net: crate::engine::NetSession,
    input_size: (u32, u32),
}

impl FaceDetector {
    pub fn new(net: crate::engine::NetSession) -> Self {
        let input_size = net
            .input_hw()
            .map(|(h, w)| (w, h))
            .unwrap_or((DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE));
        Self { net, input_size }
    }

    /// Detect faces over the whole image. Coordinates are returned in the
    /// image's own pixel space.
    pub fn detect(&self, image: &PixelTensor) -> Result<Vec<DetectedFace>> {
        if image.width == 0 || image.height == 0 {
            return Ok(Vec::new());
        }

        let (in_w, in_h) = self.input_size;
        let resized = resize_bilinear(image, in_w, in_h);
        let value_scale = self.net.value_scale();
        let scaled: Vec<f32> = resized.data.iter().map(|&v| v * value_scale).collect();
        let input = Array4::from_shape_vec((1, 3, in_h as usize, in_w as usize), scaled)?;

        let outputs = self.net.run(input)?;
        if outputs.len() < STRIDES.len() {
            bail!(
                "detector produced {} outputs, expected one per stride ({})",
                outputs.len(),
                STRIDES.len()
            );
        }

        let scale_x = image.width as f32 / in_w as f32;
        let scale_y = image.height as f32 / in_h as f32;

        let mut candidates = Vec::new();
        for (output, &stride) in outputs.iter().zip(STRIDES.iter()) {
            decode_stride(output, stride, scale_x, scale_y, &mut candidates)?;
            if candidates.len() >= MAX_RAW_CANDIDATES {
                candidates.truncate(MAX_RAW_CANDIDATES);
                break;
            }
        }

        let clamped: Vec<DetectedFace> = candidates
            .into_iter()
            .filter_map(|face| clamp_to_image(face, image.width as f32, image.height as f32))
            .collect();

        let kept = non_max_suppression(clamped, NMS_IOU_THRESHOLD, MAX_FACES);
        debug!(faces = kept.len(), "face detection complete");
        Ok(kept)
    }
}

/// Decode one stride's `[1, 16, H, W]` grid into scored candidates.
pub fn decode_stride(
    output: &ArrayD<f32>,
    stride: u32,
    scale_x: f32,
    scale_y: f32,
    out: &mut Vec<DetectedFace>,
) -> Result<()> {
    let shape = output.shape();
    if shape.len() != 4 || shape[0] != 1 || shape[1] != 16 {
        bail!("expected detector output [1,16,H,W], got {shape:?}");
    }
    let (grid_h, grid_w) = (shape[2], shape[3]);
    let s = stride as f32;

    for gy in 0..grid_h {
        for gx in 0..grid_w {
            if out.len() >= MAX_RAW_CANDIDATES {
                return Ok(());
            }
            let at = |c: usize| output[[0, c, gy, gx]];

            let score = (at(0).clamp(0.0, 1.0) * at(1).clamp(0.0, 1.0)).sqrt();
            if score < SCORE_THRESHOLD {
                continue;
            }

            let cx = (gx as f32 + at(2)) * s;
            let cy = (gy as f32 + at(3)) * s;
            let w = at(4).exp() * s;
            let h = at(5).exp() * s;
            if w <= 0.0 || h <= 0.0 {
                continue;
            }

            let mut landmarks = [Point::new(0.0, 0.0); 5];
            for (i, lm) in landmarks.iter_mut().enumerate() {
                lm.x = (gx as f32 + at(6 + i * 2)) * s * scale_x;
                lm.y = (gy as f32 + at(7 + i * 2)) * s * scale_y;
            }

            out.push(DetectedFace {
                bbox: BoundingBox {
                    x: (cx - w / 2.0) * scale_x,
                    y: (cy - h / 2.0) * scale_y,
                    width: w * scale_x,
                    height: h * scale_y,
                },
                score,
                landmarks: Some(landmarks),
            });
        }
    }
    Ok(())
}

/// Clamp a detection to image bounds; degenerate boxes are discarded.
fn clamp_to_image(mut face: DetectedFace, width: f32, height: f32) -> Option<DetectedFace> {
    let x0 = face.bbox.x.clamp(0.0, width);
    let y0 = face.bbox.y.clamp(0.0, height);
    let x1 = (face.bbox.x + face.bbox.width).clamp(0.0, width);
    let y1 = (face.bbox.y + face.bbox.height).clamp(0.0, height);
    if x1 - x0 <= 0.0 || y1 - y0 <= 0.0 {
        return None;
    }
    face.bbox = BoundingBox {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    };
    Some(face)
}

/// Greedy NMS: sort by score descending, keep a detection unless it overlaps
/// an already-kept one beyond `iou_threshold`; stop after `max_kept`.
pub fn non_max_suppression(
    mut faces: Vec<DetectedFace>,
    iou_threshold: f32,
    max_kept: usize,
) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<DetectedFace> = Vec::new();
    for face in faces {
        if kept.len() >= max_kept {
            break;
        }
        if kept.iter().all(|k| k.bbox.iou(&face.bbox) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn face(x: f32, y: f32, size: f32, score: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x,
                y,
                width: size,
                height: size,
            },
            score,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_disjoint_and_identical() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 };
        let b = BoundingBox { x: 20.0, y: 20.0, width: 10.0, height: 10.0 };
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_heavy_overlap() {
        let kept = non_max_suppression(
            vec![face(0.0, 0.0, 10.0, 0.9), face(1.0, 1.0, 10.0, 0.8)],
            NMS_IOU_THRESHOLD,
            MAX_FACES,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn test_nms_keeps_low_overlap() {
        let kept = non_max_suppression(
            vec![face(0.0, 0.0, 10.0, 0.9), face(9.0, 9.0, 10.0, 0.8)],
            NMS_IOU_THRESHOLD,
            MAX_FACES,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_nms_caps_kept_count() {
        let faces: Vec<_> = (0..20)
            .map(|i| face(i as f32 * 50.0, 0.0, 10.0, 0.9 - i as f32 * 0.01))
            .collect();
        assert_eq!(non_max_suppression(faces, NMS_IOU_THRESHOLD, MAX_FACES).len(), MAX_FACES);
    }

    #[test]
    fn test_decode_single_confident_cell() {
        // grid 4x4 at stride 8, one confident cell at (2, 1)
        let mut raw = ArrayD::zeros(IxDyn(&[1, 16, 4, 4]));
        raw[[0, 0, 1, 2]] = 0.81; // cls
        raw[[0, 1, 1, 2]] = 1.0; // obj
        raw[[0, 2, 1, 2]] = 0.5; // dx
        raw[[0, 3, 1, 2]] = 0.25; // dy
        raw[[0, 4, 1, 2]] = 0.0; // dw -> exp(0) * 8 = 8
        raw[[0, 5, 1, 2]] = 0.0; // dh
        raw[[0, 6, 1, 2]] = 0.1; // lm0 x offset

        let mut out = Vec::new();
        decode_stride(&raw, 8, 1.0, 1.0, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        let f = &out[0];
        assert!((f.score - 0.9).abs() < 1e-3);
        // center (2.5*8, 1.25*8) = (20, 10), size 8 -> box at (16, 6)
        assert!((f.bbox.x - 16.0).abs() < 1e-4);
        assert!((f.bbox.y - 6.0).abs() < 1e-4);
        assert!((f.bbox.width - 8.0).abs() < 1e-4);
        let lm = f.landmarks.unwrap();
        assert!((lm[0].x - 16.8).abs() < 1e-3);
    }

    #[test]
    fn test_decode_rejects_low_score() {
        let mut raw = ArrayD::zeros(IxDyn(&[1, 16, 2, 2]));
        raw[[0, 0, 0, 0]] = 0.3;
        raw[[0, 1, 0, 0]] = 0.3;
        let mut out = Vec::new();
        decode_stride(&raw, 8, 1.0, 1.0, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let raw = ArrayD::zeros(IxDyn(&[1, 15, 2, 2]));
        assert!(decode_stride(&raw, 8, 1.0, 1.0, &mut Vec::new()).is_err());
    }
}
