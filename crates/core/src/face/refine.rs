//! Face refinement: canonical-frame warp (aligned) or square crop
//! (unaligned), refiner network invocation, and feathered blend back.

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use tracing::{debug, warn};

use crate::engine::NetSession;
use crate::types::PixelTensor;

use super::align::AffineTransform;
use super::detect::{DetectedFace, FaceDetector};
use super::{resize_bilinear, sample_bilinear, Point};

/// Canonical frame edge when the refiner does not declare a static input.
const DEFAULT_CANONICAL_SIZE: u32 = 512;

/// Detected boxes are expanded by this factor before cropping.
const REGION_EXPAND: f32 = 1.4;
const REGION_MIN_SIDE: u32 = 32;

/// 5-point landmark template for a 512×512 canonical frame (FFHQ layout):
/// right eye, left eye, nose tip, mouth corners.
const TEMPLATE_512: [Point; 5] = [
    Point { x: 192.98, y: 239.71 },
    Point { x: 318.90, y: 240.19 },
    Point { x: 256.63, y: 314.01 },
    Point { x: 201.26, y: 371.41 },
    Point { x: 313.08, y: 347.55 },
];

/// Square expansion of a detected face, clamped to image bounds, with the
/// feather width used for edge blending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub feather: u32,
}

impl FaceRegion {
    /// Expand the box by [`REGION_EXPAND`] around its center, enforce the
    /// minimum side, then clamp to the image. Clamping may cut the square.
    pub fn from_bbox(
        bx: f32,
        by: f32,
        bw: f32,
        bh: f32,
        image_width: u32,
        image_height: u32,
    ) -> Option<FaceRegion> {
        if image_width == 0 || image_height == 0 {
            return None;
        }
        let side = (bw.max(bh) * REGION_EXPAND).max(REGION_MIN_SIDE as f32);
        let cx = bx + bw / 2.0;
        let cy = by + bh / 2.0;

        let x0 = (cx - side / 2.0).floor().max(0.0) as u32;
        let y0 = (cy - side / 2.0).floor().max(0.0) as u32;
        let x1 = ((cx + side / 2.0).ceil() as u32).min(image_width);
        let y1 = ((cy + side / 2.0).ceil() as u32).min(image_height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let width = x1 - x0;
        let height = y1 - y0;
        let feather = (width.max(height) / 10).clamp(2, 32);
        Some(FaceRegion {
            x: x0,
            y: y0,
            width,
            height,
            feather,
        })
    }
}

/// How a single face gets refined, decided once per detection.
enum RefinePath {
    Aligned { transform: AffineTransform },
    Unaligned { region: FaceRegion },
}

pub struct FaceRefiner {
    detector: FaceDetector,
    refiner: NetSession,
    canonical: u32,
}

impl FaceRefiner {
    pub fn new(detector: FaceDetector, refiner: NetSession) -> Self {
        let canonical = refiner
            .input_hw()
            .map(|(h, _)| h)
            .unwrap_or(DEFAULT_CANONICAL_SIZE);
        Self {
            detector,
            refiner,
            canonical,
        }
    }

    /// Refine every detected face in `output`. Detection runs on the
    /// pre-upscale `source`; detected geometry is scaled by `ratio` into
    /// the output's coordinate space. Never fails the upscale: any
    /// detector or refiner error is logged and skipped.
    pub fn refine_image(&self, output: &mut PixelTensor, source: &PixelTensor, ratio: f32) {
        let faces = match self.detector.detect(source) {
            Ok(faces) => faces,
            Err(e) => {
                warn!(error = %e, "face detection failed — skipping refinement");
                return;
            }
        };

        for (index, face) in faces.iter().enumerate() {
            if let Err(e) = self.refine_face(output, face, ratio) {
                warn!(index, error = %e, "face refinement failed — face skipped");
            }
        }
    }

    fn refine_face(&self, output: &mut PixelTensor, face: &DetectedFace, ratio: f32) -> Result<()> {
        let bbox = &face.bbox;
        let region = FaceRegion::from_bbox(
            bbox.x * ratio,
            bbox.y * ratio,
            bbox.width * ratio,
            bbox.height * ratio,
            output.width,
            output.height,
        )
        .context("face region degenerate after clamping")?;

        match self.choose_path(face, ratio, region) {
            RefinePath::Aligned { transform } => {
                let canonical = warp_to_canonical(output, &transform, self.canonical);
                let refined = self.run_refiner(&canonical)?;
                paste_aligned(output, &refined, &transform, region);
                debug!(?region, "face refined (aligned)");
            }
            RefinePath::Unaligned { region } => {
                let crop = output.crop(&crate::types::Crop {
                    x: region.x,
                    y: region.y,
                    width: region.width,
                    height: region.height,
                });
                let resized = resize_bilinear(&crop, self.canonical, self.canonical);
                let refined = self.run_refiner(&resized)?;
                let restored = resize_bilinear(&refined, region.width, region.height);
                paste_unaligned(output, &restored, region);
                debug!(?region, "face refined (unaligned)");
            }
        }
        Ok(())
    }

    /// Aligned when usable landmarks yield an invertible transform,
    /// otherwise fall back to the axis-aligned crop path.
    fn choose_path(&self, face: &DetectedFace, ratio: f32, region: FaceRegion) -> RefinePath {
        if let Some(landmarks) = &face.landmarks {
            let template = template_points(self.canonical);
            let detected = [
                scale_point(landmarks[0], ratio),
                scale_point(landmarks[1], ratio),
                scale_point(landmarks[2], ratio),
            ];
            if let Some(transform) = AffineTransform::estimate(&template, &detected) {
                if transform.invert().is_some() {
                    return RefinePath::Aligned { transform };
                }
            }
            debug!("landmark alignment unavailable — using crop path");
        }
        RefinePath::Unaligned { region }
    }

    fn run_refiner(&self, frame: &PixelTensor) -> Result<PixelTensor> {
        let value_scale = self.refiner.value_scale();
        let h = frame.height as usize;
        let w = frame.width as usize;
        let scaled: Vec<f32> = frame.data.iter().map(|&v| v * value_scale).collect();
        let input = Array4::from_shape_vec((1, 3, h, w), scaled)?;

        let outputs = self.refiner.run(input)?;
        let output = outputs
            .into_iter()
            .next()
            .context("refiner produced no output")?;
        let shape = output.shape().to_vec();
        if shape.len() != 4 || shape[1] != 3 {
            bail!("expected NCHW RGB refiner output, got shape {shape:?}");
        }

        let (out_h, out_w) = (shape[2] as u32, shape[3] as u32);
        let mut refined = PixelTensor::new(out_w, out_h);
        let contiguous;
        let slice = if let Some(s) = output.as_slice() {
            s
        } else {
            contiguous = output.as_standard_layout().into_owned();
            contiguous.as_slice().unwrap()
        };
        for (dst, &src) in refined.data.iter_mut().zip(slice.iter()) {
            *dst = (src / value_scale).clamp(0.0, 1.0);
        }

        // Some refiners emit a larger frame; bring it back to the warp size.
        if (out_w, out_h) != (frame.width, frame.height) {
            refined = resize_bilinear(&refined, frame.width, frame.height);
        }
        Ok(refined)
    }
}

/// Eyes and nose tip of the canonical template, scaled from the 512 layout
/// to the actual canonical edge.
fn template_points(canonical: u32) -> [Point; 3] {
    let s = canonical as f32 / 512.0;
    [
        scale_point(TEMPLATE_512[0], s),
        scale_point(TEMPLATE_512[1], s),
        scale_point(TEMPLATE_512[2], s),
    ]
}

fn scale_point(p: Point, s: f32) -> Point {
    Point::new(p.x * s, p.y * s)
}

/// Fill a canonical frame by sampling the image at `transform(canonical
/// pixel)` with bilinear interpolation; samples outside the image are left
/// black.
fn warp_to_canonical(
    image: &PixelTensor,
    transform: &AffineTransform,
    canonical: u32,
) -> PixelTensor {
    let mut frame = PixelTensor::new(canonical, canonical);
    for y in 0..canonical {
        for x in 0..canonical {
            let p = transform.apply(Point::new(x as f32, y as f32));
            for c in 0..3 {
                if let Some(v) = sample_bilinear(image, p.x, p.y, c) {
                    frame.set(x, y, c, v);
                }
            }
        }
    }
    frame
}

/// Project the refined canonical frame back onto the face region. Each
/// destination pixel maps through the inverse transform; pixels whose
/// canonical coordinate falls outside the frame receive no contribution
/// (the coverage mask), and contributions are feathered toward the region
/// edge.
fn paste_aligned(
    dst: &mut PixelTensor,
    refined: &PixelTensor,
    transform: &AffineTransform,
    region: FaceRegion,
) {
    let Some(inverse) = transform.invert() else {
        return; // checked at path selection; a singular map means no paste
    };

    for y in region.y..(region.y + region.height).min(dst.height) {
        for x in region.x..(region.x + region.width).min(dst.width) {
            let q = inverse.apply(Point::new(x as f32, y as f32));
            let Some(r) = sample_bilinear(refined, q.x, q.y, 0) else {
                continue;
            };
            let weight = feather_weight(x, y, region);
            if weight <= 0.0 {
                continue;
            }
            blend_pixel(dst, x, y, 0, r, weight);
            for c in 1..3 {
                if let Some(v) = sample_bilinear(refined, q.x, q.y, c) {
                    blend_pixel(dst, x, y, c, v, weight);
                }
            }
        }
    }
}

/// Blend a same-sized refined crop into the region with feathered weights.
fn paste_unaligned(dst: &mut PixelTensor, refined: &PixelTensor, region: FaceRegion) {
    for y in 0..region.height.min(refined.height) {
        let dy = region.y + y;
        if dy >= dst.height {
            break;
        }
        for x in 0..region.width.min(refined.width) {
            let dx = region.x + x;
            if dx >= dst.width {
                break;
            }
            let weight = feather_weight(dx, dy, region);
            for c in 0..3 {
                blend_pixel(dst, dx, dy, c, refined.get(x, y, c), weight);
            }
        }
    }
}

#[inline]
fn blend_pixel(dst: &mut PixelTensor, x: u32, y: u32, channel: usize, value: f32, weight: f32) {
    let old = dst.get(x, y, channel);
    dst.set(x, y, channel, old * (1.0 - weight) + value * weight);
}

/// Linear ramp from the region edge inward over the feather width.
fn feather_weight(x: u32, y: u32, region: FaceRegion) -> f32 {
    let dx = (x - region.x).min(region.x + region.width - 1 - x);
    let dy = (y - region.y).min(region.y + region.height - 1 - y);
    let d = dx.min(dy) as f32;
    ((d + 1.0) / (region.feather as f32 + 1.0)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_expands_and_enforces_min_side() {
        let r = FaceRegion::from_bbox(100.0, 100.0, 10.0, 10.0, 1000, 1000).unwrap();
        // 10 * 1.4 < 32, so the minimum side wins
        assert!(r.width >= REGION_MIN_SIDE);
        assert_eq!(r.feather, (r.width.max(r.height) / 10).clamp(2, 32));
    }

    #[test]
    fn test_region_clamps_to_image() {
        let r = FaceRegion::from_bbox(0.0, 0.0, 100.0, 100.0, 80, 80).unwrap();
        assert_eq!(r.x, 0);
        assert!(r.x + r.width <= 80);
        assert!(r.y + r.height <= 80);
    }

    #[test]
    fn test_region_feather_bounds() {
        let small = FaceRegion::from_bbox(0.0, 0.0, 10.0, 10.0, 500, 500).unwrap();
        assert!(small.feather >= 2);
        let large = FaceRegion::from_bbox(0.0, 0.0, 400.0, 400.0, 2000, 2000).unwrap();
        assert_eq!(large.feather, 32);
    }

    #[test]
    fn test_region_degenerate_image() {
        assert!(FaceRegion::from_bbox(0.0, 0.0, 10.0, 10.0, 0, 0).is_none());
    }

    #[test]
    fn test_feather_weight_full_in_interior() {
        let region = FaceRegion { x: 0, y: 0, width: 100, height: 100, feather: 4 };
        assert_eq!(feather_weight(50, 50, region), 1.0);
        assert!(feather_weight(0, 50, region) < 1.0);
        assert!(feather_weight(0, 50, region) > 0.0);
    }

    #[test]
    fn test_paste_unaligned_replaces_interior() {
        let mut dst = PixelTensor::new(40, 40);
        let region = FaceRegion { x: 10, y: 10, width: 20, height: 20, feather: 2 };
        let mut refined = PixelTensor::new(20, 20);
        refined.data.fill(1.0);
        paste_unaligned(&mut dst, &refined, region);
        // deep interior gets the refined value, outside stays untouched
        assert!((dst.get(20, 20, 0) - 1.0).abs() < 1e-6);
        assert_eq!(dst.get(5, 5, 0), 0.0);
        // edge pixel is blended, not replaced
        let edge = dst.get(10, 20, 0);
        assert!(edge > 0.0 && edge < 1.0);
    }

    #[test]
    fn test_paste_aligned_identity_transform_masks_outside() {
        // identity transform: canonical frame coordinates == image coordinates,
        // so only the top-left 16x16 of the region maps inside an 16x16 frame
        let mut dst = PixelTensor::new(64, 64);
        let mut refined = PixelTensor::new(16, 16);
        refined.data.fill(1.0);
        let identity = AffineTransform([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let region = FaceRegion { x: 0, y: 0, width: 40, height: 40, feather: 2 };
        paste_aligned(&mut dst, &refined, &identity, region);
        assert!(dst.get(8, 8, 0) > 0.9);
        // outside the canonical frame: no contribution recorded
        assert_eq!(dst.get(30, 30, 0), 0.0);
    }

    #[test]
    fn test_warp_identity_reproduces_image() {
        let mut img = PixelTensor::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                img.set(x, y, 0, (x + y) as f32 / 16.0);
            }
        }
        let identity = AffineTransform([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let frame = warp_to_canonical(&img, &identity, 8);
        for y in 0..8 {
            for x in 0..8 {
                assert!((frame.get(x, y, 0) - img.get(x, y, 0)).abs() < 1e-6);
            }
        }
    }
}
