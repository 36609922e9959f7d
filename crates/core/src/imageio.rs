//! Image file decode/encode for [`PixelTensor`].
//!
//! Still inputs and extracted video frames both pass through here. Color
//! profiles are carried as opaque bytes and re-attached on save when the
//! target encoder supports them.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageDecoder, ImageEncoder, ImageReader};
use tracing::debug;

use crate::types::{OutputFormat, PixelTensor};

/// Extensions that `OutputFormat::Original` may keep.
const ENCODABLE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

pub fn load(path: &Path) -> Result<PixelTensor> {
    let mut decoder = ImageReader::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to probe image format: {}", path.display()))?
        .into_decoder()
        .with_context(|| format!("failed to decode image: {}", path.display()))?;

    let icc_profile = decoder.icc_profile().ok().flatten();
    let img = DynamicImage::from_decoder(decoder)
        .with_context(|| format!("failed to decode image: {}", path.display()))?;
    let rgb = img.to_rgb8();

    let (width, height) = rgb.dimensions();
    let mut tensor = PixelTensor::new(width, height);
    let plane = tensor.plane_len();
    let raw = rgb.as_raw();
    for i in 0..plane {
        tensor.data[i] = raw[i * 3] as f32 / 255.0;
        tensor.data[plane + i] = raw[i * 3 + 1] as f32 / 255.0;
        tensor.data[2 * plane + i] = raw[i * 3 + 2] as f32 / 255.0;
    }
    tensor.icc_profile = icc_profile;

    debug!(path = %path.display(), width, height, "image loaded");
    Ok(tensor)
}

/// Interleave the planar buffer back to packed RGB bytes.
pub fn to_rgb8(tensor: &PixelTensor) -> Vec<u8> {
    let plane = tensor.plane_len();
    let mut rgb = vec![0u8; plane * 3];
    for i in 0..plane {
        rgb[i * 3] = (tensor.data[i] * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
        rgb[i * 3 + 1] = (tensor.data[plane + i] * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
        rgb[i * 3 + 2] = (tensor.data[2 * plane + i] * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
    }
    rgb
}

pub fn save(tensor: &PixelTensor, path: &Path, quality: u8) -> Result<()> {
    let rgb = to_rgb8(tensor);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let file = File::create(path)
        .with_context(|| format!("failed to create output file: {}", path.display()))?;
    let writer = BufWriter::new(file);

    match ext.as_str() {
        "png" => {
            let mut encoder = PngEncoder::new(writer);
            attach_icc(&mut encoder, tensor);
            encoder.write_image(&rgb, tensor.width, tensor.height, ExtendedColorType::Rgb8)?;
        }
        "jpg" | "jpeg" => {
            let mut encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
            attach_icc(&mut encoder, tensor);
            encoder.write_image(&rgb, tensor.width, tensor.height, ExtendedColorType::Rgb8)?;
        }
        "webp" => {
            let encoder = WebPEncoder::new_lossless(writer);
            encoder.write_image(&rgb, tensor.width, tensor.height, ExtendedColorType::Rgb8)?;
        }
        other => bail!("unsupported output extension: {other:?}"),
    }

    debug!(path = %path.display(), "image saved");
    Ok(())
}

fn attach_icc<E: ImageEncoder>(encoder: &mut E, tensor: &PixelTensor) {
    if let Some(icc) = &tensor.icc_profile {
        // Not every encoder supports embedded profiles; dropping it is fine.
        let _ = encoder.set_icc_profile(icc.clone());
    }
}

/// Deterministic output path: same stem as the input, in `output_dir`, with
/// the extension the resolved format dictates.
pub fn output_path(input: &Path, output_dir: &Path, format: OutputFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let ext = match format {
        OutputFormat::Png => "png",
        OutputFormat::Jpeg => "jpg",
        OutputFormat::Webp => "webp",
        OutputFormat::Original => {
            let input_ext = input
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_default();
            if ENCODABLE_EXTENSIONS.contains(&input_ext.as_str()) {
                return output_dir.join(format!("{stem}.{input_ext}"));
            }
            // Lossless default for anything we cannot re-encode.
            "png"
        }
    };
    output_dir.join(format!("{stem}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_explicit_format() {
        let p = output_path(Path::new("/in/photo.tiff"), Path::new("/out"), OutputFormat::Jpeg);
        assert_eq!(p, Path::new("/out/photo.jpg"));
    }

    #[test]
    fn test_output_path_original_keeps_supported_extension() {
        let p = output_path(Path::new("/in/frame.webp"), Path::new("/out"), OutputFormat::Original);
        assert_eq!(p, Path::new("/out/frame.webp"));
    }

    #[test]
    fn test_output_path_original_falls_back_to_png() {
        let p = output_path(Path::new("/in/scan.tiff"), Path::new("/out"), OutputFormat::Original);
        assert_eq!(p, Path::new("/out/scan.png"));
    }

    #[test]
    fn test_rgb_round_trip() {
        let mut t = PixelTensor::new(2, 1);
        t.set(0, 0, 0, 1.0);
        t.set(1, 0, 2, 0.5);
        let rgb = to_rgb8(&t);
        assert_eq!(rgb, vec![255, 0, 0, 0, 0, 128]);
    }

    #[test]
    fn test_save_and_load_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.png");
        let mut t = PixelTensor::new(3, 2);
        t.set(2, 1, 1, 1.0);
        save(&t, &path, 90).unwrap();
        let back = load(&path).unwrap();
        assert_eq!(back.width, 3);
        assert_eq!(back.height, 2);
        assert!((back.get(2, 1, 1) - 1.0).abs() < 1.0 / 255.0);
        assert_eq!(back.get(0, 0, 0), 0.0);
    }
}
