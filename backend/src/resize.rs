//! Local resize paths for the smart resizer.
//!
//! A classifier picks the cheapest faithful strategy per (master, format)
//! pair; only AI_REGENERATE leaves the process (and therefore pays a rate
//! token and an upstream call).

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};

/// Strategy for producing a target format from a master image.
///
/// - `Crop`: aspect ratios are near-identical; scale to cover and center-crop.
/// - `Padding`: same orientation, moderately different ratio; fit within and
///   letterbox.
/// - `AiRegenerate`: the geometry change is too large to fake; regenerate
///   through the model with the master as reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeDecision {
    Crop,
    Padding,
    AiRegenerate,
}

const CROP_RATIO_TOLERANCE: f64 = 0.05;
const PADDING_RATIO_TOLERANCE: f64 = 0.25;

pub fn classify(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> ResizeDecision {
    let src_ratio = src_w as f64 / src_h as f64;
    let dst_ratio = dst_w as f64 / dst_h as f64;
    let relative_gap = (src_ratio - dst_ratio).abs() / dst_ratio;

    if relative_gap < CROP_RATIO_TOLERANCE {
        return ResizeDecision::Crop;
    }

    let same_orientation = (src_ratio >= 1.0) == (dst_ratio >= 1.0);
    if same_orientation && relative_gap < PADDING_RATIO_TOLERANCE {
        return ResizeDecision::Padding;
    }

    ResizeDecision::AiRegenerate
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

/// Scale to cover the target box, then center-crop the overflow.
pub fn crop_to(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    img.resize_to_fill(width, height, FilterType::Lanczos3)
}

/// Fit within the target box and letterbox the remainder.
pub fn pad_to(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let scaled = img.resize(width, height, FilterType::Lanczos3);

    let mut canvas = DynamicImage::new_rgba8(width, height);
    let (sw, sh) = scaled.dimensions();
    let x = (width.saturating_sub(sw) / 2) as i64;
    let y = (height.saturating_sub(sh) / 2) as i64;

    image::imageops::overlay(&mut canvas, &scaled, x, y);
    canvas
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_identical_ratio_crops() {
        // 1000x1000 -> 1024x1000: 2.4% gap
        assert_eq!(classify(1000, 1000, 1024, 1000), ResizeDecision::Crop);
    }

    #[test]
    fn moderate_same_orientation_pads() {
        // 4:3 -> 16:10, both landscape, ~20% gap
        assert_eq!(classify(1600, 1200, 1600, 1000), ResizeDecision::Padding);
    }

    #[test]
    fn orientation_flip_regenerates() {
        // Landscape master into a portrait story format
        assert_eq!(classify(1920, 1080, 1080, 1920), ResizeDecision::AiRegenerate);
    }

    #[test]
    fn extreme_ratio_gap_regenerates() {
        assert_eq!(classify(1000, 1000, 1920, 480), ResizeDecision::AiRegenerate);
    }

    #[test]
    fn crop_and_pad_hit_exact_dimensions() {
        let img = DynamicImage::new_rgb8(400, 300);

        let cropped = crop_to(&img, 200, 200);
        assert_eq!(cropped.dimensions(), (200, 200));

        let padded = pad_to(&img, 500, 500);
        assert_eq!(padded.dimensions(), (500, 500));
    }

    #[test]
    fn png_round_trip() {
        let img = DynamicImage::new_rgb8(10, 10);
        let bytes = encode_png(&img).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (10, 10));
    }
}
