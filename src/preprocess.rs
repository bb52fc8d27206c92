//! Image normalization into OCR-friendly bitmap variants.
//!
//! One uploaded photo fans out into several variants (thresholded, contrast
//! enhanced, rotated). Each strategy runs in isolation: a strategy that fails
//! or panics is logged and skipped, and the unmodified original is always kept.

use std::io::Cursor;
use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use imageproc::contrast::{adaptive_threshold, otsu_level, threshold};
use imageproc::filter::median_filter;
use tracing::{debug, info, warn};

use crate::error::VerifyError;

/// Images whose shorter side is below this get upscaled before recognition.
const MIN_DIMENSION: u32 = 300;
/// Upscaling never pushes the longer side past this.
const MAX_UPSCALED_DIMENSION: u32 = 4096;

/// CLAHE clip limit (multiple of the uniform bin height).
const CLAHE_CLIP_LIMIT: f32 = 2.0;
/// CLAHE grid: the image is split into this many tiles per axis.
const CLAHE_GRID: u32 = 8;

/// Neighbourhood radius for local (adaptive) thresholding: an 11x11 block.
const ADAPTIVE_BLOCK_RADIUS: u32 = 5;

/// One preprocessed bitmap and the strategy that produced it.
#[derive(Debug, Clone)]
pub struct PreprocessedVariant {
    pub label: String,
    pub image: DynamicImage,
}

impl PreprocessedVariant {
    fn new(label: &str, image: DynamicImage) -> Self {
        Self {
            label: label.to_string(),
            image,
        }
    }
}

/// Preprocessing switches.
#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    /// Apply EXIF orientation tags (2-8) before anything else.
    pub correct_orientation: bool,
    /// Add a 90° rotated copy of the Otsu variant for labels photographed sideways.
    pub include_rotated: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            correct_orientation: true,
            include_rotated: true,
        }
    }
}

/// Decode uploaded bytes into a bitmap, whatever the container format.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, VerifyError> {
    if bytes.is_empty() {
        return Err(VerifyError::ImageDecode("empty upload".to_string()));
    }
    image::load_from_memory(bytes).map_err(|e| VerifyError::ImageDecode(e.to_string()))
}

/// Produce the ordered variant list for one photo.
///
/// Order is fixed: `original`, `enhanced`, `otsu`, `adaptive`, `mean`,
/// `rotated_90`; `enhanced` is absent when contrast enhancement fails.
/// Candidate selection uses this order to break ties.
pub fn preprocess(raw_bytes: &[u8], image: DynamicImage, opts: &PreprocessOptions) -> Vec<PreprocessedVariant> {
    preprocess_with(raw_bytes, image, opts, enhance_contrast)
}

fn preprocess_with(
    raw_bytes: &[u8],
    image: DynamicImage,
    opts: &PreprocessOptions,
    enhance: fn(&DynamicImage) -> Result<GrayImage>,
) -> Vec<PreprocessedVariant> {
    let (w, h) = image.dimensions();
    info!("Preprocessing image {}x{}", w, h);

    let mut image = image;
    if opts.correct_orientation {
        let orientation = read_exif_orientation(raw_bytes);
        if orientation != 1 {
            debug!("Applying EXIF orientation {}", orientation);
        }
        image = apply_orientation(image, orientation);
    }

    let base = upscale_if_small(image);
    let mut variants = vec![PreprocessedVariant::new("original", base.clone())];

    let enhanced = run_strategy("enhanced", || enhance(&base));
    let threshold_input = match enhanced {
        Some(img) => {
            variants.push(PreprocessedVariant::new(
                "enhanced",
                DynamicImage::ImageLuma8(img.clone()),
            ));
            img
        }
        None => {
            warn!("Contrast enhancement failed, thresholding the plain grayscale");
            base.to_luma8()
        }
    };
    variants.extend(binarized_variants(&threshold_input, opts));

    info!(
        "Produced {} variants: {:?}",
        variants.len(),
        variants.iter().map(|v| v.label.as_str()).collect::<Vec<_>>()
    );
    variants
}

/// Denoise then equalize contrast locally.
fn enhance_contrast(image: &DynamicImage) -> Result<GrayImage> {
    let gray = image.to_luma8();
    let denoised = median_filter(&gray, 1, 1);
    Ok(clahe(&denoised, CLAHE_CLIP_LIMIT, CLAHE_GRID))
}

/// `otsu`, `adaptive`, `mean` and `rotated_90`, each skipped on its own failure.
fn binarized_variants(gray: &GrayImage, opts: &PreprocessOptions) -> Vec<PreprocessedVariant> {
    let mut variants = Vec::new();

    let otsu = run_strategy("otsu", || {
        let level = otsu_level(gray);
        debug!("Otsu level: {}", level);
        Ok(threshold(gray, level))
    });
    if let Some(img) = &otsu {
        variants.push(PreprocessedVariant::new("otsu", DynamicImage::ImageLuma8(img.clone())));
    }

    if let Some(img) = run_strategy("adaptive", || {
        Ok(adaptive_threshold(gray, ADAPTIVE_BLOCK_RADIUS))
    }) {
        variants.push(PreprocessedVariant::new("adaptive", DynamicImage::ImageLuma8(img)));
    }

    if let Some(img) = run_strategy("mean", || {
        let level = mean_level(gray).ok_or_else(|| anyhow!("image has no pixels"))?;
        Ok(threshold(gray, level))
    }) {
        variants.push(PreprocessedVariant::new("mean", DynamicImage::ImageLuma8(img)));
    }

    if opts.include_rotated {
        if let Some(img) = otsu {
            variants.push(PreprocessedVariant::new(
                "rotated_90",
                DynamicImage::ImageLuma8(img).rotate90(),
            ));
        }
    }

    variants
}

/// Run one strategy, turning both errors and panics into a skipped variant.
fn run_strategy<F>(label: &str, f: F) -> Option<GrayImage>
where
    F: FnOnce() -> Result<GrayImage>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(img)) if img.width() > 0 && img.height() > 0 => Some(img),
        Ok(Ok(_)) => {
            warn!("Strategy '{}' produced an empty bitmap, skipping", label);
            None
        }
        Ok(Err(e)) => {
            warn!("Strategy '{}' failed: {}", label, e);
            None
        }
        Err(_) => {
            warn!("Strategy '{}' panicked, skipping", label);
            None
        }
    }
}

fn upscale_if_small(image: DynamicImage) -> DynamicImage {
    let (w, h) = image.dimensions();
    let min_side = w.min(h);
    if min_side == 0 || min_side >= MIN_DIMENSION {
        return image;
    }
    let max_side = w.max(h);
    let scale = (MIN_DIMENSION as f32 / min_side as f32)
        .min(MAX_UPSCALED_DIMENSION as f32 / max_side as f32);
    if scale <= 1.0 {
        debug!("Image {}x{} too elongated to upscale", w, h);
        return image;
    }
    let nw = ((w as f32 * scale).round() as u32).clamp(1, MAX_UPSCALED_DIMENSION);
    let nh = ((h as f32 * scale).round() as u32).clamp(1, MAX_UPSCALED_DIMENSION);
    info!("Upscaling image from {}x{} to {}x{}", w, h, nw, nh);
    image.resize_exact(nw, nh, FilterType::CatmullRom)
}

/// Read the EXIF orientation tag. Returns 1 (normal) when absent.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Undo the camera's EXIF orientation so text reads left-to-right.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn mean_level(image: &GrayImage) -> Option<u8> {
    let count = image.width() as u64 * image.height() as u64;
    if count == 0 {
        return None;
    }
    let sum: u64 = image.pixels().map(|p| p[0] as u64).sum();
    Some((sum / count) as u8)
}

/// Contrast-limited adaptive histogram equalization.
///
/// Each tile gets a clipped histogram and its own lookup table; pixels blend
/// the tables of the four surrounding tile centres bilinearly.
pub fn clahe(image: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || grid == 0 {
        return image.clone();
    }

    let tiles_x = grid.min(width);
    let tiles_y = grid.min(height);
    let tile_w = (width + tiles_x - 1) / tiles_x;
    let tile_h = (height + tiles_y - 1) / tiles_y;

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            luts.push(tile_lut(image, x0, y0, x1, y1, clip_limit));
        }
    }
    let lut = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];

    let mut out = GrayImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels() {
        let v = pixel[0] as usize;

        // Position relative to tile centres.
        let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let x_lo = fx.floor().clamp(0.0, (tiles_x - 1) as f32) as u32;
        let y_lo = fy.floor().clamp(0.0, (tiles_y - 1) as f32) as u32;
        let x_hi = (x_lo + 1).min(tiles_x - 1);
        let y_hi = (y_lo + 1).min(tiles_y - 1);
        let ax = (fx - x_lo as f32).clamp(0.0, 1.0);
        let ay = (fy - y_lo as f32).clamp(0.0, 1.0);

        let top = lut(x_lo, y_lo)[v] * (1.0 - ax) + lut(x_hi, y_lo)[v] * ax;
        let bottom = lut(x_lo, y_hi)[v] * (1.0 - ax) + lut(x_hi, y_hi)[v] * ax;
        let value = top * (1.0 - ay) + bottom * ay;

        out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
    }
    out
}

fn tile_lut(image: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [f32; 256] {
    let mut hist = [0u32; 256];
    let mut count = 0u32;
    for y in y0..y1 {
        for x in x0..x1 {
            hist[image.get_pixel(x, y)[0] as usize] += 1;
            count += 1;
        }
    }

    let mut lut = [0.0f32; 256];
    if count == 0 {
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = i as f32;
        }
        return lut;
    }

    let limit = ((clip_limit * count as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for h in hist.iter_mut() {
        if *h > limit {
            excess += *h - limit;
            *h = limit;
        }
    }
    let spread = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, h) in hist.iter_mut().enumerate() {
        *h += spread + u32::from(i < remainder);
    }

    let mut cumulative = 0u32;
    for (i, &h) in hist.iter().enumerate() {
        cumulative += h;
        lut[i] = cumulative as f32 * 255.0 / count as f32;
    }
    lut
}
