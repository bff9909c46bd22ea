//! Grayscale frames: decoding uploaded images, dark-frame rejection and
//! CLAHE lighting normalisation.

use image::GrayImage;
use thiserror::Error;

/// Fraction of pixels that must be near-black for a frame to count as dark.
const DARK_FRAME_FRACTION: f32 = 0.95;
/// Pixels below this value fall in the darkest histogram bucket.
const DARK_PIXEL_LEVEL: u8 = 32;

const CLAHE_TILES: usize = 8;
const CLAHE_CLIP_LIMIT: f32 = 0.02;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("pixel buffer length mismatch: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// An 8-bit grayscale image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap a raw grayscale buffer.
    pub fn from_gray(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Decode an encoded image (JPEG, PNG, ...) into a grayscale frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let gray = image::load_from_memory(bytes)?.into_luma8();
        let (width, height) = gray.dimensions();
        Self::from_gray(width, height, gray.into_raw())
    }

    /// Copy into an `image` buffer for resampling.
    pub fn to_image(&self) -> GrayImage {
        GrayImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// True when nearly every pixel sits in the darkest bucket; such a
    /// frame cannot contain a usable face.
    pub fn is_dark(&self) -> bool {
        is_dark(&self.data, DARK_FRAME_FRACTION)
    }

    /// Apply CLAHE with the default tile grid and clip limit.
    pub fn enhance(&mut self) {
        clahe_enhance(
            &mut self.data,
            self.width as usize,
            self.height as usize,
            CLAHE_TILES,
            CLAHE_CLIP_LIMIT,
        );
    }
}

fn is_dark(gray: &[u8], fraction: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_PIXEL_LEVEL).count();
    (dark as f32 / gray.len() as f32) > fraction
}

/// Equalisation lookup table for one tile: clipped histogram, excess
/// redistributed evenly, CDF rescaled to 0–255.
fn tile_lut(gray: &[u8], stride: usize, x0: usize, y0: usize, w: usize, h: usize, clip_limit: f32) -> [f32; 256] {
    let mut hist = [0u32; 256];
    for row in gray[y0 * stride..].chunks(stride).take(h) {
        for &p in &row[x0..x0 + w] {
            hist[p as usize] += 1;
        }
    }

    let pixels = (w * h) as u32;
    let clip = ((clip_limit * pixels as f32) as u32).max(1);
    let excess: u32 = hist.iter().map(|&c| c.saturating_sub(clip)).sum();
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin = (*bin).min(clip) + share + u32::from(i < remainder);
    }

    let mut lut = [0f32; 256];
    let mut running = 0u32;
    for (slot, &count) in lut.iter_mut().zip(hist.iter()) {
        running += count;
        *slot = running as f32;
    }
    let cdf_min = lut.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let span = pixels as f32 - cdf_min;
    if span > 0.0 {
        for v in lut.iter_mut() {
            *v = ((*v - cdf_min) / span * 255.0).clamp(0.0, 255.0);
        }
    }
    lut
}

/// Contrast-Limited Adaptive Histogram Equalisation, in place.
///
/// Each pixel is mapped through the lookup tables of its four nearest tile
/// centres and bilinearly blended, which avoids visible tile seams.
pub fn clahe_enhance(gray: &mut [u8], width: usize, height: usize, tiles: usize, clip_limit: f32) {
    if width == 0 || height == 0 || tiles == 0 || gray.len() < width * height {
        return;
    }
    let tile_w = width / tiles;
    let tile_h = height / tiles;
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let luts: Vec<[f32; 256]> = (0..tiles * tiles)
        .map(|t| {
            let (row, col) = (t / tiles, t % tiles);
            tile_lut(gray, width, col * tile_w, row * tile_h, tile_w, tile_h, clip_limit)
        })
        .collect();

    let last = (tiles - 1) as f32;
    for y in 0..height {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(tiles - 1);
        let dy = fy - r0 as f32;

        for x in 0..width {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tiles - 1);
            let dx = fx - c0 as f32;

            let p = gray[y * width + x] as usize;
            let top = luts[r0 * tiles + c0][p] * (1.0 - dx) + luts[r0 * tiles + c1][p] * dx;
            let bottom = luts[r1 * tiles + c0][p] * (1.0 - dx) + luts[r1 * tiles + c1][p] * dx;
            gray[y * width + x] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}
