//! Pixel compositing: white out everything that is not the subject
//!
//! Two strategies are available. With a subject mask, every pixel whose mask
//! intensity falls below the threshold becomes white. Without one, a border of
//! `floor(min(w, h) * ratio)` pixels is whitened and the interior is kept.
//! Both strategies keep the source alpha channel and never touch the input buffer.

use crate::config::{RemovalConfig, DEFAULT_BORDER_RATIO, DEFAULT_MASK_THRESHOLD};
use crate::error::{Result, WhiteBgError};
use crate::types::Mask;
use image::{Rgba, RgbaImage};

const WHITE: u8 = 255;

/// Applies a subject mask or the border fallback to an image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compositor {
    mask_threshold: u8,
    border_ratio: f32,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new(DEFAULT_MASK_THRESHOLD, DEFAULT_BORDER_RATIO)
    }
}

impl Compositor {
    #[must_use]
    pub fn new(mask_threshold: u8, border_ratio: f32) -> Self {
        Self {
            mask_threshold,
            border_ratio,
        }
    }

    #[must_use]
    pub fn from_config(config: &RemovalConfig) -> Self {
        Self::new(config.mask_threshold, config.border_ratio)
    }

    #[must_use]
    pub fn mask_threshold(&self) -> u8 {
        self.mask_threshold
    }

    #[must_use]
    pub fn border_ratio(&self) -> f32 {
        self.border_ratio
    }

    /// Produce a white-background copy of `image`.
    ///
    /// A mask at a different resolution is resampled to the image size first.
    ///
    /// # Errors
    /// Only fails if the resampled mask still disagrees with the image, which
    /// indicates a resampling bug rather than bad input
    pub fn composite(&self, image: &RgbaImage, subject_mask: Option<&Mask>) -> Result<RgbaImage> {
        match subject_mask {
            Some(mask) => {
                let (width, height) = image.dimensions();
                if mask.dimensions() == (width, height) {
                    apply_mask(image, mask, self.mask_threshold)
                } else {
                    log::debug!(
                        "Resampling mask from {}x{} to {}x{}",
                        mask.width(),
                        mask.height(),
                        width,
                        height
                    );
                    apply_mask(image, &mask.resize(width, height), self.mask_threshold)
                }
            },
            None => Ok(apply_border_fallback(image, self.border_ratio)),
        }
    }
}

/// Whiten every pixel whose mask intensity is below `threshold`
///
/// # Errors
/// Returns `WhiteBgError::MaskMismatch` when mask and image sizes differ
pub fn apply_mask(image: &RgbaImage, mask: &Mask, threshold: u8) -> Result<RgbaImage> {
    let (width, height) = image.dimensions();
    if mask.dimensions() != (width, height) {
        return Err(WhiteBgError::MaskMismatch {
            mask_width: mask.width(),
            mask_height: mask.height(),
            image_width: width,
            image_height: height,
        });
    }

    let mut output = image.clone();
    for (pixel, &intensity) in output.pixels_mut().zip(mask.as_raw()) {
        if intensity < threshold {
            whiten(pixel);
        }
    }
    Ok(output)
}

/// Whiten a border of `border_size(w, h, ratio)` pixels on every edge
#[must_use]
pub fn apply_border_fallback(image: &RgbaImage, ratio: f32) -> RgbaImage {
    let (width, height) = image.dimensions();
    let border = border_size(width, height, ratio);
    let mut output = image.clone();
    if border == 0 {
        return output;
    }

    for (x, y, pixel) in output.enumerate_pixels_mut() {
        if in_border(x, y, width, height, border) {
            whiten(pixel);
        }
    }
    output
}

/// Border thickness in pixels: `floor(min(width, height) * ratio)`
#[must_use]
pub fn border_size(width: u32, height: u32, ratio: f32) -> u32 {
    let shorter = f64::from(width.min(height));
    // ratio is validated to 0.0..=0.5, so the product fits in u32
    (shorter * f64::from(ratio.max(0.0))).floor() as u32
}

/// Number of pixels the border fallback whitens for the given size
#[must_use]
pub fn bordered_pixel_count(width: u32, height: u32, ratio: f32) -> u64 {
    let border = u64::from(border_size(width, height, ratio));
    let (w, h) = (u64::from(width), u64::from(height));
    let inner_w = w.saturating_sub(2 * border);
    let inner_h = h.saturating_sub(2 * border);
    w * h - inner_w * inner_h
}

fn in_border(x: u32, y: u32, width: u32, height: u32, border: u32) -> bool {
    x < border
        || y < border
        || x >= width.saturating_sub(border)
        || y >= height.saturating_sub(border)
}

fn whiten(pixel: &mut Rgba<u8>) {
    pixel[0] = WHITE;
    pixel[1] = WHITE;
    pixel[2] = WHITE;
}
