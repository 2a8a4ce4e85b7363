//! Image to tensor conversion for SegFormer-style models

use crate::{
    error::{Result, WhiteBgError},
    models::PreprocessingConfig,
};
use image::{imageops::FilterType, DynamicImage};
use ndarray::Array4;

/// Prepares images for model inference
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Resize to the model input size and build a normalized NCHW tensor
    ///
    /// The image is stretched to `target_size` without preserving aspect ratio,
    /// matching how SegFormer was trained; masks are stretched back later.
    ///
    /// # Errors
    /// Returns `WhiteBgError::Processing` for empty images
    pub fn preprocess(image: &DynamicImage, config: &PreprocessingConfig) -> Result<Array4<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(WhiteBgError::processing("Cannot preprocess an empty image"));
        }

        let [target_height, target_width] = config.target_size;
        let rgb = image.to_rgb8();
        let resized =
            image::imageops::resize(&rgb, target_width, target_height, FilterType::Triangle);

        let mut tensor =
            Array4::<f32>::zeros((1, 3, target_height as usize, target_width as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                let value = f32::from(pixel[channel]) * config.rescale_factor;
                let value = if config.do_normalize {
                    (value - config.normalization_mean[channel])
                        / config.normalization_std[channel]
                } else {
                    value
                };
                tensor[[0, channel, y as usize, x as usize]] = value;
            }
        }

        Ok(tensor)
    }
}
