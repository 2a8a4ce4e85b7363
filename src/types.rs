//! Core types for segmentation results and composited output

use crate::config::DOWNLOAD_FILE_NAME;
use crate::error::{Result, WhiteBgError};
use crate::services::ImageIOService;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use image::{GrayImage, Luma, RgbaImage};
use std::path::Path;

/// Single-channel intensity grid; high values belong to the segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Mask {
    /// Create a mask from raw row-major intensities
    ///
    /// # Errors
    /// Returns `WhiteBgError::Decode` for a zero dimension or when `data` does
    /// not hold `width * height` values
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        ensure_non_empty(width, height)?;
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(WhiteBgError::decode(format!(
                "Mask data has {} values, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Create a mask with every pixel set to `value`
    #[must_use]
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            data: vec![value; width as usize * height as usize],
            width,
            height,
        }
    }

    /// Create a mask from a grayscale image
    #[must_use]
    pub fn from_luma(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
        }
    }

    /// Decode an encoded mask image (PNG, JPEG).
    ///
    /// Mask channels are assumed equal, so the red channel is taken as the intensity.
    ///
    /// # Errors
    /// Returns `WhiteBgError::Decode` when the bytes are not a decodable image
    pub fn from_encoded(bytes: &[u8]) -> Result<Self> {
        let rgba = ImageIOService::decode_image(bytes)
            .map_err(|e| WhiteBgError::decode(format!("Failed to decode mask image: {}", e)))?
            .to_rgba8();
        let (width, height) = rgba.dimensions();
        ensure_non_empty(width, height)?;
        let data = rgba.pixels().map(|pixel| pixel[0]).collect();
        Ok(Self {
            data,
            width,
            height,
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Raw row-major intensities
    #[must_use]
    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    /// Intensity at `(x, y)`; out-of-bounds reads as background
    #[must_use]
    pub fn intensity(&self, x: u32, y: u32) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Fraction of pixels at or above `threshold`
    #[must_use]
    pub fn coverage(&self, threshold: u8) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let covered = self.data.iter().filter(|&&value| value >= threshold).count();
        covered as f32 / self.data.len() as f32
    }

    /// Convert the mask to a grayscale image
    #[must_use]
    pub fn to_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| Luma([self.intensity(x, y)]))
    }

    /// Resample the mask to new dimensions with linear filtering
    #[must_use]
    pub fn resize(&self, new_width: u32, new_height: u32) -> Self {
        if self.dimensions() == (new_width, new_height) {
            return self.clone();
        }
        let resized = image::imageops::resize(
            &self.to_image(),
            new_width,
            new_height,
            image::imageops::FilterType::Triangle,
        );
        Self::from_luma(resized)
    }
}

fn ensure_non_empty(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(WhiteBgError::decode(format!(
            "Mask has no pixels ({}x{})",
            width, height
        )));
    }
    Ok(())
}

/// Mask payload as produced at the model boundary, decoded only when the
/// segment is chosen as the subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskData {
    /// Encoded image bytes (usually PNG)
    Encoded(Vec<u8>),
    /// Base64 text of an encoded image, with or without a `data:` prefix
    Base64(String),
    /// The backend sent no mask for this segment
    Absent,
    /// Already-decoded intensities
    Raw {
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
}

/// One labeled region as handed over by a segmentation backend, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    pub label: String,
    pub score: Option<f32>,
    pub mask: MaskData,
}

impl SegmentRecord {
    /// Validate the record and decode its mask
    ///
    /// # Errors
    /// - `WhiteBgError::Inference` for an empty label, a score outside 0.0-1.0
    ///   or a missing mask
    /// - `WhiteBgError::Decode` when the mask cannot be decoded
    pub fn into_segment(self) -> Result<Segment> {
        let label = self.label;
        if label.trim().is_empty() {
            return Err(WhiteBgError::inference("Segment has an empty label"));
        }

        if let Some(score) = self.score {
            if !(0.0..=1.0).contains(&score) || score.is_nan() {
                return Err(WhiteBgError::inference(format!(
                    "Segment '{}' has score {} outside 0.0-1.0",
                    label, score
                )));
            }
        }

        let mask = match self.mask {
            MaskData::Encoded(bytes) => Mask::from_encoded(&bytes)?,
            MaskData::Base64(text) => {
                let payload = text
                    .split_once(";base64,")
                    .map_or(text.as_str(), |(_, payload)| payload);
                let bytes = STANDARD.decode(payload.trim()).map_err(|e| {
                    WhiteBgError::decode(format!(
                        "Mask for segment '{}' is not valid base64: {}",
                        label, e
                    ))
                })?;
                Mask::from_encoded(&bytes)?
            },
            MaskData::Absent => {
                return Err(WhiteBgError::inference(format!(
                    "Segment '{}' has no mask",
                    label
                )))
            },
            MaskData::Raw {
                width,
                height,
                data,
            } => Mask::new(width, height, data)?,
        };

        Ok(Segment {
            label,
            score: self.score,
            mask,
        })
    }
}

/// A labeled region predicted by the segmentation model
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub label: String,
    pub score: Option<f32>,
    pub mask: Mask,
}

/// Ordered records returned for one image.
///
/// Records are kept as the backend sent them; only the record picked as the
/// subject is validated and decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentationResult {
    segments: Vec<SegmentRecord>,
}

impl SegmentationResult {
    #[must_use]
    pub fn new(segments: Vec<SegmentRecord>) -> Self {
        Self { segments }
    }

    #[must_use]
    pub fn segments(&self) -> &[SegmentRecord] {
        &self.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SegmentRecord> {
        self.segments.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Labels in result order
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.label.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a SegmentationResult {
    type Item = &'a SegmentRecord;
    type IntoIter = std::slice::Iter<'a, SegmentRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

/// Why the border fallback was used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The model returned no segments at all
    NoSegments,
    /// Segments were returned but none carried a subject label
    NoSubjectFound,
    /// The model could not be initialized or run
    ModelUnavailable(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSegments => write!(f, "no segments returned"),
            Self::NoSubjectFound => write!(f, "no subject segment found"),
            Self::ModelUnavailable(reason) => write!(f, "model unavailable: {}", reason),
        }
    }
}

/// How the background was whitened
#[derive(Debug, Clone, PartialEq)]
pub enum CompositeMethod {
    /// A subject segment's mask was applied
    SubjectMask { label: String, score: Option<f32> },
    /// The fixed-border heuristic was applied
    BorderFallback { reason: FallbackReason },
}

/// Per-stage timing breakdown in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingTimings {
    pub decode_ms: u64,
    pub segmentation_ms: u64,
    pub composite_ms: u64,
    pub encode_ms: u64,
    pub total_ms: u64,
}

impl ProcessingTimings {
    /// One-line summary for logs
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Total: {}ms | Decode: {}ms | Segmentation: {}ms | Composite: {}ms | Encode: {}ms",
            self.total_ms, self.decode_ms, self.segmentation_ms, self.composite_ms, self.encode_ms
        )
    }
}

/// A composited image with a white background, ready for display or download
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// Composited pixels
    pub image: RgbaImage,
    /// PNG encoding of `image`
    pub png: Vec<u8>,
    /// How the background was whitened
    pub method: CompositeMethod,
    /// Stage timings
    pub timings: ProcessingTimings,
    /// When processing finished
    pub processed_at: DateTime<Utc>,
}

impl ProcessedImage {
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// PNG bytes of the result
    #[must_use]
    pub fn png_bytes(&self) -> &[u8] {
        &self.png
    }

    /// `data:image/png;base64,...` URI for display surfaces
    #[must_use]
    pub fn to_data_uri(&self) -> String {
        ImageIOService::data_uri("image/png", &self.png)
    }

    /// File name offered for downloads
    #[must_use]
    pub fn download_file_name(&self) -> &'static str {
        DOWNLOAD_FILE_NAME
    }

    /// Whether the border fallback produced this image
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self.method, CompositeMethod::BorderFallback { .. })
    }

    /// Write the PNG bytes to `path`
    ///
    /// # Errors
    /// Returns `WhiteBgError::Io` when the file cannot be written
    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, &self.png)
            .map_err(|e| WhiteBgError::file_io_error("write processed image", path, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_gray_png(image: &GrayImage) -> Vec<u8> {
        let mut buffer = Vec::new();
        image
            .write_to(
                &mut std::io::Cursor::new(&mut buffer),
                image::ImageFormat::Png,
            )
            .unwrap();
        buffer
    }

    #[test]
    fn test_mask_new_rejects_wrong_length() {
        assert!(Mask::new(2, 2, vec![0; 3]).is_err());
        let mask = Mask::new(2, 2, vec![0, 10, 20, 30]).unwrap();
        assert_eq!(mask.intensity(1, 1), 30);
        assert_eq!(mask.intensity(5, 5), 0);
    }

    #[test]
    fn test_zero_sized_masks_are_decode_failures() {
        for (width, height) in [(0, 0), (0, 4), (4, 0)] {
            let err = Mask::new(width, height, Vec::new()).unwrap_err();
            assert!(matches!(err, WhiteBgError::Decode(_)), "{width}x{height}");
        }

        let record = SegmentRecord {
            label: "car".to_string(),
            score: Some(0.9),
            mask: MaskData::Raw {
                width: 0,
                height: 0,
                data: vec![],
            },
        };
        assert!(matches!(record.into_segment(), Err(WhiteBgError::Decode(_))));
    }

    #[test]
    fn test_mask_from_encoded_png() {
        let gray = GrayImage::from_fn(4, 3, |x, _| Luma([(x * 60) as u8]));
        let mask = Mask::from_encoded(&encode_gray_png(&gray)).unwrap();
        assert_eq!(mask.dimensions(), (4, 3));
        assert_eq!(mask.intensity(3, 2), 180);
    }

    #[test]
    fn test_mask_from_encoded_garbage_is_decode_failure() {
        let err = Mask::from_encoded(b"definitely not an image").unwrap_err();
        assert!(matches!(err, WhiteBgError::Decode(_)));
    }

    #[test]
    fn test_mask_resize_preserves_uniform_values() {
        let mask = Mask::filled(8, 8, 255);
        let resized = mask.resize(20, 13);
        assert_eq!(resized.dimensions(), (20, 13));
        assert!(resized.as_raw().iter().all(|&v| v == 255));
    }

    #[test]
    fn test_mask_coverage() {
        let mask = Mask::new(2, 2, vec![0, 49, 50, 255]).unwrap();
        assert!((mask.coverage(50) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_record_validation() {
        let record = SegmentRecord {
            label: "  Car ".to_string(),
            score: Some(0.9),
            mask: MaskData::Raw {
                width: 1,
                height: 1,
                data: vec![255],
            },
        };
        let segment = record.into_segment().unwrap();
        assert_eq!(segment.label, "  Car ");

        let empty_label = SegmentRecord {
            label: " ".to_string(),
            score: None,
            mask: MaskData::Raw {
                width: 1,
                height: 1,
                data: vec![0],
            },
        };
        assert!(matches!(
            empty_label.into_segment(),
            Err(WhiteBgError::Inference(_))
        ));

        let bad_score = SegmentRecord {
            label: "car".to_string(),
            score: Some(1.5),
            mask: MaskData::Raw {
                width: 1,
                height: 1,
                data: vec![0],
            },
        };
        assert!(bad_score.into_segment().is_err());

        let no_mask = SegmentRecord {
            label: "car".to_string(),
            score: None,
            mask: MaskData::Absent,
        };
        assert!(matches!(no_mask.into_segment(), Err(WhiteBgError::Inference(_))));
    }

    #[test]
    fn test_base64_mask_payloads() {
        let png = encode_gray_png(&GrayImage::from_pixel(3, 2, Luma([200])));
        let plain = STANDARD.encode(&png);
        for text in [plain.clone(), format!("data:image/png;base64,{}", plain)] {
            let segment = SegmentRecord {
                label: "car".to_string(),
                score: None,
                mask: MaskData::Base64(text),
            }
            .into_segment()
            .unwrap();
            assert_eq!(segment.mask.dimensions(), (3, 2));
            assert_eq!(segment.mask.intensity(2, 1), 200);
        }

        let garbage = SegmentRecord {
            label: "car".to_string(),
            score: None,
            mask: MaskData::Base64("***".to_string()),
        };
        assert!(matches!(garbage.into_segment(), Err(WhiteBgError::Decode(_))));
    }

    #[test]
    fn test_result_keeps_records_unvalidated() {
        let records = ["sky", "road", "car"]
            .iter()
            .map(|label| SegmentRecord {
                label: (*label).to_string(),
                score: Some(2.0),
                mask: MaskData::Encoded(b"not a png".to_vec()),
            })
            .collect();
        let result = SegmentationResult::new(records);
        assert_eq!(result.labels(), vec!["sky", "road", "car"]);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_fallback_reason_display() {
        assert_eq!(
            FallbackReason::NoSubjectFound.to_string(),
            "no subject segment found"
        );
        assert!(FallbackReason::ModelUnavailable("boom".into())
            .to_string()
            .contains("boom"));
    }
}
