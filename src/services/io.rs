//! Image I/O: byte loading, decoding, PNG encoding and data URIs

use crate::error::{Result, WhiteBgError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Extensions accepted as input
const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Stateless helpers for getting images in and out of the pipeline
pub struct ImageIOService;

impl ImageIOService {
    /// Read an input file into memory
    ///
    /// # Errors
    /// Returns an I/O error naming the path when the file cannot be read
    pub async fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
        let path = path.as_ref();
        tokio::fs::read(path)
            .await
            .map_err(|e| WhiteBgError::file_io_error("read image file", path, &e))
    }

    /// Drain an async reader into memory
    ///
    /// # Errors
    /// Returns an I/O error when reading fails
    pub async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }

    /// Decode JPEG or PNG bytes, sniffing the format from content
    ///
    /// # Errors
    /// Returns `WhiteBgError::Decode` for empty, unknown or corrupt data
    pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(WhiteBgError::decode("Image data is empty"));
        }
        let format = image::guess_format(bytes)
            .map_err(|e| WhiteBgError::decode(format!("Unrecognized image format: {}", e)))?;
        image::load_from_memory_with_format(bytes, format)
            .map_err(|e| WhiteBgError::decode(format!("Failed to decode {:?} image: {}", format, e)))
    }

    /// Encode RGBA pixels as PNG
    ///
    /// # Errors
    /// Returns `WhiteBgError::Image` when encoding fails
    pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
        Ok(buffer)
    }

    /// MIME type sniffed from content, `application/octet-stream` when unknown
    #[must_use]
    pub fn mime_type(bytes: &[u8]) -> &'static str {
        match image::guess_format(bytes) {
            Ok(ImageFormat::Png) => "image/png",
            Ok(ImageFormat::Jpeg) => "image/jpeg",
            Ok(format) => format.to_mime_type(),
            Err(_) => "application/octet-stream",
        }
    }

    /// `data:<mime>;base64,<payload>` URI
    #[must_use]
    pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
        format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
    }

    /// Whether a path has a supported input extension
    pub fn is_supported_format<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                SUPPORTED_EXTENSIONS
                    .iter()
                    .any(|supported| ext.eq_ignore_ascii_case(supported))
            })
    }
}
