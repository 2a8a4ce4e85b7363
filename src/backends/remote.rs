//! HTTP backend for hosted image-segmentation models
//!
//! Speaks the Hugging Face inference JSON shape:
//! request `{"inputs": "<base64 image>", "parameters": {"threshold": 0.5, "return_mask": true}}`,
//! response `[{"label": "car", "score": 0.98, "mask": "<base64 png>"}]`.
//! Masks stay base64 text until a segment is chosen as the subject.

use crate::config::SegmentationOptions;
use crate::error::{Result, WhiteBgError};
use crate::inference::SegmentationBackend;
use crate::services::ImageIOService;
use crate::types::{MaskData, SegmentRecord};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::DynamicImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct SegmentationRequest<'a> {
    inputs: &'a str,
    parameters: RequestParameters,
}

#[derive(Debug, Serialize)]
struct RequestParameters {
    threshold: f32,
    return_mask: bool,
}

#[derive(Debug, Deserialize)]
struct WireSegment {
    label: String,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    mask: Option<String>,
}

/// Calls a remote segmentation endpoint
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
}

impl RemoteBackend {
    /// # Errors
    /// Returns `WhiteBgError::Network` when the HTTP client cannot be built,
    /// or `WhiteBgError::InvalidConfig` for a non-http(s) endpoint
    pub fn new(endpoint: &str, api_token: Option<String>, timeout: Duration) -> Result<Self> {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(WhiteBgError::invalid_config(format!(
                "Remote endpoint must be an http(s) URL, got '{}'",
                endpoint
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WhiteBgError::network_error("Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_token,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Parse a response body into boundary records
///
/// # Errors
/// Returns `WhiteBgError::Inference` for malformed JSON
pub fn parse_response(body: &[u8]) -> Result<Vec<SegmentRecord>> {
    let segments: Vec<WireSegment> = serde_json::from_slice(body).map_err(|e| {
        WhiteBgError::inference(format!("Malformed segmentation response: {}", e))
    })?;

    Ok(segments
        .into_iter()
        .map(|segment| SegmentRecord {
            label: segment.label,
            score: segment.score,
            mask: segment.mask.map_or(MaskData::Absent, MaskData::Base64),
        })
        .collect())
}

#[async_trait]
impl SegmentationBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn segment(
        &self,
        image: &DynamicImage,
        options: &SegmentationOptions,
    ) -> Result<Vec<SegmentRecord>> {
        let png = ImageIOService::encode_png(&image.to_rgba8())?;
        let inputs = STANDARD.encode(png);
        let request = SegmentationRequest {
            inputs: &inputs,
            parameters: RequestParameters {
                threshold: options.confidence_threshold,
                return_mask: options.return_mask,
            },
        };

        log::debug!("Posting {} byte image to {}", inputs.len(), self.endpoint);
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| WhiteBgError::network_error("Segmentation request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(WhiteBgError::model_unavailable(format!(
                "Segmentation endpoint returned {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| WhiteBgError::network_error("Failed to read segmentation response", e))?;
        let records = parse_response(&body)?;
        log::debug!("Remote endpoint returned {} segments", records.len());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbaImage};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn mask_png_base64(value: u8) -> String {
        let mask = GrayImage::from_pixel(4, 4, Luma([value]));
        let mut buffer = Vec::new();
        mask.write_to(
            &mut std::io::Cursor::new(&mut buffer),
            image::ImageFormat::Png,
        )
        .unwrap();
        STANDARD.encode(buffer)
    }

    /// Serves one HTTP request with a fixed status and body
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                let n = socket.read(&mut buffer).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{}/segment", address)
    }

    #[test]
    fn test_parse_response() {
        let body = format!(
            r#"[{{"label": "sky", "score": 0.9, "mask": "{}"}},
                {{"label": "car", "mask": "data:image/png;base64,{}"}}]"#,
            mask_png_base64(0),
            mask_png_base64(255)
        );
        let records = parse_response(body.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].score, Some(0.9));
        assert_eq!(records[1].score, None);

        let segment = records[1].clone().into_segment().unwrap();
        assert_eq!(segment.mask.dimensions(), (4, 4));
        assert_eq!(segment.mask.intensity(2, 2), 255);
    }

    #[test]
    fn test_parse_response_errors() {
        assert!(matches!(
            parse_response(b"{\"error\": \"loading\"}"),
            Err(WhiteBgError::Inference(_))
        ));

        // broken masks surface only when the segment is decoded
        let records =
            parse_response(br#"[{"label": "car"}, {"label": "sky", "mask": "***"}]"#).unwrap();
        assert_eq!(records[0].mask, MaskData::Absent);
        assert!(matches!(
            records[0].clone().into_segment(),
            Err(WhiteBgError::Inference(_))
        ));
        assert!(matches!(
            records[1].clone().into_segment(),
            Err(WhiteBgError::Decode(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let request = SegmentationRequest {
            inputs: "aW1n",
            parameters: RequestParameters {
                threshold: 0.5,
                return_mask: SegmentationOptions::default().return_mask,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "inputs": "aW1n",
                "parameters": {"threshold": 0.5, "return_mask": true}
            })
        );
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        assert!(RemoteBackend::new("ftp://host", None, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_segment_against_local_server() {
        let body = format!(r#"[{{"label": "Truck", "score": 0.97, "mask": "{}"}}]"#, mask_png_base64(255));
        let endpoint = serve_once("200 OK", body).await;

        let backend = RemoteBackend::new(&endpoint, Some("token".into()), Duration::from_secs(5)).unwrap();
        let image = DynamicImage::ImageRgba8(RgbaImage::new(4, 4));
        let records = backend
            .segment(&image, &SegmentationOptions::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, "Truck");
    }

    #[tokio::test]
    async fn test_error_status_is_model_unavailable() {
        let endpoint = serve_once("503 Service Unavailable", "{\"error\":\"loading\"}".into()).await;

        let backend = RemoteBackend::new(&endpoint, None, Duration::from_secs(5)).unwrap();
        let image = DynamicImage::ImageRgba8(RgbaImage::new(2, 2));
        let err = backend
            .segment(&image, &SegmentationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WhiteBgError::ModelUnavailable(_)));
    }
}
