//! Error types for white-background compositing

use thiserror::Error;

/// Result type alias for white-background operations
pub type Result<T> = std::result::Result<T, WhiteBgError>;

/// Error taxonomy for the decode → segment → composite → encode pipeline
#[derive(Error, Debug)]
pub enum WhiteBgError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding errors raised by the image crate
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Source or mask bytes could not be decoded as an image
    #[error("Decode failure: {0}")]
    Decode(String),

    /// Segmentation backend failed to initialize or run
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Mask and image sizes disagree at the point of application
    #[error("Mask is {mask_width}x{mask_height} but image is {image_width}x{image_height}")]
    MaskMismatch {
        mask_width: u32,
        mask_height: u32,
        image_width: u32,
        image_height: u32,
    },

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Model files missing or malformed
    #[error("Model error: {0}")]
    Model(String),

    /// Network errors while downloading models or calling a remote backend
    #[error("Network error: {0}")]
    Network(String),

    /// Inference did not answer within the configured bound
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Pixel processing errors
    #[error("Processing error: {0}")]
    Processing(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WhiteBgError {
    /// Create a new decode failure
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new model-unavailable error
    pub fn model_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ModelUnavailable(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new model error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new processing error
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        Self::Io(std::io::Error::new(
            error.kind(),
            format!(
                "Failed to {} '{}': {}",
                operation,
                path.as_ref().display(),
                error
            ),
        ))
    }

    /// Create network error with context
    pub fn network_error<S: Into<String>, E: std::fmt::Display>(context: S, error: E) -> Self {
        Self::Network(format!("{}: {}", context.into(), error))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {}", rec),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {}).{}",
            parameter, value, valid_range, recommendation
        ))
    }

    /// Whether this error originates from the segmentation model rather than the image.
    ///
    /// Only these errors may be absorbed by the model failure policy; decode
    /// failures and pixel errors always abort the pipeline.
    #[must_use]
    pub fn is_model_failure(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable(_)
                | Self::Inference(_)
                | Self::Model(_)
                | Self::Network(_)
                | Self::Timeout(_)
        )
    }

    /// Short message suitable for a user-facing notification
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Decode(_) | Self::Image(_) => {
                "Error processing image. Please try again with a different image."
            },
            Self::ModelUnavailable(_) | Self::Timeout(_) => {
                "The image processing model is unavailable. Please try again later."
            },
            _ => "Error processing image.",
        }
    }
}
