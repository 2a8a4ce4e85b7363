//! Configuration types for white-background processing

use crate::error::{Result, WhiteBgError};
use crate::models::ModelSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Mask intensity (0-255) below which a pixel counts as background
pub const DEFAULT_MASK_THRESHOLD: u8 = 50;

/// Fraction of the shorter image side whitened by the border fallback
pub const DEFAULT_BORDER_RATIO: f32 = 0.1;

/// Minimum segment confidence requested from the segmentation model
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Upper bound on a single inference call
pub const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 120_000;

/// Labels that identify the photographic subject
pub const DEFAULT_SUBJECT_LABELS: &[&str] = &["car", "vehicle", "automobile", "truck", "bus"];

/// File name offered when the processed image is downloaded
pub const DOWNLOAD_FILE_NAME: &str = "car-with-white-background.png";

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

/// Which segmentation backend runs the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pure Rust ONNX inference
    #[default]
    Tract,
    /// ONNX Runtime inference
    Onnx,
    /// Hosted model behind an HTTP endpoint
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tract => write!(f, "tract"),
            Self::Onnx => write!(f, "onnx"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = WhiteBgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tract" => Ok(Self::Tract),
            "onnx" => Ok(Self::Onnx),
            "remote" | "http" => Ok(Self::Remote),
            other => Err(WhiteBgError::invalid_config(format!(
                "Unknown backend '{}'. Expected one of: tract, onnx, remote",
                other
            ))),
        }
    }
}

/// What happens when the segmentation model cannot produce a result.
///
/// Applied identically to initialization failures, inference failures and
/// inference timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelFailurePolicy {
    /// Continue with the border fallback
    #[default]
    Fallback,
    /// Abort processing for the image
    Strict,
}

/// Options handed to the segmentation model with every call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentationOptions {
    /// Segments with a lower confidence are dropped
    pub confidence_threshold: f32,
    /// Masks must be included in the result
    pub return_mask: bool,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            return_mask: true,
        }
    }
}

/// Configuration for white-background processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemovalConfig {
    /// Mask intensity below which a pixel is background
    pub mask_threshold: u8,

    /// Border width for the fallback, as a fraction of the shorter side
    pub border_ratio: f32,

    /// Labels accepted as the subject (case-insensitive)
    pub subject_labels: Vec<String>,

    /// Confidence threshold forwarded to the model
    pub confidence_threshold: f32,

    /// Inference timeout in milliseconds
    pub inference_timeout_ms: u64,

    /// Behavior when the model is unavailable
    pub model_failure_policy: ModelFailurePolicy,

    /// Segmentation backend
    pub backend: BackendKind,

    /// Execution provider for the ONNX Runtime backend
    pub execution_provider: ExecutionProvider,

    /// Model specification for local backends
    pub model_spec: ModelSpec,

    /// Endpoint URL for the remote backend
    pub remote_endpoint: Option<String>,

    /// Bearer token for the remote backend
    #[serde(skip_serializing)]
    pub api_token: Option<String>,

    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            mask_threshold: DEFAULT_MASK_THRESHOLD,
            border_ratio: DEFAULT_BORDER_RATIO,
            subject_labels: DEFAULT_SUBJECT_LABELS
                .iter()
                .map(|label| (*label).to_string())
                .collect(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            inference_timeout_ms: DEFAULT_INFERENCE_TIMEOUT_MS,
            model_failure_policy: ModelFailurePolicy::default(),
            backend: BackendKind::default(),
            execution_provider: ExecutionProvider::default(),
            model_spec: ModelSpec::default(),
            remote_endpoint: None,
            api_token: None,
            intra_threads: 0,
        }
    }
}

impl RemovalConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> RemovalConfigBuilder {
        RemovalConfigBuilder::new()
    }

    /// Inference timeout as a `Duration`
    #[must_use]
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    /// Options forwarded to the segmentation backend
    #[must_use]
    pub fn segmentation_options(&self) -> SegmentationOptions {
        SegmentationOptions {
            confidence_threshold: self.confidence_threshold,
            return_mask: true,
        }
    }

    /// Validate configuration values
    ///
    /// # Errors
    /// - Border ratio outside 0.0-0.5
    /// - Confidence threshold outside 0.0-1.0
    /// - Empty subject label set
    /// - Zero inference timeout
    /// - Remote backend without an endpoint
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=0.5).contains(&self.border_ratio) {
            return Err(WhiteBgError::config_value_error(
                "border ratio",
                self.border_ratio,
                "0.0-0.5",
                Some(DEFAULT_BORDER_RATIO),
            ));
        }

        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(WhiteBgError::config_value_error(
                "confidence threshold",
                self.confidence_threshold,
                "0.0-1.0",
                Some(DEFAULT_CONFIDENCE_THRESHOLD),
            ));
        }

        if self.subject_labels.iter().all(|label| label.trim().is_empty()) {
            return Err(WhiteBgError::invalid_config(
                "At least one subject label is required",
            ));
        }

        if self.inference_timeout_ms == 0 {
            return Err(WhiteBgError::config_value_error(
                "inference timeout (ms)",
                self.inference_timeout_ms,
                "> 0",
                Some(DEFAULT_INFERENCE_TIMEOUT_MS),
            ));
        }

        if self.backend == BackendKind::Remote && self.remote_endpoint.is_none() {
            return Err(WhiteBgError::invalid_config(
                "The remote backend requires an endpoint URL",
            ));
        }

        Ok(())
    }

    /// Load configuration from a JSON file; missing fields take defaults
    ///
    /// # Errors
    /// - File cannot be read
    /// - JSON is malformed
    /// - Loaded values fail validation
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| WhiteBgError::file_io_error("read config file", path, &e))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            WhiteBgError::invalid_config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Builder for `RemovalConfig`
#[derive(Debug, Default)]
pub struct RemovalConfigBuilder {
    config: RemovalConfig,
}

impl RemovalConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RemovalConfig::default(),
        }
    }

    #[must_use]
    pub fn mask_threshold(mut self, threshold: u8) -> Self {
        self.config.mask_threshold = threshold;
        self
    }

    #[must_use]
    pub fn border_ratio(mut self, ratio: f32) -> Self {
        self.config.border_ratio = ratio;
        self
    }

    #[must_use]
    pub fn subject_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.subject_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn confidence_threshold(mut self, threshold: f32) -> Self {
        self.config.confidence_threshold = threshold;
        self
    }

    #[must_use]
    pub fn inference_timeout(mut self, timeout: Duration) -> Self {
        self.config.inference_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn model_failure_policy(mut self, policy: ModelFailurePolicy) -> Self {
        self.config.model_failure_policy = policy;
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn model_spec(mut self, model_spec: ModelSpec) -> Self {
        self.config.model_spec = model_spec;
        self
    }

    #[must_use]
    pub fn remote_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.config.remote_endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn api_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.api_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    /// Returns `WhiteBgError::InvalidConfig` when validation fails
    pub fn build(self) -> Result<RemovalConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
