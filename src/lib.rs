#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # car-whitebg
//!
//! Replaces the background of car photographs with opaque white.
//!
//! A pretrained semantic-segmentation model (SegFormer-B0 fine-tuned on ADE20K
//! by default) labels the regions of the photo. The first region whose label is
//! a vehicle class becomes the subject mask; every pixel outside it is painted
//! white. When no usable mask exists, a fixed border around the image is
//! whitened instead.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use car_whitebg::{whiten_background_from_bytes, RemovalConfig};
//!
//! # async fn example(upload: Vec<u8>) -> anyhow::Result<()> {
//! let config = RemovalConfig::default();
//! let result = whiten_background_from_bytes(&upload, &config).await?;
//! result.save_png(result.download_file_name())?;
//! println!("{}", result.to_data_uri());
//! # Ok(())
//! # }
//! ```
//!
//! ## Upload sessions
//!
//! [`UploadSession`] drives the `Idle → Loading → Segmenting → Compositing → Ready`
//! state machine for interactive front ends and exposes both the original and
//! the processed image as data URIs.
//!
//! ## Feature Flags
//!
//! - `tract` (default): pure Rust ONNX inference
//! - `onnx`: ONNX Runtime backend with CUDA and `CoreML` execution providers
//! - `cli` (default): the `car-whitebg` command-line tool
//! - `tracing-json`: JSON log output for the command-line tool

pub mod backends;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod compositor;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod models;
pub mod processor;
pub mod selector;
pub mod services;
pub mod session;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod utils;

use tokio::io::AsyncRead;

pub use backends::*;
pub use cache::{format_size, CachedModelInfo, ModelCache, DEFAULT_MODEL_URL};
pub use compositor::{apply_border_fallback, apply_mask, bordered_pixel_count, Compositor};
pub use config::{
    BackendKind, ExecutionProvider, ModelFailurePolicy, RemovalConfig, RemovalConfigBuilder,
    SegmentationOptions,
};
pub use download::{parse_huggingface_url, validate_model_url, ModelDownloader};
pub use error::{Result, WhiteBgError};
pub use inference::{
    BackendFactory, DefaultBackendFactory, SegmentationBackend, SegmentationInvoker,
    SharedSegmenter,
};
pub use models::{LabelMap, ModelSource, ModelSpec, PreprocessingConfig, SegmentationModel};
pub use processor::WhiteBackgroundProcessor;
pub use selector::{select_subject, Labeled, SubjectLabels};
pub use services::{
    ConsoleProgressReporter, ImageIOService, NoOpProgressReporter, ProcessingStage,
    ProgressReporter, ProgressTracker, ProgressUpdate,
};
pub use session::{ReadyImages, SessionState, UploadSession};
pub use types::{
    CompositeMethod, FallbackReason, Mask, MaskData, ProcessedImage, ProcessingTimings, Segment,
    SegmentRecord, SegmentationResult,
};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat};

/// Whiten the background of a JPEG or PNG image given as bytes
///
/// Uses the process-wide model handle, initialized on first use.
///
/// # Examples
///
/// ```rust,no_run
/// use car_whitebg::{whiten_background_from_bytes, ModelFailurePolicy, RemovalConfig};
///
/// # async fn example(upload_bytes: Vec<u8>) -> anyhow::Result<()> {
/// let config = RemovalConfig::builder()
///     .model_failure_policy(ModelFailurePolicy::Strict)
///     .build()?;
/// let result = whiten_background_from_bytes(&upload_bytes, &config).await?;
/// let png: &[u8] = result.png_bytes();
/// # Ok(())
/// # }
/// ```
pub async fn whiten_background_from_bytes(
    image_bytes: &[u8],
    config: &RemovalConfig,
) -> Result<ProcessedImage> {
    WhiteBackgroundProcessor::new(config.clone())?
        .process_bytes(image_bytes)
        .await
}

/// Whiten the background of an already decoded image
pub async fn whiten_background_from_image(
    image: &image::DynamicImage,
    config: &RemovalConfig,
) -> Result<ProcessedImage> {
    WhiteBackgroundProcessor::new(config.clone())?
        .process_image(image)
        .await
}

/// Whiten the background of an image read from an async stream
///
/// ```rust,no_run
/// use car_whitebg::{whiten_background_from_reader, RemovalConfig};
/// use tokio::fs::File;
///
/// # async fn example() -> anyhow::Result<()> {
/// let file = File::open("car.jpg").await?;
/// let result = whiten_background_from_reader(file, &RemovalConfig::default()).await?;
/// result.save_png("car-with-white-background.png")?;
/// # Ok(())
/// # }
/// ```
pub async fn whiten_background_from_reader<R: AsyncRead + Unpin>(
    reader: R,
    config: &RemovalConfig,
) -> Result<ProcessedImage> {
    WhiteBackgroundProcessor::new(config.clone())?
        .process_reader(reader)
        .await
}
