//! White-background processor
//!
//! Runs one image through `decode → segment → select subject → composite → encode`.
//! Model failures are handled by the configured [`ModelFailurePolicy`]; decode
//! failures always abort.

use crate::{
    compositor::Compositor,
    config::{ModelFailurePolicy, RemovalConfig},
    error::{Result, WhiteBgError},
    inference::{SegmentationBackend, SegmentationInvoker, SharedSegmenter},
    selector::{select_subject, SubjectLabels},
    services::{ImageIOService, NoOpProgressReporter, ProcessingStage, ProgressReporter, ProgressTracker},
    types::{CompositeMethod, FallbackReason, ProcessedImage, ProcessingTimings, SegmentationResult},
};
use chrono::Utc;
use image::DynamicImage;
use instant::Instant;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{instrument, span, Instrument, Level};

/// Whitens the background of car photos
pub struct WhiteBackgroundProcessor {
    config: RemovalConfig,
    invoker: SegmentationInvoker,
    compositor: Compositor,
    labels: SubjectLabels,
    reporter: Arc<dyn ProgressReporter>,
}

impl std::fmt::Debug for WhiteBackgroundProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhiteBackgroundProcessor")
            .field("config", &self.config)
            .field("invoker", &self.invoker)
            .finish()
    }
}

impl WhiteBackgroundProcessor {
    /// Processor backed by the process-wide model handle
    ///
    /// # Errors
    /// Returns `WhiteBgError::InvalidConfig` when the configuration is invalid
    pub fn new(config: RemovalConfig) -> Result<Self> {
        let segmenter = SharedSegmenter::global(&config);
        Self::with_segmenter(config, segmenter)
    }

    /// Processor backed by a specific model handle
    ///
    /// # Errors
    /// Returns `WhiteBgError::InvalidConfig` when the configuration is invalid
    pub fn with_segmenter(config: RemovalConfig, segmenter: Arc<SharedSegmenter>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            invoker: SegmentationInvoker::from_config(segmenter, &config),
            compositor: Compositor::from_config(&config),
            labels: SubjectLabels::new(&config.subject_labels),
            reporter: Arc::new(NoOpProgressReporter),
            config,
        })
    }

    /// Processor using an already initialized backend
    ///
    /// # Errors
    /// Returns `WhiteBgError::InvalidConfig` when the configuration is invalid
    pub fn with_backend(
        config: RemovalConfig,
        backend: Arc<dyn SegmentationBackend>,
    ) -> Result<Self> {
        Self::with_segmenter(config, Arc::new(SharedSegmenter::with_backend(backend)))
    }

    /// Report progress to `reporter`
    #[must_use]
    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RemovalConfig {
        &self.config
    }

    /// Process a JPEG or PNG file
    ///
    /// # Errors
    /// - I/O errors reading the file
    /// - See [`WhiteBackgroundProcessor::process_bytes`]
    pub async fn process_file<P: AsRef<Path>>(&self, path: P) -> Result<ProcessedImage> {
        let bytes = ImageIOService::read_file(path).await?;
        self.process_bytes(&bytes).await
    }

    /// Process an image read from an async reader
    ///
    /// # Errors
    /// - I/O errors while reading
    /// - See [`WhiteBackgroundProcessor::process_bytes`]
    pub async fn process_reader<R: AsyncRead + Unpin>(&self, reader: R) -> Result<ProcessedImage> {
        let bytes = ImageIOService::read_all(reader).await?;
        self.process_bytes(&bytes).await
    }

    /// Process encoded JPEG or PNG bytes
    ///
    /// # Errors
    /// - `Decode` for undecodable input or masks
    /// - Model failures under [`ModelFailurePolicy::Strict`]
    /// - PNG encoding errors
    pub async fn process_bytes(&self, bytes: &[u8]) -> Result<ProcessedImage> {
        let mut tracker = ProgressTracker::new(Arc::clone(&self.reporter));
        let total_start = Instant::now();

        tracker.report_stage(ProcessingStage::ImageLoading);
        let decode_start = Instant::now();
        let image = match ImageIOService::decode_image(bytes) {
            Ok(image) => image,
            Err(e) => {
                tracker.report_error(&e.to_string());
                return Err(e);
            },
        };
        let timings = ProcessingTimings {
            decode_ms: decode_start.elapsed().as_millis() as u64,
            ..ProcessingTimings::default()
        };

        self.run(&image, timings, total_start, &mut tracker).await
    }

    /// Process an already decoded image
    ///
    /// # Errors
    /// Same as [`WhiteBackgroundProcessor::process_bytes`], minus input decoding
    pub async fn process_image(&self, image: &DynamicImage) -> Result<ProcessedImage> {
        let mut tracker = ProgressTracker::new(Arc::clone(&self.reporter));
        self.run(image, ProcessingTimings::default(), Instant::now(), &mut tracker)
            .await
    }

    async fn run(
        &self,
        image: &DynamicImage,
        timings: ProcessingTimings,
        total_start: Instant,
        tracker: &mut ProgressTracker,
    ) -> Result<ProcessedImage> {
        let result = self.run_stages(image, timings, total_start, tracker).await;
        match &result {
            Ok(processed) => tracker.report_completion(&processed.timings),
            Err(e) => tracker.report_error(&e.to_string()),
        }
        result
    }

    #[instrument(
        skip(self, image, timings, total_start, tracker),
        fields(
            backend = %self.config.backend,
            dimensions = %format!("{}x{}", image.width(), image.height())
        )
    )]
    async fn run_stages(
        &self,
        image: &DynamicImage,
        mut timings: ProcessingTimings,
        total_start: Instant,
        tracker: &mut ProgressTracker,
    ) -> Result<ProcessedImage> {
        info!(
            "Processing {}x{} image with {} backend",
            image.width(),
            image.height(),
            self.config.backend
        );

        tracker.report_stage(ProcessingStage::Segmentation);
        let segmentation_start = Instant::now();
        let segmentation = self
            .segment_with_policy(image)
            .instrument(span!(Level::INFO, "segmentation", backend = %self.config.backend))
            .await?;
        timings.segmentation_ms = segmentation_start.elapsed().as_millis() as u64;

        tracker.report_stage(ProcessingStage::SubjectSelection);
        let border = |reason: FallbackReason| CompositeMethod::BorderFallback { reason };
        let (subject, method) = match segmentation {
            Ok(result) if result.is_empty() => (None, border(FallbackReason::NoSegments)),
            Ok(result) => match select_subject(result.segments(), &self.labels) {
                // only the subject's record is validated and decoded
                Some(record) => match self.absorb_model_failure(record.clone().into_segment())? {
                    Ok(segment) => {
                        let method = CompositeMethod::SubjectMask {
                            label: segment.label,
                            score: segment.score,
                        };
                        (Some(segment.mask), method)
                    },
                    Err(reason) => (None, border(FallbackReason::ModelUnavailable(reason))),
                },
                None => {
                    debug!("No subject among labels {:?}", result.labels());
                    (None, border(FallbackReason::NoSubjectFound))
                },
            },
            Err(reason) => (None, border(FallbackReason::ModelUnavailable(reason))),
        };

        tracker.report_stage(ProcessingStage::Compositing);
        let composite_start = Instant::now();
        let composited = {
            let _span = span!(Level::DEBUG, "compositing", method = ?method).entered();
            self.compositor.composite(&image.to_rgba8(), subject.as_ref())?
        };
        timings.composite_ms = composite_start.elapsed().as_millis() as u64;

        tracker.report_stage(ProcessingStage::Encoding);
        let encode_start = Instant::now();
        let png = {
            let _span = span!(Level::DEBUG, "encoding").entered();
            ImageIOService::encode_png(&composited)?
        };
        timings.encode_ms = encode_start.elapsed().as_millis() as u64;
        timings.total_ms = total_start.elapsed().as_millis() as u64;

        match &method {
            CompositeMethod::SubjectMask { label, .. } => {
                info!("Applied '{}' mask. {}", label, timings.summary());
            },
            CompositeMethod::BorderFallback { reason } => {
                info!("Applied border fallback ({}). {}", reason, timings.summary());
            },
        }

        Ok(ProcessedImage {
            image: composited,
            png,
            method,
            timings,
            processed_at: Utc::now(),
        })
    }

    /// Segment the image; the inner `Err` carries the reason a model failure was absorbed
    async fn segment_with_policy(
        &self,
        image: &DynamicImage,
    ) -> Result<std::result::Result<SegmentationResult, String>> {
        self.absorb_model_failure(self.invoker.segment(image).await)
    }

    /// Apply the model failure policy: under `Fallback` a model failure becomes
    /// the inner `Err` reason, under `Strict` it is returned as `ModelUnavailable`
    /// or `Timeout`. Other errors pass through.
    fn absorb_model_failure<T>(
        &self,
        outcome: Result<T>,
    ) -> Result<std::result::Result<T, String>> {
        match outcome {
            Ok(value) => Ok(Ok(value)),
            Err(e) if e.is_model_failure() => match self.config.model_failure_policy {
                ModelFailurePolicy::Fallback => {
                    warn!("Segmentation unavailable, using border fallback: {}", e);
                    Ok(Err(e.to_string()))
                },
                ModelFailurePolicy::Strict => Err(match e {
                    WhiteBgError::ModelUnavailable(_) | WhiteBgError::Timeout(_) => e,
                    other => WhiteBgError::model_unavailable(other.to_string()),
                }),
            },
            Err(e) => Err(e),
        }
    }
}
