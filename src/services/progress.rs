//! Progress reporting service
//!
//! Keeps progress reporting out of the pipeline so each frontend decides how
//! (and whether) to display it.

use crate::types::ProcessingTimings;
use instant::Instant;
use std::sync::Arc;

/// Stages of white-background processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Initializing the segmentation backend
    Initialization,
    /// Decoding the input image
    ImageLoading,
    /// Running the segmentation model
    Segmentation,
    /// Picking the subject segment
    SubjectSelection,
    /// Whitening the background
    Compositing,
    /// Encoding the result as PNG
    Encoding,
    /// Processing completed
    Completed,
}

impl ProcessingStage {
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            ProcessingStage::Initialization => "Initializing segmentation model",
            ProcessingStage::ImageLoading => "Loading input image",
            ProcessingStage::Segmentation => "Segmenting image",
            ProcessingStage::SubjectSelection => "Selecting subject",
            ProcessingStage::Compositing => "Whitening background",
            ProcessingStage::Encoding => "Encoding PNG",
            ProcessingStage::Completed => "Processing completed",
        }
    }

    /// Typical progress percentage when the stage starts
    #[must_use]
    pub fn progress_percentage(&self) -> u8 {
        match self {
            ProcessingStage::Initialization => 5,
            ProcessingStage::ImageLoading => 10,
            ProcessingStage::Segmentation => 20,
            ProcessingStage::SubjectSelection => 80,
            ProcessingStage::Compositing => 85,
            ProcessingStage::Encoding => 95,
            ProcessingStage::Completed => 100,
        }
    }
}

/// Progress update with stage and timing information
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub stage: ProcessingStage,
    /// Progress percentage (0-100)
    pub progress: u8,
    pub description: String,
    /// Elapsed time since processing started (milliseconds)
    pub elapsed_ms: u64,
}

impl ProgressUpdate {
    #[must_use]
    pub fn new(stage: ProcessingStage, start_time: Instant) -> Self {
        Self {
            progress: stage.progress_percentage(),
            description: stage.description().to_string(),
            elapsed_ms: start_time.elapsed().as_millis() as u64,
            stage,
        }
    }
}

/// Receives progress during processing
pub trait ProgressReporter: Send + Sync {
    fn report_progress(&self, update: ProgressUpdate);

    fn report_completion(&self, timings: &ProcessingTimings);

    fn report_error(&self, stage: ProcessingStage, error: &str);
}

/// Discards all progress updates
#[derive(Debug, Default)]
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_progress(&self, _update: ProgressUpdate) {}

    fn report_completion(&self, _timings: &ProcessingTimings) {}

    fn report_error(&self, _stage: ProcessingStage, _error: &str) {}
}

/// Logs progress through the `log` facade
#[derive(Debug)]
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        if self.verbose {
            log::info!(
                "[{}%] {} ({}ms elapsed)",
                update.progress,
                update.description,
                update.elapsed_ms
            );
        } else {
            log::debug!("[{}%] {}", update.progress, update.description);
        }
    }

    fn report_completion(&self, timings: &ProcessingTimings) {
        log::info!("White background applied in {}ms", timings.total_ms);
        if self.verbose {
            log::info!("  {}", timings.summary());
        }
    }

    fn report_error(&self, stage: ProcessingStage, error: &str) {
        log::error!("Error during {}: {}", stage.description(), error);
    }
}

/// Tracks stage and elapsed time for one processing run
pub struct ProgressTracker {
    reporter: Arc<dyn ProgressReporter>,
    start_time: Instant,
    current_stage: Option<ProcessingStage>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            reporter,
            start_time: Instant::now(),
            current_stage: None,
        }
    }

    #[must_use]
    pub fn no_op() -> Self {
        Self::new(Arc::new(NoOpProgressReporter))
    }

    pub fn report_stage(&mut self, stage: ProcessingStage) {
        self.current_stage = Some(stage);
        self.reporter
            .report_progress(ProgressUpdate::new(stage, self.start_time));
    }

    pub fn report_completion(&mut self, timings: &ProcessingTimings) {
        self.report_stage(ProcessingStage::Completed);
        self.reporter.report_completion(timings);
    }

    /// Report an error against the current stage
    pub fn report_error(&self, error: &str) {
        let stage = self
            .current_stage
            .unwrap_or(ProcessingStage::Initialization);
        self.reporter.report_error(stage, error);
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    #[must_use]
    pub fn current_stage(&self) -> Option<ProcessingStage> {
        self.current_stage
    }
}
