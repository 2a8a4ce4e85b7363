//! Upload session state machine
//!
//! `Idle → Loading → Segmenting → Compositing → Ready`; any failure returns the
//! session to `Idle` with a single user-facing notification. `upload` takes
//! `&mut self`, so one upload is in flight per session at a time. State changes
//! are published on a watch channel for display surfaces.

use crate::{
    error::Result,
    processor::WhiteBackgroundProcessor,
    services::{ImageIOService, ProcessingStage, ProgressReporter, ProgressUpdate},
    types::{ProcessedImage, ProcessingTimings},
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

/// Original and processed images of a finished upload
#[derive(Debug, Clone)]
pub struct ReadyImages {
    /// The uploaded image as a data URI
    pub original_uri: String,
    pub processed: ProcessedImage,
}

impl ReadyImages {
    /// The processed image as a `data:image/png;base64,...` URI
    #[must_use]
    pub fn processed_uri(&self) -> String {
        self.processed.to_data_uri()
    }
}

/// Where an upload currently is
#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    Loading,
    Segmenting,
    Compositing,
    Ready(Arc<ReadyImages>),
}

impl SessionState {
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Loading | Self::Segmenting | Self::Compositing)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Segmenting => "segmenting",
            Self::Compositing => "compositing",
            Self::Ready(_) => "ready",
        }
    }
}

/// Moves the session through pipeline stages as the processor reports them
struct StageReporter {
    state: watch::Sender<SessionState>,
}

impl ProgressReporter for StageReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        let next = match update.stage {
            ProcessingStage::Initialization | ProcessingStage::ImageLoading => SessionState::Loading,
            ProcessingStage::Segmentation => SessionState::Segmenting,
            ProcessingStage::SubjectSelection
            | ProcessingStage::Compositing
            | ProcessingStage::Encoding => SessionState::Compositing,
            ProcessingStage::Completed => return,
        };
        self.state.send_replace(next);
    }

    fn report_completion(&self, _timings: &ProcessingTimings) {}

    fn report_error(&self, stage: ProcessingStage, error: &str) {
        log::debug!("Upload failed during {}: {}", stage.description(), error);
    }
}

/// One user's upload workflow
pub struct UploadSession {
    processor: WhiteBackgroundProcessor,
    state: watch::Sender<SessionState>,
    notification: Option<&'static str>,
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("state", &self.state.borrow().name())
            .field("notification", &self.notification)
            .finish()
    }
}

impl UploadSession {
    #[must_use]
    pub fn new(processor: WhiteBackgroundProcessor) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let reporter = Arc::new(StageReporter {
            state: state.clone(),
        });
        Self {
            processor: processor.with_progress_reporter(reporter),
            state,
            notification: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receive every state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Message for the last failed upload, cleared by the next upload or a reset
    #[must_use]
    pub fn notification(&self) -> Option<&'static str> {
        self.notification
    }

    /// Results of the last successful upload
    #[must_use]
    pub fn ready(&self) -> Option<Arc<ReadyImages>> {
        match &*self.state.borrow() {
            SessionState::Ready(images) => Some(Arc::clone(images)),
            _ => None,
        }
    }

    /// Process an uploaded image
    ///
    /// # Errors
    /// Any pipeline error; the session is back in `Idle` with a notification set
    pub async fn upload(&mut self, bytes: &[u8]) -> Result<Arc<ReadyImages>> {
        self.notification = None;
        self.state.send_replace(SessionState::Loading);

        match self.processor.process_bytes(bytes).await {
            Ok(processed) => {
                let images = Arc::new(ReadyImages {
                    original_uri: ImageIOService::data_uri(ImageIOService::mime_type(bytes), bytes),
                    processed,
                });
                self.state
                    .send_replace(SessionState::Ready(Arc::clone(&images)));
                Ok(images)
            },
            Err(e) => {
                log::warn!("Upload failed: {}", e);
                self.notification = Some(e.user_message());
                self.state.send_replace(SessionState::Idle);
                Err(e)
            },
        }
    }

    /// Read and process an image file
    ///
    /// # Errors
    /// Same as [`UploadSession::upload`], plus read errors
    pub async fn upload_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Arc<ReadyImages>> {
        match ImageIOService::read_file(path).await {
            Ok(bytes) => self.upload(&bytes).await,
            Err(e) => {
                self.notification = Some(e.user_message());
                self.state.send_replace(SessionState::Idle);
                Err(e)
            },
        }
    }

    /// Discard results and notifications
    pub fn reset(&mut self) {
        self.notification = None;
        self.state.send_replace(SessionState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ScriptedBackend;
    use crate::config::RemovalConfig;
    use image::{Rgba, RgbaImage};

    fn session(backend: ScriptedBackend) -> UploadSession {
        let processor =
            WhiteBackgroundProcessor::with_backend(RemovalConfig::default(), Arc::new(backend))
                .unwrap();
        UploadSession::new(processor)
    }

    fn jpeg_bytes() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(16, 16, image::Rgb([200, 10, 10]));
        let mut buffer = Vec::new();
        image
            .write_to(
                &mut std::io::Cursor::new(&mut buffer),
                image::ImageFormat::Jpeg,
            )
            .unwrap();
        buffer
    }

    #[tokio::test]
    async fn test_upload_reaches_ready() {
        let mut session = session(ScriptedBackend::uniform("car", 4, 4, 255));
        assert!(matches!(session.state(), SessionState::Idle));

        let images = session.upload(&jpeg_bytes()).await.unwrap();
        assert!(images.original_uri.starts_with("data:image/jpeg;base64,"));
        assert!(images.processed_uri().starts_with("data:image/png;base64,"));
        assert!(matches!(session.state(), SessionState::Ready(_)));
        assert!(session.notification().is_none());

        session.reset();
        assert!(matches!(session.state(), SessionState::Idle));
        assert!(session.ready().is_none());
    }

    #[tokio::test]
    async fn test_state_sequence() {
        let mut session = session(ScriptedBackend::uniform("car", 4, 4, 255));
        let mut receiver = session.subscribe();

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while receiver.changed().await.is_ok() {
                let name = receiver.borrow_and_update().name();
                if seen.last() != Some(&name) {
                    seen.push(name);
                }
                if name == "ready" || name == "idle" {
                    break;
                }
            }
            seen
        });

        session.upload(&jpeg_bytes()).await.unwrap();
        let seen = observer.await.unwrap();
        assert_eq!(seen.first(), Some(&"loading"));
        assert_eq!(seen.last(), Some(&"ready"));
    }

    #[tokio::test]
    async fn test_failure_returns_to_idle() {
        let mut session = session(ScriptedBackend::empty());
        session.upload(&jpeg_bytes()).await.unwrap();

        let err = session.upload(b"corrupt").await.unwrap_err();
        assert!(matches!(err, crate::error::WhiteBgError::Decode(_)));
        assert!(matches!(session.state(), SessionState::Idle));
        assert_eq!(
            session.notification(),
            Some("Error processing image. Please try again with a different image.")
        );

        let image = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]));
        let png = ImageIOService::encode_png(&image).unwrap();
        session.upload(&png).await.unwrap();
        assert!(session.notification().is_none());
    }
}
