//! Backend that replays a preset segmentation result
//!
//! Used by tests and for offline runs where the segments are known ahead of time.

use crate::config::SegmentationOptions;
use crate::error::{Result, WhiteBgError};
use crate::inference::SegmentationBackend;
use crate::types::{MaskData, SegmentRecord};
use async_trait::async_trait;
use image::DynamicImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Script {
    Segments(Vec<SegmentRecord>),
    Fail(String),
}

/// Returns the same segments (or the same failure) on every call
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Script,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new(segments: Vec<SegmentRecord>) -> Self {
        Self {
            script: Script::Segments(segments),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A backend that never finds anything
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// A backend whose every call fails with an inference error
    pub fn failing<S: Into<String>>(message: S) -> Self {
        Self {
            script: Script::Fail(message.into()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// One segment whose mask has the same intensity everywhere
    pub fn uniform<S: Into<String>>(label: S, width: u32, height: u32, intensity: u8) -> Self {
        Self::new(vec![SegmentRecord {
            label: label.into(),
            score: Some(1.0),
            mask: MaskData::Raw {
                width,
                height,
                data: vec![intensity; width as usize * height as usize],
            },
        }])
    }

    /// Wait before answering
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `segment` calls so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentationBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn segment(
        &self,
        _image: &DynamicImage,
        _options: &SegmentationOptions,
    ) -> Result<Vec<SegmentRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.script {
            Script::Segments(segments) => Ok(segments.clone()),
            Script::Fail(message) => Err(WhiteBgError::inference(message.clone())),
        }
    }
}
