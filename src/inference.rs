//! Segmentation backend abstraction, lazy model handle and invoker

use crate::{
    config::{BackendKind, RemovalConfig, SegmentationOptions},
    error::{Result, WhiteBgError},
    types::{SegmentRecord, SegmentationResult},
};
use async_trait::async_trait;
use image::DynamicImage;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::OnceCell;

/// A pretrained semantic-segmentation model
#[async_trait]
pub trait SegmentationBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Segment one image into labeled regions
    ///
    /// # Errors
    /// - Inference or transport failures (`Inference`, `Network`, `ModelUnavailable`)
    /// - Undecodable mask payloads (`Decode`)
    async fn segment(
        &self,
        image: &DynamicImage,
        options: &SegmentationOptions,
    ) -> Result<Vec<SegmentRecord>>;
}

/// Creates segmentation backends from configuration
pub trait BackendFactory: Send + Sync {
    /// Build and initialize a backend; may block while the model loads
    ///
    /// # Errors
    /// - Model files missing or malformed
    /// - Backend not compiled in
    fn create_backend(&self, config: &RemovalConfig) -> Result<Arc<dyn SegmentationBackend>>;

    /// Backend kinds this factory can build
    fn available_backends(&self) -> Vec<BackendKind>;
}

/// Builds the backends compiled into this crate
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(&self, config: &RemovalConfig) -> Result<Arc<dyn SegmentationBackend>> {
        match config.backend {
            BackendKind::Tract => create_tract(config),
            BackendKind::Onnx => create_onnx(config),
            BackendKind::Remote => {
                let endpoint = config.remote_endpoint.as_deref().ok_or_else(|| {
                    WhiteBgError::invalid_config("Remote backend requires an endpoint")
                })?;
                let backend = crate::backends::RemoteBackend::new(
                    endpoint,
                    config.api_token.clone(),
                    config.inference_timeout(),
                )?;
                Ok(Arc::new(backend))
            },
        }
    }

    fn available_backends(&self) -> Vec<BackendKind> {
        let mut backends = Vec::new();
        if cfg!(feature = "tract") {
            backends.push(BackendKind::Tract);
        }
        if cfg!(feature = "onnx") {
            backends.push(BackendKind::Onnx);
        }
        backends.push(BackendKind::Remote);
        backends
    }
}

#[cfg(any(feature = "tract", feature = "onnx"))]
fn resolve_model(config: &RemovalConfig) -> Result<crate::models::SegmentationModel> {
    let cache = crate::cache::ModelCache::new()?;
    crate::models::SegmentationModel::from_spec(
        &config.model_spec,
        &cache,
        config.execution_provider,
    )
}

#[cfg(feature = "tract")]
fn create_tract(config: &RemovalConfig) -> Result<Arc<dyn SegmentationBackend>> {
    let model = resolve_model(config)?;
    Ok(Arc::new(crate::backends::TractBackend::load(model)?))
}

#[cfg(not(feature = "tract"))]
fn create_tract(_config: &RemovalConfig) -> Result<Arc<dyn SegmentationBackend>> {
    Err(WhiteBgError::model_unavailable(
        "Tract backend not compiled in; enable the `tract` feature",
    ))
}

#[cfg(feature = "onnx")]
fn create_onnx(config: &RemovalConfig) -> Result<Arc<dyn SegmentationBackend>> {
    let model = resolve_model(config)?;
    Ok(Arc::new(crate::backends::OnnxBackend::load(
        model,
        config.execution_provider,
        config.intra_threads,
    )?))
}

#[cfg(not(feature = "onnx"))]
fn create_onnx(_config: &RemovalConfig) -> Result<Arc<dyn SegmentationBackend>> {
    Err(WhiteBgError::model_unavailable(
        "ONNX Runtime backend not compiled in; enable the `onnx` feature",
    ))
}

static GLOBAL_SEGMENTER: OnceLock<Arc<SharedSegmenter>> = OnceLock::new();

/// Lazily initialized model handle shared by every caller.
///
/// Concurrent first calls wait on the same initialization. A failed
/// initialization leaves the handle empty, so the next call retries.
pub struct SharedSegmenter {
    factory: Arc<dyn BackendFactory>,
    config: RemovalConfig,
    backend: OnceCell<Arc<dyn SegmentationBackend>>,
}

impl std::fmt::Debug for SharedSegmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegmenter")
            .field("backend", &self.config.backend)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl SharedSegmenter {
    #[must_use]
    pub fn new(factory: Arc<dyn BackendFactory>, config: RemovalConfig) -> Self {
        Self {
            factory,
            config,
            backend: OnceCell::new(),
        }
    }

    /// A handle that is already initialized with `backend`
    #[must_use]
    pub fn with_backend(backend: Arc<dyn SegmentationBackend>) -> Self {
        Self {
            factory: Arc::new(DefaultBackendFactory),
            config: RemovalConfig::default(),
            backend: OnceCell::new_with(Some(backend)),
        }
    }

    /// The process-wide handle, created with `config` on first use.
    ///
    /// Later calls get the same handle regardless of their configuration.
    #[must_use]
    pub fn global(config: &RemovalConfig) -> Arc<Self> {
        Arc::clone(GLOBAL_SEGMENTER.get_or_init(|| {
            Arc::new(Self::new(Arc::new(DefaultBackendFactory), config.clone()))
        }))
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.backend.initialized()
    }

    /// Get the backend, initializing it on first use
    ///
    /// # Errors
    /// Returns `WhiteBgError::ModelUnavailable` when initialization fails
    pub async fn get(&self) -> Result<Arc<dyn SegmentationBackend>> {
        let backend = self
            .backend
            .get_or_try_init(|| async {
                let factory = Arc::clone(&self.factory);
                let config = self.config.clone();
                log::info!("Initializing {} segmentation backend", config.backend);

                match tokio::task::spawn_blocking(move || factory.create_backend(&config)).await {
                    Ok(created) => created.map_err(|e| match e {
                        WhiteBgError::ModelUnavailable(_) => e,
                        other => WhiteBgError::model_unavailable(other.to_string()),
                    }),
                    Err(e) => Err(WhiteBgError::model_unavailable(format!(
                        "Backend initialization task failed: {}",
                        e
                    ))),
                }
            })
            .await?;
        Ok(Arc::clone(backend))
    }
}

/// Runs segmentation with fixed options and a time bound
#[derive(Debug, Clone)]
pub struct SegmentationInvoker {
    segmenter: Arc<SharedSegmenter>,
    options: SegmentationOptions,
    timeout: Duration,
}

impl SegmentationInvoker {
    #[must_use]
    pub fn new(
        segmenter: Arc<SharedSegmenter>,
        options: SegmentationOptions,
        timeout: Duration,
    ) -> Self {
        Self {
            segmenter,
            options,
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(segmenter: Arc<SharedSegmenter>, config: &RemovalConfig) -> Self {
        Self::new(
            segmenter,
            config.segmentation_options(),
            config.inference_timeout(),
        )
    }

    #[must_use]
    pub fn options(&self) -> &SegmentationOptions {
        &self.options
    }

    /// Segment an image. Every call runs inference again.
    ///
    /// # Errors
    /// - `ModelUnavailable` when the backend cannot be initialized
    /// - `Timeout` when inference exceeds the bound
    /// - Backend inference errors
    ///
    /// Returned records are not validated here; masks are decoded by the caller
    /// once a subject is chosen.
    pub async fn segment(&self, image: &DynamicImage) -> Result<SegmentationResult> {
        let backend = self.segmenter.get().await?;

        let records = tokio::time::timeout(self.timeout, backend.segment(image, &self.options))
            .await
            .map_err(|_| WhiteBgError::Timeout(self.timeout))??;

        log::debug!(
            "Backend {} returned {} segments",
            backend.name(),
            records.len()
        );
        Ok(SegmentationResult::new(records))
    }
}
