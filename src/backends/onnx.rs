//! ONNX Runtime backend for local SegFormer inference
//!
//! Supports CUDA and `CoreML` acceleration when the runtime provides them and
//! falls back to CPU otherwise.

use crate::config::{ExecutionProvider, SegmentationOptions};
use crate::error::{Result, WhiteBgError};
use crate::inference::SegmentationBackend;
use crate::models::SegmentationModel;
use crate::types::SegmentRecord;
use crate::utils::{segments_from_logits, ImagePreprocessor};
use async_trait::async_trait;
use image::DynamicImage;
use instant::Instant;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::sync::{Arc, Mutex};

/// Runs a SegFormer ONNX model with ONNX Runtime
pub struct OnnxBackend {
    session: Arc<Mutex<Session>>,
    metadata: Arc<SegmentationModel>,
}

impl std::fmt::Debug for OnnxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxBackend")
            .field("model", &self.metadata.name())
            .field("variant", &self.metadata.variant())
            .finish()
    }
}

impl OnnxBackend {
    /// Create a session for the model
    ///
    /// # Errors
    /// - Model file cannot be read
    /// - ONNX Runtime rejects the session configuration or the model
    pub fn load(
        metadata: SegmentationModel,
        execution_provider: ExecutionProvider,
        intra_threads: usize,
    ) -> Result<Self> {
        let load_start = Instant::now();
        let model_data = metadata.load_bytes()?;

        log::info!(
            "Initializing ONNX Runtime backend: {} ({}, provider {})",
            metadata.name(),
            metadata.variant(),
            execution_provider
        );

        let mut builder = Session::builder()
            .map_err(|e| WhiteBgError::model(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| WhiteBgError::model(format!("Failed to set optimization level: {e}")))?;

        let providers = Self::providers_for(execution_provider);
        if !providers.is_empty() {
            builder = builder.with_execution_providers(providers).map_err(|e| {
                WhiteBgError::model(format!("Failed to set execution providers: {e}"))
            })?;
        }

        let intra_threads = if intra_threads > 0 {
            intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(4)
        };

        let session = builder
            .with_intra_threads(intra_threads)
            .map_err(|e| WhiteBgError::model(format!("Failed to set intra threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| {
                WhiteBgError::model(format!("Failed to create session from model data: {e}"))
            })?;

        log::info!(
            "ONNX Runtime backend initialized in {}ms",
            load_start.elapsed().as_millis()
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            metadata: Arc::new(metadata),
        })
    }

    fn providers_for(execution_provider: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
        let cuda_available =
            || OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        let coreml_available = || {
            OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default()).unwrap_or(false)
        };

        let mut providers = Vec::new();
        match execution_provider {
            ExecutionProvider::Cpu => {},
            ExecutionProvider::Auto => {
                if cuda_available() {
                    providers.push(CUDAExecutionProvider::default().build());
                }
                if coreml_available() {
                    providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
                }
                if providers.is_empty() {
                    log::info!("No hardware acceleration available, using CPU");
                }
            },
            ExecutionProvider::Cuda => {
                if cuda_available() {
                    providers.push(CUDAExecutionProvider::default().build());
                } else {
                    log::warn!("CUDA requested but not available, falling back to CPU");
                }
            },
            ExecutionProvider::CoreMl => {
                if coreml_available() {
                    providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
                } else {
                    log::warn!("CoreML requested but not available, falling back to CPU");
                }
            },
        }
        providers
    }

    fn run_blocking(
        session: &Mutex<Session>,
        metadata: &SegmentationModel,
        image: &DynamicImage,
        options: SegmentationOptions,
    ) -> Result<Vec<SegmentRecord>> {
        let input = ImagePreprocessor::preprocess(image, metadata.preprocessing())?;
        let input_value = Value::from_array(input)
            .map_err(|e| WhiteBgError::inference(format!("Failed to convert input tensor: {e}")))?;

        let mut session = session
            .lock()
            .map_err(|_| WhiteBgError::internal("ONNX session lock poisoned"))?;

        let inference_start = Instant::now();
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| WhiteBgError::inference(format!("ONNX inference failed: {e}")))?;
        log::debug!(
            "ONNX inference completed in {}ms",
            inference_start.elapsed().as_millis()
        );

        let first_key = outputs
            .keys()
            .next()
            .map(str::to_string)
            .ok_or_else(|| WhiteBgError::inference("No output tensors found"))?;
        let logits = outputs
            .get(first_key.as_str())
            .ok_or_else(|| WhiteBgError::inference("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| WhiteBgError::inference(format!("Failed to extract output tensor: {e}")))?;

        segments_from_logits(logits, metadata.labels(), options.confidence_threshold)
    }
}

#[async_trait]
impl SegmentationBackend for OnnxBackend {
    fn name(&self) -> &'static str {
        "onnx"
    }

    async fn segment(
        &self,
        image: &DynamicImage,
        options: &SegmentationOptions,
    ) -> Result<Vec<SegmentRecord>> {
        let session = Arc::clone(&self.session);
        let metadata = Arc::clone(&self.metadata);
        let image = image.clone();
        let options = *options;

        tokio::task::spawn_blocking(move || {
            Self::run_blocking(&session, &metadata, &image, options)
        })
        .await
        .map_err(|e| WhiteBgError::inference(format!("ONNX inference task failed: {e}")))?
    }
}
