//! Tract backend for local SegFormer inference
//!
//! Pure Rust ONNX inference with no native dependencies. The model is loaded
//! once with a fixed input shape taken from `preprocessor_config.json`, and
//! each call runs on the blocking pool.

use crate::config::SegmentationOptions;
use crate::error::{Result, WhiteBgError};
use crate::inference::SegmentationBackend;
use crate::models::SegmentationModel;
use crate::types::SegmentRecord;
use crate::utils::{segments_from_logits, ImagePreprocessor};
use async_trait::async_trait;
use image::DynamicImage;
use instant::Instant;
use ndarray::{ArrayViewD, IxDyn};
use std::sync::Arc;
use tract_onnx::prelude::*;

/// Type alias for the runnable Tract plan
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Runs a SegFormer ONNX model with Tract
pub struct TractBackend {
    model: Arc<TractModel>,
    metadata: Arc<SegmentationModel>,
}

impl std::fmt::Debug for TractBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TractBackend")
            .field("model", &self.metadata.name())
            .field("variant", &self.metadata.variant())
            .finish()
    }
}

impl TractBackend {
    /// Load and optimize the model
    ///
    /// # Errors
    /// - Model file cannot be read
    /// - ONNX graph cannot be parsed, typed or optimized
    pub fn load(metadata: SegmentationModel) -> Result<Self> {
        let load_start = Instant::now();
        let model_data = metadata.load_bytes()?;
        let [height, width] = metadata.preprocessing().target_size;

        log::info!(
            "Initializing Tract backend: {} ({}, {:.2} MB)",
            metadata.name(),
            metadata.variant(),
            model_data.len() as f64 / (1024.0 * 1024.0)
        );

        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(model_data))
            .map_err(|e| WhiteBgError::model(format!("Failed to load ONNX model: {e}")))?
            .with_input_fact(
                0,
                f32::fact([1, 3, height as usize, width as usize]).into(),
            )
            .map_err(|e| WhiteBgError::model(format!("Failed to set model input shape: {e}")))?
            .into_optimized()
            .map_err(|e| WhiteBgError::model(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| WhiteBgError::model(format!("Failed to create runnable model: {e}")))?;

        log::info!(
            "Tract backend initialized in {}ms",
            load_start.elapsed().as_millis()
        );

        Ok(Self {
            model: Arc::new(model),
            metadata: Arc::new(metadata),
        })
    }

    fn run_blocking(
        model: &TractModel,
        metadata: &SegmentationModel,
        image: &DynamicImage,
        options: SegmentationOptions,
    ) -> Result<Vec<SegmentRecord>> {
        let input = ImagePreprocessor::preprocess(image, metadata.preprocessing())?;
        let shape = input.shape().to_vec();
        let data = input
            .as_slice()
            .ok_or_else(|| WhiteBgError::internal("Input tensor is not contiguous"))?;
        let tensor = Tensor::from_shape::<f32>(&shape, data)
            .map_err(|e| WhiteBgError::inference(format!("Failed to build input tensor: {e}")))?;

        let inference_start = Instant::now();
        let outputs = model
            .run(tvec![tensor.into()])
            .map_err(|e| WhiteBgError::inference(format!("Tract inference failed: {e}")))?;
        log::debug!(
            "Tract inference completed in {}ms",
            inference_start.elapsed().as_millis()
        );

        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| WhiteBgError::inference("No output tensor found"))?
            .into_arc_tensor();
        let logits = output
            .as_slice::<f32>()
            .map_err(|e| WhiteBgError::inference(format!("Output is not f32: {e}")))?;
        let logits = ArrayViewD::from_shape(IxDyn(output.shape()), logits)
            .map_err(|e| WhiteBgError::inference(format!("Invalid output shape: {e}")))?;

        segments_from_logits(logits, metadata.labels(), options.confidence_threshold)
    }
}

#[async_trait]
impl SegmentationBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    async fn segment(
        &self,
        image: &DynamicImage,
        options: &SegmentationOptions,
    ) -> Result<Vec<SegmentRecord>> {
        let model = Arc::clone(&self.model);
        let metadata = Arc::clone(&self.metadata);
        let image = image.clone();
        let options = *options;

        tokio::task::spawn_blocking(move || Self::run_blocking(&model, &metadata, &image, options))
            .await
            .map_err(|e| WhiteBgError::inference(format!("Tract inference task failed: {e}")))?
    }
}
