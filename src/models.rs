//! Segmentation model metadata and file resolution

use crate::cache::{file_name_for_variant, list_variants, ModelCache};
use crate::config::ExecutionProvider;
use crate::error::{Result, WhiteBgError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Where the model files come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelSource {
    /// Model directory on the filesystem
    External(PathBuf),
    /// Downloaded model in the cache, by model id
    Downloaded(String),
}

impl ModelSource {
    /// Display name for tracing and logging
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            ModelSource::External(path) => {
                format!(
                    "external:{}",
                    path.file_name().unwrap_or_default().to_string_lossy()
                )
            },
            ModelSource::Downloaded(model_id) => format!("cached:{}", model_id),
        }
    }
}

/// Model source plus an optional variant (fp32, fp16, quantized)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub source: ModelSource,
    pub variant: Option<String>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            source: ModelSource::Downloaded(ModelCache::default_model_id()),
            variant: None,
        }
    }
}

/// Class id to label name, from `config.json`'s `id2label`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
    labels: BTreeMap<usize, String>,
}

impl LabelMap {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = (usize, S)>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(|(id, l)| (id, l.into())).collect(),
        }
    }

    /// Parse the `id2label` table of a model `config.json`
    ///
    /// # Errors
    /// Returns `WhiteBgError::Model` when the table is missing or has non-numeric keys
    pub fn from_model_config(config: &serde_json::Value) -> Result<Self> {
        let table = config
            .get("id2label")
            .and_then(serde_json::Value::as_object)
            .ok_or_else(|| WhiteBgError::model("Missing id2label in config.json"))?;

        let mut labels = BTreeMap::new();
        for (key, value) in table {
            let id: usize = key.parse().map_err(|_| {
                WhiteBgError::model(format!("Invalid class id '{}' in id2label", key))
            })?;
            let label = value.as_str().ok_or_else(|| {
                WhiteBgError::model(format!("Label for class {} is not a string", id))
            })?;
            labels.insert(id, label.to_string());
        }

        if labels.is_empty() {
            return Err(WhiteBgError::model("id2label is empty"));
        }
        Ok(Self { labels })
    }

    /// Label for a class id; unknown ids get a synthetic `class_<id>` name
    #[must_use]
    pub fn label(&self, class_id: usize) -> String {
        self.labels
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
enum SizeField {
    Square(u32),
    Dims { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
}

#[derive(Debug, Deserialize)]
struct RawPreprocessorConfig {
    size: Option<SizeField>,
    #[serde(default)]
    image_mean: Option<Vec<f32>>,
    #[serde(default)]
    image_std: Option<Vec<f32>>,
    #[serde(default = "default_true")]
    do_normalize: bool,
    #[serde(default = "default_true")]
    do_rescale: bool,
    #[serde(default)]
    rescale_factor: Option<f32>,
}

fn default_true() -> bool {
    true
}

/// Input preparation parameters, from `preprocessor_config.json`
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingConfig {
    /// Model input size as `[height, width]`
    pub target_size: [u32; 2],
    /// Per-channel mean on the 0-1 scale
    pub normalization_mean: [f32; 3],
    /// Per-channel std on the 0-1 scale
    pub normalization_std: [f32; 3],
    /// Factor applied to 0-255 channel values before normalization
    pub rescale_factor: f32,
    pub do_normalize: bool,
}

impl Default for PreprocessingConfig {
    /// SegFormer ADE20K defaults
    fn default() -> Self {
        Self {
            target_size: [512, 512],
            normalization_mean: [0.485, 0.456, 0.406],
            normalization_std: [0.229, 0.224, 0.225],
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
        }
    }
}

impl PreprocessingConfig {
    /// Parse a `preprocessor_config.json` document
    ///
    /// # Errors
    /// Returns `WhiteBgError::Model` for malformed JSON, fewer than 3 mean/std
    /// values or a zero standard deviation
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawPreprocessorConfig = serde_json::from_str(json).map_err(|e| {
            WhiteBgError::model(format!("Failed to parse preprocessor_config.json: {}", e))
        })?;
        let defaults = Self::default();

        let target_size = match raw.size {
            Some(SizeField::Square(edge)) | Some(SizeField::ShortestEdge { shortest_edge: edge }) => {
                [edge, edge]
            },
            Some(SizeField::Dims { height, width }) => [height, width],
            None => defaults.target_size,
        };
        if target_size.contains(&0) {
            return Err(WhiteBgError::model("Model input size must be non-zero"));
        }

        let normalization_mean = match raw.image_mean {
            Some(values) => unit_scale(&values, "image_mean")?,
            None => defaults.normalization_mean,
        };
        let normalization_std = match raw.image_std {
            Some(values) => unit_scale(&values, "image_std")?,
            None => defaults.normalization_std,
        };
        if normalization_std.iter().any(|&s| s <= 0.0) {
            return Err(WhiteBgError::model("image_std values must be positive"));
        }

        let rescale_factor = if raw.do_rescale {
            raw.rescale_factor.unwrap_or(defaults.rescale_factor)
        } else {
            1.0
        };

        Ok(Self {
            target_size,
            normalization_mean,
            normalization_std,
            rescale_factor,
            do_normalize: raw.do_normalize,
        })
    }
}

/// First three values, converted to the 0-1 scale when given on the 0-255 scale
fn unit_scale(values: &[f32], field: &str) -> Result<[f32; 3]> {
    let [a, b, c] = match values {
        [a, b, c, ..] => [*a, *b, *c],
        _ => {
            return Err(WhiteBgError::model(format!(
                "{} must have at least 3 values",
                field
            )))
        },
    };
    if a > 1.0 || b > 1.0 || c > 1.0 {
        Ok([a / 255.0, b / 255.0, c / 255.0])
    } else {
        Ok([a, b, c])
    }
}

/// A resolved segmentation model: file location, labels and preprocessing
#[derive(Debug, Clone)]
pub struct SegmentationModel {
    name: String,
    model_dir: PathBuf,
    variant: String,
    labels: LabelMap,
    preprocessing: PreprocessingConfig,
}

impl SegmentationModel {
    /// Resolve a model spec against the cache or the filesystem
    ///
    /// # Errors
    /// - Downloaded model not present in the cache
    /// - Missing or malformed `config.json` / `preprocessor_config.json`
    /// - Requested variant not available
    pub fn from_spec(
        spec: &ModelSpec,
        cache: &ModelCache,
        execution_provider: ExecutionProvider,
    ) -> Result<Self> {
        let model_dir = match &spec.source {
            ModelSource::External(path) => {
                if !path.is_dir() {
                    return Err(WhiteBgError::model(format!(
                        "Model path is not a directory: {}",
                        path.display()
                    )));
                }
                path.clone()
            },
            ModelSource::Downloaded(model_id) => {
                if !cache.is_model_cached(model_id) {
                    let available: Vec<String> = cache
                        .scan_cached_models()?
                        .into_iter()
                        .map(|m| m.model_id)
                        .collect();
                    return Err(WhiteBgError::model_unavailable(format!(
                        "Model '{}' not found in cache. Available models: {:?}",
                        model_id, available
                    )));
                }
                cache.model_path(model_id)
            },
        };

        Self::from_dir(
            spec.source.display_name(),
            &model_dir,
            spec.variant.as_deref(),
            execution_provider,
        )
    }

    /// Load metadata from a model directory in the Hugging Face layout
    ///
    /// # Errors
    /// Same as [`SegmentationModel::from_spec`]
    pub fn from_dir(
        name: String,
        model_dir: &Path,
        variant: Option<&str>,
        execution_provider: ExecutionProvider,
    ) -> Result<Self> {
        let config_path = model_dir.join("config.json");
        let config_text = fs::read_to_string(&config_path)
            .map_err(|e| WhiteBgError::file_io_error("read model config.json", &config_path, &e))?;
        let model_config: serde_json::Value = serde_json::from_str(&config_text)
            .map_err(|e| WhiteBgError::model(format!("Failed to parse config.json: {}", e)))?;
        let labels = LabelMap::from_model_config(&model_config)?;

        let preprocessor_path = model_dir.join("preprocessor_config.json");
        let preprocessing = match fs::read_to_string(&preprocessor_path) {
            Ok(text) => PreprocessingConfig::from_json(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "No preprocessor_config.json in {}, using SegFormer defaults",
                    model_dir.display()
                );
                PreprocessingConfig::default()
            },
            Err(e) => {
                return Err(WhiteBgError::file_io_error(
                    "read preprocessor_config.json",
                    &preprocessor_path,
                    &e,
                ))
            },
        };

        let available = list_variants(&model_dir.join("onnx"));
        let variant = resolve_variant(&available, variant, execution_provider)?;
        log::debug!(
            "Resolved model {} variant {} ({} labels)",
            name,
            variant,
            labels.len()
        );

        Ok(Self {
            name,
            model_dir: model_dir.to_path_buf(),
            variant,
            labels,
            preprocessing,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn variant(&self) -> &str {
        &self.variant
    }

    #[must_use]
    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    #[must_use]
    pub fn preprocessing(&self) -> &PreprocessingConfig {
        &self.preprocessing
    }

    /// Path of the ONNX file for the resolved variant
    #[must_use]
    pub fn model_file(&self) -> PathBuf {
        self.model_dir
            .join("onnx")
            .join(file_name_for_variant(&self.variant))
    }

    /// Read the ONNX file into memory
    ///
    /// # Errors
    /// Returns an I/O error when the file cannot be read
    pub fn load_bytes(&self) -> Result<Vec<u8>> {
        let path = self.model_file();
        fs::read(&path).map_err(|e| WhiteBgError::file_io_error("read model file", &path, &e))
    }
}

/// Pick a variant: the requested one, else by execution provider preference
///
/// # Errors
/// Returns `WhiteBgError::Model` when no variant exists or the requested one is missing
pub fn resolve_variant(
    available: &[String],
    requested: Option<&str>,
    execution_provider: ExecutionProvider,
) -> Result<String> {
    if available.is_empty() {
        return Err(WhiteBgError::model("No ONNX model files found"));
    }

    if let Some(variant) = requested {
        if available.iter().any(|v| v == variant) {
            return Ok(variant.to_string());
        }
        return Err(WhiteBgError::model(format!(
            "Requested variant '{}' not available. Available: {:?}",
            variant, available
        )));
    }

    let preferences: &[&str] = match execution_provider {
        ExecutionProvider::Cuda => &["fp16", "fp32", "quantized"],
        ExecutionProvider::Auto | ExecutionProvider::Cpu | ExecutionProvider::CoreMl => {
            &["fp32", "quantized", "fp16"]
        },
    };

    let chosen = preferences
        .iter()
        .find(|preferred| available.iter().any(|v| v == *preferred))
        .map(|v| (*v).to_string())
        .or_else(|| available.first().cloned());

    chosen.ok_or_else(|| WhiteBgError::model("No ONNX model files found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG_JSON: &str =
        r#"{"model_type": "segformer", "id2label": {"0": "wall", "1": "building", "20": "car"}}"#;

    #[test]
    fn test_label_map_parsing() {
        let config: serde_json::Value = serde_json::from_str(CONFIG_JSON).unwrap();
        let labels = LabelMap::from_model_config(&config).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.label(20), "car");
        assert_eq!(labels.label(7), "class_7");

        let missing: serde_json::Value = serde_json::json!({"model_type": "segformer"});
        assert!(LabelMap::from_model_config(&missing).is_err());
    }

    #[test]
    fn test_preprocessing_square_size() {
        let config = PreprocessingConfig::from_json(
            r#"{"do_normalize": true, "image_mean": [0.485, 0.456, 0.406],
                "image_std": [0.229, 0.224, 0.225], "size": 512}"#,
        )
        .unwrap();
        assert_eq!(config.target_size, [512, 512]);
        assert!((config.rescale_factor - 1.0 / 255.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_preprocessing_dims_and_255_scale() {
        let config = PreprocessingConfig::from_json(
            r#"{"size": {"height": 384, "width": 640}, "image_mean": [127.5, 127.5, 127.5],
                "image_std": [255, 255, 255], "do_rescale": false}"#,
        )
        .unwrap();
        assert_eq!(config.target_size, [384, 640]);
        assert!((config.normalization_mean[0] - 0.5).abs() < 1e-6);
        assert!((config.normalization_std[2] - 1.0).abs() < 1e-6);
        assert!((config.rescale_factor - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_preprocessing_rejects_bad_values() {
        assert!(PreprocessingConfig::from_json(r#"{"image_mean": [0.5]}"#).is_err());
        assert!(PreprocessingConfig::from_json(r#"{"image_std": [0, 0, 0]}"#).is_err());
        assert!(PreprocessingConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_resolve_variant() {
        let available = vec!["fp16".to_string(), "fp32".to_string(), "quantized".to_string()];
        assert_eq!(
            resolve_variant(&available, None, ExecutionProvider::Cpu).unwrap(),
            "fp32"
        );
        assert_eq!(
            resolve_variant(&available, None, ExecutionProvider::Cuda).unwrap(),
            "fp16"
        );
        assert_eq!(
            resolve_variant(&available, Some("quantized"), ExecutionProvider::Cpu).unwrap(),
            "quantized"
        );
        assert!(resolve_variant(&available, Some("int4"), ExecutionProvider::Cpu).is_err());
        assert!(resolve_variant(&[], None, ExecutionProvider::Cpu).is_err());
    }

    #[test]
    fn test_from_dir() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::create_dir_all(dir.join("onnx")).unwrap();
        fs::write(dir.join("config.json"), CONFIG_JSON).unwrap();
        fs::write(dir.join("onnx").join("model_quantized.onnx"), b"bytes").unwrap();

        let model =
            SegmentationModel::from_dir("local".into(), dir, None, ExecutionProvider::Auto)
                .unwrap();
        assert_eq!(model.variant(), "quantized");
        assert_eq!(model.preprocessing(), &PreprocessingConfig::default());
        assert_eq!(model.load_bytes().unwrap(), b"bytes");
    }

    #[test]
    fn test_missing_downloaded_model_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ModelCache::with_cache_dir(temp_dir.path()).unwrap();
        let err = SegmentationModel::from_spec(
            &ModelSpec::default(),
            &cache,
            ExecutionProvider::Auto,
        )
        .unwrap_err();
        assert!(matches!(err, WhiteBgError::ModelUnavailable(_)));
    }

    #[test]
    fn test_display_name() {
        let source = ModelSource::External(PathBuf::from("/models/segformer"));
        assert_eq!(source.display_name(), "external:segformer");
        assert!(ModelSpec::default()
            .source
            .display_name()
            .contains("segformer-b0"));
    }
}
