//! On-disk cache of downloaded segmentation models
//!
//! Models live under `<cache root>/<model id>/` in the Hugging Face layout:
//! `config.json`, `preprocessor_config.json` and `onnx/model*.onnx`.
//! The cache root is `$CAR_WHITEBG_CACHE_DIR/models` when the variable is set,
//! otherwise `<user cache dir>/car-whitebg/models`.

use crate::error::{Result, WhiteBgError};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "CAR_WHITEBG_CACHE_DIR";

/// Repository of the default segmentation model
pub const DEFAULT_MODEL_URL: &str =
    "https://huggingface.co/Xenova/segformer-b0-finetuned-ade-512-512";

const HUGGINGFACE_PREFIX: &str = "https://huggingface.co/";

/// A model directory found in the cache
#[derive(Debug, Clone)]
pub struct CachedModelInfo {
    pub model_id: String,
    pub path: PathBuf,
    /// Available ONNX variants (fp32, fp16, quantized, ...)
    pub variants: Vec<String>,
    pub size_bytes: u64,
}

/// Model cache manager
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Open the default cache, creating the directory when missing
    ///
    /// # Errors
    /// - No user cache directory could be determined and the override is unset
    /// - The directory cannot be created
    pub fn new() -> Result<Self> {
        Self::open(Self::default_cache_dir()?)
    }

    /// Open a cache rooted at `<root>/models`
    ///
    /// # Errors
    /// Returns an I/O error when the directory cannot be created
    pub fn with_cache_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::open(root.as_ref().join("models"))
    }

    fn open(cache_dir: PathBuf) -> Result<Self> {
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir).map_err(|e| {
                WhiteBgError::file_io_error("create cache directory", &cache_dir, &e)
            })?;
        }
        Ok(Self { cache_dir })
    }

    fn default_cache_dir() -> Result<PathBuf> {
        if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
            return Ok(PathBuf::from(cache_override).join("models"));
        }

        Ok(dirs::cache_dir()
            .ok_or_else(|| {
                WhiteBgError::invalid_config(format!(
                    "Failed to determine cache directory. Set {} environment variable.",
                    CACHE_DIR_ENV
                ))
            })?
            .join("car-whitebg")
            .join("models"))
    }

    /// Turn a model URL into a filesystem-safe identifier
    ///
    /// ```
    /// use car_whitebg::cache::ModelCache;
    ///
    /// let id = ModelCache::url_to_model_id(
    ///     "https://huggingface.co/Xenova/segformer-b0-finetuned-ade-512-512",
    /// );
    /// assert_eq!(id, "Xenova--segformer-b0-finetuned-ade-512-512");
    /// ```
    #[must_use]
    pub fn url_to_model_id(url: &str) -> String {
        if let Some(repo) = url.strip_prefix(HUGGINGFACE_PREFIX) {
            return repo.trim_end_matches('/').replace('/', "--");
        }

        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let hash_string = format!("url-{:x}", hasher.finalize());
        hash_string.get(..16).unwrap_or(&hash_string).to_string()
    }

    /// Identifier of the default model
    #[must_use]
    pub fn default_model_id() -> String {
        Self::url_to_model_id(DEFAULT_MODEL_URL)
    }

    /// Whether `model_id` has a complete directory in the cache
    #[must_use]
    pub fn is_model_cached(&self, model_id: &str) -> bool {
        let model_path = self.cache_dir.join(model_id);
        model_path.exists() && Self::is_complete(&model_path)
    }

    /// Directory of `model_id` (may not exist)
    #[must_use]
    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.cache_dir.join(model_id)
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// List cached models, sorted by id
    ///
    /// # Errors
    /// Returns an I/O error when the cache directory cannot be read
    pub fn scan_cached_models(&self) -> Result<Vec<CachedModelInfo>> {
        let mut models = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(models);
        }

        for path in self.model_dirs()? {
            if !Self::is_complete(&path) {
                log::debug!("Skipping incomplete model directory: {}", path.display());
                continue;
            }
            let Some(model_id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            models.push(CachedModelInfo {
                model_id: model_id.to_string(),
                variants: list_variants(&path.join("onnx")),
                size_bytes: directory_size(&path).unwrap_or(0),
                path: path.clone(),
            });
        }

        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    /// Remove every cached model, returning the removed ids
    ///
    /// # Errors
    /// Returns an I/O error when a directory cannot be read or removed
    pub fn clear_all_models(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(removed);
        }

        for path in self.model_dirs()? {
            let model_id = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string();
            log::info!("Removing cached model: {}", model_id);
            fs::remove_dir_all(&path).map_err(|e| {
                WhiteBgError::file_io_error("remove cached model directory", &path, &e)
            })?;
            removed.push(model_id);
        }
        Ok(removed)
    }

    /// Remove one cached model; `false` when it was not cached
    ///
    /// # Errors
    /// Returns an I/O error when the directory cannot be removed
    pub fn clear_model(&self, model_id: &str) -> Result<bool> {
        let model_path = self.model_path(model_id);
        if !model_path.exists() {
            return Ok(false);
        }

        log::info!("Removing cached model: {}", model_id);
        fs::remove_dir_all(&model_path)
            .map_err(|e| WhiteBgError::file_io_error("remove cached model", &model_path, &e))?;
        Ok(true)
    }

    fn model_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            WhiteBgError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        let mut dirs = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| {
                    WhiteBgError::file_io_error("read cache directory entry", &self.cache_dir, &e)
                })?
                .path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }

    fn is_complete(model_path: &Path) -> bool {
        model_path.join("config.json").exists()
            && model_path.join("preprocessor_config.json").exists()
            && model_path.join("onnx").is_dir()
    }
}

/// Map an ONNX file name to its variant name
///
/// `model.onnx` is fp32; `model_<variant>.onnx` is `<variant>`.
#[must_use]
pub fn variant_from_file_name(file_name: &str) -> Option<String> {
    if file_name == "model.onnx" {
        return Some("fp32".to_string());
    }
    file_name
        .strip_prefix("model_")
        .and_then(|s| s.strip_suffix(".onnx"))
        .map(str::to_string)
}

/// ONNX file name for a variant
#[must_use]
pub fn file_name_for_variant(variant: &str) -> String {
    match variant {
        "fp32" => "model.onnx".to_string(),
        other => format!("model_{}.onnx", other),
    }
}

/// Variants present in an `onnx/` directory, sorted
#[must_use]
pub fn list_variants(onnx_dir: &Path) -> Vec<String> {
    let mut variants: Vec<String> = fs::read_dir(onnx_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|entry| entry.file_name().to_str().and_then(variant_from_file_name))
                .collect()
        })
        .unwrap_or_default();
    variants.sort();
    variants
}

fn directory_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            total += directory_size(&path)?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Format a byte count for display
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS.get(unit_index).unwrap_or(&"B");
    if unit_index == 0 {
        format!("{} {}", bytes, unit)
    } else {
        format!("{:.1} {}", size, unit)
    }
}
