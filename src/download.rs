//! Download segmentation models from Hugging Face repositories
//!
//! Files are fetched into a temporary directory and moved into the cache in
//! one rename, so an interrupted download never leaves a half-populated model.

use crate::cache::{ModelCache, DEFAULT_MODEL_URL};
use crate::error::{Result, WhiteBgError};
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

const HUGGINGFACE_PREFIX: &str = "https://huggingface.co/";

/// Metadata files every model needs
const REQUIRED_FILES: &[&str] = &["config.json", "preprocessor_config.json"];

/// ONNX variants to try; at least one must succeed
const ONNX_FILES: &[(&str, &str)] = &[
    ("onnx/model.onnx", "fp32"),
    ("onnx/model_quantized.onnx", "quantized"),
    ("onnx/model_fp16.onnx", "fp16"),
];

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Download progress display, silent without the `cli` feature
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    fn new(show_progress: bool) -> Self {
        #[cfg(feature = "cli")]
        if show_progress {
            let pb = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            return Self::Indicatif(pb);
        }
        #[cfg(not(feature = "cli"))]
        let _ = show_progress;
        Self::NoOp
    }

    fn set_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_message(msg),
            Self::NoOp => {
                let _ = msg;
            },
        }
    }

    fn set_progress(&self, position: u64, total: Option<u64>) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => {
                if let Some(total) = total {
                    pb.set_length(total);
                }
                pb.set_position(position);
            },
            Self::NoOp => {
                let _ = (position, total);
            },
        }
    }

    fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => {
                let _ = msg;
            },
        }
    }
}

/// Fetches model repositories into a [`ModelCache`]
#[derive(Debug)]
pub struct ModelDownloader {
    client: Client,
    cache: ModelCache,
}

impl ModelDownloader {
    /// Downloader targeting the default cache
    ///
    /// # Errors
    /// - HTTP client construction failed
    /// - Cache directory could not be opened
    pub fn new() -> Result<Self> {
        Self::with_cache(ModelCache::new()?)
    }

    /// Downloader targeting a specific cache
    ///
    /// # Errors
    /// Returns `WhiteBgError::Network` when the HTTP client cannot be built
    pub fn with_cache(cache: ModelCache) -> Result<Self> {
        let client = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| WhiteBgError::network_error("Failed to create HTTP client", e))?;
        Ok(Self { client, cache })
    }

    #[must_use]
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Download the default SegFormer model unless already cached
    ///
    /// # Errors
    /// See [`ModelDownloader::download_model`]
    pub async fn ensure_default_model(&self, show_progress: bool) -> Result<String> {
        self.download_model(DEFAULT_MODEL_URL, show_progress).await
    }

    /// Download a model repository into the cache, returning its model id
    ///
    /// An already cached model is not downloaded again.
    ///
    /// # Errors
    /// - URL is not a Hugging Face repository
    /// - Required metadata or every ONNX variant failed to download
    /// - Filesystem errors while moving the model into place
    pub async fn download_model(&self, url: &str, show_progress: bool) -> Result<String> {
        validate_model_url(url)?;
        let model_id = ModelCache::url_to_model_id(url);

        if self.cache.is_model_cached(&model_id) {
            log::info!("Model already cached: {}", model_id);
            return Ok(model_id);
        }

        log::info!("Downloading model {} from {}", model_id, url);
        let temp_dir = create_temp_download_dir(&model_id)?;
        let final_dir = self.cache.model_path(&model_id);
        let progress = ProgressIndicator::new(show_progress);

        match self.download_model_files(url, &temp_dir, &progress).await {
            Ok(()) => {
                if final_dir.exists() {
                    fs::remove_dir_all(&final_dir).map_err(|e| {
                        WhiteBgError::file_io_error("remove existing model directory", &final_dir, &e)
                    })?;
                }
                move_dir(&temp_dir, &final_dir)?;
                progress.finish_with_message(format!("Downloaded {}", model_id));
                log::info!("Successfully downloaded model: {}", model_id);
                Ok(model_id)
            },
            Err(e) => {
                if temp_dir.exists() {
                    if let Err(cleanup_err) = fs::remove_dir_all(&temp_dir) {
                        log::warn!("Failed to clean up temp directory: {}", cleanup_err);
                    }
                }
                progress.finish_with_message("Download failed".to_string());
                Err(e)
            },
        }
    }

    async fn download_model_files(
        &self,
        base_url: &str,
        download_dir: &Path,
        progress: &ProgressIndicator,
    ) -> Result<()> {
        let raw_base = format!("{}/resolve/main/", base_url.trim_end_matches('/'));

        for file_name in REQUIRED_FILES {
            progress.set_message(format!("Downloading {}", file_name));
            self.download_file(
                &format!("{}{}", raw_base, file_name),
                &download_dir.join(file_name),
                progress,
            )
            .await?;
        }

        let mut downloaded_models = 0;
        for (file_path, variant) in ONNX_FILES {
            progress.set_message(format!("Downloading {} model", variant));
            match self
                .download_file(
                    &format!("{}{}", raw_base, file_path),
                    &download_dir.join(file_path),
                    progress,
                )
                .await
            {
                Ok(()) => {
                    downloaded_models += 1;
                    log::info!("Downloaded {} model variant", variant);
                },
                Err(e) => log::warn!("Failed to download {} variant: {}", variant, e),
            }
        }

        if downloaded_models == 0 {
            return Err(WhiteBgError::network_error(
                "Failed to download any ONNX model variant",
                base_url,
            ));
        }
        Ok(())
    }

    async fn download_file(
        &self,
        url: &str,
        local_path: &Path,
        progress: &ProgressIndicator,
    ) -> Result<()> {
        log::debug!("Downloading: {} -> {}", url, local_path.display());

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| WhiteBgError::file_io_error("create directory", parent, &e))?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WhiteBgError::network_error(format!("Failed to download {}", url), e))?;

        if !response.status().is_success() {
            return Err(WhiteBgError::network_error(
                format!("HTTP error for {}", url),
                response.status(),
            ));
        }

        let total_size = response.content_length();
        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| WhiteBgError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut buffer = vec![0; 8192];
        loop {
            let bytes_read = stream
                .read(&mut buffer)
                .await
                .map_err(|e| WhiteBgError::network_error("Failed to read download stream", e))?;
            if bytes_read == 0 {
                break;
            }

            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| WhiteBgError::file_io_error("write to file", local_path, &e))?;
            downloaded += bytes_read as u64;
            progress.set_progress(downloaded, total_size);
        }

        file.flush()
            .await
            .map_err(|e| WhiteBgError::file_io_error("flush file", local_path, &e))?;

        log::debug!("Downloaded {} bytes to {}", downloaded, local_path.display());
        Ok(())
    }
}

fn create_temp_download_dir(model_id: &str) -> Result<PathBuf> {
    let temp_dir = std::env::temp_dir().join(format!("car-whitebg-{}", model_id));
    if temp_dir.exists() {
        fs::remove_dir_all(&temp_dir).map_err(|e| {
            WhiteBgError::file_io_error("remove existing temp directory", &temp_dir, &e)
        })?;
    }
    fs::create_dir_all(&temp_dir)
        .map_err(|e| WhiteBgError::file_io_error("create temp directory", &temp_dir, &e))?;
    Ok(temp_dir)
}

/// Rename, falling back to copy + delete when the temp dir is on another filesystem
fn move_dir(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_dir(from, to)?;
    fs::remove_dir_all(from)
        .map_err(|e| WhiteBgError::file_io_error("remove temp directory", from, &e))
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|e| WhiteBgError::file_io_error("create directory", to, &e))?;
    let entries =
        fs::read_dir(from).map_err(|e| WhiteBgError::file_io_error("read directory", from, &e))?;
    for entry in entries {
        let entry = entry.map_err(|e| WhiteBgError::file_io_error("read directory", from, &e))?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        if source.is_dir() {
            copy_dir(&source, &target)?;
        } else {
            fs::copy(&source, &target)
                .map_err(|e| WhiteBgError::file_io_error("copy model file", &source, &e))?;
        }
    }
    Ok(())
}

/// Check a file against an expected SHA-256 hex digest
///
/// # Errors
/// Returns an I/O error when the file cannot be read
pub fn verify_file_integrity(file_path: &Path, expected_hash: &str) -> Result<bool> {
    let contents = fs::read(file_path)
        .map_err(|e| WhiteBgError::file_io_error("read file for verification", file_path, &e))?;

    let mut hasher = Sha256::new();
    hasher.update(&contents);
    let actual_hash = format!("{:x}", hasher.finalize());

    if actual_hash.eq_ignore_ascii_case(expected_hash) {
        Ok(true)
    } else {
        log::warn!(
            "File integrity check failed for {}: expected {}, got {}",
            file_path.display(),
            expected_hash,
            actual_hash
        );
        Ok(false)
    }
}

/// Accept only `https://huggingface.co/<owner>/<repo>` URLs
///
/// # Errors
/// Returns `WhiteBgError::InvalidConfig` describing the expected format
pub fn validate_model_url(url: &str) -> Result<()> {
    parse_huggingface_url(url).map(|_| ())
}

/// Split a Hugging Face repository URL into `(owner, repository)`
///
/// # Errors
/// Returns `WhiteBgError::InvalidConfig` for empty, non-Hugging Face or malformed URLs
pub fn parse_huggingface_url(url: &str) -> Result<(String, String)> {
    if url.is_empty() {
        return Err(WhiteBgError::invalid_config("Model URL cannot be empty"));
    }

    let repo_path = url.strip_prefix(HUGGINGFACE_PREFIX).ok_or_else(|| {
        WhiteBgError::invalid_config(format!(
            "Unsupported URL format: {}. Only Hugging Face repositories are supported ({}...)",
            url, HUGGINGFACE_PREFIX
        ))
    })?;

    let mut parts = repo_path.trim_end_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        },
        _ => Err(WhiteBgError::invalid_config(format!(
            "Invalid Hugging Face repository URL: {}. Expected format: {}owner/repo-name",
            url, HUGGINGFACE_PREFIX
        ))),
    }
}
