//! car-whitebg command-line tool
//!
//! Whitens the background of car photos, one file, a directory or stdin at a time.

use super::config::{parse_model_arg, CliConfigBuilder};
use crate::{
    cache::{format_size, ModelCache, CACHE_DIR_ENV, DEFAULT_MODEL_URL},
    config::{BackendKind, RemovalConfig, DOWNLOAD_FILE_NAME},
    download::{validate_model_url, ModelDownloader},
    models::ModelSource,
    processor::WhiteBackgroundProcessor,
    services::{ConsoleProgressReporter, ImageIOService},
    tracing_config::{init_cli_tracing, spans, TracingFormat},
    types::{CompositeMethod, ProcessedImage},
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Replace the background of car photos with white
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "car-whitebg")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Input JPEG/PNG files or directories (use "-" for stdin)
    #[arg(value_name = "INPUT", required_unless_present_any = &["only_download", "list_models", "clear_cache", "show_cache_dir"])]
    pub input: Vec<String>,

    /// Output file (single input) or directory (several inputs). Use "-" for stdout.
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Option<String>,

    /// Print the result as a data:image/png;base64 URI
    #[arg(long)]
    pub data_uri: bool,

    /// Backend and provider as backend[:provider] (tract, onnx:auto, onnx:cuda, remote)
    #[arg(short, long, default_value = "tract")]
    pub execution_provider: String,

    /// Segmentation endpoint for the remote backend
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Bearer token for the remote backend [default: $HF_TOKEN]
    #[arg(long, value_name = "TOKEN")]
    pub api_token: Option<String>,

    /// Mask intensity (0-255) below which a pixel is background [default: 50]
    #[arg(long)]
    pub threshold: Option<u8>,

    /// Fallback border width as a fraction of the shorter side [default: 0.1]
    #[arg(long)]
    pub border_ratio: Option<f32>,

    /// Minimum segment confidence (0.0-1.0) [default: 0.5]
    #[arg(long)]
    pub confidence: Option<f32>,

    /// Comma-separated subject labels [default: car,vehicle,automobile,truck,bus]
    #[arg(long, value_delimiter = ',')]
    pub labels: Vec<String>,

    /// Inference timeout in seconds [default: 120]
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Fail instead of using the border fallback when the model is unavailable
    #[arg(long)]
    pub strict: bool,

    /// JSON configuration file; command-line flags take precedence
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of inference threads (0 = auto)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE, -vvv: TRACE for dependencies too)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, value_enum, default_value_t = CliLogFormat::Console)]
    pub log_format: CliLogFormat,

    /// Process directories recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Model URL, cached model id or path to a model folder
    #[arg(short, long)]
    pub model: Option<String>,

    /// Model variant (fp32, quantized, fp16)
    #[arg(long)]
    pub variant: Option<String>,

    /// Download a model (--model URL or the default SegFormer) and exit
    #[arg(long)]
    pub only_download: bool,

    /// List cached models and exit
    #[arg(long)]
    pub list_models: bool,

    /// Clear cached models (combine with --model to clear one model)
    #[arg(long)]
    pub clear_cache: bool,

    /// Show the model cache directory and exit
    #[arg(long)]
    pub show_cache_dir: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliLogFormat {
    Console,
    Compact,
    #[cfg(feature = "tracing-json")]
    Json,
}

impl From<CliLogFormat> for TracingFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Console => Self::Console,
            CliLogFormat::Compact => Self::Compact,
            #[cfg(feature = "tracing-json")]
            CliLogFormat::Json => Self::Json,
        }
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_cli_tracing(cli.verbose, cli.log_format.into())
        .context("Failed to initialize tracing")?;

    if cli.show_cache_dir {
        return show_cache_dir();
    }

    if cli.list_models {
        return list_cached_models();
    }

    if cli.clear_cache {
        return clear_cache_models(&cli);
    }

    if cli.only_download {
        return download_model_only(&cli).await;
    }

    if cli.input.is_empty() {
        anyhow::bail!("At least one input is required");
    }

    CliConfigBuilder::validate_cli(&cli).context("Invalid CLI arguments")?;
    let config = CliConfigBuilder::from_cli(&cli).context("Failed to build configuration")?;

    info!("Input(s): {}", cli.input.join(", "));
    info!(
        "Backend: {}, Provider: {}, Model: {}",
        config.backend,
        config.execution_provider,
        config.model_spec.source.display_name()
    );

    ensure_model_available(&config)
        .await
        .context("Failed to ensure model is available")?;

    let processor = WhiteBackgroundProcessor::new(config)
        .context("Failed to create processor")?
        .with_progress_reporter(Arc::new(ConsoleProgressReporter::new(cli.verbose > 0)));

    let start_time = Instant::now();
    let processed_count = process_inputs(&cli, &processor).await?;
    info!(
        "Processed {} image(s) in {:.2}s",
        processed_count,
        start_time.elapsed().as_secs_f64()
    );

    Ok(())
}

/// Download the default model when a local backend needs it and it is missing
async fn ensure_model_available(config: &RemovalConfig) -> Result<()> {
    if config.backend == BackendKind::Remote {
        return Ok(());
    }

    let ModelSource::Downloaded(model_id) = &config.model_spec.source else {
        return Ok(());
    };

    let cache = ModelCache::new().context("Failed to create model cache")?;
    if cache.is_model_cached(model_id) {
        return Ok(());
    }

    if *model_id != ModelCache::default_model_id() {
        anyhow::bail!(
            "Model '{}' not found in cache. Use --only-download --model <URL> first, or --list-models to see cached models.",
            model_id
        );
    }

    eprintln!("Model not cached. Downloading default model...");
    let downloader = ModelDownloader::with_cache(cache).context("Failed to create downloader")?;
    downloader
        .ensure_default_model(true)
        .instrument(spans::download(DEFAULT_MODEL_URL))
        .await
        .context("Failed to download default model")?;
    eprintln!("Model downloaded.");

    Ok(())
}

fn show_cache_dir() -> Result<()> {
    let cache = ModelCache::new().context("Failed to access cache directory")?;
    println!("Cache directory: {}", cache.cache_dir().display());
    if std::env::var(CACHE_DIR_ENV).is_ok() {
        println!("Source: {} environment variable", CACHE_DIR_ENV);
    } else {
        println!("Source: platform cache directory");
        println!("Set {} to use a different directory", CACHE_DIR_ENV);
    }
    Ok(())
}

fn list_cached_models() -> Result<()> {
    let cache = ModelCache::new().context("Failed to initialize model cache")?;
    let models = cache
        .scan_cached_models()
        .context("Failed to list cached models")?;

    if models.is_empty() {
        println!("No cached models found.");
        println!("Download the default model with: car-whitebg --only-download");
        return Ok(());
    }

    println!("Cached models:");
    for model in models {
        println!("  {}", model.model_id);
        println!("    location: {}", model.path.display());
        if !model.variants.is_empty() {
            println!("    variants: {}", model.variants.join(", "));
        }
        println!("    size: {}", format_size(model.size_bytes));
    }

    Ok(())
}

async fn download_model_only(cli: &Cli) -> Result<()> {
    let model_url = match &cli.model {
        Some(model) if model.starts_with("http") => model.clone(),
        Some(_) => anyhow::bail!(
            "--only-download requires a URL, e.g. --model {}",
            DEFAULT_MODEL_URL
        ),
        None => DEFAULT_MODEL_URL.to_string(),
    };
    validate_model_url(&model_url).context("Invalid model URL")?;

    println!("Downloading model from: {}", model_url);
    let downloader = ModelDownloader::new().context("Failed to create model downloader")?;
    let model_id = downloader
        .download_model(&model_url, true)
        .instrument(spans::download(&model_url))
        .await
        .context("Failed to download model")?;

    println!("Model ID: {}", model_id);
    println!(
        "Cache location: {}",
        downloader.cache().model_path(&model_id).display()
    );
    Ok(())
}

fn clear_cache_models(cli: &Cli) -> Result<()> {
    let cache = ModelCache::new().context("Failed to create model cache")?;

    if let Some(model) = &cli.model {
        let model_id = match parse_model_arg(model).source {
            ModelSource::Downloaded(id) => id,
            ModelSource::External(path) => {
                anyhow::bail!("{} is not a cached model", path.display())
            },
        };
        if cache
            .clear_model(&model_id)
            .with_context(|| format!("Failed to clear model '{}'", model_id))?
        {
            println!("Removed model: {}", model_id);
        } else {
            println!("Model '{}' not found in cache", model_id);
        }
        return Ok(());
    }

    let removed = cache.clear_all_models().context("Failed to clear cache")?;
    if removed.is_empty() {
        println!("Cache was already empty");
    } else {
        println!("Removed {} model(s):", removed.len());
        for model_id in &removed {
            println!("  {}", model_id);
        }
    }
    Ok(())
}

/// Where a processed image goes
#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputTarget {
    File(PathBuf),
    Stdout,
    /// Only the data URI is printed
    None,
}

async fn process_inputs(cli: &Cli, processor: &WhiteBackgroundProcessor) -> Result<usize> {
    if cli.input.first().is_some_and(|input| input == "-") {
        return process_stdin(cli, processor).await;
    }

    let mut all_files = Vec::new();
    for input in &cli.input {
        let path = PathBuf::from(input);
        if path.is_file() {
            if ImageIOService::is_supported_format(&path) {
                all_files.push(path);
            } else {
                warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            all_files.extend(find_image_files(&path, cli.recursive)?);
        } else {
            anyhow::bail!(
                "Input path does not exist or is not accessible: {}",
                path.display()
            );
        }
    }

    if all_files.is_empty() {
        warn!("No JPEG or PNG files found in the provided inputs");
        return Ok(0);
    }
    all_files.sort();

    if let [input] = all_files.as_slice() {
        let target = single_output_target(cli.output.as_deref(), cli.data_uri);
        process_single_file(processor, input, &target, cli.data_uri)
            .instrument(spans::file_processing(input))
            .await?;
        return Ok(1);
    }

    process_batch(cli, processor, &all_files)
        .instrument(spans::batch_processing(all_files.len()))
        .await
}

async fn process_batch(
    cli: &Cli,
    processor: &WhiteBackgroundProcessor,
    files: &[PathBuf],
) -> Result<usize> {
    let output_dir = match cli.output.as_deref() {
        Some("-") => anyhow::bail!("Cannot use stdout (-) as output when processing multiple files"),
        Some(output) => {
            let output_path = PathBuf::from(output);
            if output_path.is_file() {
                anyhow::bail!(
                    "Output path exists and is a file, not a directory: {}",
                    output_path.display()
                );
            }
            std::fs::create_dir_all(&output_path).with_context(|| {
                format!("Failed to create output directory: {}", output_path.display())
            })?;
            Some(output_path)
        },
        None => None,
    };

    let progress = ProgressBar::new(files.len() as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(style.progress_chars("#>-"));
    }

    let mut processed_count = 0;
    let mut failed_count = 0;
    let batch_start = Instant::now();

    for input in files {
        progress.set_message(format!("{}", input.display()));
        let target = OutputTarget::File(batch_output_path(input, output_dir.as_deref()));

        match process_single_file(processor, input, &target, cli.data_uri)
            .instrument(spans::file_processing(input))
            .await
        {
            Ok(()) => processed_count += 1,
            Err(e) => {
                error!("Failed to process {}: {:#}", input.display(), e);
                failed_count += 1;
            },
        }
        progress.inc(1);
    }

    progress.finish_with_message(format!(
        "Completed! Processed: {processed_count}, Failed: {failed_count}"
    ));

    if failed_count > 0 {
        warn!("Some files failed to process. Processed: {processed_count}, Failed: {failed_count}");
    }
    let elapsed = batch_start.elapsed().as_secs_f64();
    info!(
        "Batch finished in {:.2}s ({:.2}s per file)",
        elapsed,
        if processed_count > 0 {
            elapsed / processed_count as f64
        } else {
            0.0
        }
    );

    Ok(processed_count)
}

async fn process_stdin(cli: &Cli, processor: &WhiteBackgroundProcessor) -> Result<usize> {
    info!("Reading image from stdin");
    let image_data = read_stdin()?;

    let result = processor
        .process_bytes(&image_data)
        .await
        .context("Failed to whiten background")?;

    // stdin defaults to stdout unless a data URI is requested
    let target = match (cli.output.as_deref(), cli.data_uri) {
        (None, false) => OutputTarget::Stdout,
        (output, data_uri) => single_output_target(output, data_uri),
    };
    write_result(&result, &target, cli.data_uri)?;
    Ok(1)
}

async fn process_single_file(
    processor: &WhiteBackgroundProcessor,
    input_path: &Path,
    target: &OutputTarget,
    data_uri: bool,
) -> Result<()> {
    let result = processor
        .process_file(input_path)
        .await
        .with_context(|| format!("Failed to whiten background of {}", input_path.display()))?;

    match &result.method {
        CompositeMethod::SubjectMask { label, score } => info!(
            "{}: subject '{}'{}",
            input_path.display(),
            label,
            score.map(|s| format!(" ({:.2})", s)).unwrap_or_default()
        ),
        CompositeMethod::BorderFallback { reason } => {
            info!("{}: border fallback ({})", input_path.display(), reason);
        },
    }

    write_result(&result, target, data_uri)
}

fn write_result(result: &ProcessedImage, target: &OutputTarget, data_uri: bool) -> Result<()> {
    match target {
        OutputTarget::File(path) => {
            result
                .save_png(path)
                .with_context(|| format!("Failed to save {}", path.display()))?;
            info!("Saved {}", path.display());
        },
        OutputTarget::Stdout => write_stdout(result.png_bytes())?,
        OutputTarget::None => {},
    }

    if data_uri {
        println!("{}", result.to_data_uri());
    }
    Ok(())
}

/// `-o` for a single input: a path, stdout, or the default download file name
fn single_output_target(output: Option<&str>, data_uri: bool) -> OutputTarget {
    match output {
        Some("-") => OutputTarget::Stdout,
        Some(path) => OutputTarget::File(PathBuf::from(path)),
        None if data_uri => OutputTarget::None,
        None => OutputTarget::File(PathBuf::from(DOWNLOAD_FILE_NAME)),
    }
}

/// `<stem>-white.png`, in `output_dir` or next to the input
fn batch_output_path(input_path: &Path, output_dir: Option<&Path>) -> PathBuf {
    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let file_name = format!("{stem}-white.png");
    match output_dir {
        Some(dir) => dir.join(file_name),
        None => input_path.with_file_name(file_name),
    }
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    io::stdin()
        .read_to_end(&mut buffer)
        .context("Failed to read image data from stdin")?;

    if buffer.is_empty() {
        anyhow::bail!("No data received from stdin");
    }

    Ok(buffer)
}

fn write_stdout(data: &[u8]) -> Result<()> {
    io::stdout()
        .write_all(data)
        .context("Failed to write image data to stdout")?;
    io::stdout().flush().context("Failed to flush stdout")?;
    Ok(())
}

/// JPEG and PNG files in `dir`
fn find_image_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();

    for entry in walkdir::WalkDir::new(dir).max_depth(max_depth) {
        let entry = entry?;
        if entry.file_type().is_file() && ImageIOService::is_supported_format(entry.path()) {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}
