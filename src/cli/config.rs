//! Conversion of command-line arguments into a [`RemovalConfig`]

use crate::cache::ModelCache;
use crate::cli::main_impl::Cli;
use crate::config::{BackendKind, ExecutionProvider, ModelFailurePolicy, RemovalConfig};
use crate::models::{ModelSource, ModelSpec};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

/// Environment variable read when `--api-token` is not given
pub(crate) const API_TOKEN_ENV: &str = "HF_TOKEN";

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build the processing configuration, starting from `--config` when given
    pub(crate) fn from_cli(cli: &Cli) -> Result<RemovalConfig> {
        let base = match &cli.config {
            Some(path) => RemovalConfig::from_json_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => RemovalConfig::default(),
        };

        let (backend, provider) = parse_provider_string(&cli.execution_provider)?;

        let mut builder = RemovalConfig::builder()
            .mask_threshold(cli.threshold.unwrap_or(base.mask_threshold))
            .border_ratio(cli.border_ratio.unwrap_or(base.border_ratio))
            .confidence_threshold(cli.confidence.unwrap_or(base.confidence_threshold))
            .inference_timeout(
                cli.timeout
                    .map_or_else(|| base.inference_timeout(), Duration::from_secs),
            )
            .backend(backend)
            .execution_provider(provider)
            .intra_threads(cli.threads);

        builder = if cli.labels.is_empty() {
            builder.subject_labels(base.subject_labels.clone())
        } else {
            builder.subject_labels(cli.labels.clone())
        };

        builder = builder.model_failure_policy(if cli.strict {
            ModelFailurePolicy::Strict
        } else {
            base.model_failure_policy
        });

        let spec = match &cli.model {
            Some(model) => parse_model_arg(model),
            None => base.model_spec.clone(),
        };
        builder = builder.model_spec(ModelSpec {
            variant: cli.variant.clone().or(spec.variant),
            source: spec.source,
        });

        if let Some(endpoint) = cli.endpoint.clone().or(base.remote_endpoint.clone()) {
            builder = builder.remote_endpoint(endpoint);
        }
        if let Some(token) = cli
            .api_token
            .clone()
            .or_else(|| std::env::var(API_TOKEN_ENV).ok())
            .or(base.api_token.clone())
        {
            builder = builder.api_token(token);
        }

        builder.build().context("Invalid configuration")
    }

    /// Reject argument combinations that cannot work
    pub(crate) fn validate_cli(cli: &Cli) -> Result<()> {
        let (backend, _) = parse_provider_string(&cli.execution_provider)?;
        if backend == BackendKind::Remote && cli.endpoint.is_none() && cli.config.is_none() {
            anyhow::bail!("The remote backend requires --endpoint");
        }
        if cli.data_uri && cli.output.as_deref() == Some("-") {
            anyhow::bail!("--data-uri and --output - both write to stdout; choose one");
        }
        if cli.input.len() > 1 && cli.input.iter().any(|input| input == "-") {
            anyhow::bail!("stdin (-) cannot be combined with other inputs");
        }
        Ok(())
    }
}

/// Parse `backend[:provider]`, e.g. `tract`, `onnx:cuda`, `remote`
pub(crate) fn parse_provider_string(value: &str) -> Result<(BackendKind, ExecutionProvider)> {
    let (backend, provider) = match value.split_once(':') {
        Some((backend, provider)) => (backend, Some(provider)),
        None => (value, None),
    };

    let backend: BackendKind = backend.parse().context("Invalid execution provider format")?;
    let provider = match provider.map(str::to_ascii_lowercase).as_deref() {
        None | Some("auto") => ExecutionProvider::Auto,
        Some("cpu") => ExecutionProvider::Cpu,
        Some("cuda") => ExecutionProvider::Cuda,
        Some("coreml") => ExecutionProvider::CoreMl,
        Some(other) => anyhow::bail!(
            "Unknown execution provider '{}'. Use auto, cpu, cuda or coreml",
            other
        ),
    };

    if backend != BackendKind::Onnx && !matches!(provider, ExecutionProvider::Auto | ExecutionProvider::Cpu) {
        anyhow::bail!("Provider '{}' is only supported by the onnx backend", provider);
    }

    Ok((backend, provider))
}

/// Interpret `--model` as a local directory, a repository URL or a cached model id
pub(crate) fn parse_model_arg(model: &str) -> ModelSpec {
    let source = if Path::new(model).is_dir() {
        ModelSource::External(model.into())
    } else if model.starts_with("http://") || model.starts_with("https://") {
        ModelSource::Downloaded(ModelCache::url_to_model_id(model))
    } else {
        ModelSource::Downloaded(model.to_string())
    };
    ModelSpec {
        source,
        variant: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_provider_string() {
        assert_eq!(
            parse_provider_string("tract").unwrap(),
            (BackendKind::Tract, ExecutionProvider::Auto)
        );
        assert_eq!(
            parse_provider_string("onnx:cuda").unwrap(),
            (BackendKind::Onnx, ExecutionProvider::Cuda)
        );
        assert_eq!(
            parse_provider_string("ONNX:CoreML").unwrap(),
            (BackendKind::Onnx, ExecutionProvider::CoreMl)
        );
        assert_eq!(
            parse_provider_string("remote").unwrap().0,
            BackendKind::Remote
        );
        assert!(parse_provider_string("tract:cuda").is_err());
        assert!(parse_provider_string("onnx:tpu").is_err());
        assert!(parse_provider_string("magic").is_err());
    }

    #[test]
    fn test_parse_model_arg() {
        let spec = parse_model_arg("https://huggingface.co/Xenova/segformer-b0-finetuned-ade-512-512");
        assert_eq!(
            spec.source,
            ModelSource::Downloaded("Xenova--segformer-b0-finetuned-ade-512-512".to_string())
        );

        let dir = tempfile::tempdir().unwrap();
        let spec = parse_model_arg(dir.path().to_str().unwrap());
        assert!(matches!(spec.source, ModelSource::External(_)));

        let spec = parse_model_arg("my-model");
        assert_eq!(spec.source, ModelSource::Downloaded("my-model".to_string()));
    }

    #[test]
    fn test_from_cli_flags() {
        let cli = Cli::parse_from([
            "car-whitebg",
            "--threshold",
            "80",
            "--labels",
            "car,van",
            "--timeout",
            "5",
            "--strict",
            "-e",
            "remote",
            "--endpoint",
            "http://localhost:8080/segment",
            "in.jpg",
        ]);
        CliConfigBuilder::validate_cli(&cli).unwrap();
        let config = CliConfigBuilder::from_cli(&cli).unwrap();
        assert_eq!(config.mask_threshold, 80);
        assert_eq!(config.subject_labels, vec!["car", "van"]);
        assert_eq!(config.inference_timeout(), Duration::from_secs(5));
        assert_eq!(config.model_failure_policy, ModelFailurePolicy::Strict);
        assert_eq!(config.backend, BackendKind::Remote);
        assert_eq!(
            config.remote_endpoint.as_deref(),
            Some("http://localhost:8080/segment")
        );
    }

    #[test]
    fn test_remote_requires_endpoint() {
        let cli = Cli::parse_from(["car-whitebg", "-e", "remote", "in.jpg"]);
        assert!(CliConfigBuilder::validate_cli(&cli).is_err());
    }

    #[test]
    fn test_config_file_is_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"mask_threshold": 30, "border_ratio": 0.2}"#).unwrap();

        let cli = Cli::parse_from([
            "car-whitebg",
            "--config",
            path.to_str().unwrap(),
            "--border-ratio",
            "0.05",
            "in.jpg",
        ]);
        let config = CliConfigBuilder::from_cli(&cli).unwrap();
        assert_eq!(config.mask_threshold, 30);
        assert!((config.border_ratio - 0.05).abs() < f32::EPSILON);
    }
}
