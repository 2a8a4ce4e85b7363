//! Tracing subscriber setup for the command-line tool
//!
//! The library only emits events and spans; installing a subscriber is left to
//! the binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Target prefix shared by the library and the binary
const CRATE_TARGET: &str = "car_whitebg";

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Colored human-readable output
    Console,
    /// Plain output for CI logs
    Compact,
    /// One JSON object per event
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Tracing configuration builder
#[derive(Debug)]
pub struct TracingConfig {
    /// Verbosity level (maps to log levels)
    pub verbosity: u8,
    pub format: TracingFormat,
    /// Environment filter string (overrides verbosity if set)
    pub env_filter: Option<String>,
    /// Run ID logged once at startup for correlation
    pub session_id: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            format: TracingFormat::Console,
            env_filter: None,
            session_id: None,
        }
    }
}

impl TracingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbosity level (0-2+)
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    /// Set custom environment filter
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    pub fn with_session_id<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Level for this crate's own events
    pub fn verbosity_to_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Filter directive: the crate at the verbosity level, dependencies at
    /// `warn` until `-vvv` opens everything
    pub fn filter_directive(&self) -> String {
        let level = self.verbosity_to_filter();
        if self.verbosity >= 3 {
            level.to_string()
        } else {
            format!("warn,{}={}", CRATE_TARGET, level)
        }
    }

    /// Install the global subscriber
    pub fn init(self) -> anyhow::Result<()> {
        use tracing_subscriber::fmt;

        let filter = match &self.env_filter {
            Some(env_filter) => EnvFilter::try_new(env_filter)?,
            None => EnvFilter::try_new(self.filter_directive())?,
        };
        let registry = Registry::default().with(filter);

        match self.format {
            TracingFormat::Console => {
                let fmt_layer = fmt::layer()
                    .with_ansi(true)
                    .with_target(false)
                    .with_level(true)
                    .with_writer(std::io::stderr)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },
            TracingFormat::Compact => {
                let fmt_layer = fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },
            #[cfg(feature = "tracing-json")]
            TracingFormat::Json => {
                let fmt_layer = fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr);
                registry.with(fmt_layer).try_init()?;
            },
        }

        if let Some(session_id) = &self.session_id {
            tracing::info!(session_id = %session_id, "car-whitebg run started");
        }

        Ok(())
    }
}

/// Initialize tracing with command-line defaults and a fresh run ID
pub fn init_cli_tracing(verbosity: u8, format: TracingFormat) -> anyhow::Result<()> {
    TracingConfig::new()
        .with_verbosity(verbosity)
        .with_format(format)
        .with_session_id(uuid::Uuid::new_v4().to_string())
        .init()
}

/// Span helpers for command-line operations
pub mod spans {
    use tracing::{Level, Span};

    /// A span for one input file
    pub fn file_processing(file_path: &std::path::Path) -> Span {
        tracing::span!(
            Level::INFO,
            "file_processing",
            file_path = %file_path.display()
        )
    }

    /// A span for a batch of input files
    pub fn batch_processing(file_count: usize) -> Span {
        tracing::span!(Level::INFO, "batch_processing", file_count = %file_count)
    }

    /// A span for a model download
    pub fn download(url: &str) -> Span {
        tracing::span!(Level::INFO, "download", url = %url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_stay_quiet_below_vvv() {
        let quiet = TracingConfig::default();
        assert_eq!(quiet.filter_directive(), "warn,car_whitebg=info");
        assert_eq!(
            TracingConfig::new().with_verbosity(2).filter_directive(),
            "warn,car_whitebg=trace"
        );
        assert_eq!(TracingConfig::new().with_verbosity(3).filter_directive(), "trace");
        for directive in [quiet.filter_directive(), "trace".to_string()] {
            assert!(EnvFilter::try_new(directive).is_ok());
        }
    }

    #[test]
    fn test_cli_style_config() {
        let config = TracingConfig::new()
            .with_verbosity(1)
            .with_format(TracingFormat::Compact)
            .with_session_id("3f1c");

        assert_eq!(config.verbosity_to_filter(), "debug");
        assert_eq!(config.format, TracingFormat::Compact);
        assert!(config.env_filter.is_none());
        assert_eq!(config.session_id.as_deref(), Some("3f1c"));

        let overridden = config.with_env_filter("car_whitebg::processor=trace");
        assert_eq!(
            overridden.env_filter.as_deref(),
            Some("car_whitebg::processor=trace")
        );
    }
}
