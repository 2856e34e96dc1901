//! Subscriber setup for the pipeline binary.
//!
//! The `logging` section of the pipeline config sets the filter and format;
//! `SF_LOG` and `SF_LOG_FORMAT` override it for a single run.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, Subscriber};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;

pub const LOG_FILTER_ENV: &str = "SF_LOG";
pub const LOG_FORMAT_ENV: &str = "SF_LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum LogFormat {
    /// One flattened JSON object per event, for log shipping.
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = LoggingInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            _ => Err(LoggingInitError::UnknownFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for LogFormat {
    type Error = LoggingInitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info,sf_align=debug`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("unknown log format: {0:?} (expected json or pretty)")]
    UnknownFormat(String),
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] ParseError),
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Applies `SF_LOG` / `SF_LOG_FORMAT` from the process environment.
pub fn logging_config_from_env(base: &LoggingConfig) -> Result<LoggingConfig, LoggingInitError> {
    apply_log_overrides(base, |key| std::env::var(key).ok())
}

/// Applies overrides from any key lookup; blank values are ignored.
pub fn apply_log_overrides(
    base: &LoggingConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<LoggingConfig, LoggingInitError> {
    let set = |key: &str| lookup(key).filter(|raw| !raw.trim().is_empty());
    let mut config = base.clone();
    if let Some(filter) = set(LOG_FILTER_ENV) {
        config.filter = filter.trim().to_string();
    }
    if let Some(format) = set(LOG_FORMAT_ENV) {
        config.format = format.parse()?;
    }
    Ok(config)
}

/// Builds the subscriber `init_logging` installs, writing to `writer`.
pub fn logging_subscriber<W>(
    config: &LoggingConfig,
    writer: W,
) -> Result<Box<dyn Subscriber + Send + Sync>, LoggingInitError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_new(&config.filter)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    Ok(match config.format {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Pretty => Box::new(builder.pretty().finish()),
    })
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    tracing::subscriber::set_global_default(logging_subscriber(config, std::io::stderr)?)?;
    Ok(())
}

pub fn log_run_start(logging: &LoggingConfig, cfg: &PipelineConfig, config_path: Option<&Path>) {
    info!(
        component = "sf_pipeline",
        event = "run.start",
        log_filter = %logging.filter,
        log_format = %logging.format,
        config = %config_path.map_or_else(|| "<default>".into(), |p| p.display().to_string()),
        join_mode = ?cfg.join_mode
    );
}

pub fn log_inputs_loaded(left: &Path, right: &Path, left_rows: usize, right_rows: usize) {
    info!(
        component = "sf_pipeline",
        event = "inputs.loaded",
        left = %left.display(),
        right = %right.display(),
        left_rows,
        right_rows
    );
}

pub fn log_output_written(output: &Path, report_path: Option<&Path>, fingerprint: &str) {
    info!(
        component = "sf_pipeline",
        event = "output.written",
        output = %output.display(),
        report = %report_path.map_or_else(String::new, |p| p.display().to_string()),
        fingerprint
    );
}
