//! Tracing setup shared by `preprocess_server` and `preprocess_csv`.
//!
//! Both binaries log to stderr: `preprocess_csv` streams the resampled table on stdout, so
//! nothing else may be written there. Settings come from `FITPULSE_LOG_LEVEL`,
//! `FITPULSE_LOG_FORMAT` (`pretty`, `compact` or `json`) and `FITPULSE_LOG_TARGET`.

use std::io;
use std::net::SocketAddr;

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{env_value, PipelineConfig};

const FALLBACK_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
    /// Single-line human output, handy when piping `preprocess_csv`.
    Compact,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
            Self::Compact => "compact",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `info` or `fitpulse=debug,warn`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: FALLBACK_LEVEL.to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Reads the `FITPULSE_LOG_*` variables. Blank or unrecognised values keep the default.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: env_value("FITPULSE_LOG_LEVEL").unwrap_or(defaults.level),
        format: env_value("FITPULSE_LOG_FORMAT")
            .and_then(|raw| parse_log_format(&raw))
            .unwrap_or(defaults.format),
        include_target: env_value("FITPULSE_LOG_TARGET")
            .and_then(|raw| parse_switch(&raw))
            .unwrap_or(defaults.include_target),
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(level_filter(&config.level))
        .with_target(config.include_target)
        .with_writer(io::stderr)
        .with_ansi(config.format != LogFormat::Json);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
        LogFormat::Compact => {
            tracing::subscriber::set_global_default(builder.compact().finish())?
        }
    }

    Ok(())
}

/// Builds the filter for `level`, or the `info` filter when the directive does not parse.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

/// `binary` names the executable that is starting up.
pub fn log_app_start(binary: &'static str, config: &LoggingConfig) {
    info!(
        component = binary,
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        log_format = config.format.as_str(),
        include_target = config.include_target
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = "preprocess_server",
        event = "app.bind",
        bind_addr = %bound_addr,
        route = "/pipeline"
    );
}

/// Records the effective pipeline settings once at startup.
pub fn log_pipeline_config(config: &PipelineConfig, schema_fingerprint: &str) {
    info!(
        component = "pipeline",
        event = "pipeline.config",
        date_format = config.date_format.as_str(),
        frequency = config.frequency.as_str(),
        timezone = config.timezone.name(),
        entity_column = %config.entity_column,
        timestamp_column = %config.timestamp_column,
        measured_columns = config.measured_columns.len(),
        static_columns = config.static_columns.len(),
        categorical_columns = config.categorical_columns.len(),
        insufficient_data = ?config.insufficient_data,
        max_grid_cells = config.max_grid_cells,
        schema_fingerprint
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        "compact" => Some(LogFormat::Compact),
        _ => None,
    }
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
