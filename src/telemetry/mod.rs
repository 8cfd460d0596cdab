//! Logging setup for mailbridge-sync
//!
//! Installs a `tracing-subscriber` registry with a level filter and either
//! JSON or human-readable output.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Telemetry error types
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to install the global subscriber
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line human-readable output
    Pretty,
    /// Single-line plain text
    Plain,
}

impl LogFormat {
    /// Parse a configured format name; unknown names fall back to JSON
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "plain" | "text" | "compact" => LogFormat::Plain,
            _ => LogFormat::Json,
        }
    }
}

/// Map a configured level name onto a tracing level
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG`, when set, overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_level(&config.level).to_string()));

    let format = LogFormat::parse(&config.format);
    let json = (format == LogFormat::Json).then(|| fmt::layer().json());
    let pretty = (format == LogFormat::Pretty).then(|| fmt::layer().pretty());
    let plain = (format == LogFormat::Plain).then(|| fmt::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .with(plain)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}
