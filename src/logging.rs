//! Tracing Infrastructure
//!
//! Structured logging for the control core, built on `tracing` and `tracing-subscriber`.
//! Level and format come from the `[application]` section of the configuration; `RUST_LOG`
//! overrides the level. Events carry box/probe/channel fields, and the stream and script
//! workers log under their thread names.
//!
//! # Example
//! ```no_run
//! use viperbox_control::{config::AppConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(port = config.stream.port, "Control core started");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::AppConfig;

/// Output format for tracing
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line format with colors, for an operator watching a session
    Pretty,
    /// Single-line format without colors
    #[default]
    Compact,
    /// One JSON object per event, for log collection
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Include source file and line of every event
    pub with_file_and_line: bool,
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            with_file_and_line: false,
        }
    }

    /// Level and format from `[application]`; debug level also logs source locations.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;
        Ok(Self {
            level,
            format: config.application.log_format,
            with_file_and_line: level >= Level::DEBUG,
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Initialize tracing from the application configuration
pub fn init_from_config(config: &AppConfig) -> Result<(), String> {
    init(TracingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without changes when a subscriber is already installed, e.g. by a host
/// application or an earlier call.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));
    let located = config.with_file_and_line;

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(located)
            .with_line_number(located)
            .with_thread_names(true)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(located)
            .with_line_number(located)
            .with_thread_names(true)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(located)
            .with_line_number(located)
            .with_thread_names(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| format!("Failed to initialize tracing: {e}"))
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}
