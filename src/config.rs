//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/viperbox.toml` (base configuration, optional)
//! 2. Environment variables (prefixed with `VIPERBOX_`, sections split on `__`)
//!
//! Sections: `application`, `storage`, `stream`, `scheduler`, `device`, `defaults`.
//!
//! Every field has a default, so an empty or missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use viperbox_control::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! println!("Streaming on port {}", config.stream.port);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ViperError};
use crate::logging::{parse_log_level, OutputFormat};
use crate::range::parse_indices;
use crate::settings::PROBES_PER_BOX;
use crate::streaming::frame::RoutingMatrix;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/viperbox.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Output folders
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Where recordings go when only a name is given
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,
    /// Where stimulation journals are written
    #[serde(default = "default_journal_dir")]
    pub journal_dir: PathBuf,
}

/// Real-time streaming to the acquisition consumer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// TCP port the consumer connects to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Packets per frame
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Physical channels delivered per packet
    #[serde(default = "default_input_channels")]
    pub input_channels: usize,
    /// Data channels per frame (status channels excluded)
    #[serde(default = "default_output_channels")]
    pub output_channels: usize,
    /// Apply the physical-to-logical routing matrix
    #[serde(default = "default_true")]
    pub use_mapping: bool,
    /// Notch filter centre frequency in Hz
    #[serde(default = "default_notch_f0")]
    pub notch_f0: f64,
    /// Notch filter quality factor
    #[serde(default = "default_notch_q")]
    pub notch_q: f64,
    /// Pause after a short read, in milliseconds
    #[serde(default = "default_underrun_pause_ms")]
    pub underrun_pause_ms: u64,
    /// Zero frames sent when a consumer connects
    #[serde(default = "default_idle_frames")]
    pub idle_frames: usize,
    /// Physical-to-logical channel routes; empty routes channel `k` to electrode `k`
    #[serde(default)]
    pub mapping: Vec<ChannelRoute>,
}

/// One entry of the electrode mapping (both sides 1-indexed)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelRoute {
    /// Physical channel delivered by the probe
    pub channel: usize,
    /// Logical channel it appears as in a frame
    pub electrode: usize,
}

/// Script scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Polling granularity while waiting for the next entry, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Keep executing after an entry failed
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
}

/// Connection used by the command-line runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Probes to initialise, as an identifier-set expression
    #[serde(default = "default_probes")]
    pub probes: String,
    /// Ask the driver to simulate the hardware
    #[serde(default = "default_true")]
    pub emulation: bool,
    /// Skip the device entirely
    #[serde(default)]
    pub boxless: bool,
}

/// Optional files replacing the built-in default settings documents
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DefaultsConfig {
    pub recording_settings: Option<PathBuf>,
    pub stimulation_settings: Option<PathBuf>,
}

// Default value functions
fn default_name() -> String {
    "ViperBox Control".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_recordings_dir() -> PathBuf {
    PathBuf::from("Recordings")
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from("Stimulations")
}

fn default_port() -> u16 {
    9001
}

fn default_num_samples() -> usize {
    500
}

fn default_sample_rate() -> f64 {
    20_000.0
}

fn default_input_channels() -> usize {
    64
}

fn default_output_channels() -> usize {
    60
}

fn default_true() -> bool {
    true
}

fn default_notch_f0() -> f64 {
    50.0
}

fn default_notch_q() -> f64 {
    30.0
}

fn default_underrun_pause_ms() -> u64 {
    1000
}

fn default_idle_frames() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_probes() -> String {
    "-".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recordings_dir: default_recordings_dir(),
            journal_dir: default_journal_dir(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            num_samples: default_num_samples(),
            sample_rate: default_sample_rate(),
            input_channels: default_input_channels(),
            output_channels: default_output_channels(),
            use_mapping: true,
            notch_f0: default_notch_f0(),
            notch_q: default_notch_q(),
            underrun_pause_ms: default_underrun_pause_ms(),
            idle_frames: default_idle_frames(),
            mapping: Vec::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            continue_on_error: true,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            probes: default_probes(),
            emulation: true,
            boxless: false,
        }
    }
}

impl StreamConfig {
    /// Time covered by one frame.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(self.num_samples as f64 / self.sample_rate)
    }

    pub fn underrun_pause(&self) -> Duration {
        Duration::from_millis(self.underrun_pause_ms)
    }

    /// Channels per frame including the two status channels.
    pub fn frame_channels(&self) -> usize {
        self.data_channels() + 2
    }

    /// Data channels per frame: routed channels when mapping, physical ones otherwise.
    pub fn data_channels(&self) -> usize {
        if self.use_mapping {
            self.output_channels
        } else {
            self.input_channels
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl AppConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Environment variables override the file with prefix `VIPERBOX_`.
    /// Example: `VIPERBOX_STREAM__PORT=9100`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VIPERBOX_").split("__"))
            .extract()?;
        config.validate().map_err(ViperError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.application.log_level)?;

        if self.stream.num_samples == 0 {
            return Err("stream.num_samples must be greater than 0".to_string());
        }
        if !(self.stream.sample_rate > 0.0) {
            return Err(format!(
                "Invalid stream.sample_rate {}. Must be positive",
                self.stream.sample_rate
            ));
        }
        if self.stream.use_mapping && self.stream.output_channels > self.stream.input_channels {
            return Err(format!(
                "stream.output_channels ({}) cannot exceed stream.input_channels ({})",
                self.stream.output_channels, self.stream.input_channels
            ));
        }
        if self.stream.use_mapping {
            RoutingMatrix::from_routes(
                self.stream.output_channels,
                self.stream.input_channels,
                &self.stream.mapping,
            )?;
        }
        if !(self.stream.notch_f0 > 0.0 && self.stream.notch_f0 < self.stream.sample_rate / 2.0)
        {
            return Err(format!(
                "Invalid stream.notch_f0 {}. Must be between 0 and the Nyquist frequency",
                self.stream.notch_f0
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err("scheduler.poll_interval_ms must be greater than 0".to_string());
        }
        let probes: Vec<usize> = (0..PROBES_PER_BOX).collect();
        parse_indices(&self.device.probes, &probes)
            .map_err(|e| format!("Invalid device.probes: {e}"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.stream.port, 9001);
        assert_eq!(config.stream.frame_channels(), 62);
    }

    #[test]
    #[serial]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viperbox.toml");
        std::fs::write(
            &path,
            "[stream]\nport = 9100\nuse_mapping = false\n\n[scheduler]\ncontinue_on_error = false\n",
        )
        .unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.stream.port, 9100);
        assert_eq!(config.stream.frame_channels(), 66);
        assert!(!config.scheduler.continue_on_error);
        assert_eq!(config.stream.num_samples, 500);
    }

    #[test]
    #[serial]
    fn mapping_table_is_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viperbox.toml");
        std::fs::write(
            &path,
            "[[stream.mapping]]\nchannel = 2\nelectrode = 1\n\n\
             [[stream.mapping]]\nchannel = 1\nelectrode = 2\n",
        )
        .unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(
            config.stream.mapping,
            [
                ChannelRoute { channel: 2, electrode: 1 },
                ChannelRoute { channel: 1, electrode: 2 },
            ]
        );

        std::fs::write(
            &path,
            "[[stream.mapping]]\nchannel = 1\nelectrode = 61\n",
        )
        .unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ViperError::Configuration(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stream.notch_f0 = 15_000.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stream.output_channels = 70;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.device.probes = "5".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viperbox.toml");
        std::fs::write(&path, "[stream]\nport = 9100\n").unwrap();

        std::env::set_var("VIPERBOX_STREAM__PORT", "9200");
        std::env::set_var("VIPERBOX_SCHEDULER__POLL_INTERVAL_MS", "5");
        let config = AppConfig::load_from(&path);
        std::env::remove_var("VIPERBOX_STREAM__PORT");
        std::env::remove_var("VIPERBOX_SCHEDULER__POLL_INTERVAL_MS");

        let config = config.unwrap();
        assert_eq!(config.stream.port, 9200);
        assert_eq!(config.scheduler.poll_interval(), Duration::from_millis(5));
    }

    #[test]
    fn frame_period_matches_block_size() {
        let config = StreamConfig::default();
        assert_eq!(config.frame_period(), Duration::from_millis(25));
    }
}
