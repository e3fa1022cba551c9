// src/utils/config.rs
//! Layered configuration
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. `capture-tape.toml` in the working directory (optional)
//! 3. `TAPE__<SECTION>__<KEY>` environment variables

use crate::recording::compressor::CompressionLevel;
use crate::recording::exporter::ExportFormat;
use crate::recording::protocol::OpenRequest;
use crate::utils::errors::{Result, TapeError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default config file stem
pub const CONFIG_FILE: &str = "capture-tape";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeConfig {
    pub tape: TapeSettings,
    pub watchdog: WatchdogSettings,
    pub compression: CompressionSettings,
    pub logging: LoggingSettings,
    pub metrics: MetricsSettings,
    pub demo: DemoSettings,
}

impl TapeConfig {
    /// Load configuration from the default file and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration using `file_stem` as the optional config file
    pub fn load_from(file_stem: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(file_stem).required(false))
            .add_source(
                Environment::with_prefix("TAPE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TapeError::ConfigError(format!("Failed to read configuration: {}", e)))?;

        let config: TapeConfig = settings
            .try_deserialize()
            .map_err(|e| TapeError::ConfigError(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the recorder cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tape.queue_depth == 0 {
            return Err(TapeError::ConfigError("tape.queue_depth cannot be 0".to_string()));
        }
        if self.watchdog.interval_ms == 0 {
            return Err(TapeError::ConfigError("watchdog.interval_ms cannot be 0".to_string()));
        }
        if self.watchdog.handle_patience_ms <= self.watchdog.interval_ms
            || self.watchdog.worker_patience_ms <= self.watchdog.interval_ms
        {
            return Err(TapeError::ConfigError(
                "watchdog patience must exceed the heartbeat interval".to_string(),
            ));
        }
        if self.demo.bufflen == 0 {
            return Err(TapeError::ConfigError("demo.bufflen cannot be 0".to_string()));
        }
        Ok(())
    }
}

/// Tape and worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeSettings {
    /// Container file; `None` selects the in-memory store
    pub path: Option<PathBuf>,

    /// Tape title; defaults to a timestamped one
    pub title: Option<String>,

    /// Replace an existing container file
    pub overwrite: bool,

    /// Track per-chunk write statistics
    pub stats: bool,

    /// Write queue capacity (records)
    pub queue_depth: usize,

    /// How long `record` may block on a full queue
    pub record_timeout_ms: u64,

    /// Default reply timeout for control commands
    pub reply_timeout_ms: u64,

    /// Worker sleep when both channels are idle
    pub idle_quantum_us: u64,
}

impl Default for TapeSettings {
    fn default() -> Self {
        Self {
            path: None,
            title: None,
            overwrite: true,
            stats: false,
            queue_depth: 1000,
            record_timeout_ms: 500,
            reply_timeout_ms: 7000,
            idle_quantum_us: 1000,
        }
    }
}

impl TapeSettings {
    pub fn open_request(&self) -> OpenRequest {
        OpenRequest {
            path: self.path.clone(),
            title: self.title.clone(),
            queue_depth: self.queue_depth,
            overwrite: self.overwrite,
            stats: self.stats,
        }
    }

    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn idle_quantum(&self) -> Duration {
        Duration::from_micros(self.idle_quantum_us)
    }
}

/// Heartbeat timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub interval_ms: u64,
    pub handle_patience_ms: u64,
    pub worker_patience_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            handle_patience_ms: 1000,
            worker_patience_ms: 2000,
        }
    }
}

impl WatchdogSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn handle_patience(&self) -> Duration {
        Duration::from_millis(self.handle_patience_ms)
    }

    pub fn worker_patience(&self) -> Duration {
        Duration::from_millis(self.worker_patience_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub level: CompressionLevel,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            level: CompressionLevel::Best,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Prometheus listen address, e.g. `127.0.0.1:9100`
    pub listen: Option<String>,
}

/// Settings for the synthetic acquisition run of the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    pub chapter: String,
    pub channels: u8,
    pub bufflen: usize,
    /// Number of acquisition ticks before auto-stop
    pub ticks: usize,
    pub tick_interval_ms: u64,
    pub export_path: Option<PathBuf>,
    pub export_format: ExportFormat,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            chapter: "stream".to_string(),
            channels: 2,
            bufflen: 1000,
            ticks: 40,
            tick_interval_ms: 5,
            export_path: None,
            export_format: ExportFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TapeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.tape.path.is_none());
        assert_eq!(config.tape.queue_depth, 1000);
    }

    #[test]
    fn test_open_request_from_settings() {
        let settings = TapeSettings {
            path: Some(PathBuf::from("/tmp/run.tape")),
            stats: true,
            ..Default::default()
        };
        let req = settings.open_request();
        assert_eq!(req.path, Some(PathBuf::from("/tmp/run.tape")));
        assert!(req.stats);
        assert!(req.overwrite);
    }

    #[test]
    fn test_validate_rejects_bad_watchdog() {
        let mut config = TapeConfig::default();
        config.watchdog.handle_patience_ms = 50;
        assert!(matches!(config.validate(), Err(TapeError::ConfigError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("tape-test");
        std::fs::write(
            stem.with_extension("toml"),
            "[tape]\nqueue_depth = 16\nstats = true\n\n[watchdog]\ninterval_ms = 50\n",
        )
        .unwrap();

        let config = TapeConfig::load_from(stem.to_str().unwrap()).unwrap();
        assert_eq!(config.tape.queue_depth, 16);
        assert!(config.tape.stats);
        assert_eq!(config.watchdog.interval_ms, 50);
        assert_eq!(config.watchdog.handle_patience_ms, 1000);
    }
}
