// src/observability/mod.rs
//! Logging and metrics setup
//!
//! - **Tracing**: `tracing-subscriber` with an `EnvFilter`; `RUST_LOG` wins
//!   over the configured level. Human-readable or JSON lines.
//! - **Metrics**: the worker emits through the `metrics` facade. A Prometheus
//!   endpoint is installed only when a listen address is configured.
//!
//! Metrics emitted by the recorder worker:
//!
//! | Name | Kind |
//! |---|---|
//! | `tape_chunks_written_total` | counter |
//! | `tape_bytes_written_total` | counter |
//! | `tape_records_dropped_total` | counter |
//! | `tape_chunk_write_seconds` | histogram |

use crate::utils::config::{LoggingSettings, MetricsSettings};
use crate::utils::errors::{Result, TapeError};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
pub fn init_tracing(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| {
            TapeError::ConfigError(format!("Invalid log filter '{}': {}", settings.level, e))
        })?;

    let json = settings.json.then(|| fmt::layer().json().with_thread_names(true));
    let plain = (!settings.json).then(|| fmt::layer().with_thread_names(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()
        .map_err(|e| TapeError::ConfigError(format!("Tracing already initialized: {}", e)))
}

/// Describe recorder metrics and start the Prometheus endpoint if configured
pub fn init_metrics(settings: &MetricsSettings) -> Result<()> {
    let Some(listen) = settings.listen.as_deref() else {
        return Ok(());
    };

    let addr: SocketAddr = listen.parse().map_err(|e| {
        TapeError::ConfigError(format!("Invalid metrics listen address '{}': {}", listen, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| TapeError::ConfigError(format!("Failed to start metrics exporter: {}", e)))?;

    describe_counter!("tape_chunks_written_total", "Chunks persisted to the tape");
    describe_counter!(
        "tape_bytes_written_total",
        Unit::Bytes,
        "Bytes written by the store"
    );
    describe_counter!(
        "tape_records_dropped_total",
        "Records dropped after a persistence failure"
    );
    describe_histogram!(
        "tape_chunk_write_seconds",
        Unit::Seconds,
        "Time spent writing one chunk"
    );

    info!("Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_listener() {
        assert!(init_metrics(&MetricsSettings::default()).is_ok());
    }

    #[test]
    fn test_bad_listen_address() {
        let settings = MetricsSettings {
            listen: Some("not-an-address".to_string()),
        };
        assert!(matches!(
            init_metrics(&settings),
            Err(TapeError::ConfigError(_))
        ));
    }
}
