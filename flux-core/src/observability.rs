/*!
Observability infrastructure for flux.

This module provides:
- Structured logging setup (plain or JSON) through `tracing-subscriber`
- Prometheus counters for snapshots, purges and transfers (feature `metrics`)

Logging is configured once at startup by the binary. The core only emits
events through `tracing` and never depends on the subscriber for correctness.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::{FluxError, Result};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<FluxMetrics> = OnceLock::new();

/// Metrics collection for flux runs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct FluxMetrics {
    pub snapshots_created_total: Counter,
    pub snapshots_destroyed_total: Counter,
    pub destroy_failures_total: Counter,
    pub transfers_total: Counter,
    pub transfer_failures_total: Counter,
    pub transfer_bytes_total: Counter,
    pub transfer_duration_seconds: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn register_counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| FluxError::config(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| FluxError::config(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
impl FluxMetrics {
    /// Initialize new metrics instance
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let snapshots_created_total = register_counter(
            &registry,
            "flux_snapshots_created_total",
            "Snapshots created by flux",
        )?;
        let snapshots_destroyed_total = register_counter(
            &registry,
            "flux_snapshots_destroyed_total",
            "Snapshots destroyed by retention",
        )?;
        let destroy_failures_total = register_counter(
            &registry,
            "flux_destroy_failures_total",
            "Snapshot destroy calls that failed",
        )?;
        let transfers_total = register_counter(
            &registry,
            "flux_transfers_total",
            "Transfers attempted",
        )?;
        let transfer_failures_total = register_counter(
            &registry,
            "flux_transfer_failures_total",
            "Transfers that failed",
        )?;
        let transfer_bytes_total = register_counter(
            &registry,
            "flux_transfer_bytes_total",
            "Bytes written into the transport pipe",
        )?;

        let transfer_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "flux_transfer_duration_seconds",
                "Duration of transfers in seconds",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
        )
        .map_err(|e| {
            FluxError::config(format!(
                "Failed to create transfer_duration_seconds metric: {e}"
            ))
        })?;
        registry
            .register(Box::new(transfer_duration_seconds.clone()))
            .map_err(|e| {
                FluxError::config(format!("Failed to register transfer_duration_seconds: {e}"))
            })?;

        Ok(Self {
            snapshots_created_total,
            snapshots_destroyed_total,
            destroy_failures_total,
            transfers_total,
            transfer_failures_total,
            transfer_bytes_total,
            transfer_duration_seconds,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static FluxMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize flux metrics"))
    }

    pub fn record_created(&self) {
        self.snapshots_created_total.inc();
    }

    pub fn record_destroyed(&self) {
        self.snapshots_destroyed_total.inc();
    }

    pub fn record_destroy_failure(&self) {
        self.destroy_failures_total.inc();
    }

    /// Record one finished transfer attempt
    pub fn record_transfer(&self, bytes: u64, elapsed: Duration, succeeded: bool) {
        self.transfers_total.inc();
        if !succeeded {
            self.transfer_failures_total.inc();
        }
        self.transfer_bytes_total.inc_by(bytes as f64);
        self.transfer_duration_seconds.observe(elapsed.as_secs_f64());
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| FluxError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| FluxError::config(format!("Failed to convert metrics to string: {e}")))
    }

    /// Write metrics for node_exporter's textfile collector
    ///
    /// Writes to a temporary sibling first and renames it into place so the
    /// collector never reads a half-written file.
    pub fn write_textfile(&self, path: &std::path::Path) -> Result<()> {
        let text = self.gather_metrics()?;
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Logging options chosen by the binary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Raise verbosity to debug
    pub debug: bool,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

/// Build the level filter; `RUST_LOG` wins over the debug flag
pub fn log_filter(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize the global tracing subscriber
///
/// Logs go to stderr so stdout stays free for reports and tables.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init_logging(options: LogOptions) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter(options.debug))
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = if options.json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| FluxError::config(format!("Failed to set global tracing subscriber: {e}")))?;

    tracing::debug!("flux logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails_cleanly() {
        let _ = init_logging(LogOptions::default());
        assert!(init_logging(LogOptions {
            debug: true,
            json: true
        })
        .is_err());
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        let metrics = FluxMetrics::global();

        metrics.record_created();
        metrics.record_destroyed();
        metrics.record_destroy_failure();
        metrics.record_transfer(4096, Duration::from_millis(250), true);

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("flux_snapshots_created_total"));
        assert!(text.contains("flux_transfer_bytes_total"));
        assert!(text.contains("flux_transfer_duration_seconds_bucket"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_write_textfile() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("flux.prom");

        FluxMetrics::global().record_created();
        FluxMetrics::global().write_textfile(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("flux_snapshots_created_total"));
        assert!(!dir.path().join("flux.prom.tmp").exists());
    }
}
