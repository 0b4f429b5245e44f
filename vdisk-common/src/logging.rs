//! Logging initialization using tracing.

use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, one event per line
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("Unknown log format: {}", other)),
        }
    }
}

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
///
/// # Example
/// ```no_run
/// vdisk_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_timer(ChronoUtc::rfc_3339())
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}

/// Initialize logging with JSON output format.
/// Suitable for production environments with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}

/// Initialize logging in the given format.
pub fn init_logging_with(format: LogFormat, level: &str) -> Result<()> {
    match format {
        LogFormat::Pretty => init_logging(level),
        LogFormat::Json => init_logging_json(level),
    }
}

/// Measures a named operation and logs its duration when finished.
///
/// Dropping the guard without calling [`TimedOperation::finish`] logs the
/// operation as abandoned.
pub struct TimedOperation {
    name: String,
    started_at: DateTime<Utc>,
    start: Instant,
    finished: bool,
}

impl TimedOperation {
    /// Start timing an operation.
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started_at: Utc::now(),
            start: Instant::now(),
            finished: false,
        }
    }

    /// Wall-clock time the operation started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Stop timing and log the elapsed milliseconds. Returns the elapsed time.
    pub fn finish(mut self) -> std::time::Duration {
        self.finished = true;
        let elapsed = self.start.elapsed();
        debug!(
            operation = %self.name,
            started_at = %self.started_at.to_rfc3339(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Operation finished"
        );
        elapsed
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                operation = %self.name,
                elapsed_ms = self.start.elapsed().as_millis() as u64,
                "Operation abandoned before completion"
            );
        }
    }
}
