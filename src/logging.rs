//! Structured logging utilities for actioncache
//!
//! All logs use structured fields so cache behaviour can be followed per
//! action across a pipeline run.
//!
//! # Log Format Conventions
//!
//! - `action`: The action name (e.g., "TrainModel")
//! - `operation`: The operation being performed (e.g., "load", "save", "reclaim")
//! - `status`: The result status ("hit", "miss", "expired", "error")
//! - `cache_key`: The derived cache key (`<Action>_<16 hex>`)
//! - `path`: Filesystem path of the entry involved
//!
//! # Examples
//!
//! ```rust
//! use tracing::info;
//!
//! let key = "TrainModel_0123456789abcdef";
//!
//! // Cache hit
//! info!(
//!     action = "TrainModel",
//!     operation = "load",
//!     status = "hit",
//!     cache_key = %key,
//!     "cache hit"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Custom formatter that shows "actioncache" instead of full module path
struct ActionCacheFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for ActionCacheFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(
                writer,
                "{}{:5}(actioncache)\x1b[0m: ",
                level_style,
                meta.level()
            )?;
        } else {
            write!(writer, "{:5}(actioncache): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors (default for interactive runs)
    Pretty,
    /// Same layout without colors (for CI and batch jobs)
    Compact,
    /// JSON format (for log aggregation systems)
    Json,
}

impl LogFormat {
    /// Parse from environment variable (ACTIONCACHE_LOG_FORMAT)
    pub fn from_env() -> Self {
        match std::env::var("ACTIONCACHE_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ => {
                if std::env::var("CI").is_ok() {
                    Self::Compact
                } else {
                    Self::Pretty
                }
            }
        }
    }
}

/// Initialize the global tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "debug", "info", "warn")
/// - `ACTIONCACHE_LOG_FORMAT`: Set format ("pretty", "compact", "json")
/// - `CI`: If set, defaults to compact format
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match LogFormat::from_env() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(ActionCacheFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(ActionCacheFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {}", e);
    }
}

/// Standard field names for consistent logging
pub mod fields {
    /// Action name (e.g., "TrainModel")
    pub const ACTION: &str = "action";
    /// Operation name (e.g., "load", "save")
    pub const OPERATION: &str = "operation";
    /// Status (e.g., "hit", "miss", "error")
    pub const STATUS: &str = "status";
    /// Derived cache key
    pub const CACHE_KEY: &str = "cache_key";
    /// Filesystem path
    pub const PATH: &str = "path";
}

/// Operation names for consistent logging
pub mod operations {
    pub const LOAD: &str = "load";
    pub const SAVE: &str = "save";
    pub const INVALIDATE: &str = "invalidate";
    pub const RECLAIM: &str = "reclaim";
    pub const RUN: &str = "run";
}

/// Status values for consistent logging
pub mod status {
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const EXPIRED: &str = "expired";
    pub const CORRUPT: &str = "corrupt";
    pub const DISABLED: &str = "disabled";
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
}
