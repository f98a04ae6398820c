//! Logging setup and client counters.
//!
//! The library only emits `tracing` events and `metrics` counters; it never
//! installs a subscriber or recorder on its own. Applications call
//! [`init_logging`] once at startup (or install their own subscriber) and
//! pick any `metrics` exporter.
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: log filter (default: `info`)

use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output (default).
    #[default]
    Pretty,
    /// One JSON object per line, for log aggregators.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        })
    }
}

impl LogFormat {
    /// Reads the `LOG_FORMAT` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Installs a global `tracing` subscriber filtered by `RUST_LOG`.
///
/// Returns `false` when a global subscriber was already installed, so it is
/// safe to call more than once.
pub fn init_logging(format: LogFormat) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    };
    installed.is_ok()
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

pub const MESSAGES_PUBLISHED: &str = "bindwire_messages_published_total";
pub const PUBLISH_FAILURES: &str = "bindwire_publish_failures_total";
pub const MESSAGES_DELIVERED: &str = "bindwire_messages_delivered_total";
pub const MESSAGES_DROPPED: &str = "bindwire_messages_dropped_total";
pub const SUBSCRIPTIONS_OPENED: &str = "bindwire_subscriptions_opened_total";
pub const SUBSCRIPTIONS_CLOSED: &str = "bindwire_subscriptions_closed_total";

pub(crate) fn record_published(protocol: &str) {
    ::metrics::counter!(MESSAGES_PUBLISHED, "protocol" => protocol.to_string()).increment(1);
}

pub(crate) fn record_publish_failed(protocol: &str) {
    ::metrics::counter!(PUBLISH_FAILURES, "protocol" => protocol.to_string()).increment(1);
}

pub(crate) fn record_delivered(protocol: &str) {
    ::metrics::counter!(MESSAGES_DELIVERED, "protocol" => protocol.to_string()).increment(1);
}

pub(crate) fn record_dropped(protocol: &str, reason: &'static str) {
    ::metrics::counter!(
        MESSAGES_DROPPED,
        "protocol" => protocol.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub(crate) fn record_subscription_opened(protocol: &str) {
    ::metrics::counter!(SUBSCRIPTIONS_OPENED, "protocol" => protocol.to_string()).increment(1);
}

pub(crate) fn record_subscription_closed(protocol: &str) {
    ::metrics::counter!(SUBSCRIPTIONS_CLOSED, "protocol" => protocol.to_string()).increment(1);
}
