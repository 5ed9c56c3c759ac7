//! Logging and observability
//!
//! Structured logging is built on `tracing` with a `tracing-subscriber`
//! backend. The subscriber is configured once, at startup, from a
//! [`LogSettings`] value; components never touch the global subscriber
//! themselves and only emit events through the `tracing` macros.
//!
//! All logging output is directed to stderr so that stdout stays reserved
//! for supervised process output and command results.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Environment variable selecting the log format (`json` or `text`)
pub const LOG_FORMAT_ENV: &str = "SIDECARS_LOG_FORMAT";

/// Environment variable holding an `EnvFilter` directive
pub const LOG_FILTER_ENV: &str = "SIDECARS_LOG";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Process-wide logging configuration, created once at startup
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// Explicit format; `None` defers to `SIDECARS_LOG_FORMAT`
    pub format: Option<LogFormat>,
    /// Level name (error, warn, info, debug, trace)
    pub level: Option<String>,
    /// Disable ANSI colors in text output
    pub no_color: bool,
}

impl LogSettings {
    /// Format after applying the environment fallback
    pub fn effective_format(&self) -> LogFormat {
        if let Some(format) = self.format {
            return format;
        }
        match std::env::var(LOG_FORMAT_ENV).ok().as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Normalize a user supplied level name into an `EnvFilter` level
///
/// Unknown names map to `None` so the caller can fall back to `info`.
pub fn normalize_level(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "error" | "fatal" | "panic" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}

/// Initialize the logging system
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init(settings: &LogSettings) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter(settings.level.as_deref());
        match settings.effective_format() {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .with_target(false)
                            .with_ansi(!settings.no_color)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {:?}", settings.effective_format());
    });

    Ok(())
}

/// Create an EnvFilter, preferring environment directives over the configured level
fn create_env_filter(level: Option<&str>) -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_FILTER_ENV) {
        return EnvFilter::try_new(&directive).unwrap_or_else(|_| {
            eprintln!(
                "Invalid {} specification '{}', using default 'info'",
                LOG_FILTER_ENV, directive
            );
            EnvFilter::new("info")
        });
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match level {
        Some(raw) => normalize_level(raw).unwrap_or_else(|| {
            eprintln!("Unknown log level '{}', using 'info'", raw);
            "info"
        }),
        None => "info",
    };
    EnvFilter::new(level)
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
