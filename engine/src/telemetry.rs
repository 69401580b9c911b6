//! Telemetry and Observability
//!
//! Handles setting up `tracing-subscriber` for structured logging.
//! Supports config-driven log levels, environment variable overrides,
//! and format switching between pretty (debug) and JSON (release).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber with the given log level from config.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter > default "info"
///
/// In debug builds: pretty-printed terminal output.
/// In release builds: JSON structured output with spans.
///
/// Only the first successful call installs a subscriber; later calls are no-ops.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(log_level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    }
}

/// Initialize the tracing subscriber with default settings.
pub fn init_telemetry() {
    init_telemetry_with_level("info");
}

/// Filter directive: the configured level for everything, with the engine's
/// own target pinned to the same level and noisy HTTP internals kept at warn.
fn default_filter(log_level: &str) -> String {
    format!(
        "{level},wrench_engine={level},hyper=warn,sqlx=warn",
        level = log_level
    )
}

/// Truncate long text for log fields (context strings, prompts)
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}…", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        let filter = default_filter("debug");
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("wrench_engine=debug"));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("mantenimiento", 100), "mantenimiento");
        assert_eq!(preview("ñandú", 2), "ña…");
    }
}
