//! Logging setup.
//!
//! The library only emits `tracing` events; binaries choose how they are
//! rendered:
//! - Pretty: human-readable lines (default)
//! - Json: one JSON object per event, for log aggregation
//!
//! Set `SLOT_ENGINE_LOG_FORMAT=json` for JSON output.
//! Set `RUST_LOG` to control log levels (default: info).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs.
    Json,
}

impl LogFormat {
    /// Parse a format name; anything but `json` is pretty.
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }

    /// Detect log format from `SLOT_ENGINE_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("SLOT_ENGINE_LOG_FORMAT").unwrap_or_default())
    }
}

/// Initialize logging from the environment.
pub fn init() {
    init_with_level_and_format(None, LogFormat::from_env());
}

/// Initialize logging with a default level used when `RUST_LOG` is unset.
pub fn init_with_level(level: &str) {
    init_with_level_and_format(Some(level), LogFormat::from_env());
}

/// Initialize logging with an explicit default level and format.
///
/// A second initialization in the same process is ignored.
pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let registry = tracing_subscriber::registry().with(env_filter);
    let _ = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
    }

    #[test]
    fn test_double_init_is_harmless() {
        init_with_level_and_format(Some("warn"), LogFormat::Pretty);
        init_with_level_and_format(Some("warn"), LogFormat::Json);
    }
}
