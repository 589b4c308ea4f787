//! Tracing subscriber setup for the `stagehand` binary.
//!
//! Library code only emits events; installing the subscriber is left to the binary.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Normalises a user supplied level name, falling back to [`DEFAULT_LOG_LEVEL`].
pub fn parse_level(value: &str) -> &'static str {
    match value.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        "off" | "none" => "off",
        _ => DEFAULT_LOG_LEVEL,
    }
}

/// Installs a stderr subscriber. `RUST_LOG` wins over `level` when set.
///
/// Calling this twice is harmless; the second subscriber is ignored.
pub fn init(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(parse_level(level)));

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_line_number(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), "debug");
        assert_eq!(parse_level("warning"), "warn");
        assert_eq!(parse_level("none"), "off");
        assert_eq!(parse_level("chatty"), DEFAULT_LOG_LEVEL);
    }
}
