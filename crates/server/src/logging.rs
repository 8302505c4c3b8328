//! Structured logging configuration.
//!
//! Two output modes:
//! - Pretty: human-readable logs for development (default)
//! - Json: machine-parseable logs for aggregation
//!
//! Set `SPECACHE_LOG_FORMAT=json` for JSON output and `RUST_LOG` to
//! control per-target levels.

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("SPECACHE_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize the logging subsystem with the default "info" level.
pub fn init() {
    init_with_level("info");
}

/// Initialize with an explicit base level; `RUST_LOG` still wins when
/// set. A second initialization (e.g. in tests) is a no-op.
pub fn init_with_level(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = match LogFormat::from_env() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test touches the env var so parallel runs cannot race on it.
    #[test]
    fn format_from_env_variants() {
        std::env::remove_var("SPECACHE_LOG_FORMAT");
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);

        std::env::set_var("SPECACHE_LOG_FORMAT", "JSON");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);

        std::env::set_var("SPECACHE_LOG_FORMAT", "pretty");
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
        std::env::remove_var("SPECACHE_LOG_FORMAT");
    }

    #[test]
    fn double_init_does_not_panic() {
        init_with_level("warn");
        init_with_level("warn");
    }
}
