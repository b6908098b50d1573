//! Tracing subscriber setup

use crate::config::LoggingConfig;
use crate::error::{ChargePointError, ChargePointResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map a configured level name onto a tracing level, falling back to INFO
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LoggingConfig) -> ChargePointResult<()> {
    let level = parse_level(&config.level);
    let registry =
        tracing_subscriber::registry().with(EnvFilter::from_default_env().add_directive(level.into()));

    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).try_init()
    };

    result.map_err(|e| ChargePointError::configuration(format!("tracing init failed: {}", e)))
}
