//! Configuration management for the charge point engine

use crate::error::{ChargePointError, ChargePointResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Outbound message queue configuration
    pub queue: QueueConfig,
    /// Connector layout
    pub connectors: ConnectorsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// How the delay before a retransmission grows with the attempt count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// Always `retry_interval`
    Fixed,
    /// `retry_interval * attempts`
    Linear,
    /// `retry_interval * 2^(attempts - 1)`
    Exponential,
}

impl std::str::FromStr for RetryBackoff {
    type Err = ChargePointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(RetryBackoff::Fixed),
            "linear" => Ok(RetryBackoff::Linear),
            "exponential" => Ok(RetryBackoff::Exponential),
            other => Err(ChargePointError::configuration(format!(
                "unknown retry backoff: {}",
                other
            ))),
        }
    }
}

/// Outbound message queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retransmissions allowed after the first send
    pub max_attempts: u32,
    /// Seconds to wait for a response before a send counts as timed out
    pub message_timeout_secs: u64,
    /// Base delay before a retransmission
    pub retry_interval_secs: u64,
    /// Growth of the retransmission delay
    pub retry_backoff: RetryBackoff,
    /// Upper bound for any retransmission delay
    pub max_retry_interval_secs: u64,
    /// Non-transaction calls allowed in flight at once
    pub normal_in_flight_limit: usize,
    /// Hold all traffic until a session-opening call is accepted
    pub start_stalled: bool,
    /// Write transaction-related calls to the message store
    pub persist_transaction_messages: bool,
    /// Pending calls above which normal calls, then every second
    /// MeterValues call, are dropped
    pub queues_total_size_threshold: usize,
    /// Accept non-transaction calls while the queue is paused
    pub queue_all_messages: bool,
    /// Start paused, waiting for the first `resume`
    pub start_offline: bool,
    /// Seconds to hold traffic back after a reconnect
    pub delay_on_reconnect_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            message_timeout_secs: 30,
            retry_interval_secs: 60,
            retry_backoff: RetryBackoff::Linear,
            max_retry_interval_secs: 3600,
            normal_in_flight_limit: 1,
            start_stalled: false,
            persist_transaction_messages: false,
            queues_total_size_threshold: 2500,
            queue_all_messages: false,
            start_offline: false,
            delay_on_reconnect_secs: 0,
        }
    }
}

impl QueueConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn delay_on_reconnect(&self) -> Duration {
        Duration::from_secs(self.delay_on_reconnect_secs)
    }

    /// Delay before retransmission number `attempts` (1-based)
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let interval = self.retry_interval_secs;
        let secs = match self.retry_backoff {
            RetryBackoff::Fixed => interval,
            RetryBackoff::Linear => interval.saturating_mul(u64::from(attempts)),
            RetryBackoff::Exponential => {
                let exponent = attempts.saturating_sub(1).min(63);
                interval.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_secs(secs.min(self.max_retry_interval_secs))
    }
}

/// Connector layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorsConfig {
    /// Physical connectors, not counting the charge point itself
    pub number_of_connectors: u32,
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            number_of_connectors: 1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration from a TOML file
pub fn load_from_file(path: impl AsRef<Path>) -> ChargePointResult<EngineConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        ChargePointError::configuration(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_toml(&content)
}

/// Parse configuration from TOML text
pub fn parse_toml(content: &str) -> ChargePointResult<EngineConfig> {
    toml::from_str(content).map_err(|e| ChargePointError::configuration(e.to_string()))
}

/// Load configuration from environment variables
pub fn load_from_env() -> ChargePointResult<EngineConfig> {
    let mut config = EngineConfig::default();
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Overlay `OCPP_CP_*` environment variables onto an existing configuration
pub fn apply_env_overrides(config: &mut EngineConfig) -> ChargePointResult<()> {
    if let Some(value) = env_parse("OCPP_CP_MAX_ATTEMPTS")? {
        config.queue.max_attempts = value;
    }
    if let Some(value) = env_parse("OCPP_CP_MESSAGE_TIMEOUT_SECS")? {
        config.queue.message_timeout_secs = value;
    }
    if let Some(value) = env_parse("OCPP_CP_RETRY_INTERVAL_SECS")? {
        config.queue.retry_interval_secs = value;
    }
    if let Some(value) = env_parse("OCPP_CP_RETRY_BACKOFF")? {
        config.queue.retry_backoff = value;
    }
    if let Some(value) = env_parse("OCPP_CP_NORMAL_IN_FLIGHT_LIMIT")? {
        config.queue.normal_in_flight_limit = value;
    }
    if let Some(value) = env_parse("OCPP_CP_QUEUES_TOTAL_SIZE_THRESHOLD")? {
        config.queue.queues_total_size_threshold = value;
    }
    if let Some(value) = env_parse("OCPP_CP_QUEUE_ALL_MESSAGES")? {
        config.queue.queue_all_messages = value;
    }
    if let Some(value) = env_parse("OCPP_CP_NUMBER_OF_CONNECTORS")? {
        config.connectors.number_of_connectors = value;
    }
    if let Ok(level) = std::env::var("OCPP_CP_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(value) = env_parse("OCPP_CP_LOG_JSON")? {
        config.logging.json = value;
    }
    Ok(())
}

fn env_parse<T>(name: &str) -> ChargePointResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ChargePointError::configuration(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// Longest timeout, retry or reconnect delay accepted, one day
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Validate configuration
pub fn validate_config(config: &EngineConfig) -> ChargePointResult<()> {
    if config.queue.max_attempts == 0 {
        return Err(ChargePointError::configuration(
            "max_attempts must be at least 1",
        ));
    }
    if config.queue.message_timeout_secs == 0 {
        return Err(ChargePointError::configuration(
            "message_timeout_secs cannot be 0",
        ));
    }
    if config.queue.normal_in_flight_limit == 0 {
        return Err(ChargePointError::configuration(
            "normal_in_flight_limit must be at least 1",
        ));
    }
    if config.queue.max_retry_interval_secs < config.queue.retry_interval_secs {
        return Err(ChargePointError::configuration(
            "max_retry_interval_secs cannot be below retry_interval_secs",
        ));
    }
    for (name, secs) in [
        ("message_timeout_secs", config.queue.message_timeout_secs),
        ("max_retry_interval_secs", config.queue.max_retry_interval_secs),
        ("delay_on_reconnect_secs", config.queue.delay_on_reconnect_secs),
    ] {
        if secs > MAX_INTERVAL_SECS {
            return Err(ChargePointError::configuration(format!(
                "{} cannot exceed {}",
                name, MAX_INTERVAL_SECS
            )));
        }
    }
    if config.queue.queues_total_size_threshold == 0 {
        return Err(ChargePointError::configuration(
            "queues_total_size_threshold must be at least 1",
        ));
    }
    if config.connectors.number_of_connectors == 0 {
        return Err(ChargePointError::configuration(
            "number_of_connectors must be at least 1",
        ));
    }
    Ok(())
}
