use std::env;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("invalid {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("{0} must not be empty")]
    EmptyValue(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchConfig {
    pub max_batch: usize,
    pub min_drain_interval: Duration,
    pub version_check_interval: Duration,
    pub affinity_violation_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 8,
            min_drain_interval: Duration::from_millis(20),
            version_check_interval: Duration::from_secs(1),
            affinity_violation_threshold: 2,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_batch = parse_u64_lookup(
            &lookup,
            "HOSTLINK_DRAIN_MAX_BATCH",
            defaults.max_batch as u64,
            1,
            256,
        )? as usize;
        let min_drain_interval = parse_millis_lookup(
            &lookup,
            "HOSTLINK_MIN_DRAIN_INTERVAL_MS",
            defaults.min_drain_interval,
            0,
            1_000,
        )?;
        let version_check_interval = parse_millis_lookup(
            &lookup,
            "HOSTLINK_VERSION_CHECK_INTERVAL_MS",
            defaults.version_check_interval,
            50,
            60_000,
        )?;
        let affinity_violation_threshold = parse_u64_lookup(
            &lookup,
            "HOSTLINK_AFFINITY_VIOLATION_THRESHOLD",
            u64::from(defaults.affinity_violation_threshold),
            1,
            100,
        )? as u32;

        Ok(Self {
            max_batch,
            min_drain_interval,
            version_check_interval,
            affinity_violation_threshold,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportConfig {
    pub base_url: String,
    pub client_id: String,
    pub display_name: String,
    pub command_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_consecutive_failures: u32,
    pub submit_attempts: u32,
    pub submit_retry_delay: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8765".to_string(),
            client_id: format!("hostlink-{}", Uuid::new_v4().simple()),
            display_name: "hostlink client".to_string(),
            command_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
            max_consecutive_failures: 3,
            submit_attempts: 3,
            submit_retry_delay: Duration::from_millis(500),
            reconnect_base: Duration::from_secs(3),
            reconnect_max: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let base_url = non_empty_lookup(&lookup, "HOSTLINK_BASE_URL", defaults.base_url)?;
        let client_id = non_empty_lookup(&lookup, "HOSTLINK_CLIENT_ID", defaults.client_id)?;
        let display_name =
            non_empty_lookup(&lookup, "HOSTLINK_DISPLAY_NAME", defaults.display_name)?;
        let command_timeout = parse_millis_lookup(
            &lookup,
            "HOSTLINK_COMMAND_TIMEOUT_MS",
            defaults.command_timeout,
            100,
            600_000,
        )?;
        let poll_interval = parse_millis_lookup(
            &lookup,
            "HOSTLINK_POLL_INTERVAL_MS",
            defaults.poll_interval,
            10,
            60_000,
        )?;
        let heartbeat_interval = parse_millis_lookup(
            &lookup,
            "HOSTLINK_HEARTBEAT_INTERVAL_MS",
            defaults.heartbeat_interval,
            1_000,
            600_000,
        )?;
        let max_consecutive_failures = parse_u64_lookup(
            &lookup,
            "HOSTLINK_MAX_CONSECUTIVE_FAILURES",
            u64::from(defaults.max_consecutive_failures),
            1,
            1_000,
        )? as u32;
        let submit_attempts = parse_u64_lookup(
            &lookup,
            "HOSTLINK_SUBMIT_ATTEMPTS",
            u64::from(defaults.submit_attempts),
            1,
            10,
        )? as u32;
        let submit_retry_delay = parse_millis_lookup(
            &lookup,
            "HOSTLINK_SUBMIT_RETRY_DELAY_MS",
            defaults.submit_retry_delay,
            0,
            30_000,
        )?;
        let reconnect_base = parse_millis_lookup(
            &lookup,
            "HOSTLINK_RECONNECT_BASE_MS",
            defaults.reconnect_base,
            MIN_RECONNECT_DELAY.as_millis() as u64,
            300_000,
        )?;
        let reconnect_max = parse_millis_lookup(
            &lookup,
            "HOSTLINK_RECONNECT_MAX_MS",
            defaults.reconnect_max,
            MIN_RECONNECT_DELAY.as_millis() as u64,
            3_600_000,
        )?
        .max(reconnect_base);
        let request_timeout = parse_millis_lookup(
            &lookup,
            "HOSTLINK_REQUEST_TIMEOUT_MS",
            defaults.request_timeout,
            250,
            120_000,
        )?;

        Ok(Self {
            base_url,
            client_id,
            display_name,
            command_timeout,
            poll_interval,
            heartbeat_interval,
            max_consecutive_failures,
            submit_attempts,
            submit_retry_delay,
            reconnect_base,
            reconnect_max,
            request_timeout,
        })
    }
}

fn non_empty_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: String,
) -> Result<String, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Err(ConfigError::EmptyValue(key.to_string()))
        } else {
            Ok(trimmed.to_string())
        }
    })
}

fn parse_millis_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
    min: u64,
    max: u64,
) -> Result<Duration, ConfigError> {
    parse_u64_lookup(lookup, key, default.as_millis() as u64, min, max).map(Duration::from_millis)
}

fn parse_u64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidValue {
                key: key.to_string(),
                message: error.to_string(),
            })
            .map(|value| value.clamp(min, max))
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}
