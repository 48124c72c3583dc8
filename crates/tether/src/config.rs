use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::{Backoff, DEFAULT_RECONNECT_BASE, DEFAULT_RECONNECT_CAP};
use crate::error::ConfigError;

const ENV_PREFIX: &str = "TETHER_PREFIX";
const ENV_RESYNC_INTERVAL: &str = "TETHER_RESYNC_INTERVAL_MS";
const ENV_RECONNECT_BASE: &str = "TETHER_RECONNECT_BASE_MS";
const ENV_RECONNECT_CAP: &str = "TETHER_RECONNECT_CAP_MS";
const ENV_MESSAGE_TIMEOUT: &str = "TETHER_MESSAGE_TIMEOUT_MS";

/// Session tuning shared by the handler and the connection manager.
///
/// Durations are stored as milliseconds so the struct maps one-to-one onto
/// TOML and environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Topic prefix written before the message type of every frame.
    pub prefix: Option<u64>,
    /// Period of the handshake-1 resend; unset disables periodic resync.
    pub resync_interval_ms: Option<u64>,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    /// Close a connected channel that has been silent this long.
    pub message_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            resync_interval_ms: None,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE.as_millis() as u64,
            reconnect_cap_ms: DEFAULT_RECONNECT_CAP.as_millis() as u64,
            message_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Defaults overridden by `TETHER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_PREFIX) {
            self.prefix = parse_optional(ENV_PREFIX, &value)?;
        }
        if let Some(value) = lookup(ENV_RESYNC_INTERVAL) {
            self.resync_interval_ms = parse_optional(ENV_RESYNC_INTERVAL, &value)?;
        }
        if let Some(value) = lookup(ENV_RECONNECT_BASE) {
            self.reconnect_base_ms = parse_required(ENV_RECONNECT_BASE, &value)?;
        }
        if let Some(value) = lookup(ENV_RECONNECT_CAP) {
            self.reconnect_cap_ms = parse_required(ENV_RECONNECT_CAP, &value)?;
        }
        if let Some(value) = lookup(ENV_MESSAGE_TIMEOUT) {
            self.message_timeout_ms = parse_optional(ENV_MESSAGE_TIMEOUT, &value)?;
        }
        Ok(self)
    }

    pub fn with_prefix(mut self, prefix: u64) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.reconnect_base_ms = base.as_millis() as u64;
        self.reconnect_cap_ms = cap.as_millis() as u64;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        self.resync_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn message_timeout(&self) -> Option<Duration> {
        self.message_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_cap_ms),
        )
    }
}

fn parse_required(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

/// Empty, `off` and `none` clear the setting.
fn parse_optional(key: &'static str, value: &str) -> Result<Option<u64>, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "off" | "none" => Ok(None),
        _ => parse_required(key, value).map(Some),
    }
}
