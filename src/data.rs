//! Data models for the feed and its configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Exchange segment used when an instrument record omits one
pub const DEFAULT_EXCHANGE: &str = "NSECM";

/// A tradable instrument: display symbol plus the feed token it streams under
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Instrument {
    pub symbol: String,
    pub token: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
}

fn default_exchange() -> String {
    DEFAULT_EXCHANGE.to_string()
}

impl Instrument {
    pub fn new(symbol: &str, token: &str, exchange: &str) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            token: token.trim().to_string(),
            exchange: exchange.trim().to_string(),
        }
    }

    /// Symbol normalised the way the store keys it
    pub fn normalized(mut self) -> Self {
        self.symbol = self.symbol.trim().to_uppercase();
        self.token = self.token.trim().to_string();
        self
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.exchange, self.symbol, self.token)
    }
}

/// Decoded market-data tick: cumulative traded quantity for one token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick {
    pub token: String,
    pub cumulative_volume: u64,
}

impl Tick {
    pub fn new(token: impl Into<String>, cumulative_volume: u64) -> Self {
        Self {
            token: token.into(),
            cumulative_volume,
        }
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tick[{}]: ttq={}", self.token, self.cumulative_volume)
    }
}

/// Feed client configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub endpoint: String,
    pub login_id: String,
    pub password: String,
    pub timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
}

impl FeedConfig {
    pub fn builder() -> FeedConfigBuilder {
        FeedConfigBuilder::new()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::invalid("endpoint", "cannot be empty"));
        }

        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(ConfigError::invalid("endpoint", "must be a ws:// or wss:// URL"));
        }

        if self.login_id.is_empty() {
            return Err(ConfigError::invalid("login_id", "cannot be empty"));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than 0"));
        }

        self.reconnect.validate()?;
        self.heartbeat.validate()?;

        Ok(())
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:19102".to_string(),
            login_id: "guest".to_string(),
            password: String::new(),
            timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Builder for [`FeedConfig`]
#[derive(Debug, Clone, Default)]
pub struct FeedConfigBuilder {
    config: FeedConfig,
}

impl FeedConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn credentials(mut self, login_id: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.login_id = login_id.into();
        self.config.password = password.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.config.heartbeat = heartbeat;
        self
    }

    pub fn build(self) -> Result<FeedConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive retries allowed before the feed gives up
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomise each delay by up to ±25%
    pub jitter: bool,
}

impl ReconnectConfig {
    /// Validate reconnection configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be greater than 0"));
        }

        if self.initial_delay.is_zero() {
            return Err(ConfigError::invalid("initial_delay", "must be greater than 0"));
        }

        if self.max_delay < self.initial_delay {
            return Err(ConfigError::invalid(
                "max_delay",
                "must be greater than or equal to initial delay",
            ));
        }

        if !(self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid("backoff_multiplier", "must be at least 1.0"));
        }

        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Keep-alive configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Silent intervals tolerated before the connection is declared dead
    pub dead_after_intervals: u32,
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("heartbeat_interval", "must be greater than 0"));
        }
        if self.dead_after_intervals < 2 {
            return Err(ConfigError::invalid(
                "dead_after_intervals",
                "must allow at least two silent intervals",
            ));
        }
        Ok(())
    }

    /// Silence after which the connection is treated as lost
    pub fn dead_after(&self) -> Duration {
        self.interval * self.dead_after_intervals
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            dead_after_intervals: 3,
        }
    }
}
