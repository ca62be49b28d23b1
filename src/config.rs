//! Process configuration from `VOLWATCH_*` environment variables
//!
//! | Variable | Default |
//! |----------|---------|
//! | `VOLWATCH_ENDPOINT` | `ws://127.0.0.1:19102` |
//! | `VOLWATCH_LOGIN_ID` / `VOLWATCH_PASSWORD` | `guest` / empty |
//! | `VOLWATCH_CONNECT_TIMEOUT_SECS` | 30 |
//! | `VOLWATCH_MAX_RECONNECT_ATTEMPTS` | 10 |
//! | `VOLWATCH_RECONNECT_INITIAL_MS` / `VOLWATCH_RECONNECT_MAX_MS` | 1000 / 60000 |
//! | `VOLWATCH_HEARTBEAT_SECS` | 60 |
//! | `VOLWATCH_WINDOW_START` / `VOLWATCH_WINDOW_END` | `09:15` / `15:30` |
//! | `VOLWATCH_Z_HIGH` / `VOLWATCH_Z_VERY_HIGH` / `VOLWATCH_Z_ALERT` | 0.5 / 1.5 / 2.0 |
//! | `VOLWATCH_STALE_AFTER_SECS` | 120 |
//! | `VOLWATCH_LOG_CAPACITY` | 300 |
//! | `VOLWATCH_SESSION_CHECK_SECS` | 30 |
//! | `VOLWATCH_UNIVERSE` | `universe.json` |
//! | `VOLWATCH_BASELINES` | unset |
//! | `VOLWATCH_WEBHOOK_URL` | unset |

use crate::alerts::DEFAULT_LOG_CAPACITY;
use crate::data::{FeedConfig, Instrument};
use crate::error::ConfigError;
use crate::spike::SpikeThresholds;
use crate::window::WindowConfig;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Everything the binary needs to start a monitor and its feed
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub feed: FeedConfig,
    pub window: WindowConfig,
    pub thresholds: SpikeThresholds,
    /// A symbol with no update for this long inside the window is stale
    pub stale_after: Duration,
    pub log_capacity: usize,
    /// How often the binary checks for a new trading day between ticks
    pub session_check_interval: Duration,
    pub universe_path: PathBuf,
    pub baselines_path: Option<PathBuf>,
    pub webhook_url: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            window: WindowConfig::default(),
            thresholds: SpikeThresholds::default(),
            stale_after: Duration::from_secs(120),
            log_capacity: DEFAULT_LOG_CAPACITY,
            session_check_interval: Duration::from_secs(30),
            universe_path: PathBuf::from("universe.json"),
            baselines_path: None,
            webhook_url: None,
        }
    }
}

impl MonitorConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Failed to load .env: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("VOLWATCH_ENDPOINT") {
            config.feed.endpoint = endpoint;
        }
        if let Some(login_id) = lookup("VOLWATCH_LOGIN_ID") {
            config.feed.login_id = login_id;
        }
        if let Some(password) = lookup("VOLWATCH_PASSWORD") {
            config.feed.password = password;
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "VOLWATCH_CONNECT_TIMEOUT_SECS")? {
            config.feed.timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parsed(&lookup, "VOLWATCH_MAX_RECONNECT_ATTEMPTS")? {
            config.feed.reconnect.max_attempts = attempts;
        }
        if let Some(ms) = parsed::<u64, _>(&lookup, "VOLWATCH_RECONNECT_INITIAL_MS")? {
            config.feed.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed::<u64, _>(&lookup, "VOLWATCH_RECONNECT_MAX_MS")? {
            config.feed.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "VOLWATCH_HEARTBEAT_SECS")? {
            config.feed.heartbeat.interval = Duration::from_secs(secs);
        }

        let start = lookup("VOLWATCH_WINDOW_START");
        let end = lookup("VOLWATCH_WINDOW_END");
        if start.is_some() || end.is_some() {
            let start = start.unwrap_or_else(|| config.window.start().format("%H:%M").to_string());
            let end = end.unwrap_or_else(|| config.window.end().format("%H:%M").to_string());
            config.window = WindowConfig::parse(&start, &end)?;
        }

        if let Some(high) = parsed(&lookup, "VOLWATCH_Z_HIGH")? {
            config.thresholds.high = high;
        }
        if let Some(very_high) = parsed(&lookup, "VOLWATCH_Z_VERY_HIGH")? {
            config.thresholds.very_high = very_high;
        }
        if let Some(alert) = parsed(&lookup, "VOLWATCH_Z_ALERT")? {
            config.thresholds.alert = alert;
        }

        if let Some(secs) = parsed::<u64, _>(&lookup, "VOLWATCH_STALE_AFTER_SECS")? {
            config.stale_after = Duration::from_secs(secs);
        }
        if let Some(capacity) = parsed(&lookup, "VOLWATCH_LOG_CAPACITY")? {
            config.log_capacity = capacity;
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "VOLWATCH_SESSION_CHECK_SECS")? {
            config.session_check_interval = Duration::from_secs(secs);
        }
        if let Some(path) = lookup("VOLWATCH_UNIVERSE") {
            config.universe_path = PathBuf::from(path);
        }
        config.baselines_path = lookup("VOLWATCH_BASELINES")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        config.webhook_url = lookup("VOLWATCH_WEBHOOK_URL").filter(|u| !u.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.feed.validate()?;
        self.thresholds.validate()?;

        if self.stale_after.is_zero() {
            return Err(ConfigError::invalid("stale_after", "must be greater than 0"));
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::invalid("log_capacity", "must be greater than 0"));
        }
        if self.session_check_interval.is_zero() {
            return Err(ConfigError::invalid(
                "session_check_interval",
                "must be greater than 0",
            ));
        }
        if let Some(url) = &self.webhook_url {
            url::Url::parse(url).map_err(|e| ConfigError::invalid("webhook_url", e.to_string()))?;
        }
        Ok(())
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("{:?}: {}", raw, e))),
    }
}

/// Read the monitored universe: a JSON array of `{symbol, token, exchange?}`
pub fn load_instruments(path: impl AsRef<Path>) -> Result<Vec<Instrument>, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_instruments(&raw)
}

pub fn parse_instruments(raw: &str) -> Result<Vec<Instrument>, ConfigError> {
    let instruments: Vec<Instrument> = serde_json::from_str(raw)
        .map_err(|e| ConfigError::invalid("universe", e.to_string()))?;

    let instruments: Vec<Instrument> = instruments
        .into_iter()
        .map(Instrument::normalized)
        .filter(|i| !i.symbol.is_empty() && !i.token.is_empty())
        .collect();

    if instruments.is_empty() {
        return Err(ConfigError::invalid("universe", "no instruments listed"));
    }
    Ok(instruments)
}
