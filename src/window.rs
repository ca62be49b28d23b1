//! Intraday monitoring window and trading-session date tracking

use crate::error::ConfigError;
use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator-selected intraday window, `start..=end` in local time
///
/// Always at least one whole minute long; construction goes through
/// [`WindowConfig::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    start: NaiveTime,
    end: NaiveTime,
}

impl WindowConfig {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ConfigError> {
        let window = Self { start, end };
        if window.duration_minutes() < 1 {
            return Err(ConfigError::InvalidWindow {
                start: start.format("%H:%M").to_string(),
                end: end.format("%H:%M").to_string(),
            });
        }
        Ok(window)
    }

    /// Parse `"HH:MM"` bounds
    pub fn parse(start: &str, end: &str) -> Result<Self, ConfigError> {
        Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?)
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// Window length in whole minutes
    pub fn duration_minutes(&self) -> i64 {
        minute_of_day(self.end) - minute_of_day(self.start)
    }

    /// Inclusive on both ends
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time <= self.end
    }

    pub fn has_started(&self, time: NaiveTime) -> bool {
        time >= self.start
    }

    /// Whole minutes elapsed since window start, clamped to `[1, duration]`.
    /// `None` before the window opens.
    pub fn elapsed_minutes(&self, time: NaiveTime) -> Option<i64> {
        if !self.has_started(time) {
            return None;
        }
        let effective = time.min(self.end);
        let elapsed = minute_of_day(effective) - minute_of_day(self.start);
        Some(elapsed.clamp(1, self.duration_minutes().max(1)))
    }
}

/// Continuous trading opens here; pre-open prints are not window volume
pub fn market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default()
}

impl Default for WindowConfig {
    /// Full cash session, 09:15 to 15:30
    fn default() -> Self {
        Self {
            start: market_open(),
            end: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
        }
    }
}

impl fmt::Display for WindowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Parse `"HH:MM"` or `"HH:MM:SS"`
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ConfigError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::InvalidTime(value.to_string()))
}

fn minute_of_day(time: NaiveTime) -> i64 {
    (time.hour() * 60 + time.minute()) as i64
}

/// Tracks the current trading date and reports rollovers
#[derive(Debug, Clone, Default)]
pub struct SessionClock {
    current: Option<NaiveDate>,
}

impl SessionClock {
    pub fn starting(date: NaiveDate) -> Self {
        Self { current: Some(date) }
    }

    pub fn current(&self) -> Option<NaiveDate> {
        self.current
    }

    /// Record an observed date. Returns true when it starts a new session.
    /// The very first observation only initialises the clock.
    pub fn observe(&mut self, date: NaiveDate) -> bool {
        match self.current {
            Some(current) if date > current => {
                self.current = Some(date);
                true
            }
            Some(_) => false,
            None => {
                self.current = Some(date);
                false
            }
        }
    }
}
