//! Wall-clock abstraction
//!
//! Window and session logic works on exchange-local wall-clock time. Everything
//! that needs "now" takes an `Arc<dyn Clock>` so tests can drive time by hand.

use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::Mutex;

/// Source of the current local date and time
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }

    fn time_of_day(&self) -> NaiveTime {
        self.now().time()
    }
}

/// Host local time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Manually driven clock for tests, benches and replays
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Convenience constructor from `(y, m, d)` and `(h, min, s)`
    pub fn at(date: (i32, u32, u32), time: (u32, u32, u32)) -> Self {
        let date = NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap_or_default();
        let time = NaiveTime::from_hms_opt(time.0, time.1, time.2).unwrap_or_default();
        Self::new(date.and_time(time))
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.lock() = now;
    }

    /// Move to another time of day on the current date
    pub fn set_time(&self, hour: u32, minute: u32, second: u32) {
        let mut now = self.lock();
        if let Some(time) = NaiveTime::from_hms_opt(hour, minute, second) {
            *now = now.date().and_time(time);
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NaiveDateTime> {
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.lock()
    }
}
