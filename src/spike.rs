//! Windowed z-score spike detection
//!
//! Scores how far a symbol's window volume runs ahead of the pace implied by
//! its daily mean:
//!
//! ```text
//! expected = daily_mean × elapsed / duration
//! z        = (window_volume − expected) / max(daily_std_dev, 1)
//! ```
//!
//! The score drives the intensity label on every tick. Crossing the alert
//! threshold inside the window fires once per window.

use crate::alerts::{AlertEvent, AlertKind};
use crate::error::ConfigError;
use crate::store::SymbolState;
use crate::window::WindowConfig;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Volume intensity label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intensity {
    /// Window not open yet, or no score computed
    #[default]
    Waiting,
    Normal,
    High,
    VeryHigh,
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Intensity::Waiting => "WAITING",
            Intensity::Normal => "NORMAL",
            Intensity::High => "HIGH",
            Intensity::VeryHigh => "VERY_HIGH",
        })
    }
}

/// Classification and alert thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeThresholds {
    /// `z` at or above this is HIGH
    pub high: f64,
    /// `z` strictly above this is VERY_HIGH. The bound itself stays HIGH,
    /// so `z == very_high` classifies as HIGH.
    pub very_high: f64,
    /// `z` at or above this fires the alert
    pub alert: f64,
}

impl SpikeThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.high.is_finite() && self.very_high.is_finite() && self.alert.is_finite()) {
            return Err(ConfigError::invalid("spike_thresholds", "must be finite"));
        }
        if self.high > self.very_high {
            return Err(ConfigError::invalid(
                "spike_thresholds",
                "high must not exceed very_high",
            ));
        }
        Ok(())
    }

    pub fn classify(&self, z: f64) -> Intensity {
        if z < self.high {
            Intensity::Normal
        } else if z <= self.very_high {
            Intensity::High
        } else {
            Intensity::VeryHigh
        }
    }
}

impl Default for SpikeThresholds {
    fn default() -> Self {
        Self {
            high: 0.5,
            very_high: 1.5,
            alert: 2.0,
        }
    }
}

/// Volume expected by now, given the daily mean and window progress
pub trait ExpectedVolumeModel: Send + Sync {
    fn expected(&self, daily_mean: f64, elapsed_minutes: i64, duration_minutes: i64) -> f64;
}

/// Expects the full daily mean to trade evenly across the window
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearPaceModel;

impl ExpectedVolumeModel for LinearPaceModel {
    fn expected(&self, daily_mean: f64, elapsed_minutes: i64, duration_minutes: i64) -> f64 {
        daily_mean * elapsed_minutes as f64 / duration_minutes as f64
    }
}

/// Scores symbols and fires the unusual-volume alert
#[derive(Clone)]
pub struct SpikeDetector {
    thresholds: SpikeThresholds,
    model: Arc<dyn ExpectedVolumeModel>,
}

impl SpikeDetector {
    pub fn new(thresholds: SpikeThresholds) -> Self {
        Self::with_model(thresholds, Arc::new(LinearPaceModel))
    }

    pub fn with_model(thresholds: SpikeThresholds, model: Arc<dyn ExpectedVolumeModel>) -> Self {
        Self { thresholds, model }
    }

    pub fn thresholds(&self) -> &SpikeThresholds {
        &self.thresholds
    }

    /// Re-score `state` at `now`. Returns the alert if this evaluation fired it.
    pub fn evaluate(
        &self,
        state: &mut SymbolState,
        window: &WindowConfig,
        now: NaiveDateTime,
    ) -> Option<AlertEvent> {
        let time = now.time();

        let Some(elapsed) = window.elapsed_minutes(time) else {
            state.z_score = None;
            state.intensity = Intensity::Waiting;
            return None;
        };

        let duration = window.duration_minutes();
        if duration <= 0 {
            return None;
        }

        let Some((mean, std_dev)) = state.baseline.as_ref().and_then(|b| b.scoring_inputs())
        else {
            state.z_score = None;
            state.intensity = Intensity::Waiting;
            return None;
        };

        let expected = self.model.expected(mean, elapsed, duration);
        let z = (state.window_volume as f64 - expected) / std_dev;
        if !z.is_finite() {
            return None;
        }

        state.z_score = Some(z);
        state.intensity = self.thresholds.classify(z);

        if z >= self.thresholds.alert && window.contains(time) && !state.auto_alert_fired {
            state.auto_alert_fired = true;
            tracing::debug!(symbol = %state.symbol, z, expected, "Unusual volume");
            return Some(AlertEvent::new(
                &state.symbol,
                AlertKind::UnusualVolume {
                    z_score: (z * 100.0).round() / 100.0,
                    window_volume: state.window_volume,
                },
                now,
            ));
        }

        None
    }
}

impl Default for SpikeDetector {
    fn default() -> Self {
        Self::new(SpikeThresholds::default())
    }
}
