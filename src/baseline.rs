//! Historical volume baselines
//!
//! A [`Baseline`] is produced outside the ingest path (bulk history download,
//! nightly job) and handed to the store wholesale. [`compute_baselines`] turns
//! raw daily volume records into baselines; [`load_baselines`] reads either a
//! precomputed map or the raw records from disk.

use crate::error::MonitorError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Days of history used for mean, deviation and monthly average
pub const LOOKBACK_DAYS: usize = 20;
/// Days averaged for the weekly reference
pub const WEEK_DAYS: usize = 5;
/// Smallest standard deviation handed to the z-score
pub const MIN_STD_DEV: f64 = 1.0;

/// Whether the history behind a baseline is long enough to trust
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataStatus {
    #[default]
    Ok,
    Insufficient,
}

/// Per-symbol historical metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Baseline {
    pub daily_mean: Option<f64>,
    pub daily_std_dev: Option<f64>,
    pub p90: Option<f64>,
    pub prev_day_volume: Option<f64>,
    pub weekly_avg_volume: Option<f64>,
    pub monthly_avg_volume: Option<f64>,
    pub last_observed_date: Option<NaiveDate>,
    #[serde(default)]
    pub data_status: DataStatus,
    #[serde(default)]
    pub available_days: usize,
}

impl Baseline {
    /// Mean and floored deviation, if both are usable for scoring
    pub fn scoring_inputs(&self) -> Option<(f64, f64)> {
        let mean = self.daily_mean.filter(|m| m.is_finite() && *m > 0.0)?;
        let std = self.daily_std_dev.filter(|s| s.is_finite() && *s > 0.0)?;
        Some((mean, std.max(MIN_STD_DEV)))
    }
}

/// One day of traded volume for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyVolume {
    pub symbol: String,
    pub date: NaiveDate,
    pub volume: f64,
}

/// Derive baselines from daily records
///
/// With at least [`LOOKBACK_DAYS`] of history the last twenty days drive the
/// mean, population deviation and monthly average. Shorter histories use every
/// day available and are marked [`DataStatus::Insufficient`].
pub fn compute_baselines(records: &[DailyVolume]) -> HashMap<String, Baseline> {
    let mut grouped: BTreeMap<&str, Vec<&DailyVolume>> = BTreeMap::new();
    for record in records {
        grouped
            .entry(record.symbol.trim())
            .or_default()
            .push(record);
    }

    grouped
        .into_iter()
        .filter_map(|(symbol, mut rows)| {
            rows.sort_by_key(|r| r.date);
            let volumes: Vec<f64> = rows.iter().map(|r| r.volume).collect();
            let last = rows.last()?;

            let window = &volumes[volumes.len().saturating_sub(LOOKBACK_DAYS)..];
            let week = &volumes[volumes.len().saturating_sub(WEEK_DAYS)..];

            let mut sorted = volumes.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let p90_index = ((0.9 * sorted.len() as f64) as usize).min(sorted.len() - 1);

            let baseline = Baseline {
                daily_mean: Some(mean(window)),
                daily_std_dev: Some(population_std_dev(window).max(MIN_STD_DEV)),
                p90: Some(sorted[p90_index]),
                prev_day_volume: Some(last.volume),
                weekly_avg_volume: Some(mean(week)),
                monthly_avg_volume: Some(mean(window)),
                last_observed_date: Some(last.date),
                data_status: if volumes.len() < LOOKBACK_DAYS {
                    DataStatus::Insufficient
                } else {
                    DataStatus::Ok
                },
                available_days: volumes.len(),
            };
            Some((symbol.to_uppercase(), baseline))
        })
        .collect()
}

/// Read baselines from a JSON file holding either a `symbol → Baseline` map or
/// an array of [`DailyVolume`] records
pub fn load_baselines(path: impl AsRef<Path>) -> Result<HashMap<String, Baseline>, MonitorError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| MonitorError::Baseline(format!("{}: {}", path.display(), e)))?;
    parse_baselines(&raw)
}

pub fn parse_baselines(raw: &str) -> Result<HashMap<String, Baseline>, MonitorError> {
    if let Ok(map) = serde_json::from_str::<HashMap<String, Baseline>>(raw) {
        return Ok(map
            .into_iter()
            .map(|(symbol, baseline)| (symbol.trim().to_uppercase(), baseline))
            .collect());
    }

    let records: Vec<DailyVolume> = serde_json::from_str(raw)
        .map_err(|e| MonitorError::Baseline(format!("unrecognised baseline file: {}", e)))?;
    Ok(compute_baselines(&records))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = mean(values);
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.max(0.0).sqrt()
}
