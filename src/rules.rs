//! User-defined threshold rules
//!
//! A rule compares a symbol's live cumulative volume against a fixed number or
//! a historical reference. Each rule fires at most once; re-arming means
//! removing it and adding a new one.

use crate::alerts::{AlertEvent, AlertKind};
use crate::baseline::Baseline;
use crate::error::RuleError;
use crate::store::SymbolState;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type RuleId = Uuid;

/// Comparison applied as `live_volume <op> threshold`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

impl Operator {
    pub fn compare(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Operator::Greater => lhs > rhs,
            Operator::GreaterOrEqual => lhs >= rhs,
        }
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "GT" | "gt" => Ok(Operator::Greater),
            ">=" | "≥" | "GTE" | "gte" => Ok(Operator::GreaterOrEqual),
            other => Err(RuleError::InvalidOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
        })
    }
}

/// What the live volume is compared against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RightSide {
    Fixed(f64),
    PrevDay,
    WeeklyAvg,
    MonthlyAvg,
    /// Weekly average scaled by a factor
    MultiplierWeekly(f64),
}

impl RightSide {
    /// Build from the wire representation (`FIXED`, `PREV_DAY`, ...)
    pub fn from_request(right_type: &str, value: Option<f64>) -> Result<Self, RuleError> {
        let kind = right_type.trim().to_uppercase();
        let side = match kind.as_str() {
            "FIXED" => RightSide::Fixed(require_value(&kind, value)?),
            "PREV_DAY" => RightSide::PrevDay,
            "WEEKLY_AVG" => RightSide::WeeklyAvg,
            "MONTHLY_AVG" => RightSide::MonthlyAvg,
            "MULTIPLIER_WEEKLY" | "MULTIPLIER" => {
                RightSide::MultiplierWeekly(require_value(&kind, value)?)
            }
            _ => return Err(RuleError::InvalidRightSide(right_type.to_string())),
        };
        Ok(side)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RightSide::Fixed(_) => "FIXED",
            RightSide::PrevDay => "PREV_DAY",
            RightSide::WeeklyAvg => "WEEKLY_AVG",
            RightSide::MonthlyAvg => "MONTHLY_AVG",
            RightSide::MultiplierWeekly(_) => "MULTIPLIER_WEEKLY",
        }
    }

    /// Threshold for this rule; `None` when the baseline lacks the reference
    pub fn resolve(&self, baseline: Option<&Baseline>) -> Option<f64> {
        let value = match self {
            RightSide::Fixed(v) => Some(*v),
            RightSide::PrevDay => baseline?.prev_day_volume,
            RightSide::WeeklyAvg => baseline?.weekly_avg_volume,
            RightSide::MonthlyAvg => baseline?.monthly_avg_volume,
            RightSide::MultiplierWeekly(factor) => baseline?.weekly_avg_volume.map(|w| w * factor),
        };
        value.filter(|v| v.is_finite())
    }

    /// Fixed thresholds ignore the toggles
    pub fn is_enabled(&self, toggles: &RuleToggles) -> bool {
        match self {
            RightSide::Fixed(_) => true,
            RightSide::PrevDay => toggles.above_prev_day,
            RightSide::WeeklyAvg | RightSide::MultiplierWeekly(_) => toggles.above_weekly_avg,
            RightSide::MonthlyAvg => toggles.above_monthly_avg,
        }
    }
}

impl fmt::Display for RightSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RightSide::Fixed(v) => write!(f, "FIXED({})", v),
            RightSide::MultiplierWeekly(m) => write!(f, "{}x WEEKLY_AVG", m),
            other => f.write_str(other.kind()),
        }
    }
}

fn require_value(kind: &str, value: Option<f64>) -> Result<f64, RuleError> {
    let value = value.ok_or_else(|| RuleError::MissingValue(kind.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(RuleError::InvalidValue {
            kind: kind.to_string(),
            value,
        });
    }
    Ok(value)
}

/// Operator switches that suppress whole classes of reference rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleToggles {
    pub above_prev_day: bool,
    /// Also governs multiplier rules
    pub above_weekly_avg: bool,
    pub above_monthly_avg: bool,
}

impl Default for RuleToggles {
    fn default() -> Self {
        Self {
            above_prev_day: true,
            above_weekly_avg: true,
            above_monthly_avg: true,
        }
    }
}

/// Rule creation request as received from the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRequest {
    pub symbol: String,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default = "default_right_type")]
    pub right_type: String,
    #[serde(default)]
    pub right_value: Option<f64>,
}

fn default_operator() -> String {
    ">".to_string()
}

fn default_right_type() -> String {
    "FIXED".to_string()
}

impl RuleRequest {
    pub fn new(symbol: &str, operator: &str, right_type: &str, right_value: Option<f64>) -> Self {
        Self {
            symbol: symbol.to_string(),
            operator: operator.to_string(),
            right_type: right_type.to_string(),
            right_value,
        }
    }
}

/// A registered threshold rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRule {
    pub id: RuleId,
    pub symbol: String,
    pub operator: Operator,
    pub right_side: RightSide,
    pub triggered: bool,
    pub created_at: NaiveDateTime,
    pub triggered_at: Option<NaiveDateTime>,
}

impl AlertRule {
    /// Validate a request. The symbol is normalised but not checked against
    /// the store here.
    pub fn from_request(request: &RuleRequest, now: NaiveDateTime) -> Result<Self, RuleError> {
        let symbol = request.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(RuleError::UnknownSymbol(request.symbol.clone()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            symbol,
            operator: request.operator.parse()?,
            right_side: RightSide::from_request(&request.right_type, request.right_value)?,
            triggered: false,
            created_at: now,
            triggered_at: None,
        })
    }

    fn mark_triggered(&mut self, now: NaiveDateTime) {
        self.triggered = true;
        self.triggered_at = Some(now);
    }
}

impl fmt::Display for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.symbol, self.operator, self.right_side)
    }
}

/// Evaluates a symbol's rules against its live volume
pub struct RuleEngine;

impl RuleEngine {
    /// Fire every untriggered, enabled, resolvable rule whose condition holds.
    pub fn evaluate(
        rules: &mut [AlertRule],
        state: &mut SymbolState,
        toggles: &RuleToggles,
        now: NaiveDateTime,
    ) -> Vec<AlertEvent> {
        let Some(live) = state.live_volume else {
            return Vec::new();
        };

        let mut fired = Vec::new();
        for rule in rules.iter_mut() {
            if rule.triggered || !rule.right_side.is_enabled(toggles) {
                continue;
            }
            let Some(threshold) = rule.right_side.resolve(state.baseline.as_ref()) else {
                continue;
            };
            if !rule.operator.compare(live as f64, threshold) {
                continue;
            }

            rule.mark_triggered(now);
            state.user_alert_active = true;
            tracing::debug!(symbol = %state.symbol, rule = %rule, live, threshold, "Rule triggered");
            fired.push(AlertEvent::new(
                &state.symbol,
                AlertKind::UserRule {
                    rule_id: rule.id,
                    operator: rule.operator,
                    right_side: rule.right_side,
                    live_volume: live,
                    threshold,
                },
                now,
            ));
        }
        fired
    }

    /// Whether any rule is still in the triggered state
    pub fn any_triggered(rules: &[AlertRule]) -> bool {
        rules.iter().any(|r| r.triggered)
    }
}
