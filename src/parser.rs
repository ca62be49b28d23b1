//! Inbound frame decoding

use crate::{data::Tick, error::ParseError};
use serde_json::Value;

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Login acknowledgement
    Login(LoginAck),
    MarketData(Tick),
    FeedStatus(Value),
    /// Any other `Type`; carried so callers can log it
    Other(String),
}

/// Login acknowledgement. A non-empty `ErrorMsg` means the login was refused.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginAck {
    pub error: Option<String>,
}

impl LoginAck {
    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
    }
}

/// Trait for decoding feed frames
pub trait MessageParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<FeedMessage, ParseError>;
}

/// Parser for the upstream JSON protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedParser;

impl FeedParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_login(data: Option<&Value>) -> LoginAck {
        let error = data
            .and_then(|d| d.get("ErrorMsg"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|msg| !msg.is_empty())
            .map(str::to_string);
        LoginAck { error }
    }

    fn parse_market_data(data: Option<&Value>) -> Result<Tick, ParseError> {
        let data = data.ok_or_else(|| ParseError::MissingField("Data".to_string()))?;
        let token = extract_token(data)?;
        let cumulative_volume = extract_quantity(data, "TTQ")?;
        Ok(Tick {
            token,
            cumulative_volume,
        })
    }
}

impl MessageParser for FeedParser {
    fn parse(&self, text: &str) -> Result<FeedMessage, ParseError> {
        let json: Value = serde_json::from_str(text.trim())
            .map_err(|e| ParseError::InvalidJson(format!("JSON parsing failed: {}", e)))?;

        let msg_type = json
            .get("Type")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::MissingField("Type".to_string()))?;

        let data = json.get("Data");
        match msg_type {
            "Login" => Ok(FeedMessage::Login(Self::parse_login(data))),
            "MarketData" => Self::parse_market_data(data).map(FeedMessage::MarketData),
            "FeedStatus" => Ok(FeedMessage::FeedStatus(data.cloned().unwrap_or(Value::Null))),
            other => Ok(FeedMessage::Other(other.to_string())),
        }
    }
}

/// `Tkn` arrives as a string or an integer
fn extract_token(data: &Value) -> Result<String, ParseError> {
    match data.get("Tkn") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ParseError::InvalidDataType(format!("Tkn: {}", other))),
        None => Err(ParseError::MissingField("Tkn".to_string())),
    }
}

/// Non-negative quantity from a number or a numeric string
fn extract_quantity(data: &Value, field: &str) -> Result<u64, ParseError> {
    let value = data
        .get(field)
        .ok_or_else(|| ParseError::MissingField(field.to_string()))?;

    let parsed = match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(float_quantity)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(float_quantity))
        }
        _ => None,
    };

    parsed.ok_or_else(|| ParseError::InvalidDataType(format!("{}: {}", field, value)))
}

fn float_quantity(value: f64) -> Option<u64> {
    if value.is_finite() && value >= 0.0 && value <= u64::MAX as f64 {
        Some(value.floor() as u64)
    } else {
        None
    }
}
