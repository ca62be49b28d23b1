//! Error types for the volume monitor

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug, Clone)]
pub enum MonitorError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Tick error: {0}")]
    Tick(#[from] TickError),

    #[error("Baseline error: {0}")]
    Baseline(String),
}

/// Connection-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Failed to establish connection: {0}")]
    EstablishmentFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("No inbound traffic for {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    #[error("Gave up after {attempts} reconnection attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Parsing-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

/// Rule management errors, returned to the caller of the rule API
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Invalid right-hand side: {0}")]
    InvalidRightSide(String),

    #[error("Right-hand side {0} requires a value")]
    MissingValue(String),

    #[error("Invalid value for {kind}: {value}")]
    InvalidValue { kind: String, value: f64 },
}

/// Configuration errors, rejected at the mutation boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid time of day: {0}")]
    InvalidTime(String),

    #[error("Window start {start} must be at least one minute before end {end}")]
    InvalidWindow { start: String, end: String },

    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: String, reason: String },

    #[error("Failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidSetting {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Per-tick processing errors. These never escape the ingest loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TickError {
    #[error("No symbol registered for token {0}")]
    UnknownToken(String),
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,      // Expected noise, dropped input
    Medium,   // Recoverable errors
    High,     // Rejected operator input or degraded transport
    Critical, // Ingestion stopped
}

impl ErrorSeverity {
    pub fn from_error(error: &MonitorError) -> Self {
        match error {
            MonitorError::Connection(conn_err) => match conn_err {
                ConnectionError::RetriesExhausted { .. } => ErrorSeverity::Critical,
                ConnectionError::AuthenticationFailed(_) => ErrorSeverity::High,
                _ => ErrorSeverity::Medium,
            },
            MonitorError::Parse(_) => ErrorSeverity::Low,
            MonitorError::Tick(_) => ErrorSeverity::Low,
            MonitorError::Rule(_) => ErrorSeverity::Medium,
            MonitorError::Configuration(_) => ErrorSeverity::High,
            MonitorError::Baseline(_) => ErrorSeverity::Medium,
        }
    }
}

/// Routes errors to the tracing level that matches their severity
pub struct ErrorReporter;

impl ErrorReporter {
    pub fn report(error: &MonitorError, operation: &str) {
        match ErrorSeverity::from_error(error) {
            ErrorSeverity::Critical => {
                tracing::error!(operation, "CRITICAL: {}", error);
            }
            ErrorSeverity::High => {
                tracing::error!(operation, "{}", error);
            }
            ErrorSeverity::Medium => {
                tracing::warn!(operation, "{}", error);
            }
            ErrorSeverity::Low => {
                tracing::debug!(operation, "{}", error);
            }
        }
    }
}
