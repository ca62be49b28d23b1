//! WebSocket connection establishment, handshake frames and reconnect backoff

use crate::{
    data::{FeedConfig, ReconnectConfig},
    error::ConnectionError,
};
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Stream type produced by [`ConnectionManager::connect`]
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the upstream socket and builds the session frames
pub struct ConnectionManager {
    config: FeedConfig,
}

impl ConnectionManager {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Establish the WebSocket connection, bounded by the configured timeout
    pub async fn connect(&self) -> Result<WsStream, ConnectionError> {
        let url = Url::parse(&self.config.endpoint)
            .map_err(|e| ConnectionError::EstablishmentFailed(format!("Invalid URL: {}", e)))?;

        tokio::select! {
            result = connect_async(url) => {
                match result {
                    Ok((ws_stream, _)) => {
                        tracing::info!("WebSocket connection established to {}", self.config.endpoint);
                        Ok(ws_stream)
                    }
                    Err(e) => Err(ConnectionError::EstablishmentFailed(format!("Connection failed: {}", e))),
                }
            }
            _ = sleep(self.config.timeout) => {
                Err(ConnectionError::Timeout(format!(
                    "no connection to {} within {:?}",
                    self.config.endpoint, self.config.timeout
                )))
            }
        }
    }

    /// Login request, the first frame of every session
    pub fn login_message(&self) -> Message {
        let payload = json!({
            "Type": "Login",
            "Data": {
                "LoginId": self.config.login_id,
                "Password": self.config.password,
            }
        });
        tracing::info!("Login request prepared for {}", self.config.login_id);
        Message::Text(payload.to_string())
    }

    /// Keep-alive frame
    pub fn heartbeat_message() -> Message {
        let payload = json!({
            "Type": "Info",
            "Data": {
                "InfoType": "HB",
                "InfoMsg": "Heartbeat",
            }
        });
        Message::Text(payload.to_string())
    }
}

/// Exponential backoff between reconnection attempts
#[derive(Debug, Clone)]
pub struct ReconnectStrategy {
    config: ReconnectConfig,
}

impl ReconnectStrategy {
    const JITTER_FACTOR: f64 = 0.25;

    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay before retry number `attempt` (1-based):
    /// `initial × multiplier^(attempt-1)`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let capped = base.min(self.config.max_delay.as_millis() as f64);

        let delay = if self.config.jitter && capped >= 1.0 {
            let range = capped * Self::JITTER_FACTOR;
            let jitter = rand::thread_rng().gen_range(-range..range);
            (capped + jitter).clamp(0.0, self.config.max_delay.as_millis() as f64)
        } else {
            capped
        };

        tracing::debug!("Backoff for attempt {}: {:.0}ms", attempt, delay);
        Duration::from_millis(delay as u64)
    }
}
