//! # volwatch
//!
//! Real-time unusual-volume monitor for exchange instruments.
//!
//! A [`FeedClient`] keeps a websocket session to the market-data feed alive
//! and hands cumulative-volume ticks to a [`Monitor`], which accumulates
//! volume inside an operator-chosen intraday window, scores it against
//! historical baselines, and fires alerts from the spike detector and from
//! operator-defined threshold rules.
//!
//! ## Quick Start
//! ```rust,ignore
//! use volwatch::prelude::*;
//!
//! let monitor = Arc::new(Monitor::builder().instruments(universe).build()?);
//! let client = FeedClient::new(FeedConfig::default())?;
//! for instrument in universe {
//!     client.subscribe(instrument);
//! }
//! client.connect(monitor.clone(), shutdown_rx).await?;
//! ```

pub mod alerts;
pub mod baseline;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod data;
pub mod error;
pub mod events;
pub mod monitor;
pub mod parser;
pub mod processor;
pub mod rules;
pub mod spike;
pub mod state;
pub mod store;
pub mod subscription;
pub mod window;

pub use alerts::{
    AlertChannel, AlertDispatcher, AlertEvent, AlertKind, AlertLog, AlertSeverity, AlertSink,
    ChannelSink, ConsoleChannel, FanoutSink, LogEntry, WebhookChannel,
};
pub use baseline::{compute_baselines, load_baselines, Baseline, DailyVolume, DataStatus};
pub use client::FeedClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_instruments, MonitorConfig};
pub use data::{FeedConfig, FeedConfigBuilder, HeartbeatConfig, Instrument, ReconnectConfig, Tick};
pub use error::*;
pub use events::{ChannelHandler, FeedEvent, FeedHandler};
pub use monitor::{FeedHealth, Monitor, MonitorBuilder};
pub use processor::{IngestSnapshot, TickOutcome, TickProcessor};
pub use rules::{AlertRule, Operator, RightSide, RuleId, RuleRequest, RuleToggles};
pub use spike::{ExpectedVolumeModel, Intensity, LinearPaceModel, SpikeDetector, SpikeThresholds};
pub use state::{ConnectionState, StateTransition};
pub use store::{SymbolSnapshot, SymbolStore, VolumeStatus};
pub use window::WindowConfig;

/// Prelude - the types most binaries need
///
/// Import with: `use volwatch::prelude::*;`
pub mod prelude {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // CORE API
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Operator-facing monitor
    pub use crate::monitor::{FeedHealth, Monitor, MonitorBuilder};

    /// Feed
    pub use crate::client::FeedClient;
    pub use crate::data::{FeedConfig, Instrument, Tick};

    /// Rules and detection
    pub use crate::rules::{RuleRequest, RuleToggles};
    pub use crate::spike::{Intensity, SpikeThresholds};
    pub use crate::window::WindowConfig;

    /// Errors
    pub use crate::error::{ConfigError, ConnectionError, MonitorError, RuleError};

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // OPTIONAL: Alert delivery
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    pub use crate::alerts::{AlertDispatcher, ChannelSink, WebhookChannel};

    pub use std::sync::Arc;
}

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`)
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("Logging already initialised");
    }
}
