//! Feed event callbacks

use crate::{
    data::Tick,
    error::{ConnectionError, MonitorError},
    state::{ConnectionState, StateTransition},
};
use tokio::sync::mpsc;

/// Receives everything the feed client observes
///
/// `on_tick` runs on the feed task; implementations should return quickly.
pub trait FeedHandler: Send + Sync {
    fn on_tick(&self, tick: Tick);

    fn on_state_change(&self, _transition: &StateTransition) {}

    /// Recoverable problems: malformed frames, failed attempts, lost sessions
    fn on_error(&self, _error: &MonitorError) {}

    /// Reconnection gave up; the feed is stopping
    fn on_fatal(&self, _error: &ConnectionError) {}
}

/// Feed events as plain values, for consumers that prefer a stream
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(Tick),
    State(ConnectionState),
    Error(String),
    Fatal(ConnectionError),
}

/// Forwards every callback into an unbounded channel
#[derive(Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<FeedEvent>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<FeedEvent>;

impl ChannelHandler {
    pub fn new() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: FeedEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Feed event receiver dropped");
        }
    }
}

impl FeedHandler for ChannelHandler {
    fn on_tick(&self, tick: Tick) {
        self.forward(FeedEvent::Tick(tick));
    }

    fn on_state_change(&self, transition: &StateTransition) {
        self.forward(FeedEvent::State(transition.to.clone()));
    }

    fn on_error(&self, error: &MonitorError) {
        self.forward(FeedEvent::Error(error.to_string()));
    }

    fn on_fatal(&self, error: &ConnectionError) {
        self.forward(FeedEvent::Fatal(error.clone()));
    }
}

/// Run a handler callback, containing any panic so the feed loop survives it
pub(crate) fn shielded<F: FnOnce()>(callback: &str, f: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::error!("Feed handler panicked in {}", callback);
    }
}
