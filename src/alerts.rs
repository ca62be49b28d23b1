//! Alert events, the operator log, and delivery channels
//!
//! Detection code emits [`AlertEvent`]s into an [`AlertSink`] while it still
//! holds the symbol's lock. Sinks must therefore be cheap and non-blocking:
//! [`AlertLog`] appends to a bounded in-memory buffer, [`ChannelSink`] hands
//! the event to an [`AlertDispatcher`] task that does the slow delivery.

use crate::clock::Clock;
use crate::rules::{Operator, RightSide};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Entries kept by the operator log unless configured otherwise
pub const DEFAULT_LOG_CAPACITY: usize = 300;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// What fired
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    /// Window volume far above the expected pace
    UnusualVolume { z_score: f64, window_volume: u64 },
    /// An operator-defined threshold rule
    UserRule {
        rule_id: Uuid,
        operator: Operator,
        right_side: RightSide,
        live_volume: u64,
        threshold: f64,
    },
}

/// A single fired alert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub symbol: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub timestamp: NaiveDateTime,
}

impl AlertEvent {
    pub fn new(symbol: &str, kind: AlertKind, timestamp: NaiveDateTime) -> Self {
        let severity = match kind {
            AlertKind::UnusualVolume { .. } => AlertSeverity::Warning,
            AlertKind::UserRule { .. } => AlertSeverity::Info,
        };
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            kind,
            severity,
            timestamp,
        }
    }

    /// Operator-facing one-liner
    pub fn format_message(&self) -> String {
        match &self.kind {
            AlertKind::UnusualVolume {
                z_score,
                window_volume,
            } => format!(
                "ALERT [{}]: UNUSUAL VOLUME | z={:.2} | vol={}",
                self.symbol,
                z_score,
                group_thousands(*window_volume)
            ),
            AlertKind::UserRule {
                operator,
                right_side,
                live_volume,
                ..
            } => format!(
                "ALERT [{}]: USER ALERT TRIGGERED | {} {} | vol={}",
                self.symbol,
                operator,
                right_side.kind(),
                group_thousands(*live_volume)
            ),
        }
    }
}

impl fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_message())
    }
}

/// `850000` → `"850,000"`
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SINKS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Synchronous receiver of alerts and operator notices
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: &AlertEvent);

    /// Free-form operator notice (status changes, configuration changes)
    fn notice(&self, _message: &str) {}
}

/// One line of the operator log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Bounded in-memory operator log, oldest entries evicted first
pub struct AlertLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl AlertLog {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: self.clock.now(),
            message: message.into(),
        };
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl AlertSink for AlertLog {
    fn emit(&self, event: &AlertEvent) {
        tracing::warn!(symbol = %event.symbol, "{}", event.format_message());
        self.push(event.format_message());
    }

    fn notice(&self, message: &str) {
        tracing::info!("{}", message);
        self.push(message);
    }
}

/// Forwards to every inner sink in order
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AlertSink for FanoutSink {
    fn emit(&self, event: &AlertEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }

    fn notice(&self, message: &str) {
        for sink in &self.sinks {
            sink.notice(message);
        }
    }
}

/// Queues events for an [`AlertDispatcher`] task. Notices are not forwarded.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AlertEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelSink {
    fn emit(&self, event: &AlertEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!("Alert dispatcher gone; dropping {}", event.id);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELIVERY CHANNELS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Alert channel trait
#[async_trait::async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, alert: &AlertEvent) -> Result<(), String>;
    fn name(&self) -> &str;
}

/// Writes alerts to the tracing output
pub struct ConsoleChannel;

#[async_trait::async_trait]
impl AlertChannel for ConsoleChannel {
    async fn send(&self, alert: &AlertEvent) -> Result<(), String> {
        tracing::info!(target: "volwatch::alert", "{}", alert.format_message());
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Webhook alert channel (HTTP POST)
pub struct WebhookChannel {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            headers: HashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Body posted for an alert; `content`/`text` keep chat webhooks happy
    pub fn payload(alert: &AlertEvent) -> serde_json::Value {
        serde_json::json!({
            "content": alert.format_message(),
            "text": alert.format_message(),
            "alert": alert,
        })
    }
}

#[async_trait::async_trait]
impl AlertChannel for WebhookChannel {
    async fn send(&self, alert: &AlertEvent) -> Result<(), String> {
        let mut request = self.client.post(&self.url).json(&Self::payload(alert));
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("Webhook returned {}", response.status())),
            Err(e) => Err(e.to_string()),
        }
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Routes queued alerts to delivery channels
pub struct AlertDispatcher {
    channels: Vec<Box<dyn AlertChannel>>,
    history: VecDeque<AlertEvent>,
    max_history: usize,
    min_severity: AlertSeverity,
}

impl AlertDispatcher {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            history: VecDeque::new(),
            max_history: 1000,
            min_severity: AlertSeverity::Info,
        }
    }

    pub fn add_channel(&mut self, channel: Box<dyn AlertChannel>) {
        self.channels.push(channel);
    }

    pub fn with_channel(mut self, channel: Box<dyn AlertChannel>) -> Self {
        self.add_channel(channel);
        self
    }

    pub fn set_min_severity(&mut self, severity: AlertSeverity) {
        self.min_severity = severity;
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver to every channel. Channel failures are logged, not returned.
    pub async fn dispatch(&mut self, alert: AlertEvent) {
        if alert.severity < self.min_severity {
            return;
        }

        for channel in &self.channels {
            if let Err(e) = channel.send(&alert).await {
                tracing::warn!("Failed to send alert via {}: {}", channel.name(), e);
            }
        }

        if self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(alert);
    }

    /// Most recent first
    pub fn history(&self, count: usize) -> Vec<&AlertEvent> {
        self.history.iter().rev().take(count).collect()
    }

    /// Drain `rx` until every sender is dropped
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AlertEvent>) -> Self {
        while let Some(alert) = rx.recv().await {
            self.dispatch(alert).await;
        }
        tracing::debug!("Alert dispatcher stopped");
        self
    }

    pub fn spawn(self, rx: mpsc::UnboundedReceiver<AlertEvent>) -> JoinHandle<Self> {
        tokio::spawn(self.run(rx))
    }
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spike(symbol: &str) -> AlertEvent {
        AlertEvent::new(
            symbol,
            AlertKind::UnusualVolume {
                z_score: 3.5,
                window_volume: 850_000,
            },
            chrono::NaiveDate::from_ymd_opt(2024, 3, 4)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        )
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1_000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn test_alert_formatting() {
        assert_eq!(
            spike("INFY").format_message(),
            "ALERT [INFY]: UNUSUAL VOLUME | z=3.50 | vol=850,000"
        );

        let rule = AlertEvent::new(
            "TCS",
            AlertKind::UserRule {
                rule_id: Uuid::new_v4(),
                operator: Operator::Greater,
                right_side: RightSide::PrevDay,
                live_volume: 1_500_000,
                threshold: 1_400_000.0,
            },
            spike("X").timestamp,
        );
        assert_eq!(
            rule.format_message(),
            "ALERT [TCS]: USER ALERT TRIGGERED | > PREV_DAY | vol=1,500,000"
        );
    }

    #[test]
    fn test_log_is_bounded() {
        let clock = Arc::new(ManualClock::at((2024, 3, 4), (9, 15, 0)));
        let log = AlertLog::new(3, clock.clone());
        for i in 0..5 {
            log.push(format!("entry {}", i));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 2");
        assert_eq!(entries[2].to_string(), "[09:15:00] entry 4");
    }

    #[test]
    fn test_fanout_reaches_all_sinks() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at((2024, 3, 4), (9, 15, 0)));
        let a = Arc::new(AlertLog::new(10, clock.clone()));
        let b = Arc::new(AlertLog::new(10, clock));
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());

        fanout.emit(&spike("SBIN"));
        fanout.notice("WINDOW SET");
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
    }

    struct CountingChannel(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl AlertChannel for CountingChannel {
        async fn send(&self, _alert: &AlertEvent) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_dispatcher_drains_channel_sink() {
        let count = Arc::new(AtomicUsize::new(0));
        let (sink, rx) = ChannelSink::new();
        let handle = AlertDispatcher::new()
            .with_channel(Box::new(CountingChannel(count.clone())))
            .spawn(rx);

        sink.emit(&spike("INFY"));
        sink.emit(&spike("TCS"));
        drop(sink);

        let dispatcher = handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.history(10)[0].symbol, "TCS");
    }

    #[tokio::test]
    async fn test_min_severity_filters() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut dispatcher =
            AlertDispatcher::new().with_channel(Box::new(CountingChannel(count.clone())));
        dispatcher.set_min_severity(AlertSeverity::Critical);
        dispatcher.dispatch(spike("INFY")).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
