//! Volume monitor - the operator-facing API
//!
//! Ties the store, tick processor, rule engine and operator log together and
//! receives feed callbacks as a [`FeedHandler`].
//!
//! ```rust,ignore
//! let monitor = Arc::new(MonitorBuilder::new().instruments(universe).build()?);
//! monitor.add_rule(RuleRequest::new("INFY", ">", "PREV_DAY", None))?;
//! client.connect(monitor.clone(), shutdown_rx).await?;
//! ```

use crate::{
    alerts::{AlertLog, AlertSink, FanoutSink, LogEntry, DEFAULT_LOG_CAPACITY},
    baseline::Baseline,
    clock::{Clock, SystemClock},
    config::MonitorConfig,
    data::{Instrument, Tick},
    error::{ConfigError, ConnectionError, ErrorReporter, MonitorError, RuleError, TickError},
    events::FeedHandler,
    processor::{IngestSnapshot, TickOutcome, TickProcessor},
    rules::{AlertRule, RuleEngine, RuleId, RuleRequest, RuleToggles},
    spike::{ExpectedVolumeModel, SpikeDetector, SpikeThresholds},
    state::{ConnectionState, StateTransition, TransitionTrigger},
    store::{lock, SymbolEntry, SymbolSnapshot, SymbolStore},
    window::{parse_time_of_day, WindowConfig},
};
use chrono::NaiveTime;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What the monitor knows about its feed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedHealth {
    pub state: ConnectionState,
    /// Reconnection gave up; state is frozen until the feed is restarted
    pub fatal: bool,
    pub last_error: Option<String>,
    /// Retry attempts since the monitor started
    pub reconnects: u64,
}

/// Builder for [`Monitor`]
pub struct MonitorBuilder {
    window: WindowConfig,
    thresholds: SpikeThresholds,
    model: Option<Arc<dyn ExpectedVolumeModel>>,
    stale_after: Duration,
    log_capacity: usize,
    clock: Arc<dyn Clock>,
    sinks: Vec<Arc<dyn AlertSink>>,
    instruments: Vec<Instrument>,
    baselines: HashMap<String, Baseline>,
}

impl MonitorBuilder {
    pub fn new() -> Self {
        Self {
            window: WindowConfig::default(),
            thresholds: SpikeThresholds::default(),
            model: None,
            stale_after: Duration::from_secs(120),
            log_capacity: DEFAULT_LOG_CAPACITY,
            clock: Arc::new(SystemClock),
            sinks: Vec::new(),
            instruments: Vec::new(),
            baselines: HashMap::new(),
        }
    }

    /// Window, thresholds, staleness and log size from a loaded config
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new()
            .window(config.window)
            .thresholds(config.thresholds)
            .stale_after(config.stale_after)
            .log_capacity(config.log_capacity)
    }

    pub fn window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    pub fn thresholds(mut self, thresholds: SpikeThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn expected_volume_model(mut self, model: Arc<dyn ExpectedVolumeModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Extra sink that receives every alert and notice after the operator log
    pub fn sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn instruments(mut self, instruments: impl IntoIterator<Item = Instrument>) -> Self {
        self.instruments.extend(instruments);
        self
    }

    pub fn baselines(mut self, baselines: HashMap<String, Baseline>) -> Self {
        self.baselines.extend(baselines);
        self
    }

    pub fn build(self) -> Result<Monitor, ConfigError> {
        self.thresholds.validate()?;
        if self.log_capacity == 0 {
            return Err(ConfigError::invalid("log_capacity", "must be greater than 0"));
        }
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| ConfigError::invalid("stale_after", e.to_string()))?;

        let log = Arc::new(AlertLog::new(self.log_capacity, self.clock.clone()));
        let sink = self
            .sinks
            .into_iter()
            .fold(FanoutSink::new().with(log.clone()), |fanout, s| fanout.with(s));
        let sink: Arc<dyn AlertSink> = Arc::new(sink);

        let detector = match self.model {
            Some(model) => SpikeDetector::with_model(self.thresholds, model),
            None => SpikeDetector::new(self.thresholds),
        };

        let store = Arc::new(SymbolStore::new(self.window));
        for instrument in self.instruments {
            store.register(&instrument.normalized());
        }

        let mut missing = 0usize;
        for (symbol, baseline) in self.baselines {
            if !store.set_baseline(&symbol.trim().to_uppercase(), baseline) {
                missing += 1;
            }
        }
        if missing > 0 {
            tracing::debug!("{} baselines had no registered symbol", missing);
        }

        let processor = TickProcessor::new(store.clone(), detector, sink.clone(), self.clock.clone());
        tracing::info!(
            symbols = store.len(),
            window = %store.window(),
            "Volume monitor ready"
        );

        Ok(Monitor {
            store,
            processor,
            sink,
            log,
            clock: self.clock,
            stale_after,
            health: Mutex::new(FeedHealth::default()),
        })
    }
}

impl Default for MonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Volume monitor
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Monitor {
    store: Arc<SymbolStore>,
    processor: TickProcessor,
    sink: Arc<dyn AlertSink>,
    log: Arc<AlertLog>,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
    health: Mutex<FeedHealth>,
}

impl Monitor {
    pub fn builder() -> MonitorBuilder {
        MonitorBuilder::new()
    }

    pub fn store(&self) -> &Arc<SymbolStore> {
        &self.store
    }

    fn health_mut(&self) -> MutexGuard<'_, FeedHealth> {
        lock(&self.health)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // INGEST
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Apply one tick. Unknown tokens are counted and returned.
    pub fn process_tick(&self, tick: &Tick) -> Result<TickOutcome, TickError> {
        self.processor.process(tick)
    }

    /// Start a new session if the date moved since the last check
    pub fn check_session(&self) -> bool {
        self.processor.check_session()
    }

    pub fn ingest_stats(&self) -> IngestSnapshot {
        self.processor.stats().snapshot()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // RULES
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Register a rule and evaluate it against the current live volume
    pub fn add_rule(&self, request: RuleRequest) -> Result<RuleId, RuleError> {
        self.check_session();

        let now = self.clock.now();
        let rule = AlertRule::from_request(&request, now)?;
        let entry = self
            .store
            .entry(&rule.symbol)
            .ok_or_else(|| RuleError::UnknownSymbol(rule.symbol.clone()))?;
        let toggles = self.store.toggles();
        let id = rule.id;

        let mut guard = lock(&entry);
        let SymbolEntry { state, rules, .. } = &mut *guard;
        rules.push(rule);
        let added = rules.len() - 1;

        self.sink.notice(&format!("ALERT CREATED: {}", rules[added]));
        for alert in RuleEngine::evaluate(&mut rules[added..], state, &toggles, now) {
            self.sink.emit(&alert);
        }
        Ok(id)
    }

    /// Remove a rule by id. Returns false if no symbol holds it.
    pub fn remove_rule(&self, id: RuleId) -> bool {
        for (_, entry) in self.store.entries() {
            let mut guard = lock(&entry);
            let SymbolEntry { state, rules, .. } = &mut *guard;
            let Some(position) = rules.iter().position(|r| r.id == id) else {
                continue;
            };

            let removed = rules.remove(position);
            if !RuleEngine::any_triggered(rules) {
                state.user_alert_active = false;
            }
            self.sink.notice(&format!("ALERT REMOVED: {}", removed));
            return true;
        }
        false
    }

    /// Every rule, grouped by symbol in symbol order, oldest first
    pub fn list_rules(&self) -> Vec<AlertRule> {
        self.store
            .entries()
            .into_iter()
            .flat_map(|(_, entry)| lock(&entry).rules.clone())
            .collect()
    }

    pub fn toggles(&self) -> RuleToggles {
        self.store.toggles()
    }

    /// Enable or suppress baseline-relative rules. Suppressed rules stay armed.
    pub fn set_toggles(&self, toggles: RuleToggles) {
        self.store.set_toggles(toggles);
        tracing::info!(?toggles, "Rule toggles updated");
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // WINDOW
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn window(&self) -> WindowConfig {
        self.store.window()
    }

    /// Move the detection window and rebuild every symbol's window volume
    pub fn set_window(&self, start: NaiveTime, end: NaiveTime) -> Result<WindowConfig, ConfigError> {
        let window = WindowConfig::new(start, end)?;
        self.check_session();
        let reset = self.store.replace_window(window, self.clock.now());
        tracing::debug!(symbols = reset, "Window state rebuilt");
        self.sink.notice(&format!("TIME WINDOW SET: {}", window));
        Ok(window)
    }

    /// [`Monitor::set_window`] from `"HH:MM"` strings
    pub fn set_window_str(&self, start: &str, end: &str) -> Result<WindowConfig, ConfigError> {
        self.set_window(parse_time_of_day(start)?, parse_time_of_day(end)?)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // UNIVERSE & BASELINES
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Route an instrument's token to its symbol, creating state on first sight
    pub fn register_instrument(&self, instrument: Instrument) -> bool {
        let instrument = instrument.normalized();
        let created = self.store.register(&instrument);
        if created {
            tracing::info!(%instrument, "Instrument registered");
        }
        created
    }

    /// Forget a symbol with its rules. Returns the tokens to unsubscribe.
    pub fn unregister_symbol(&self, symbol: &str) -> Option<Vec<String>> {
        let symbol = symbol.trim().to_uppercase();
        let tokens = self.store.unregister(&symbol)?;
        tracing::info!(symbol = %symbol, ?tokens, "Instrument unregistered");
        Some(tokens)
    }

    pub fn set_baseline(&self, symbol: &str, baseline: Baseline) -> bool {
        self.store.set_baseline(&symbol.trim().to_uppercase(), baseline)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // READ SIDE
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn snapshot(&self) -> Vec<SymbolSnapshot> {
        self.store.snapshot(self.clock.now(), self.stale_after)
    }

    /// Operator log, oldest first
    pub fn logs(&self) -> Vec<LogEntry> {
        self.log.entries()
    }

    pub fn health(&self) -> FeedHealth {
        self.health_mut().clone()
    }
}

impl FeedHandler for Monitor {
    fn on_tick(&self, tick: Tick) {
        if let Err(e) = self.processor.process(&tick) {
            ErrorReporter::report(&e.into(), "process_tick");
        }
    }

    fn on_state_change(&self, transition: &StateTransition) {
        let mut health = self.health_mut();
        health.state = transition.to.clone();
        match &transition.trigger {
            TransitionTrigger::UserConnect => health.fatal = false,
            TransitionTrigger::RetryAttempt(_) => health.reconnects += 1,
            _ => {}
        }
        tracing::debug!("{}", transition);
    }

    fn on_error(&self, error: &MonitorError) {
        if matches!(error, MonitorError::Parse(_)) {
            self.processor.stats().record_malformed();
        }
        self.health_mut().last_error = Some(error.to_string());
        ErrorReporter::report(error, "feed");
    }

    fn on_fatal(&self, error: &ConnectionError) {
        {
            let mut health = self.health_mut();
            health.fatal = true;
            health.last_error = Some(error.to_string());
        }
        tracing::error!("Feed stopped: {}", error);
        self.log.push(format!("FEED FATAL: {}", error));
    }
}
