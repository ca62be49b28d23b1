//! Per-symbol state store
//!
//! Lock order, never reversed:
//! session mutex → window lock → symbol map / routes → one symbol entry.
//! No path holds two symbol entries at once, and nothing awaits while a lock
//! is held.

use crate::baseline::Baseline;
use crate::data::Instrument;
use crate::rules::{AlertRule, RuleToggles};
use crate::spike::Intensity;
use crate::window::{SessionClock, WindowConfig};
use chrono::{Duration, NaiveDateTime, Timelike};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Live and windowed volume state for one instrument
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolState {
    pub symbol: String,
    pub token: String,
    /// Last cumulative volume seen this session; `None` before the first tick
    pub live_volume: Option<u64>,
    /// Volume accumulated while the window was open
    pub window_volume: u64,
    pub baseline: Option<Baseline>,
    pub z_score: Option<f64>,
    pub intensity: Intensity,
    pub auto_alert_fired: bool,
    pub user_alert_active: bool,
    pub last_update: Option<NaiveDateTime>,
}

impl SymbolState {
    pub fn new(symbol: &str, token: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            token: token.to_string(),
            live_volume: None,
            window_volume: 0,
            baseline: None,
            z_score: None,
            intensity: Intensity::Waiting,
            auto_alert_fired: false,
            user_alert_active: false,
            last_update: None,
        }
    }

    pub fn live(&self) -> u64 {
        self.live_volume.unwrap_or(0)
    }

    /// Clear everything scoped to the current window
    pub fn reset_window(&mut self) {
        self.window_volume = 0;
        self.z_score = None;
        self.intensity = Intensity::Waiting;
        self.auto_alert_fired = false;
    }
}

/// Minute-resolution cumulative volume, used to rebuild window volume after
/// the window moves
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeHistory {
    samples: BTreeMap<NaiveDateTime, u64>,
}

impl VolumeHistory {
    /// Record the latest cumulative value for the minute containing `at`
    pub fn record(&mut self, at: NaiveDateTime, cumulative: u64) {
        let minute = at
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(at);
        self.samples.insert(minute, cumulative);
    }

    /// Last sample at or before `at`
    pub fn volume_at(&self, at: NaiveDateTime) -> Option<u64> {
        self.samples.range(..=at).next_back().map(|(_, v)| *v)
    }

    /// Last sample strictly before `at`
    pub fn volume_before(&self, at: NaiveDateTime) -> Option<u64> {
        self.samples.range(..at).next_back().map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Where live volume sits relative to the historical references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeStatus {
    /// A user rule or the spike detector fired
    Alert,
    Above {
        prev_day: bool,
        weekly: bool,
        monthly: bool,
    },
    BelowAverages,
}

impl VolumeStatus {
    pub fn of(state: &SymbolState) -> Self {
        if state.user_alert_active || state.auto_alert_fired {
            return VolumeStatus::Alert;
        }

        let live = state.live() as f64;
        let reached = |reference: Option<f64>| reference.map_or(false, |r| r > 0.0 && live >= r);
        let baseline = state.baseline.as_ref();

        let prev_day = reached(baseline.and_then(|b| b.prev_day_volume));
        let weekly = reached(baseline.and_then(|b| b.weekly_avg_volume));
        let monthly = reached(baseline.and_then(|b| b.monthly_avg_volume));

        if prev_day || weekly || monthly {
            VolumeStatus::Above {
                prev_day,
                weekly,
                monthly,
            }
        } else {
            VolumeStatus::BelowAverages
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeStatus::Alert => f.write_str("ALERT"),
            VolumeStatus::BelowAverages => f.write_str("BELOW AVERAGES"),
            VolumeStatus::Above {
                prev_day,
                weekly,
                monthly,
            } => {
                let parts: Vec<&str> = [
                    (*prev_day, "ABOVE PREV DAY"),
                    (*weekly, "ABOVE WEEKLY AVG"),
                    (*monthly, "ABOVE MONTHLY AVG"),
                ]
                .iter()
                .filter(|(hit, _)| *hit)
                .map(|(_, label)| *label)
                .collect();
                f.write_str(&parts.join(" | "))
            }
        }
    }
}

/// Everything owned for one symbol, guarded by a single mutex
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub state: SymbolState,
    pub rules: Vec<AlertRule>,
    pub history: VolumeHistory,
    /// Status at the previous tick, for change notices
    pub last_status: Option<VolumeStatus>,
}

impl SymbolEntry {
    pub fn new(symbol: &str, token: &str) -> Self {
        Self {
            state: SymbolState::new(symbol, token),
            rules: Vec::new(),
            history: VolumeHistory::default(),
            last_status: None,
        }
    }

    /// New trading day: session fields go, baselines and rules stay
    pub fn reset_session(&mut self) {
        self.state.reset_window();
        self.state.live_volume = None;
        self.history.clear();
        self.last_status = None;
    }

    /// Recompute accumulated volume for a window that moved
    pub fn rebuild_window(&mut self, window: &WindowConfig, now: NaiveDateTime) {
        self.state.reset_window();
        if !window.has_started(now.time()) {
            return;
        }
        let start = now.date().and_time(window.start());
        let until = now.date().and_time(now.time().min(window.end()));

        if let (Some(before), Some(at)) = (
            self.history.volume_before(start),
            self.history.volume_at(until),
        ) {
            self.state.window_volume = at.saturating_sub(before);
        }
    }

    pub fn snapshot(&self, now: NaiveDateTime, window: &WindowConfig, stale_after: Duration) -> SymbolSnapshot {
        let state = &self.state;
        let stale = window.contains(now.time())
            && state
                .last_update
                .map_or(true, |last| now.signed_duration_since(last) > stale_after);

        SymbolSnapshot {
            symbol: state.symbol.clone(),
            token: state.token.clone(),
            live_volume: state.live(),
            window_volume: state.window_volume,
            z_score: state.z_score.map(|z| (z * 100.0).round() / 100.0),
            intensity: state.intensity,
            status: VolumeStatus::of(state).to_string(),
            stale,
            auto_alert_fired: state.auto_alert_fired,
            user_alert_active: state.user_alert_active,
            baseline: state.baseline.clone(),
            last_update: state.last_update,
            rule_count: self.rules.len(),
        }
    }
}

/// Read-only view of one symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub token: String,
    pub live_volume: u64,
    pub window_volume: u64,
    pub z_score: Option<f64>,
    pub intensity: Intensity,
    pub status: String,
    pub stale: bool,
    pub auto_alert_fired: bool,
    pub user_alert_active: bool,
    pub baseline: Option<Baseline>,
    pub last_update: Option<NaiveDateTime>,
    pub rule_count: usize,
}

/// Shared state for every monitored symbol plus the process-wide window,
/// toggles and session date
pub struct SymbolStore {
    symbols: RwLock<HashMap<String, Arc<Mutex<SymbolEntry>>>>,
    routes: RwLock<HashMap<String, String>>,
    window: RwLock<WindowConfig>,
    toggles: RwLock<RuleToggles>,
    session: Mutex<SessionClock>,
}

impl SymbolStore {
    pub fn new(window: WindowConfig) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            window: RwLock::new(window),
            toggles: RwLock::new(RuleToggles::default()),
            session: Mutex::new(SessionClock::default()),
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // REGISTRATION
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Add routing and state for an instrument. Returns true when the symbol
    /// is new; registering another token for a known symbol only adds a route.
    pub fn register(&self, instrument: &Instrument) -> bool {
        let created = {
            let mut symbols = write(&self.symbols);
            if symbols.contains_key(&instrument.symbol) {
                false
            } else {
                symbols.insert(
                    instrument.symbol.clone(),
                    Arc::new(Mutex::new(SymbolEntry::new(&instrument.symbol, &instrument.token))),
                );
                true
            }
        };
        write(&self.routes).insert(instrument.token.clone(), instrument.symbol.clone());
        created
    }

    /// Drop a symbol with its rules and routes. Returns the tokens that
    /// routed to it, or `None` for an unknown symbol.
    pub fn unregister(&self, symbol: &str) -> Option<Vec<String>> {
        write(&self.symbols).remove(symbol)?;
        let mut routes = write(&self.routes);
        let tokens: Vec<String> = routes
            .iter()
            .filter(|(_, s)| s.as_str() == symbol)
            .map(|(t, _)| t.clone())
            .collect();
        for token in &tokens {
            routes.remove(token);
        }
        Some(tokens)
    }

    pub fn resolve(&self, token: &str) -> Option<String> {
        read(&self.routes).get(token).cloned()
    }

    pub fn entry(&self, symbol: &str) -> Option<Arc<Mutex<SymbolEntry>>> {
        read(&self.symbols).get(symbol).cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        read(&self.symbols).contains_key(symbol)
    }

    /// All entries, ordered by symbol. The map lock is released on return.
    pub fn entries(&self) -> Vec<(String, Arc<Mutex<SymbolEntry>>)> {
        let mut entries: Vec<_> = read(&self.symbols)
            .iter()
            .map(|(s, e)| (s.clone(), Arc::clone(e)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn symbols(&self) -> Vec<String> {
        self.entries().into_iter().map(|(s, _)| s).collect()
    }

    pub fn len(&self) -> usize {
        read(&self.symbols).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.symbols).is_empty()
    }

    /// Replace a symbol's baseline wholesale
    pub fn set_baseline(&self, symbol: &str, baseline: Baseline) -> bool {
        match self.entry(symbol) {
            Some(entry) => {
                lock(&entry).state.baseline = Some(baseline);
                true
            }
            None => false,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // WINDOW, TOGGLES, SESSION
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn window(&self) -> WindowConfig {
        *read(&self.window)
    }

    /// Held by the tick path for the whole tick so a window change never
    /// interleaves with one
    pub(crate) fn window_guard(&self) -> RwLockReadGuard<'_, WindowConfig> {
        read(&self.window)
    }

    /// Install a new window and rebuild every symbol's window state.
    /// Returns the number of symbols reset.
    pub fn replace_window(&self, window: WindowConfig, now: NaiveDateTime) -> usize {
        let mut current = write(&self.window);
        *current = window;

        let entries = self.entries();
        for (_, entry) in &entries {
            lock(entry).rebuild_window(&window, now);
        }
        entries.len()
    }

    pub fn toggles(&self) -> RuleToggles {
        *read(&self.toggles)
    }

    pub fn set_toggles(&self, toggles: RuleToggles) {
        *write(&self.toggles) = toggles;
    }

    /// Observe `now`'s date and, on a new trading day, reset every symbol's
    /// session fields. Returns true on rollover.
    pub fn roll_session(&self, now: NaiveDateTime) -> bool {
        let mut session = lock(&self.session);
        if !session.observe(now.date()) {
            return false;
        }
        // Keep the session lock until every symbol is reset so concurrent
        // ticks wait for a clean day.
        for (_, entry) in self.entries() {
            lock(&entry).reset_session();
        }
        true
    }

    pub fn session_date(&self) -> Option<chrono::NaiveDate> {
        lock(&self.session).current()
    }

    /// Per-symbol snapshots ordered by symbol; each symbol is locked briefly
    pub fn snapshot(&self, now: NaiveDateTime, stale_after: Duration) -> Vec<SymbolSnapshot> {
        let window = self.window();
        self.entries()
            .into_iter()
            .map(|(_, entry)| lock(&entry).snapshot(now, &window, stale_after))
            .collect()
    }
}

impl Default for SymbolStore {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}
