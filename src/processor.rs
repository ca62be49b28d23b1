//! Tick ingestion: cumulative volume in, window state and alerts out

use crate::alerts::{AlertEvent, AlertSink};
use crate::clock::Clock;
use crate::data::Tick;
use crate::error::TickError;
use crate::rules::RuleEngine;
use crate::spike::SpikeDetector;
use crate::store::{lock, SymbolEntry, SymbolStore, VolumeStatus};
use crate::window::market_open;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ingest counters
#[derive(Debug, Default)]
pub struct IngestStats {
    ticks_applied: AtomicU64,
    unknown_tokens: AtomicU64,
    discontinuities: AtomicU64,
    alerts_emitted: AtomicU64,
    malformed_frames: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub ticks_applied: u64,
    pub unknown_tokens: u64,
    pub discontinuities: u64,
    pub alerts_emitted: u64,
    pub malformed_frames: u64,
}

impl IngestStats {
    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            ticks_applied: self.ticks_applied.load(Ordering::Relaxed),
            unknown_tokens: self.unknown_tokens.load(Ordering::Relaxed),
            discontinuities: self.discontinuities.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
        }
    }
}

/// Result of applying one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub symbol: String,
    /// Volume added since the previous tick for this symbol
    pub delta: u64,
    pub window_volume: u64,
    pub alerts: Vec<AlertEvent>,
}

/// Applies ticks to the store and runs detection under the symbol's lock
pub struct TickProcessor {
    store: Arc<SymbolStore>,
    detector: SpikeDetector,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    stats: Arc<IngestStats>,
}

impl TickProcessor {
    pub fn new(
        store: Arc<SymbolStore>,
        detector: SpikeDetector,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            detector,
            sink,
            clock,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn store(&self) -> &Arc<SymbolStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    pub fn detector(&self) -> &SpikeDetector {
        &self.detector
    }

    /// Start a new session if the date moved. Returns true on rollover.
    pub fn check_session(&self) -> bool {
        let now = self.clock.now();
        let rolled = self.store.roll_session(now);
        if rolled {
            self.sink.notice(&format!("NEW SESSION: {}", now.date()));
        }
        rolled
    }

    /// Apply a tick. Unknown tokens are counted and returned as errors; they
    /// never disturb other symbols.
    pub fn process(&self, tick: &Tick) -> Result<TickOutcome, TickError> {
        self.check_session();

        let now = self.clock.now();
        let window_guard = self.store.window_guard();
        let window = *window_guard;
        let toggles = self.store.toggles();

        let Some((symbol, entry)) = self
            .store
            .resolve(&tick.token)
            .and_then(|symbol| self.store.entry(&symbol).map(|entry| (symbol, entry)))
        else {
            self.stats.unknown_tokens.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Dropping tick for unknown token {}", tick.token);
            return Err(TickError::UnknownToken(tick.token.clone()));
        };

        let mut guard = lock(&entry);
        let SymbolEntry {
            state,
            rules,
            history,
            last_status,
        } = &mut *guard;

        let cumulative = tick.cumulative_volume;
        let delta = match state.live_volume {
            None => 0,
            Some(previous) if cumulative < previous => {
                self.stats.discontinuities.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    symbol = %symbol,
                    previous,
                    cumulative,
                    "Cumulative volume went backwards; treating as reset"
                );
                0
            }
            Some(previous) => cumulative - previous,
        };

        state.live_volume = Some(cumulative);
        state.last_update = Some(now);
        if window.contains(now.time()) {
            state.window_volume = state.window_volume.saturating_add(delta);
        }
        if now.time() >= market_open() {
            history.record(now, cumulative);
        }

        let mut alerts: Vec<AlertEvent> = self.detector.evaluate(state, &window, now).into_iter().collect();
        alerts.extend(RuleEngine::evaluate(rules, state, &toggles, now));
        for alert in &alerts {
            self.sink.emit(alert);
        }

        let status = VolumeStatus::of(state);
        if let Some(previous) = *last_status {
            if previous != status {
                self.sink
                    .notice(&format!("[{}]: {} → {}", symbol, previous, status));
            }
        }
        *last_status = Some(status);

        self.stats.ticks_applied.fetch_add(1, Ordering::Relaxed);
        self.stats
            .alerts_emitted
            .fetch_add(alerts.len() as u64, Ordering::Relaxed);

        Ok(TickOutcome {
            symbol,
            delta,
            window_volume: state.window_volume,
            alerts,
        })
    }
}
