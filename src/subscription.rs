//! Subscription queue for feed instruments

use crate::data::Instrument;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_tungstenite::tungstenite::Message;

/// Market-data feed type requested in every token request
pub const FEED_TYPE_MARKET_DATA: u8 = 1;

/// Instruments the feed should stream, keyed by token
///
/// The queue survives reconnects and is sent wholesale after every login.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    queued: Arc<Mutex<BTreeMap<String, Instrument>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Instrument>> {
        self.queued.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an instrument. Returns false if the token was already queued
    /// with the same details.
    pub fn add(&self, instrument: Instrument) -> bool {
        let mut queued = self.lock();
        match queued.get(&instrument.token) {
            Some(existing) if *existing == instrument => false,
            _ => {
                tracing::debug!("Queued subscription {}", instrument);
                queued.insert(instrument.token.clone(), instrument);
                true
            }
        }
    }

    pub fn remove(&self, token: &str) -> Option<Instrument> {
        self.lock().remove(token)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.lock().contains_key(token)
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Token request covering the whole queue, `None` when nothing is queued
    pub fn subscribe_all_message(&self) -> Option<Message> {
        let instruments = self.instruments();
        if instruments.is_empty() {
            return None;
        }
        tracing::info!("Subscribing {} instruments", instruments.len());
        Some(token_request(&instruments, true))
    }
}

/// Build a `TokenRequest` frame
pub fn token_request(instruments: &[Instrument], subscribe: bool) -> Message {
    let quotes: Vec<Value> = instruments
        .iter()
        .map(|i| {
            json!({
                "Xchg": i.exchange,
                "Tkn": i.token,
                "Symbol": i.symbol,
            })
        })
        .collect();

    let message = json!({
        "Type": "TokenRequest",
        "Data": {
            "SubType": subscribe,
            "FeedType": FEED_TYPE_MARKET_DATA,
            "quotes": quotes,
        }
    });
    Message::Text(message.to_string())
}
