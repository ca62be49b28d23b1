//! Persistent feed client: handshake, keep-alive, and reconnection

use crate::{
    connection::{ConnectionManager, ReconnectStrategy, WsStream},
    data::{FeedConfig, HeartbeatConfig, Instrument},
    error::{ConfigError, ConnectionError, MonitorError},
    events::{shielded, FeedHandler},
    parser::{FeedMessage, FeedParser, MessageParser},
    state::{ConnectionState, DisconnectReason, StateError, StateMachine, StateTransition},
    subscription::{token_request, SubscriptionManager},
};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

/// How a session ended
enum SessionEnd {
    Shutdown,
    Lost(ConnectionError),
}

/// What the session loop must do after a text frame
#[derive(Debug, PartialEq)]
pub(crate) enum FrameAction {
    Continue,
    LoggedIn,
    AuthRejected(String),
}

/// Feed client for the upstream market-data socket
///
/// One task drives [`FeedClient::connect`]; `subscribe`/`unsubscribe` may be
/// called from anywhere while it runs.
pub struct FeedClient {
    connection: ConnectionManager,
    reconnect: ReconnectStrategy,
    heartbeat: HeartbeatConfig,
    login_timeout: Duration,
    subscriptions: SubscriptionManager,
    parser: FeedParser,
    state: Mutex<StateMachine>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    malformed: AtomicU64,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            reconnect: ReconnectStrategy::new(config.reconnect.clone()),
            state: Mutex::new(StateMachine::new(config.reconnect.max_attempts)),
            heartbeat: config.heartbeat.clone(),
            login_timeout: config.timeout,
            connection: ConnectionManager::new(config),
            subscriptions: SubscriptionManager::new(),
            parser: FeedParser::new(),
            outbound: Mutex::new(None),
            malformed: AtomicU64::new(0),
        })
    }

    fn machine(&self) -> MutexGuard<'_, StateMachine> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.machine().state().clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.machine().is_subscribed()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Queue an instrument; sent immediately when a session is live and
    /// again after every login
    pub fn subscribe(&self, instrument: Instrument) {
        if self.subscriptions.add(instrument.clone()) && self.is_subscribed() {
            self.send(token_request(&[instrument], true));
        }
    }

    /// Drop a queued instrument, unsubscribing upstream when live
    pub fn unsubscribe(&self, token: &str) -> Option<Instrument> {
        let removed = self.subscriptions.remove(token)?;
        if self.is_subscribed() {
            self.send(token_request(std::slice::from_ref(&removed), false));
        }
        Some(removed)
    }

    fn send(&self, message: Message) {
        if let Some(tx) = self.sender().as_ref() {
            if tx.send(message).is_err() {
                tracing::debug!("Session writer closed; frame dropped");
            }
        }
    }

    /// Apply a transition and report it to the handler outside the lock
    fn apply<F>(&self, handler: &Arc<dyn FeedHandler>, f: F) -> Option<StateTransition>
    where
        F: FnOnce(&mut StateMachine) -> Result<StateTransition, StateError>,
    {
        let result = {
            let mut sm = self.machine();
            f(&mut *sm)
        };
        match result {
            Ok(transition) => {
                shielded("on_state_change", || handler.on_state_change(&transition));
                Some(transition)
            }
            Err(e) => {
                tracing::debug!("Ignored transition: {}", e);
                None
            }
        }
    }

    fn report(&self, handler: &Arc<dyn FeedHandler>, error: MonitorError) {
        shielded("on_error", || handler.on_error(&error));
    }

    /// Run the feed until shutdown or until reconnection gives up
    ///
    /// Returns `Ok(())` on shutdown and `RetriesExhausted` once the retry
    /// budget is spent. Dropping the shutdown sender also stops the feed.
    pub async fn connect(
        &self,
        handler: Arc<dyn FeedHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        if self.apply(&handler, |sm| sm.connect()).is_none() {
            return Err(ConnectionError::EstablishmentFailed(format!(
                "feed already running ({})",
                self.state()
            )));
        }

        loop {
            let attempt = tokio::select! {
                result = self.connection.connect() => result,
                _ = shutdown_requested(&mut shutdown) => return Ok(self.stop(&handler)),
            };

            match attempt {
                Ok(ws) => {
                    self.apply(&handler, |sm| sm.connection_established());
                    match self.run_session(ws, &handler, &mut shutdown).await {
                        SessionEnd::Shutdown => return Ok(self.stop(&handler)),
                        SessionEnd::Lost(e) => {
                            tracing::warn!("Feed session ended: {}", e);
                            self.report(&handler, e.into());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Feed connection attempt failed: {}", e);
                    let reason = e.to_string();
                    self.apply(&handler, |sm| sm.connection_failed(reason));
                    self.report(&handler, e.into());
                }
            }

            self.apply(&handler, |sm| sm.retry());
            let (state, retry) = {
                let sm = self.machine();
                (sm.state().clone(), sm.retry_count())
            };

            if let ConnectionState::Failed { attempts } = state {
                let error = ConnectionError::RetriesExhausted { attempts };
                tracing::error!("{}", error);
                shielded("on_fatal", || handler.on_fatal(&error));
                return Err(error);
            }

            let delay = self.reconnect.delay_for(retry);
            tracing::info!(
                "Reconnecting in {:?} (attempt {} of {})",
                delay,
                retry,
                self.reconnect.max_attempts()
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => return Ok(self.stop(&handler)),
            }
        }
    }

    fn stop(&self, handler: &Arc<dyn FeedHandler>) {
        *self.sender() = None;
        self.apply(handler, |sm| sm.close());
        tracing::info!("Feed stopped");
    }

    /// Drive one connected session: login, subscribe, heartbeat, read
    async fn run_session(
        &self,
        ws: WsStream,
        handler: &Arc<dyn FeedHandler>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        if let Err(e) = sink.send(self.connection.login_message()).await {
            return self.lose(handler, format!("login send failed: {}", e));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.sender() = Some(tx);

        let period = self.heartbeat.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let login_deadline = sleep(self.login_timeout);
        tokio::pin!(login_deadline);
        let mut last_inbound = Instant::now();

        let end = loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }

                Some(message) = rx.recv() => {
                    if let Err(e) = sink.send(message).await {
                        break self.lose(handler, format!("send failed: {}", e));
                    }
                }

                _ = &mut login_deadline, if !self.is_subscribed() => {
                    let reason = format!("login not acknowledged within {:?}", self.login_timeout);
                    self.apply(handler, |sm| sm.auth_failed(reason.clone()));
                    break SessionEnd::Lost(ConnectionError::Timeout(reason));
                }

                _ = ticker.tick(), if self.is_subscribed() => {
                    let idle = last_inbound.elapsed();
                    if idle >= self.heartbeat.dead_after() {
                        self.apply(handler, |sm| sm.disconnected(DisconnectReason::HeartbeatTimeout));
                        break SessionEnd::Lost(ConnectionError::HeartbeatTimeout(idle));
                    }
                    if idle >= period {
                        tracing::debug!("Idle for {:?}, sending heartbeat", idle);
                        if let Err(e) = sink.send(ConnectionManager::heartbeat_message()).await {
                            break self.lose(handler, format!("heartbeat send failed: {}", e));
                        }
                    }
                }

                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => break self.lose(handler, format!("read failed: {}", e)),
                        None => break self.lose(handler, "stream ended".to_string()),
                    };
                    last_inbound = Instant::now();

                    match message {
                        Message::Text(text) => match self.on_text(&text, handler) {
                            FrameAction::Continue => {}
                            FrameAction::LoggedIn => {
                                if let Some(request) = self.subscriptions.subscribe_all_message() {
                                    if let Err(e) = sink.send(request).await {
                                        break self.lose(handler, format!("subscribe send failed: {}", e));
                                    }
                                }
                            }
                            FrameAction::AuthRejected(reason) => {
                                self.apply(handler, |sm| sm.auth_failed(reason.clone()));
                                break SessionEnd::Lost(ConnectionError::AuthenticationFailed(reason));
                            }
                        },
                        Message::Close(frame) => {
                            let reason = frame
                                .map(|f| format!("closed by server: {}", f.reason))
                                .unwrap_or_else(|| "closed by server".to_string());
                            break self.lose(handler, reason);
                        }
                        Message::Binary(data) => tracing::debug!("Ignoring {} byte binary frame", data.len()),
                        _ => {}
                    }
                }
            }
        };

        *self.sender() = None;
        end
    }

    fn lose(&self, handler: &Arc<dyn FeedHandler>, reason: String) -> SessionEnd {
        let cause = reason.clone();
        self.apply(handler, |sm| sm.disconnected(DisconnectReason::Server(cause)));
        SessionEnd::Lost(ConnectionError::ConnectionLost(reason))
    }

    /// Decode and route one text frame
    pub(crate) fn on_text(&self, text: &str, handler: &Arc<dyn FeedHandler>) -> FrameAction {
        match self.parser.parse(text) {
            Ok(FeedMessage::MarketData(tick)) => {
                shielded("on_tick", || handler.on_tick(tick));
                FrameAction::Continue
            }
            Ok(FeedMessage::Login(ack)) => match ack.error {
                None => {
                    if self.apply(handler, |sm| sm.login_confirmed()).is_some() {
                        tracing::info!("Login acknowledged");
                        FrameAction::LoggedIn
                    } else {
                        FrameAction::Continue
                    }
                }
                Some(reason) => {
                    tracing::error!("Login rejected: {}", reason);
                    FrameAction::AuthRejected(reason)
                }
            },
            Ok(FeedMessage::FeedStatus(status)) => {
                tracing::debug!("Feed status: {}", status);
                FrameAction::Continue
            }
            Ok(FeedMessage::Other(kind)) => {
                tracing::trace!("Ignoring {} frame", kind);
                FrameAction::Continue
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping malformed frame: {}", e);
                self.report(handler, e.into());
                FrameAction::Continue
            }
        }
    }
}

/// Resolves once shutdown is signalled or the sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
