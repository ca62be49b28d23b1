//! Feed connection state machine
//!
//! Every transition has a single cause and is recorded in a bounded history so
//! the client can report it to its handler.
//!
//! ## State Diagram
//!
//! ```text
//! DISCONNECTED ──connect()──▶ CONNECTING ──open──▶ AUTHENTICATING ──login ack──▶ SUBSCRIBED
//!      ▲  │                       │                      │                          │
//!      │  └──retry()──────────────┘◀─────────────────────┴──── failure / lost ──────┘
//!      │
//!      ├──retry() past max_retries──▶ FAILED
//!      └──close() from anywhere─────▶ STOPPED
//! ```

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

const MAX_HISTORY: usize = 100;

/// Feed connection states
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected. Entered initially and after every transport fault.
    ///
    /// Transitions:
    /// - `connect()` / `retry()` → CONNECTING
    /// - `retry()` past the limit → FAILED
    #[default]
    Disconnected,

    /// Opening the websocket
    ///
    /// Transitions:
    /// - open → AUTHENTICATING
    /// - failure or timeout → DISCONNECTED
    Connecting,

    /// Login sent, waiting for the ack
    ///
    /// Transitions:
    /// - ack → SUBSCRIBED
    /// - rejected, closed or timed out → DISCONNECTED
    Authenticating,

    /// Subscriptions sent, receiving market data
    ///
    /// Transitions:
    /// - closed or silent too long → DISCONNECTED
    Subscribed,

    /// Reconnection attempts exhausted. Terminal until `connect()`.
    Failed { attempts: u32 },

    /// Shut down by the operator. Terminal until `connect()`.
    Stopped,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed { .. } | ConnectionState::Stopped)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Authenticating => write!(f, "AUTHENTICATING"),
            ConnectionState::Subscribed => write!(f, "SUBSCRIBED"),
            ConnectionState::Failed { attempts } => write!(f, "FAILED(after {} retries)", attempts),
            ConnectionState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// What triggered a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionTrigger {
    UserConnect,
    UserClose,
    ConnectionEstablished,
    ConnectionFailed(String),
    LoginConfirmed,
    AuthFailed(String),
    ServerDisconnect(String),
    HeartbeatTimeout,
    RetryAttempt(u32),
    MaxRetriesExceeded,
}

/// State transition event
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub trigger: TransitionTrigger,
    pub timestamp: Instant,
}

impl StateTransition {
    pub fn new(from: ConnectionState, to: ConnectionState, trigger: TransitionTrigger) -> Self {
        Self {
            from,
            to,
            trigger,
            timestamp: Instant::now(),
        }
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({:?})", self.from, self.to, self.trigger)
    }
}

/// Why a live connection dropped back to DISCONNECTED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Server(String),
    HeartbeatTimeout,
}

/// State machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid transition: cannot {action} from state {from}")]
    InvalidTransition {
        from: ConnectionState,
        action: &'static str,
    },

    #[error("Feed already stopped")]
    AlreadyStopped,
}

/// Connection state machine
pub struct StateMachine {
    state: ConnectionState,
    max_retries: u32,
    history: VecDeque<StateTransition>,
    /// Consecutive retries since the last successful login
    retry_count: u32,
}

impl StateMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            max_retries,
            history: VecDeque::with_capacity(MAX_HISTORY),
            retry_count: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == ConnectionState::Subscribed
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn transition(&mut self, to: ConnectionState, trigger: TransitionTrigger) -> StateTransition {
        let from = std::mem::replace(&mut self.state, to.clone());
        let transition = StateTransition::new(from, to, trigger);

        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        tracing::info!("Feed state: {}", transition);
        transition
    }

    fn invalid(&self, action: &'static str) -> StateError {
        StateError::InvalidTransition {
            from: self.state.clone(),
            action,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // STATE TRANSITION METHODS
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Start a fresh run. Allowed from DISCONNECTED and the terminal states.
    pub fn connect(&mut self) -> Result<StateTransition, StateError> {
        match self.state {
            ConnectionState::Disconnected
            | ConnectionState::Failed { .. }
            | ConnectionState::Stopped => {
                self.retry_count = 0;
                Ok(self.transition(ConnectionState::Connecting, TransitionTrigger::UserConnect))
            }
            _ => Err(self.invalid("connect")),
        }
    }

    /// Operator shutdown
    pub fn close(&mut self) -> Result<StateTransition, StateError> {
        match self.state {
            ConnectionState::Stopped => Err(StateError::AlreadyStopped),
            _ => Ok(self.transition(ConnectionState::Stopped, TransitionTrigger::UserClose)),
        }
    }

    pub fn connection_established(&mut self) -> Result<StateTransition, StateError> {
        match self.state {
            ConnectionState::Connecting => Ok(self.transition(
                ConnectionState::Authenticating,
                TransitionTrigger::ConnectionEstablished,
            )),
            _ => Err(self.invalid("connection_established")),
        }
    }

    pub fn connection_failed(&mut self, error: String) -> Result<StateTransition, StateError> {
        match self.state {
            ConnectionState::Connecting => Ok(self.transition(
                ConnectionState::Disconnected,
                TransitionTrigger::ConnectionFailed(error),
            )),
            _ => Err(self.invalid("connection_failed")),
        }
    }

    /// Login acknowledged; resets the retry budget
    pub fn login_confirmed(&mut self) -> Result<StateTransition, StateError> {
        match self.state {
            ConnectionState::Authenticating => {
                self.retry_count = 0;
                Ok(self.transition(ConnectionState::Subscribed, TransitionTrigger::LoginConfirmed))
            }
            _ => Err(self.invalid("login_confirmed")),
        }
    }

    pub fn auth_failed(&mut self, error: String) -> Result<StateTransition, StateError> {
        match self.state {
            ConnectionState::Authenticating => Ok(self.transition(
                ConnectionState::Disconnected,
                TransitionTrigger::AuthFailed(error),
            )),
            _ => Err(self.invalid("auth_failed")),
        }
    }

    /// A live connection was lost
    pub fn disconnected(&mut self, reason: DisconnectReason) -> Result<StateTransition, StateError> {
        match self.state {
            ConnectionState::Authenticating | ConnectionState::Subscribed => {
                let trigger = match reason {
                    DisconnectReason::Server(msg) => TransitionTrigger::ServerDisconnect(msg),
                    DisconnectReason::HeartbeatTimeout => TransitionTrigger::HeartbeatTimeout,
                };
                Ok(self.transition(ConnectionState::Disconnected, trigger))
            }
            _ => Err(self.invalid("disconnected")),
        }
    }

    /// Schedule the next attempt, or give up once the budget is spent
    pub fn retry(&mut self) -> Result<StateTransition, StateError> {
        match self.state {
            ConnectionState::Disconnected => {
                self.retry_count += 1;
                if self.retry_count > self.max_retries {
                    Ok(self.transition(
                        ConnectionState::Failed {
                            attempts: self.max_retries,
                        },
                        TransitionTrigger::MaxRetriesExceeded,
                    ))
                } else {
                    Ok(self.transition(
                        ConnectionState::Connecting,
                        TransitionTrigger::RetryAttempt(self.retry_count),
                    ))
                }
            }
            _ => Err(self.invalid("retry")),
        }
    }
}
