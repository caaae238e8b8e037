//! Connection State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!      ▲               │              │
//!      └───────────────┴──────────────┘
//!   any non-terminal state ──► Stopped (terminal)
//! ```
//!
//! Every mutation is checked against the transition table. The state is
//! published through a `watch` channel so other tasks can read it or wait
//! for it without touching the transport.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle state of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport; a reconnect may be pending.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open; frames may be sent.
    Connected,
    /// Stopped for good.
    Stopped,
}

impl ConnectionState {
    /// Check whether moving from `self` to `next` is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting | Self::Stopped)
                | (
                    Self::Connecting,
                    Self::Connected | Self::Disconnected | Self::Stopped
                )
                | (Self::Connected, Self::Disconnected | Self::Stopped)
        )
    }

    /// Check whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal connection state transition {from} -> {to}")]
pub struct IllegalTransition {
    /// State before the attempted change.
    pub from: ConnectionState,
    /// Requested state.
    pub to: ConnectionState,
}

/// Shared, observable connection state.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    /// Create a status starting in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Move to `next` if the transition table allows it.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalTransition`] and leaves the state untouched when the
    /// move is not allowed.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, IllegalTransition> {
        let mut outcome = Err(IllegalTransition {
            from: next,
            to: next,
        });
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                outcome = Ok(*state);
                *state = next;
                true
            } else {
                outcome = Err(IllegalTransition {
                    from: *state,
                    to: next,
                });
                false
            }
        });
        outcome
    }

    /// Move to `Stopped`. Returns `true` if this call stopped it.
    pub fn stop(&self) -> bool {
        self.transition(ConnectionState::Stopped).is_ok()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until the state is `Connected` or `Stopped`.
    ///
    /// Returns `true` for `Connected`.
    pub async fn wait_connected(&self) -> bool {
        let mut rx = self.tx.subscribe();
        let connected = rx
            .wait_for(|state| matches!(state, ConnectionState::Connected | ConnectionState::Stopped))
            .await
            .is_ok_and(|state| *state == ConnectionState::Connected);
        connected
    }
}
