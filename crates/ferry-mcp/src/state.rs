//! Connection lifecycle.

use std::fmt;
use tokio::sync::watch;

/// Lifecycle of one server connection.
///
/// `Disconnected → Starting → Handshaking → Ready → Closed`, with `Closed`
/// reachable from every state and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Starting,
    Handshaking,
    Ready,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Starting)
                | (Starting, Handshaking)
                | (Handshaking, Ready)
                | (Disconnected | Starting | Handshaking | Ready, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Starting => "starting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable connection state that only accepts legal transitions.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Move to `next`. Returns `false` (and changes nothing) for an illegal transition.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::debug!("Connection state {current} -> {next}");
                *current = next;
                changed = true;
            }
            changed
        });
        changed
    }

    /// A receiver that observes every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
