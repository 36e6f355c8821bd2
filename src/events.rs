//! Connection lifecycle events.
//!
//! The worker runs independently of the caller, so failures inside the read
//! loop cannot be returned from any call. They are published as
//! [`ClientEvent`]s on a broadcast channel instead; see
//! [`Client::events`](crate::Client::events).

use std::fmt;

use tokio::sync::broadcast;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called.
    Closed,
    /// Socket failed and reconnection was disabled or exhausted.
    TransportLost(String),
    /// Server answered with `reconnect: none` advice.
    ServerAdvice(String),
    /// Server rejected a handshake.
    HandshakeRejected(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed by client"),
            Self::TransportLost(msg) => write!(f, "transport lost: {}", msg),
            Self::ServerAdvice(msg) => write!(f, "server advised not to reconnect: {}", msg),
            Self::HandshakeRejected(msg) => write!(f, "handshake rejected: {}", msg),
        }
    }
}

/// Event published by the connection worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Handshake accepted.
    Connected { client_id: String },
    /// Transport lost, about to retry.
    Reconnecting { attempt: u32, reason: String },
    /// Session ended; all subscriber channels have been released.
    Disconnected(DisconnectReason),
    /// Server refused a subscription.
    SubscribeFailed { subscription: String, error: String },
    /// Non-fatal error in the read loop (for example a malformed payload).
    Error(String),
}

/// Publishing side of the event channel.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventSender {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no listeners is fine.
    pub(crate) fn emit(&self, event: ClientEvent) {
        tracing::trace!("Client event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}
