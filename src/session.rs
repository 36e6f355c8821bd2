//! Session state machine.
//!
//! ```text
//! Disconnected ──connect──► Handshaking ──clientId──► Connected
//!      ▲                        │   ▲                     │
//!      │                 failed │   └── re-handshake ─────┤
//!      ├────────────────────────┘                         │ socket lost
//!      │                                                  ▼
//!      ├──────────── exhausted ─────────────────── Reconnecting
//!      │
//!      └──────────── Closing ◄── close() (from any live state)
//! ```
//!
//! The connection state and the server-issued client id live together under
//! one lock and change only through the transition methods below. Every
//! transition is also published on a `watch` channel so callers can await
//! readiness without polling.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::{RealtimeError, Result};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Reconnecting,
    Closing,
}

impl ConnectionState {
    /// True while a worker owns a transport or is trying to get one.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Handshaking | Self::Connected | Self::Reconnecting)
    }
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    client_id: Option<String>,
}

/// Shared session state, guarded by one mutex.
#[derive(Debug)]
pub struct Session {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Session {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                client_id: None,
            }),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            tracing::debug!("Session state {:?} -> {:?}", inner.state, state);
        }
        inner.state = state;
        if state != ConnectionState::Connected {
            inner.client_id = None;
        }
        self.state_tx.send_replace(state);
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn client_id(&self) -> Option<String> {
        self.lock().client_id.clone()
    }

    /// Client id, or `NotConnected` when no session exists.
    pub fn require_client_id(&self) -> Result<String> {
        self.lock().client_id.clone().ok_or(RealtimeError::NotConnected)
    }

    /// Receiver that observes every transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Start a handshake. Allowed from every state except `Closing`.
    pub fn begin_handshake(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closing {
            return Err(RealtimeError::ConnectionClosed);
        }
        self.set(&mut inner, ConnectionState::Handshaking);
        Ok(())
    }

    /// Store the client id issued by the server.
    pub fn handshake_succeeded(&self, client_id: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Handshaking {
            return Err(RealtimeError::HandshakeFailed(format!(
                "unexpected handshake reply in state {:?}",
                inner.state
            )));
        }
        self.set(&mut inner, ConnectionState::Connected);
        inner.client_id = Some(client_id.to_string());
        Ok(())
    }

    /// Transport lost, the worker will retry. Ignored while closing.
    pub fn begin_reconnect(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closing {
            return false;
        }
        self.set(&mut inner, ConnectionState::Reconnecting);
        true
    }

    /// Enter `Closing`. Returns the client id to send a disconnect for, if the
    /// session was connected, and whether a session was live at all.
    pub fn begin_close(&self) -> (bool, Option<String>) {
        let mut inner = self.lock();
        let was_active = inner.state.is_active();
        let client_id = inner.client_id.take();
        if was_active {
            self.set(&mut inner, ConnectionState::Closing);
        }
        (was_active, client_id)
    }

    /// Terminal transition.
    pub fn disconnected(&self) {
        let mut inner = self.lock();
        self.set(&mut inner, ConnectionState::Disconnected);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
