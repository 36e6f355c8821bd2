//! Client builder and public facade.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the client.
//! The [`Client`] manages the session lifecycle:
//! 1. Dial the realtime endpoint derived from configuration
//! 2. Spawn the writer task and the connection worker
//! 3. Handshake, then keep the session alive with `/meta/connect`
//! 4. Route data messages to subscriber channels until `close()`
//!
//! # Example
//!
//! ```ignore
//! use c8y_realtime::{Client, ClientConfig, Credentials};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(
//!         "https://tenant.example.com",
//!         Credentials::new("t123", "alice", "secret"),
//!     );
//!     let client = Client::builder(config).build()?;
//!
//!     client.connect().await?;
//!     let mut alarms = client.subscribe_channel("/alarms/*", 64).await?;
//!
//!     while let Some(message) = alarms.recv().await {
//!         println!("{}: {:?}", message.channel, message.data);
//!     }
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{RealtimeError, Result};
use crate::events::ClientEvent;
use crate::protocol::{Message, OutboundFrame};
use crate::session::ConnectionState;
use crate::subscription::{SubscriptionId, SubscriptionInfo};
use crate::transport::{Dialer, WebSocketDialer};
use crate::worker::{Shared, Worker, WorkerHandle};

/// Default time `close()` waits for the `/meta/disconnect` reply before
/// cancelling the worker.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Builder for configuring and creating a realtime client.
pub struct ClientBuilder {
    config: ClientConfig,
    dialer: Option<Arc<dyn Dialer>>,
    disconnect_timeout: Duration,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            dialer: None,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }

    /// Set the reconnection policy.
    ///
    /// Default: 5 attempts, backoff from 500ms doubling up to 10s.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Set how long `connect()` waits for the handshake reply.
    ///
    /// Default: 30 seconds
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set how long `close()` waits for the disconnect reply.
    ///
    /// Default: 2 seconds
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the outbound frame queue capacity.
    ///
    /// Default: 256
    pub fn writer_capacity(mut self, capacity: usize) -> Self {
        self.config.writer_capacity = capacity;
        self
    }

    /// Set the lifecycle event channel capacity.
    ///
    /// Default: 64
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Use a custom dialer instead of dialing the configured endpoint.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Build the client. Validates the endpoint but does not connect.
    pub fn build(self) -> Result<Client> {
        let dialer = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(WebSocketDialer::new(self.config.endpoint()?)),
        };

        let shared = Arc::new(Shared::new(
            self.config.credentials.token(),
            self.config.event_capacity,
        ));

        Ok(Client {
            shared,
            dialer,
            config: self.config,
            disconnect_timeout: self.disconnect_timeout,
            worker: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        })
    }
}

/// A realtime notification client.
///
/// All methods take `&self`; share the client behind an `Arc` to use it from
/// several tasks.
pub struct Client {
    shared: Arc<Shared>,
    dialer: Arc<dyn Dialer>,
    config: ClientConfig,
    disconnect_timeout: Duration,
    /// Worker of the current session.
    worker: Mutex<Option<WorkerHandle>>,
    /// Serializes session setup and teardown. Not held while `connect()`
    /// waits for the handshake reply.
    connecting: tokio::sync::Mutex<()>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Build a client with default settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        ClientBuilder::new(config).build()
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the transport and perform the handshake.
    ///
    /// Returns once the server has answered the handshake. Subscriptions
    /// registered before this call are sent right after the handshake.
    /// Calling it on a live or connecting session is a no-op. A concurrent
    /// `close()` aborts the handshake.
    ///
    /// # Errors
    ///
    /// - [`RealtimeError::HandshakeFailed`] if the server refuses the
    ///   handshake or issues no client id
    /// - [`RealtimeError::Timeout`] if no reply arrives in time
    /// - [`RealtimeError::Transport`] if the endpoint cannot be reached
    /// - [`RealtimeError::ConnectionClosed`] if `close()` ran first
    pub async fn connect(&self) -> Result<()> {
        let (worker_id, cancel, ready_rx) = {
            let _guard = self.connecting.lock().await;

            if self.shared.session.state().is_active() {
                tracing::debug!("connect() on a live session, ignoring");
                return Ok(());
            }
            // A previous session may have ended on its own; reap its task
            self.join_worker().await;

            self.shared.session.begin_handshake()?;
            tracing::info!("Connecting to {}", self.dialer.endpoint());

            let dialed = timeout(self.config.handshake_timeout, self.dialer.dial()).await;
            let transport = match dialed {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    self.shared.session.disconnected();
                    return Err(e);
                }
                Err(_) => {
                    self.shared.session.disconnected();
                    return Err(RealtimeError::Timeout(format!(
                        "could not reach {} within {:?}",
                        self.dialer.endpoint(),
                        self.config.handshake_timeout
                    )));
                }
            };

            let (ready_tx, ready_rx) = oneshot::channel();
            let handle = Worker::spawn(
                self.shared.clone(),
                self.dialer.clone(),
                self.config.reconnect,
                self.config.writer_capacity,
                transport,
                ready_tx,
            );
            let started = (handle.id, handle.cancel.clone(), ready_rx);
            *self.worker_slot() = Some(handle);
            started
        };

        // The lock is released here so close() can interrupt the handshake
        match timeout(self.config.handshake_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                self.join_worker_id(worker_id).await;
                Err(e)
            }
            Ok(Err(_)) => {
                self.join_worker_id(worker_id).await;
                Err(RealtimeError::ConnectionClosed)
            }
            Err(_) => {
                cancel.cancel();
                self.join_worker_id(worker_id).await;
                Err(RealtimeError::Timeout(format!(
                    "no handshake reply within {:?}",
                    self.config.handshake_timeout
                )))
            }
        }
    }

    /// Wait until the session is `Connected`.
    ///
    /// Fails with [`RealtimeError::NotConnected`] if no session is in
    /// progress or the session ends before connecting.
    pub async fn wait_for_connection(&self) -> Result<()> {
        let mut rx = self.shared.session.watch();
        let state = *rx
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
            .await
            .map_err(|_| RealtimeError::NotConnected)?;
        match state {
            ConnectionState::Connected => Ok(()),
            _ => Err(RealtimeError::NotConnected),
        }
    }

    /// [`wait_for_connection`](Self::wait_for_connection) with a bound.
    pub async fn wait_for_connection_timeout(&self, limit: Duration) -> Result<()> {
        timeout(limit, self.wait_for_connection())
            .await
            .map_err(|_| RealtimeError::Timeout(format!("not connected within {:?}", limit)))?
    }

    /// Register `destination` for channels matching `pattern` and ask the
    /// server to subscribe.
    ///
    /// The destination is registered before the subscribe frame is sent, so
    /// no matching message is lost to a fast server. Without a live session
    /// the subscription is kept locally and sent after the next handshake.
    ///
    /// The client keeps the sender until the subscription ends; when the
    /// session ends every destination is released, so a receiver whose
    /// other senders are gone sees the end of the stream.
    pub async fn subscribe(
        &self,
        pattern: &str,
        destination: mpsc::Sender<Message>,
    ) -> Result<SubscriptionId> {
        let id = self.shared.registry.add(pattern, destination)?;

        let sent = self
            .shared
            .send_with_client_id(|msg_id, client_id| {
                OutboundFrame::subscribe(msg_id, client_id, pattern)
            })
            .await;
        match sent {
            Ok(()) => tracing::debug!("Subscribe sent for {}", pattern),
            Err(RealtimeError::NotConnected) => {
                tracing::debug!("Not connected, {} will be subscribed after handshake", pattern)
            }
            Err(e) => {
                self.shared.registry.remove(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Subscribe with a channel created by the client.
    pub async fn subscribe_channel(
        &self,
        pattern: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe(pattern, tx).await?;
        Ok(rx)
    }

    /// Drop every subscription for `pattern` and tell the server.
    ///
    /// Returns how many local subscriptions were removed.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<usize> {
        let removed = self.shared.registry.remove_pattern(pattern);
        if removed == 0 {
            return Ok(0);
        }

        let sent = self
            .shared
            .send_with_client_id(|msg_id, client_id| {
                OutboundFrame::unsubscribe(msg_id, client_id, pattern)
            })
            .await;
        match sent {
            Ok(()) | Err(RealtimeError::NotConnected) => Ok(removed),
            Err(e) => Err(e),
        }
    }

    /// End the session.
    ///
    /// Sends one `/meta/disconnect`, waits briefly for the reply, then stops
    /// the worker and returns once it has exited. A handshake or reconnect
    /// still in progress is cancelled right away. All subscriber channels
    /// are released. Calling it again, or without a session, is a no-op.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.connecting.lock().await;

        let (was_active, client_id) = self.shared.session.begin_close();
        if !was_active {
            self.join_worker().await;
            return Ok(());
        }

        let handle = self.worker_slot().take();
        let Some(mut handle) = handle else {
            self.shared.session.disconnected();
            return Ok(());
        };

        let sent = match (client_id, self.shared.writer()) {
            (Some(client_id), Ok(writer)) => {
                let frame = OutboundFrame::disconnect(self.shared.ids.next_id(), &client_id);
                match writer.send(&frame).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!("Could not send disconnect: {}", e);
                        false
                    }
                }
            }
            _ => false,
        };

        let acknowledged =
            sent && timeout(self.disconnect_timeout, &mut handle.join).await.is_ok();
        if !acknowledged {
            tracing::debug!("No disconnect reply, cancelling worker");
            handle.cancel.cancel();
            if let Err(e) = handle.join.await {
                tracing::error!("Worker task failed: {}", e);
            }
        }

        tracing::info!("Realtime client closed");
        Ok(())
    }

    async fn join_worker(&self) {
        let handle = self.worker_slot().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.join.await {
                tracing::error!("Worker task failed: {}", e);
            }
        }
    }

    /// Join the worker only if it is still the one with `id`.
    async fn join_worker_id(&self, id: u64) {
        let handle = {
            let mut slot = self.worker_slot();
            match slot.as_ref() {
                Some(handle) if handle.id == id => slot.take(),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.join.await {
                tracing::error!("Worker task failed: {}", e);
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Client id issued by the server for the current session.
    pub fn client_id(&self) -> Option<String> {
        self.shared.session.client_id()
    }

    /// Active subscriptions.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.shared.registry.snapshot()
    }

    /// Lifecycle events published by the worker.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Outbound frames queued but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer().map(|w| w.pending_count()).unwrap_or(0)
    }

    /// Endpoint this client dials.
    pub fn endpoint(&self) -> String {
        self.dialer.endpoint()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.worker_slot().take() {
            handle.cancel.cancel();
        }
    }
}
