//! Connection worker - read loop and protocol state machine.
//!
//! One worker task runs per connected client. It owns the read half of the
//! websocket and drives the session:
//!
//! 1. Send `/meta/handshake` with the authentication extension
//! 2. On a handshake reply with a client id, enter `Connected`, replay every
//!    registered subscription and start the `/meta/connect` cycle
//! 3. Route data messages through the subscription registry
//! 4. On socket loss, redial and handshake again per the reconnect policy
//!
//! The worker exits on cancellation (from `close()`), on a rejected
//! handshake, on `reconnect: none` advice, or when reconnection is disabled
//! or exhausted. Every exit goes through the same cleanup: the writer is
//! released, subscriber channels are dropped, the session becomes
//! `Disconnected` and a [`ClientEvent::Disconnected`] is published.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectPolicy;
use crate::error::{RealtimeError, Result};
use crate::events::{ClientEvent, DisconnectReason, EventSender};
use crate::protocol::{
    decode_batch, is_meta_channel, Advice, InboundMessage, MessageIdGenerator, MetaChannel,
    OutboundFrame, ReconnectAdvice,
};
use crate::session::{ConnectionState, Session};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{Dialer, Transport, WsMessage, WsSource};
use crate::writer::{spawn_writer_task, WriterHandle};

/// How long a finished worker waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between the client facade and the worker.
pub(crate) struct Shared {
    pub(crate) session: Session,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) ids: MessageIdGenerator,
    pub(crate) events: EventSender,
    pub(crate) token: String,
    /// Writer of the current transport. Separate from the session lock.
    writer: Mutex<Option<WriterHandle>>,
}

impl Shared {
    pub(crate) fn new(token: String, event_capacity: usize) -> Self {
        Self {
            session: Session::new(),
            registry: SubscriptionRegistry::new(),
            ids: MessageIdGenerator::new(),
            events: EventSender::new(event_capacity),
            token,
            writer: Mutex::new(None),
        }
    }

    fn writer_slot(&self) -> MutexGuard<'_, Option<WriterHandle>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writer of the live transport, or `NotConnected`.
    pub(crate) fn writer(&self) -> Result<WriterHandle> {
        self.writer_slot()
            .clone()
            .filter(|w| !w.is_closed())
            .ok_or(RealtimeError::NotConnected)
    }

    fn set_writer(&self, writer: Option<WriterHandle>) {
        *self.writer_slot() = writer;
    }

    /// Send a frame that needs a session: builds it with the current client
    /// id and queues it on the current writer.
    pub(crate) async fn send_with_client_id<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(String, &str) -> OutboundFrame,
    {
        let client_id = self.session.require_client_id()?;
        let writer = self.writer()?;
        let frame = build(self.ids.next_id(), &client_id);
        writer.send(&frame).await
    }
}

/// A live transport: read half plus the writer task owning the write half.
struct Connection {
    source: WsSource,
    writer: WriterHandle,
    writer_task: JoinHandle<Result<()>>,
}

/// Why one connection's read loop stopped.
#[derive(Debug)]
enum LoopExit {
    Cancelled,
    DisconnectAcknowledged,
    HandshakeRejected(String),
    ServerAdvice(String),
    TransportLost(String),
}

/// Handle kept by the client to stop and join the worker.
pub(crate) struct WorkerHandle {
    /// Distinguishes workers of successive sessions.
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    pub(crate) join: JoinHandle<()>,
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    dialer: Arc<dyn Dialer>,
    policy: ReconnectPolicy,
    writer_capacity: usize,
    cancel: CancellationToken,
    /// Consecutive failed reconnect attempts, reset on handshake success.
    attempts: u32,
    /// Delay between connect frames, from server advice.
    interval: Duration,
}

impl Worker {
    /// Spawn a worker over an already dialed transport.
    ///
    /// `ready` resolves with the outcome of the first handshake.
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        dialer: Arc<dyn Dialer>,
        policy: ReconnectPolicy,
        writer_capacity: usize,
        transport: Transport,
        ready: oneshot::Sender<Result<()>>,
    ) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let worker = Worker {
            shared,
            dialer,
            policy,
            writer_capacity,
            cancel: cancel.clone(),
            attempts: 0,
            interval: Duration::ZERO,
        };
        let conn = worker.open(transport);
        let join = tokio::spawn(worker.run(conn, ready));
        WorkerHandle {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            cancel,
            join,
        }
    }

    fn open(&self, transport: Transport) -> Connection {
        let (writer, writer_task) = spawn_writer_task(transport.sink, self.writer_capacity);
        self.shared.set_writer(Some(writer.clone()));
        Connection {
            source: transport.source,
            writer,
            writer_task,
        }
    }

    async fn release(&self, conn: Connection) {
        self.shared.set_writer(None);
        let Connection {
            source,
            writer,
            mut writer_task,
        } = conn;
        if !writer.try_close() {
            tracing::trace!("Writer already stopped or full, dropping it");
        }
        drop(writer);
        drop(source);
        if timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            tracing::debug!("Writer did not drain in time, aborting");
            writer_task.abort();
        }
    }

    async fn run(mut self, conn: Connection, ready: oneshot::Sender<Result<()>>) {
        let mut ready = Some(ready);
        let mut conn = conn;

        let reason = loop {
            let exit = self.drive(&mut conn, &mut ready).await;
            tracing::debug!("Read loop exited: {:?}", exit);

            match exit {
                LoopExit::Cancelled | LoopExit::DisconnectAcknowledged => {
                    break DisconnectReason::Closed;
                }
                LoopExit::HandshakeRejected(reason) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(RealtimeError::HandshakeFailed(reason.clone())));
                    }
                    break DisconnectReason::HandshakeRejected(reason);
                }
                LoopExit::ServerAdvice(reason) => break DisconnectReason::ServerAdvice(reason),
                LoopExit::TransportLost(reason) => {
                    tracing::warn!("Realtime connection lost: {}", reason);
                    if let Some(tx) = ready.take() {
                        // The first handshake never completed: fail connect()
                        let _ = tx.send(Err(RealtimeError::HandshakeFailed(format!(
                            "transport lost during handshake: {}",
                            reason
                        ))));
                        break DisconnectReason::TransportLost(reason);
                    }

                    self.release(conn).await;
                    match self.reconnect(reason).await {
                        Ok(next) => conn = next,
                        Err(reason) => return self.finish(None, reason).await,
                    }
                }
            }
        };

        self.finish(Some(conn), reason).await;
    }

    /// Single exit path for the worker.
    async fn finish(&self, conn: Option<Connection>, reason: DisconnectReason) {
        if let Some(conn) = conn {
            self.release(conn).await;
        }
        let released = self.shared.registry.clear();
        self.shared.session.disconnected();
        tracing::info!(
            "Realtime session ended ({}), released {} subscriptions",
            reason,
            released
        );
        self.shared.events.emit(ClientEvent::Disconnected(reason));
    }

    /// Redial until a transport is open or the policy gives up.
    async fn reconnect(
        &mut self,
        mut reason: String,
    ) -> std::result::Result<Connection, DisconnectReason> {
        if !self.policy.is_enabled() {
            return Err(DisconnectReason::TransportLost(reason));
        }
        if !self.shared.session.begin_reconnect() {
            return Err(DisconnectReason::Closed);
        }

        while self.attempts < self.policy.max_attempts {
            self.attempts += 1;
            let attempt = self.attempts;
            self.shared.events.emit(ClientEvent::Reconnecting {
                attempt,
                reason: reason.clone(),
            });

            let delay = self.policy.backoff(attempt);
            tracing::info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                self.dialer.endpoint(),
                delay,
                attempt,
                self.policy.max_attempts
            );

            let dialed = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DisconnectReason::Closed),
                dialed = async {
                    sleep(delay).await;
                    self.dialer.dial().await
                } => dialed,
            };

            match dialed {
                Ok(transport) => {
                    if self.shared.session.begin_handshake().is_err() {
                        return Err(DisconnectReason::Closed);
                    }
                    return Ok(self.open(transport));
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    reason = e.to_string();
                }
            }
        }

        Err(DisconnectReason::TransportLost(format!(
            "gave up after {} reconnect attempts: {}",
            self.policy.max_attempts, reason
        )))
    }

    /// Handshake and read frames until this connection ends.
    async fn drive(
        &mut self,
        conn: &mut Connection,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> LoopExit {
        if let Err(e) = self.send_handshake(&conn.writer).await {
            return LoopExit::TransportLost(e.to_string());
        }

        let mut next_connect: Option<Instant> = None;

        loop {
            let deadline = next_connect;
            let keepalive = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return LoopExit::Cancelled,
                _ = keepalive => {
                    next_connect = None;
                    if let Err(e) = self.send_connect(&conn.writer, None).await {
                        if !matches!(e, RealtimeError::NotConnected) {
                            return LoopExit::TransportLost(e.to_string());
                        }
                    }
                }
                frame = conn.source.next() => {
                    let payload = match frame {
                        None => {
                            return LoopExit::TransportLost(
                                "connection closed by server".to_string(),
                            )
                        }
                        Some(Err(e)) => return LoopExit::TransportLost(e.to_string()),
                        Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                        Some(Ok(WsMessage::Binary(bytes))) => bytes,
                        Some(Ok(WsMessage::Close(frame))) => {
                            let detail = frame
                                .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                                .unwrap_or_else(|| "no close frame".to_string());
                            return LoopExit::TransportLost(format!(
                                "server closed the socket: {}",
                                detail
                            ));
                        }
                        Some(Ok(_)) => continue,
                    };

                    let exit = self
                        .process(&payload, &conn.writer, ready, &mut next_connect)
                        .await;
                    if let Some(exit) = exit {
                        return exit;
                    }
                }
            }
        }
    }

    /// Decode one websocket payload and handle every message in it.
    async fn process(
        &mut self,
        payload: &[u8],
        writer: &WriterHandle,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
        next_connect: &mut Option<Instant>,
    ) -> Option<LoopExit> {
        let (messages, error) = match decode_batch(payload) {
            Ok(messages) => (messages, None),
            Err(partial) => (partial.parsed, Some(partial.error)),
        };

        for message in &messages {
            if let Some(exit) = self.handle(message, writer, ready, next_connect).await {
                return Some(exit);
            }
        }

        if let Some(e) = error {
            tracing::warn!("Skipping malformed payload: {}", e);
            self.shared.events.emit(ClientEvent::Error(e.to_string()));
        }
        None
    }

    async fn handle(
        &mut self,
        message: &InboundMessage,
        writer: &WriterHandle,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
        next_connect: &mut Option<Instant>,
    ) -> Option<LoopExit> {
        if let Some(interval) = message.advice.and_then(|a| a.interval) {
            self.interval = Duration::from_millis(interval);
        }

        if !is_meta_channel(&message.channel) {
            self.deliver(message).await;
            return None;
        }

        match MetaChannel::parse(&message.channel) {
            Some(MetaChannel::Handshake) => {
                let exit = self.on_handshake(message, writer).await;
                if exit.is_none() && self.shared.session.state() == ConnectionState::Connected {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                exit
            }
            Some(MetaChannel::Connect) => self.on_connect(message, writer, next_connect).await,
            Some(MetaChannel::Subscribe) => {
                if message.is_successful() {
                    tracing::debug!("Subscribed to {:?}", message.subscriptions());
                } else {
                    let error = message.error.clone().unwrap_or_default();
                    for subscription in message.subscriptions() {
                        tracing::warn!("Subscription to {} refused: {}", subscription, error);
                        self.shared.events.emit(ClientEvent::SubscribeFailed {
                            subscription: subscription.to_string(),
                            error: error.clone(),
                        });
                    }
                }
                // Subscribe activity is followed by a connect on this binding
                *next_connect = Some(Instant::now());
                None
            }
            Some(MetaChannel::Unsubscribe) => {
                tracing::debug!(
                    "Unsubscribed from {:?} (successful: {})",
                    message.subscriptions(),
                    message.is_successful()
                );
                None
            }
            Some(MetaChannel::Disconnect) => {
                if self.shared.session.state() == ConnectionState::Closing {
                    Some(LoopExit::DisconnectAcknowledged)
                } else {
                    Some(LoopExit::ServerAdvice(
                        message
                            .error
                            .clone()
                            .unwrap_or_else(|| "server ended the session".to_string()),
                    ))
                }
            }
            None => {
                tracing::debug!("Ignoring message on {}", message.channel);
                None
            }
        }
    }

    async fn on_handshake(
        &mut self,
        message: &InboundMessage,
        writer: &WriterHandle,
    ) -> Option<LoopExit> {
        let client_id = match message.client_id() {
            Some(id) if message.is_successful() => id,
            _ => {
                let reason = message
                    .error
                    .clone()
                    .unwrap_or_else(|| "server returned no client id".to_string());
                tracing::error!("Handshake rejected: {}", reason);
                return Some(LoopExit::HandshakeRejected(reason));
            }
        };

        if let Err(e) = self.shared.session.handshake_succeeded(client_id) {
            tracing::warn!("Ignoring handshake reply: {}", e);
            return None;
        }
        self.attempts = 0;
        tracing::info!("Realtime session established, client id {}", client_id);
        self.shared.events.emit(ClientEvent::Connected {
            client_id: client_id.to_string(),
        });

        for pattern in self.shared.registry.patterns() {
            let frame = OutboundFrame::subscribe(self.shared.ids.next_id(), client_id, &pattern);
            if let Err(e) = writer.send(&frame).await {
                return Some(LoopExit::TransportLost(e.to_string()));
            }
        }

        let first = Advice {
            timeout: Some(0),
            ..Advice::default()
        };
        if let Err(e) = self.send_connect(writer, Some(first)).await {
            return Some(LoopExit::TransportLost(e.to_string()));
        }
        None
    }

    async fn on_connect(
        &mut self,
        message: &InboundMessage,
        writer: &WriterHandle,
        next_connect: &mut Option<Instant>,
    ) -> Option<LoopExit> {
        if message.is_successful() {
            tracing::trace!("Connect acknowledged");
            *next_connect = Some(Instant::now() + self.interval);
            return None;
        }

        let error = message.error.clone().unwrap_or_default();
        match message.reconnect_advice() {
            Some(ReconnectAdvice::Handshake) => {
                tracing::info!("Server requested a new handshake: {}", error);
                *next_connect = None;
                if self.shared.session.begin_handshake().is_err() {
                    return Some(LoopExit::Cancelled);
                }
                if let Err(e) = self.send_handshake(writer).await {
                    return Some(LoopExit::TransportLost(e.to_string()));
                }
                None
            }
            Some(ReconnectAdvice::None) => Some(LoopExit::ServerAdvice(error)),
            _ => {
                tracing::warn!("Connect failed, retrying: {}", error);
                *next_connect = Some(Instant::now() + self.interval);
                None
            }
        }
    }

    async fn deliver(&self, message: &InboundMessage) {
        let outcome = self.shared.registry.route(message);
        if outcome.delivered == 0 && outcome.dropped == 0 {
            tracing::trace!("No subscriber for {}", message.channel);
        }
        for pattern in outcome.orphaned {
            let sent = self
                .shared
                .send_with_client_id(|msg_id, client_id| {
                    OutboundFrame::unsubscribe(msg_id, client_id, &pattern)
                })
                .await;
            if let Err(e) = sent {
                tracing::debug!("Could not unsubscribe abandoned {}: {}", pattern, e);
            }
        }
    }

    async fn send_handshake(&self, writer: &WriterHandle) -> Result<()> {
        tracing::debug!("Sending handshake to {}", self.dialer.endpoint());
        writer
            .send(&OutboundFrame::handshake(self.shared.ids.next_id(), &self.shared.token))
            .await
    }

    async fn send_connect(&self, writer: &WriterHandle, advice: Option<Advice>) -> Result<()> {
        let client_id = self.shared.session.require_client_id()?;
        writer
            .send(&OutboundFrame::connect(self.shared.ids.next_id(), &client_id, advice))
            .await
    }
}
