//! Dedicated writer task for outbound frames.
//!
//! Every outbound frame (handshake, connect, subscribe, unsubscribe,
//! disconnect) may originate from the client facade or from the worker's
//! keepalive logic. All of them funnel through one mpsc channel into a
//! single task that owns the websocket sink, so frames never interleave on
//! the wire and no lock is held across a socket write.
//!
//! # Architecture
//!
//! ```text
//! Client::subscribe ─┐
//! Client::close     ─┼─► mpsc::Sender<WsMessage> ─► Writer Task ─► websocket
//! Worker keepalive  ─┘
//! ```
//!
//! Frames that are already queued when the task wakes up are fed into the
//! sink together and flushed once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{RealtimeError, Result};
use crate::protocol::{encode_frame, OutboundFrame};
use crate::transport::{WsMessage, WsSink};

/// Maximum frames fed before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable. The writer task exits once every handle is dropped.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WsMessage>,
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Encode a frame as a single-element batch and queue it.
    pub async fn send(&self, frame: &OutboundFrame) -> Result<()> {
        let text = encode_frame(frame)?;
        tracing::trace!("Queueing frame: {}", text);
        self.send_raw(WsMessage::Text(text)).await
    }

    /// Queue a websocket close frame without waiting for queue space.
    ///
    /// Returns false if the queue is full or the writer has stopped.
    pub fn try_close(&self) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(WsMessage::Close(None)) {
            Ok(()) => true,
            Err(_) => {
                self.pending.fetch_sub(1, Ordering::Release);
                false
            }
        }
    }

    async fn send_raw(&self, message: WsMessage) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(message).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            RealtimeError::ConnectionClosed
        })
    }

    /// Frames queued but not yet flushed.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
pub fn spawn_writer_task(sink: WsSink, capacity: usize) -> (WriterHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };
    let task = tokio::spawn(async move {
        let result = writer_loop(rx, sink, pending).await;
        if let Err(ref e) = result {
            tracing::warn!("Writer task stopped: {}", e);
        }
        result
    });

    (handle, task)
}

/// Receives frames and writes them to the socket until every handle is gone
/// or a close frame has been written.
async fn writer_loop(
    mut rx: mpsc::Receiver<WsMessage>,
    mut sink: WsSink,
    pending: Arc<AtomicUsize>,
) -> Result<()> {
    loop {
        let first = match rx.recv().await {
            Some(message) => message,
            None => {
                // All handles dropped, clean shutdown
                let _ = sink.close().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let mut closing = false;
        for message in batch {
            closing = matches!(message, WsMessage::Close(_));
            sink.feed(message).await?;
            if closing {
                break;
            }
        }
        sink.flush().await?;
        pending.fetch_sub(batch_size, Ordering::Release);

        if closing {
            rx.close();
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use futures_util::StreamExt;
    use serde_json::Value;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    async fn writer_pair() -> (
        WriterHandle,
        JoinHandle<Result<()>>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let transport = Transport::from_websocket(client);
        let (handle, task) = spawn_writer_task(transport.sink, 16);
        (handle, task, server)
    }

    #[tokio::test]
    async fn test_send_writes_single_element_batch() {
        let (handle, _task, mut server) = writer_pair().await;

        handle
            .send(&OutboundFrame::disconnect("1".to_string(), "cid"))
            .await
            .unwrap();

        let message = server.next().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
        assert_eq!(value[0]["channel"], "/meta/disconnect");
    }

    #[tokio::test]
    async fn test_frames_keep_order() {
        let (handle, _task, mut server) = writer_pair().await;

        for i in 0..10 {
            handle
                .send(&OutboundFrame::connect(i.to_string(), "cid", None))
                .await
                .unwrap();
        }

        for i in 0..10 {
            let message = server.next().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
            assert_eq!(value[0]["id"], i.to_string());
        }
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (handle, task, _server) = writer_pair().await;
        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_close_stops_writer() {
        let (handle, task, mut server) = writer_pair().await;

        assert!(handle.try_close());
        assert!(task.await.unwrap().is_ok());
        assert!(handle.is_closed());

        let message = server.next().await.unwrap().unwrap();
        assert!(message.is_close());

        let result = handle
            .send(&OutboundFrame::disconnect("2".to_string(), "cid"))
            .await;
        assert!(matches!(result, Err(RealtimeError::ConnectionClosed)));
    }
}
