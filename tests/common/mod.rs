//! In-process Bayeux server for integration tests.
//!
//! [`DuplexDialer`] hands the client one end of an in-memory websocket per
//! dial and passes the other end to the test, which plays the server with
//! [`ServerConn`].

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use c8y_realtime::error::{RealtimeError, Result};
use c8y_realtime::transport::{Dialer, Transport, WsMessage};
use c8y_realtime::{Client, ClientConfig, Credentials, ReconnectPolicy};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

pub const STEP: Duration = Duration::from_secs(5);

pub fn credentials() -> Credentials {
    Credentials::new("t100", "alice", "secret")
}

pub fn config() -> ClientConfig {
    ClientConfig::new("https://tenant.example.com", credentials())
}

/// Dialer producing in-memory websockets.
pub struct DuplexDialer {
    conns: mpsc::UnboundedSender<ServerConn>,
    dials: AtomicUsize,
    refuse: AtomicBool,
}

impl Dialer for DuplexDialer {
    fn dial(&self) -> BoxFuture<'static, Result<Transport>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let conns = self.conns.clone();
        let refuse = self.refuse.load(Ordering::SeqCst);
        Box::pin(async move {
            if refuse {
                return Err(RealtimeError::Transport(tungstenite::Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))));
            }
            let (client_io, server_io) = duplex(256 * 1024);
            let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
            let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
            conns
                .send(ServerConn { ws: server })
                .map_err(|_| RealtimeError::ConnectionClosed)?;
            Ok(Transport::from_websocket(client))
        })
    }

    fn endpoint(&self) -> String {
        "duplex://test/cep/realtime".to_string()
    }
}

/// Test side of the dialer: yields one [`ServerConn`] per client dial.
pub struct MockServer {
    conns: mpsc::UnboundedReceiver<ServerConn>,
    dialer: Arc<DuplexDialer>,
}

impl MockServer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            conns: rx,
            dialer: Arc::new(DuplexDialer {
                conns: tx,
                dials: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            }),
        }
    }

    pub fn dialer(&self) -> Arc<DuplexDialer> {
        self.dialer.clone()
    }

    pub fn dials(&self) -> usize {
        self.dialer.dials.load(Ordering::SeqCst)
    }

    /// Make every following dial fail.
    pub fn refuse_dials(&self) {
        self.dialer.refuse.store(true, Ordering::SeqCst);
    }

    /// Client built against this server, without reconnection.
    pub fn client(&self) -> Client {
        Client::builder(config())
            .dialer(self.dialer())
            .reconnect_policy(ReconnectPolicy::disabled())
            .build()
            .unwrap()
    }

    pub async fn accept(&mut self) -> ServerConn {
        timeout(STEP, self.conns.recv())
            .await
            .expect("client did not dial")
            .expect("dialer dropped")
    }
}

/// Server end of one client connection.
pub struct ServerConn<S = DuplexStream> {
    ws: WebSocketStream<S>,
}

impl<S> ServerConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }

    /// Next frame sent by the client, or `None` once the socket is closed.
    ///
    /// Every client frame must be a single-element batch.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            let next = timeout(STEP, self.ws.next())
                .await
                .expect("client sent nothing");
            match next {
                None | Some(Err(_)) => return None,
                Some(Ok(WsMessage::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    let items = value.as_array().expect("frames must be batched");
                    assert_eq!(items.len(), 1, "expected a single-element batch: {}", text);
                    return Some(items[0].clone());
                }
                Some(Ok(WsMessage::Close(_))) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next frame on `channel`, skipping keepalive connects.
    pub async fn expect(&mut self, channel: &str) -> Value {
        loop {
            let frame = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("socket closed while waiting for {}", channel));
            if frame["channel"] == channel {
                return frame;
            }
            assert_eq!(
                frame["channel"], "/meta/connect",
                "unexpected frame while waiting for {}",
                channel
            );
        }
    }

    pub async fn send(&mut self, value: Value) {
        self.ws
            .send(WsMessage::Text(value.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    /// Reply to `request` on its own channel.
    pub async fn reply(&mut self, request: &Value, fields: Value) {
        let mut reply = json!({
            "channel": request["channel"],
            "id": request["id"],
            "successful": true,
        });
        if let (Some(reply), Some(extra)) = (reply.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                reply.insert(k.clone(), v.clone());
            }
        }
        self.send(json!([reply])).await;
    }

    /// Expect a handshake and accept it with `client_id`.
    pub async fn accept_handshake(&mut self, client_id: &str) -> Value {
        let handshake = self.expect("/meta/handshake").await;
        self.reply(
            &handshake,
            json!({
                "clientId": client_id,
                "version": "1.0",
                "supportedConnectionTypes": ["websocket"],
                "advice": { "reconnect": "retry", "interval": 0, "timeout": 60000 }
            }),
        )
        .await;
        handshake
    }

    /// Send data messages in one batch.
    pub async fn publish(&mut self, channel: &str, data: Value) {
        self.send(json!([{ "channel": channel, "data": data }])).await;
    }

    /// Close the socket from the server side.
    pub async fn drop_connection(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Connect `client` while `server` accepts the handshake.
pub async fn connect(client: &Client, server: &mut MockServer, client_id: &str) -> ServerConn {
    let (result, conn) = tokio::join!(client.connect(), async {
        let mut conn = server.accept().await;
        conn.accept_handshake(client_id).await;
        conn
    });
    result.unwrap();
    conn
}
