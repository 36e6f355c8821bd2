//! Websocket transport.
//!
//! # Example
//!
//! ```ignore
//! use c8y_realtime::transport::{Dialer, WebSocketDialer};
//!
//! let dialer = WebSocketDialer::new(config.endpoint()?);
//! let transport = dialer.dial().await?;
//! ```

use std::pin::Pin;

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::error::Result;

pub use tungstenite::Message as WsMessage;

/// Write half of a websocket.
pub type WsSink = Pin<Box<dyn Sink<WsMessage, Error = tungstenite::Error> + Send>>;

/// Read half of a websocket.
pub type WsSource =
    Pin<Box<dyn Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Send>>;

/// An open websocket, split for the writer task and the read loop.
pub struct Transport {
    pub sink: WsSink,
    pub source: WsSource,
}

impl Transport {
    /// Split an established websocket.
    pub fn from_websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        Self {
            sink: Box::pin(sink),
            source: Box::pin(source),
        }
    }
}

/// Opens transports to a fixed endpoint.
pub trait Dialer: Send + Sync + 'static {
    /// Open a new transport.
    fn dial(&self) -> BoxFuture<'static, Result<Transport>>;

    /// Where this dialer connects, for diagnostics.
    fn endpoint(&self) -> String;
}

/// Dials the realtime websocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    endpoint: Url,
}

impl WebSocketDialer {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }
}

impl Dialer for WebSocketDialer {
    fn dial(&self) -> BoxFuture<'static, Result<Transport>> {
        let endpoint = self.endpoint.to_string();
        Box::pin(async move {
            tracing::debug!("Dialing {}", endpoint);
            let (ws, response) = tokio_tungstenite::connect_async(endpoint.as_str()).await?;
            tracing::debug!("Websocket upgrade completed with status {}", response.status());
            Ok(Transport::from_websocket(ws))
        })
    }

    fn endpoint(&self) -> String {
        self.endpoint.to_string()
    }
}
