//! Transport module - websocket connection to the realtime endpoint.
//!
//! Provides:
//! - [`Transport`]: a websocket split into a boxed sink (writer side) and a
//!   boxed stream (read loop side)
//! - [`Dialer`]: how the worker opens a new transport, on connect and on
//!   every reconnect
//! - [`WebSocketDialer`]: the production dialer for `ws://`/`wss://` URLs

mod websocket;

pub use websocket::{Dialer, Transport, WebSocketDialer, WsMessage, WsSink, WsSource};
