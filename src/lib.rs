//! # c8y-realtime
//!
//! Rust client for the Bayeux (CometD) realtime notification protocol as
//! served by the Cumulocity `/cep/realtime` websocket endpoint.
//!
//! The client performs the handshake, keeps the session alive with
//! `/meta/connect`, subscribes to glob channel patterns such as
//! `/measurements/*`, and delivers inbound data messages to subscriber
//! channels.
//!
//! ## Architecture
//!
//! - **Client facade** ([`Client`]): `connect`, `subscribe`, `unsubscribe`,
//!   `wait_for_connection`, `close`
//! - **Connection worker**: single read loop driving the session state
//!   machine, keepalive and reconnection
//! - **Writer task**: the only writer on the socket
//! - **Subscription registry**: pattern to subscriber fan-out without
//!   blocking the read loop
//!
//! ## Example
//!
//! ```ignore
//! use c8y_realtime::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientConfig::from_env()?)?;
//!     client.connect().await?;
//!
//!     let mut measurements = client.subscribe_channel("/measurements/*", 256).await?;
//!     while let Some(message) = measurements.recv().await {
//!         println!("{} {:?}", message.channel, message.data);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod pattern;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod transport;

mod client;
mod worker;
mod writer;

pub use client::{Client, ClientBuilder, DEFAULT_DISCONNECT_TIMEOUT};
pub use config::{ClientConfig, Credentials, ReconnectPolicy};
pub use error::{RealtimeError, Result};
pub use events::{ClientEvent, DisconnectReason};
pub use protocol::Message;
pub use session::ConnectionState;
