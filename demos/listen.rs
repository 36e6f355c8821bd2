//! Print realtime notifications for one or more channel patterns.
//!
//! Connection settings come from the environment:
//!
//! ```text
//! C8Y_BASE_URL=https://tenant.example.com \
//! C8Y_TENANT=t123 C8Y_USER=alice C8Y_PASSWORD=secret \
//! RUST_LOG=c8y_realtime=debug \
//! cargo run --example listen -- '/measurements/*' '/alarms/*'
//! ```
//!
//! Without arguments the demo listens on `/measurements/*`. Ctrl-C closes
//! the session.

use c8y_realtime::{Client, ClientConfig, ClientEvent};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut patterns: Vec<String> = std::env::args().skip(1).collect();
    if patterns.is_empty() {
        patterns.push("/measurements/*".to_string());
    }

    let client = Client::new(ClientConfig::from_env()?)?;
    let mut events = client.events();

    // One channel shared by every pattern
    let (tx, mut rx) = mpsc::channel(256);
    for pattern in &patterns {
        client.subscribe(pattern, tx.clone()).await?;
    }
    drop(tx);

    client.connect().await?;
    tracing::info!("Listening on {:?} as {:?}", patterns, client.client_id());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = rx.recv() => match message {
                Some(message) => {
                    let data = message.data.unwrap_or_default();
                    println!("{} {}", message.channel, data);
                }
                None => break,
            },
            event = events.recv() => match event {
                Ok(ClientEvent::Disconnected(reason)) => {
                    tracing::warn!("Session ended: {}", reason);
                    break;
                }
                Ok(event) => tracing::info!("{:?}", event),
                Err(e) => tracing::debug!("Event stream: {}", e),
            },
        }
    }

    client.close().await?;
    Ok(())
}
