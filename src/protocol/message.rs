//! Outbound frames and inbound messages.
//!
//! Both directions use the same JSON object shape. Outbound frames carry
//! only the fields the client sends; inbound messages keep every field the
//! worker or a subscriber may need.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use super::channel::{
    CONNECTION_TYPE_WEBSOCKET, META_CONNECT, META_DISCONNECT, META_HANDSHAKE, META_SUBSCRIBE,
    META_UNSUBSCRIBE, MINIMUM_VERSION, PROTOCOL_VERSION,
};

/// Name of the handshake authentication extension.
pub const AUTHN_EXTENSION: &str = "com.cumulocity.authn";

/// Build the handshake `ext` object for a credentials token.
pub fn authn_extension(token: &str) -> Value {
    json!({ AUTHN_EXTENSION: { "token": token } })
}

/// Server advice on how to continue after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectAdvice {
    /// Keep the session, send the next connect.
    Retry,
    /// Session is gone, handshake again.
    Handshake,
    /// Do not reconnect.
    None,
    #[serde(other)]
    Unknown,
}

/// `advice` field, sent by the client on connect and by the server on replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectAdvice>,
    /// Milliseconds to wait before the next connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Milliseconds the server may hold a connect open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// A frame sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
}

impl OutboundFrame {
    /// `/meta/handshake` with version negotiation and the authn extension.
    pub fn handshake(id: String, token: &str) -> Self {
        Self {
            channel: META_HANDSHAKE.to_string(),
            id: Some(id),
            ext: Some(authn_extension(token)),
            version: Some(PROTOCOL_VERSION.to_string()),
            minimum_version: Some(MINIMUM_VERSION.to_string()),
            supported_connection_types: Some(vec![CONNECTION_TYPE_WEBSOCKET.to_string()]),
            ..Self::default()
        }
    }

    /// `/meta/connect` keepalive.
    pub fn connect(id: String, client_id: &str, advice: Option<Advice>) -> Self {
        Self {
            channel: META_CONNECT.to_string(),
            id: Some(id),
            client_id: Some(client_id.to_string()),
            connection_type: Some(CONNECTION_TYPE_WEBSOCKET.to_string()),
            advice,
            ..Self::default()
        }
    }

    pub fn subscribe(id: String, client_id: &str, pattern: &str) -> Self {
        Self {
            channel: META_SUBSCRIBE.to_string(),
            id: Some(id),
            client_id: Some(client_id.to_string()),
            subscription: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn unsubscribe(id: String, client_id: &str, pattern: &str) -> Self {
        Self {
            channel: META_UNSUBSCRIBE.to_string(),
            id: Some(id),
            client_id: Some(client_id.to_string()),
            subscription: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn disconnect(id: String, client_id: &str) -> Self {
        Self {
            channel: META_DISCONNECT.to_string(),
            id: Some(id),
            client_id: Some(client_id.to_string()),
            ..Self::default()
        }
    }
}

/// A message received from the server, meta reply or data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// A single pattern or a list of patterns on subscribe replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Data message as delivered to subscribers.
pub type Message = InboundMessage;

impl InboundMessage {
    /// Build a data message, mostly useful in tests and mock servers.
    pub fn data(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Meta replies without `successful` are treated as successful.
    pub fn is_successful(&self) -> bool {
        self.successful.unwrap_or(true)
    }

    /// Client id if present and non-empty.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Patterns named in a subscribe/unsubscribe reply.
    pub fn subscriptions(&self) -> Vec<&str> {
        match &self.subscription {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn reconnect_advice(&self) -> Option<ReconnectAdvice> {
        self.advice.and_then(|a| a.reconnect)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Sequential message ids, unique per client.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id, starting from `"1"`.
    pub fn next_id(&self) -> String {
        (self.next.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}
