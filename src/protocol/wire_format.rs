//! Batch encoding and decoding.
//!
//! Bayeux envelopes travel as JSON arrays. Outbound frames are always sent
//! as a batch, even a batch of one, because the server expects an array.
//! Inbound payloads may carry several messages in one websocket message.
//!
//! # Partial decoding
//!
//! A batch is decoded element by element. If an element is malformed,
//! [`decode_batch`] returns a [`PartialBatch`] holding every message decoded
//! before it, so the caller can still process them.
//!
//! # Example
//!
//! ```
//! use c8y_realtime::protocol::{decode_batch, encode_frame, OutboundFrame};
//!
//! let wire = encode_frame(&OutboundFrame::disconnect("1".into(), "abc")).unwrap();
//! assert!(wire.starts_with('['));
//!
//! let messages = decode_batch(br#"[{"channel":"/meta/disconnect","successful":true}]"#).unwrap();
//! assert_eq!(messages[0].channel, "/meta/disconnect");
//! ```

use serde_json::Value;

use super::{InboundMessage, OutboundFrame};
use crate::error::{RealtimeError, Result};

/// Messages decoded before a malformed element, plus the error.
#[derive(Debug)]
pub struct PartialBatch {
    pub parsed: Vec<InboundMessage>,
    pub error: RealtimeError,
}

impl PartialBatch {
    fn new(parsed: Vec<InboundMessage>, reason: String) -> Self {
        Self {
            parsed,
            error: RealtimeError::MalformedFrame(reason),
        }
    }
}

/// Encode frames as one JSON array.
pub fn encode_batch(frames: &[OutboundFrame]) -> Result<String> {
    Ok(serde_json::to_string(frames)?)
}

/// Encode a single frame as a single-element JSON array.
pub fn encode_frame(frame: &OutboundFrame) -> Result<String> {
    encode_batch(std::slice::from_ref(frame))
}

/// Decode a server payload.
///
/// Accepts a JSON array of message objects or a single message object.
pub fn decode_batch(bytes: &[u8]) -> std::result::Result<Vec<InboundMessage>, PartialBatch> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| PartialBatch::new(Vec::new(), format!("invalid JSON: {}", e)))?;

    let elements = match value {
        Value::Array(elements) => elements,
        obj @ Value::Object(_) => vec![obj],
        other => {
            return Err(PartialBatch::new(
                Vec::new(),
                format!("expected array or object, got {}", type_name(&other)),
            ))
        }
    };

    let mut parsed = Vec::with_capacity(elements.len());
    for (index, element) in elements.into_iter().enumerate() {
        match serde_json::from_value::<InboundMessage>(element) {
            Ok(message) => parsed.push(message),
            Err(e) => {
                return Err(PartialBatch::new(
                    parsed,
                    format!("message {} in batch: {}", index, e),
                ))
            }
        }
    }
    Ok(parsed)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
