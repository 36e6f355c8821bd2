//! Protocol module - Bayeux message types and wire format.
//!
//! This module implements the JSON envelope layer of the Bayeux protocol:
//! - Meta channel names and channel classification
//! - Outbound frames and inbound messages
//! - Batch encoding/decoding with partial-failure reporting

mod channel;
mod message;
mod wire_format;

pub use channel::{
    is_meta_channel, MetaChannel, CONNECTION_TYPE_WEBSOCKET, META_CONNECT, META_DISCONNECT,
    META_HANDSHAKE, META_SUBSCRIBE, META_UNSUBSCRIBE, MINIMUM_VERSION, PROTOCOL_VERSION,
};
pub use message::{
    authn_extension, Advice, InboundMessage, Message, MessageIdGenerator, OutboundFrame,
    ReconnectAdvice, AUTHN_EXTENSION,
};
pub use wire_format::{decode_batch, encode_batch, encode_frame, PartialBatch};
