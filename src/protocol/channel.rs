//! Meta channel names and protocol constants.

/// Bayeux protocol version sent in the handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Oldest protocol version this client accepts.
pub const MINIMUM_VERSION: &str = "1.0";

/// The only connection type this client implements.
pub const CONNECTION_TYPE_WEBSOCKET: &str = "websocket";

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
pub const META_DISCONNECT: &str = "/meta/disconnect";

const META_PREFIX: &str = "/meta/";

/// Meta channels the connection worker reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaChannel {
    Handshake,
    Connect,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

impl MetaChannel {
    /// Classify a channel name. Returns `None` for data channels and for
    /// unknown meta channels.
    pub fn parse(channel: &str) -> Option<Self> {
        match channel {
            META_HANDSHAKE => Some(Self::Handshake),
            META_CONNECT => Some(Self::Connect),
            META_SUBSCRIBE => Some(Self::Subscribe),
            META_UNSUBSCRIBE => Some(Self::Unsubscribe),
            META_DISCONNECT => Some(Self::Disconnect),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => META_HANDSHAKE,
            Self::Connect => META_CONNECT,
            Self::Subscribe => META_SUBSCRIBE,
            Self::Unsubscribe => META_UNSUBSCRIBE,
            Self::Disconnect => META_DISCONNECT,
        }
    }
}

/// True for reserved `/meta/*` channels.
#[inline]
pub fn is_meta_channel(channel: &str) -> bool {
    channel.starts_with(META_PREFIX)
}
