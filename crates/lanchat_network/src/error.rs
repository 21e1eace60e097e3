//! Network error types.

use std::net::SocketAddr;

/// Errors raised by the chat [`Transport`](crate::transport::Transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The UDP socket could not be bound or configured.
    #[error("Bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A datagram could not be delivered to `target`, even after a retry.
    #[error("Send to {target} failed: {reason}")]
    SendFailed { target: SocketAddr, reason: String },

    /// The payload does not fit in a single UDP datagram.
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// The transport has been closed.
    #[error("Transport closed")]
    Closed,
}

/// Errors raised while decoding an inbound wire payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The bytes are not a valid JSON chat record.
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload exceeds the datagram limit.
    #[error("Payload too large: {0} bytes")]
    Oversized(usize),

    /// The record parsed but a field is unusable.
    #[error("Invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Errors returned synchronously from `submit`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The content is empty after trimming whitespace.
    #[error("Message content is empty")]
    EmptyContent,

    /// The encoded message would not fit in a single datagram.
    #[error("Message is {size} bytes, limit is {limit}")]
    ContentTooLong { size: usize, limit: usize },
}

/// Errors that prevent a chat node from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The chat transport could not be started.
    #[error("Transport startup failed: {0}")]
    Transport(#[from] TransportError),

    /// The network configuration is unusable.
    #[error("Invalid network config: {0}")]
    Config(String),
}
