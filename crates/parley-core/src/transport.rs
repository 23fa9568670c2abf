//! Connection abstraction the hub and sessions are written against.
//!
//! A transport is split in two halves. The [`Transport`] half is shared
//! (`Arc<dyn Transport>`) between the hub, which sends on it, and the session,
//! which closes it on exit. The [`Inbound`] half is owned by the session alone.

use async_trait::async_trait;

use crate::message::MessagePayload;

/// Transport-level failure on an established connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed (by the peer or locally).
    #[error("connection closed")]
    Closed,
    /// The peer is not draining its outbound queue fast enough.
    #[error("outbound queue full")]
    Backpressure,
    /// The payload could not be encoded for the wire.
    #[error("encode error: {0}")]
    Encode(String),
    /// The underlying socket failed.
    #[error("socket error: {0}")]
    Socket(String),
}

impl TransportError {
    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Backpressure => "backpressure",
            Self::Encode(_) => "encode",
            Self::Socket(_) => "socket",
        }
    }
}

/// Outbound half of a connection.
///
/// `send` must never wait on the peer: implementations enqueue and return.
/// `close` must be idempotent; every call after the first is a no-op.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, payload: &MessagePayload) -> Result<(), TransportError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Inbound half of a connection.
#[async_trait]
pub trait Inbound: Send + 'static {
    /// Wait for the next payload. Any error is terminal for the session.
    async fn receive(&mut self) -> Result<MessagePayload, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        assert_eq!(TransportError::Closed.kind(), "closed");
        assert_eq!(TransportError::Backpressure.kind(), "backpressure");
        assert_eq!(TransportError::Encode("x".into()).kind(), "encode");
        assert_eq!(TransportError::Socket("x".into()).kind(), "socket");
    }

    #[test]
    fn error_display() {
        assert_eq!(TransportError::Closed.to_string(), "connection closed");
        assert_eq!(
            TransportError::Socket("reset by peer".into()).to_string(),
            "socket error: reset by peer"
        );
    }
}
