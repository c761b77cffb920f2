//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between two isolated contexts.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about messages, calls, or services.
//!   It moves opaque buffers.
//! - **Order-Preserving**: Buffers sent from one end arrive at the other end in send order.
//!   Nothing is promised about ordering across the two directions.
//! - **Single Reader**: Exactly one task (the peer's pump) calls `recv`.

use std::fmt;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The counterpart is unreachable or the channel was dropped.
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One end of an order-preserving, bidirectional message channel.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues a payload for delivery to the counterpart.
    ///
    /// # invariants
    /// - Payloads handed to `send` in order are received in that order.
    /// - Must return `Err` once the channel can no longer deliver.
    /// - Should not interpret the payload content.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next payload from the counterpart.
    ///
    /// Returns `Ok(None)` once the counterpart has closed its sending half.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Stops sending. Once it has drained, the counterpart's `recv` returns
    /// `Ok(None)`.
    ///
    /// Called when the owning peer terminates. Must be idempotent.
    fn close(&self) {}
}
