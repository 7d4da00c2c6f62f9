//! Error types for the wirecall client

use thiserror::Error;

/// Errors surfaced to callers of the client
///
/// A send against a closed socket is absent on purpose: it is recovered by
/// queueing the frame and reconnecting, never surfaced.
#[derive(Error, Debug)]
pub enum WirecallError {
    /// No correlated reply arrived within the request deadline
    #[error("Request timed out")]
    Timeout,

    /// Failed to serialize the outbound payload
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Correlated payloads must be JSON objects so the correlation id can be merged in
    #[error("Invalid payload: {0}")]
    Payload(String),

    /// The client was dropped while a call was in flight
    #[error("Client shut down")]
    ChannelClosed,
}

/// Result type for wirecall operations
pub type Result<T> = std::result::Result<T, WirecallError>;
