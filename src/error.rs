//! Error types for the gate client.

use thiserror::Error;

/// Errors that can occur when using the gate client.
///
/// Nothing in this enum is fatal to the client: transport failures route into
/// the session retry policy and only user-triggered decision failures reach
/// the host as feedback. Undecodable stream events are dropped with a
/// [`DecodeError`](crate::decoder::DecodeError) in the log.
#[derive(Debug, Error)]
pub enum GateClientError {
    /// A request to the backend could not be sent or completed.
    #[error("transport request error: {0}")]
    TransportRequest(String),

    /// Failed to read from the event stream.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The backend answered with a non-2xx status.
    #[error("server responded with HTTP {status}")]
    HttpStatus {
        /// HTTP status code returned by the backend.
        status: u16,
    },

    /// A response body was not the JSON the backend promises.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client has been shut down and no longer accepts commands.
    #[error("client is not running")]
    NotRunning,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// A specialized [`Result`] type for gate client operations.
pub type Result<T> = std::result::Result<T, GateClientError>;
