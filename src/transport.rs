//! Transport abstraction for the gate-control backend.
//!
//! The client needs three request/response calls and one long-lived
//! server-push channel. [`Transport`] covers the calls and hands out an
//! [`EventStream`] for the channel. Framing is the transport's job: every
//! item an `EventStream` yields is one complete event text ready for the
//! [decoder](crate::decoder) (see [`sse`](crate::sse) for the event-stream
//! framing used by the built-in HTTP transport).
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use waggle_gate_client::error::GateClientError;
//! use waggle_gate_client::protocol::AccessDecision;
//! use waggle_gate_client::transport::{EventStream, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn create_session(&self) -> Result<String, GateClientError> {
//!         // POST {"cmd": "newSession"} and return the session id
//!         todo!()
//!     }
//!
//!     async fn open_stream(
//!         &self,
//!         session_id: &str,
//!     ) -> Result<Box<dyn EventStream>, GateClientError> {
//!         // Open the push channel for this session
//!         todo!()
//!     }
//!
//!     async fn send_access_decision(
//!         &self,
//!         session_id: &str,
//!         decision: &AccessDecision,
//!     ) -> Result<u16, GateClientError> {
//!         // POST the decision and return the HTTP status
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::GateClientError;
use crate::protocol::AccessDecision;

/// Request side of the backend connection.
///
/// Shared between the client actor and the tasks it spawns, so it must be
/// `Send + Sync`. Every method may be called concurrently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Create a new application session and return its id.
    ///
    /// # Errors
    ///
    /// Any transport failure or non-2xx answer. The client treats every
    /// error here as recoverable and retries.
    async fn create_session(&self) -> Result<String, GateClientError>;

    /// Open the server-push channel for `session_id`.
    ///
    /// Resolves once the backend has accepted the stream; events then arrive
    /// through [`EventStream::recv`].
    ///
    /// # Errors
    ///
    /// Returns an error if the stream could not be opened.
    async fn open_stream(&self, session_id: &str)
        -> Result<Box<dyn EventStream>, GateClientError>;

    /// Send an operator decision under `session_id`.
    ///
    /// Returns the HTTP status of the answer. Non-2xx statuses are returned
    /// as `Ok`; the caller decides what counts as success.
    ///
    /// # Errors
    ///
    /// Returns an error if no answer was received at all.
    async fn send_access_decision(
        &self,
        session_id: &str,
        decision: &AccessDecision,
    ) -> Result<u16, GateClientError>;
}

/// An open server-push channel.
///
/// # Cancel Safety
///
/// [`recv`](EventStream::recv) **MUST** be cancel-safe because the client
/// races it against a stop signal inside `tokio::select!`. Dropping the
/// future before it completes must not lose an event.
#[async_trait]
pub trait EventStream: Send + 'static {
    /// Receive the next complete event text.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: one complete event
    /// - `Some(Err(e))`: the stream failed (e.g. [`GateClientError::TransportReceive`])
    /// - `None`: the backend ended the stream
    async fn recv(&mut self) -> Option<Result<String, GateClientError>>;

    /// Cancel the stream. Calling it more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown could not complete cleanly;
    /// implementations still release their resources.
    async fn close(&mut self) -> Result<(), GateClientError>;
}
