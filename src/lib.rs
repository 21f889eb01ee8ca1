//! # Waggle Gate Client
//!
//! Async client for a gate-control backend that pushes player arrivals and
//! gate states over a server-sent event stream.
//!
//! The client keeps an application session alive, supervises the event
//! stream, and folds its events into an ordered queue of players waiting at
//! the gates. An operator accepts or denies the head of the queue; the
//! decision is posted to the backend and the queue updated on success.
//!
//! ## Features
//!
//! - **Self-healing session**: failed acquisitions and lost streams are
//!   retried indefinitely, one retry loop at a time
//! - **Deterministic queue**: stream events and operator decisions are
//!   serialized through a single actor
//! - **Observable state**: session id, connection, queue, and feedback are
//!   published through `tokio::sync::watch` channels
//! - **Transport-agnostic**: implement [`Transport`] for any backend; the
//!   default `transport-http` feature provides [`HttpTransport`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use waggle_gate_client::{GateClient, GateClientConfig, GateEvent};
//! use waggle_gate_client::{HttpTransport, HttpTransportConfig};
//!
//! # async fn run() -> Result<(), waggle_gate_client::GateClientError> {
//! let transport = HttpTransport::new(HttpTransportConfig::new("http://10.0.0.5:5050"))?;
//! let (mut client, mut events) = GateClient::start(transport, GateClientConfig::new());
//!
//! while let Some(event) = events.recv().await {
//!     if let GateEvent::PlayerWaiting { player_id, display_name } = event {
//!         println!("{display_name} ({player_id}) is waiting");
//!     }
//! }
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod decoder;
pub mod error;
pub mod event;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod sse;
pub mod state;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{GateClient, GateClientConfig};
pub use decoder::{DecodeError, StreamEvent};
pub use error::GateClientError;
pub use event::GateEvent;
pub use protocol::{GateState, PlayerId};
pub use queue::{PlayerEntry, PlayerQueue};
pub use session::{ConnectionState, SessionManager};
pub use state::{Feedback, FeedbackState, LastHandled, StateView};
pub use transport::{EventStream, Transport};

#[cfg(feature = "transport-http")]
pub use transports::{HttpEventStream, HttpTransport, HttpTransportConfig};
