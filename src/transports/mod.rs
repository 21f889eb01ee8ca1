//! Transport implementations for the gate-control backend.
//!
//! This module provides concrete [`Transport`](crate::Transport) implementations
//! behind feature gates. Enable the corresponding Cargo feature to pull in
//! a transport:
//!
//! | Feature          | Transport         |
//! |------------------|-------------------|
//! | `transport-http` | [`HttpTransport`] |
//!
//! # Example
//!
//! ```rust,ignore
//! # async fn example() -> Result<(), waggle_gate_client::GateClientError> {
//! use waggle_gate_client::{HttpTransport, HttpTransportConfig, Transport};
//!
//! let transport = HttpTransport::new(HttpTransportConfig::new("http://10.0.0.5:5050"))?;
//! let session_id = transport.create_session().await?;
//! let mut stream = transport.open_stream(&session_id).await?;
//!
//! if let Some(Ok(event)) = stream.recv().await {
//!     println!("backend said: {event}");
//! }
//!
//! stream.close().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "transport-http")]
pub mod http;

#[cfg(feature = "transport-http")]
pub use http::{HttpEventStream, HttpTransport, HttpTransportConfig};
