//! HTTP transport implementation using `reqwest`.
//!
//! This module provides [`HttpTransport`], a [`Transport`] implementation for
//! the backend's two endpoints:
//!
//! - `POST {base}/client2server`: session creation and access decisions
//!   (decisions carry `?sessionId=`)
//! - `GET {base}/server2client?sessionId=`: the `text/event-stream` push
//!   channel, framed by [`SseFrameDecoder`]
//!
//! # Feature gate
//!
//! This module is only available when the `transport-http` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), waggle_gate_client::GateClientError> {
//! use std::time::Duration;
//! use waggle_gate_client::{HttpTransport, HttpTransportConfig, Transport};
//!
//! let config = HttpTransportConfig::new("http://10.0.0.5:5050")
//!     .with_request_timeout(Duration::from_secs(15));
//! let transport = HttpTransport::new(config)?;
//! let session_id = transport.create_session().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;

use crate::error::GateClientError;
use crate::protocol::{AccessDecision, AccessRequest, NewSessionRequest, SessionIdResponse};
use crate::sse::SseFrameDecoder;
use crate::transport::{EventStream, Transport};

/// Path for client-to-server requests.
const CLIENT_TO_SERVER: &str = "client2server";

/// Path of the server-push channel.
const SERVER_TO_CLIENT: &str = "server2client";

/// Query parameter carrying the session id.
const SESSION_QUERY: &str = "sessionId";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for an [`HttpTransport`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use waggle_gate_client::HttpTransportConfig;
///
/// let config = HttpTransportConfig::new("http://gate-backend:5050/")
///     .with_connect_timeout(Duration::from_secs(3));
/// assert_eq!(config.base_url, "http://gate-backend:5050/");
/// assert_eq!(config.request_timeout, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Backend root URL, with or without a trailing slash.
    pub base_url: String,
    /// TCP/TLS connect timeout for every request.
    ///
    /// Defaults to **10 seconds**.
    pub connect_timeout: Duration,
    /// Total timeout of session and decision requests. Never applied to the
    /// push channel, which stays open indefinitely.
    ///
    /// Defaults to **30 seconds**.
    pub request_timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A [`Transport`] backed by `reqwest`.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport with its own `reqwest` client.
    ///
    /// # Errors
    ///
    /// Returns [`GateClientError::TransportRequest`] if the HTTP client cannot
    /// be initialised (e.g. the TLS backend fails to load).
    pub fn new(config: HttpTransportConfig) -> Result<Self, GateClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GateClientError::TransportRequest(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    /// Build a transport around an existing client (custom TLS, proxies,
    /// default headers). `config.connect_timeout` is ignored.
    pub fn with_client(client: reqwest::Client, config: HttpTransportConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

fn request_error(e: reqwest::Error) -> GateClientError {
    if e.is_timeout() {
        GateClientError::Timeout
    } else {
        GateClientError::TransportRequest(e.to_string())
    }
}

fn ensure_success(response: &reqwest::Response) -> Result<(), GateClientError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(GateClientError::HttpStatus {
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_session(&self) -> Result<String, GateClientError> {
        let response = self
            .client
            .post(self.endpoint(CLIENT_TO_SERVER))
            .timeout(self.request_timeout)
            .json(&NewSessionRequest::default())
            .send()
            .await
            .map_err(request_error)?;
        ensure_success(&response)?;

        let bytes = response.bytes().await.map_err(request_error)?;
        let body: SessionIdResponse = serde_json::from_slice(&bytes)?;
        tracing::debug!(session_id = %body.session_id, "session created");
        Ok(body.session_id)
    }

    async fn open_stream(
        &self,
        session_id: &str,
    ) -> Result<Box<dyn EventStream>, GateClientError> {
        let url = self.endpoint(SERVER_TO_CLIENT);
        tracing::debug!(url = %url, "opening event stream");

        let response = self
            .client
            .get(url)
            .query(&[(SESSION_QUERY, session_id)])
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(request_error)?;
        ensure_success(&response)?;

        tracing::info!("event stream opened");
        Ok(Box::new(HttpEventStream::from_response(response)))
    }

    async fn send_access_decision(
        &self,
        session_id: &str,
        decision: &AccessDecision,
    ) -> Result<u16, GateClientError> {
        let response = self
            .client
            .post(self.endpoint(CLIENT_TO_SERVER))
            .query(&[(SESSION_QUERY, session_id)])
            .timeout(self.request_timeout)
            .json(&AccessRequest::from(decision.clone()))
            .send()
            .await
            .map_err(request_error)?;
        Ok(response.status().as_u16())
    }
}

/// Body chunks of the push channel.
type ChunkStream = BoxStream<'static, Result<Vec<u8>, GateClientError>>;

/// An [`EventStream`] over a `text/event-stream` HTTP body.
///
/// # Cancel Safety
///
/// [`recv`](EventStream::recv) is cancel-safe: a body chunk is only consumed
/// once it is ready, and completed events are buffered until returned.
pub struct HttpEventStream {
    body: Option<ChunkStream>,
    framer: SseFrameDecoder,
    ready: VecDeque<String>,
}

impl HttpEventStream {
    fn from_response(response: reqwest::Response) -> Self {
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| GateClientError::TransportReceive(e.to_string()))
            })
            .boxed();
        Self::from_chunks(body)
    }

    /// Build a stream over arbitrary body chunks.
    pub fn from_chunks(body: ChunkStream) -> Self {
        Self {
            body: Some(body),
            framer: SseFrameDecoder::new(),
            ready: VecDeque::new(),
        }
    }
}

impl std::fmt::Debug for HttpEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEventStream")
            .field("open", &self.body.is_some())
            .field("buffered", &self.ready.len())
            .finish()
    }
}

#[async_trait]
impl EventStream for HttpEventStream {
    async fn recv(&mut self) -> Option<Result<String, GateClientError>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }
            let body = self.body.as_mut()?;
            match body.next().await {
                Some(Ok(chunk)) => {
                    let frames = self.framer.push_bytes(&chunk);
                    self.ready.extend(frames);
                }
                Some(Err(e)) => {
                    self.body = None;
                    return Some(Err(e));
                }
                None => {
                    tracing::debug!("event stream ended by server");
                    self.body = None;
                    return self.framer.finish().map(Ok);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), GateClientError> {
        // Dropping the body cancels the underlying request.
        self.body = None;
        self.ready.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn http_transport_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HttpTransport>();
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let transport = HttpTransport::new(HttpTransportConfig::new("http://x:1/")).unwrap();
        assert_eq!(transport.endpoint(CLIENT_TO_SERVER), "http://x:1/client2server");
    }

    // ── Chunk-stream tests ───────────────────────────────────────────────

    fn chunks(parts: &[&str]) -> ChunkStream {
        let items: Vec<Result<Vec<u8>, GateClientError>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures_util::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn recv_reassembles_events_across_chunks() {
        let mut stream = HttpEventStream::from_chunks(chunks(&[
            "data: {\"cmd\":",
            "\"test\"}\n\ndata: second\n",
            "\n",
        ]));
        assert_eq!(stream.recv().await.unwrap().unwrap(), r#"{"cmd":"test"}"#);
        assert_eq!(stream.recv().await.unwrap().unwrap(), "second");
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_surfaces_body_errors_once() {
        let items: Vec<Result<Vec<u8>, GateClientError>> = vec![
            Ok(b"data: a\n\n".to_vec()),
            Err(GateClientError::TransportReceive("reset".into())),
        ];
        let mut stream = HttpEventStream::from_chunks(futures_util::stream::iter(items).boxed());
        assert_eq!(stream.recv().await.unwrap().unwrap(), "a");
        assert!(matches!(
            stream.recv().await,
            Some(Err(GateClientError::TransportReceive(_)))
        ));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut stream = HttpEventStream::from_chunks(chunks(&["data: a\n\n"]));
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.recv().await.is_none());
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Read one HTTP request (headers plus `Content-Length` body).
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Serve exactly one request with a canned `response`, recording the
    /// request text. Returns the base URL and the recorded request.
    async fn serve_once(response: String) -> (String, Arc<StdMutex<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(StdMutex::new(String::new()));
        let seen_in_task = Arc::clone(&seen);

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            *seen_in_task.lock().unwrap() = request;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        (format!("http://{addr}"), seen)
    }

    fn json_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn create_session_posts_new_session_command() {
        let (url, seen) = serve_once(json_response("200 OK", r#"{"sessionId":"s-42"}"#)).await;
        let transport = HttpTransport::new(HttpTransportConfig::new(url)).unwrap();

        let session_id = transport.create_session().await.unwrap();
        assert_eq!(session_id, "s-42");

        let request = seen.lock().unwrap().clone();
        assert!(request.starts_with("POST /client2server "), "{request}");
        assert!(request.contains(r#"{"cmd":"newSession"}"#), "{request}");
    }

    #[tokio::test]
    async fn create_session_maps_error_status() {
        let (url, _seen) = serve_once(json_response("503 Service Unavailable", "{}")).await;
        let transport = HttpTransport::new(HttpTransportConfig::new(url)).unwrap();

        let err = transport.create_session().await.unwrap_err();
        assert!(matches!(err, GateClientError::HttpStatus { status: 503 }));
    }

    #[tokio::test]
    async fn create_session_rejects_unexpected_body() {
        let (url, _seen) = serve_once(json_response("200 OK", r#"{"status":"ok"}"#)).await;
        let transport = HttpTransport::new(HttpTransportConfig::new(url)).unwrap();

        let err = transport.create_session().await.unwrap_err();
        assert!(matches!(err, GateClientError::Serialization(_)), "{err:?}");
    }

    #[tokio::test]
    async fn create_session_fails_with_unreachable_host() {
        let transport =
            HttpTransport::new(HttpTransportConfig::new("http://127.0.0.1:1")).unwrap();
        let err = transport.create_session().await.unwrap_err();
        assert!(matches!(
            err,
            GateClientError::TransportRequest(_) | GateClientError::Timeout
        ));
    }

    #[tokio::test]
    async fn access_decision_carries_session_and_body() {
        let (url, seen) = serve_once(json_response("200 OK", "")).await;
        let transport = HttpTransport::new(HttpTransportConfig::new(url)).unwrap();

        let status = transport
            .send_access_decision("s-42", &AccessDecision::new("A1", false))
            .await
            .unwrap();
        assert_eq!(status, 200);

        let request = seen.lock().unwrap().clone();
        assert!(
            request.starts_with("POST /client2server?sessionId=s-42 "),
            "{request}"
        );
        assert!(
            request.contains(r#"{"drMemberCPAccess":{"position":"A1","isAccessGranted":false}}"#),
            "{request}"
        );
    }

    #[tokio::test]
    async fn access_decision_returns_error_status_as_ok() {
        let (url, _seen) = serve_once(json_response("409 Conflict", "")).await;
        let transport = HttpTransport::new(HttpTransportConfig::new(url)).unwrap();
        let status = transport
            .send_access_decision("s-1", &AccessDecision::new("A1", true))
            .await
            .unwrap();
        assert_eq!(status, 409);
    }

    #[tokio::test]
    async fn open_stream_yields_framed_events() {
        let body = "data: {\"cmd\":\"test\"}\n\n: ping\n\ndata: {\"cmd\":\"sync\"}\n\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{body}"
        );
        let (url, seen) = serve_once(response).await;
        let transport = HttpTransport::new(HttpTransportConfig::new(url)).unwrap();

        let mut stream = transport.open_stream("s-7").await.unwrap();
        assert_eq!(stream.recv().await.unwrap().unwrap(), r#"{"cmd":"test"}"#);
        assert_eq!(stream.recv().await.unwrap().unwrap(), r#"{"cmd":"sync"}"#);
        assert!(stream.recv().await.is_none());

        let request = seen.lock().unwrap().clone();
        assert!(
            request.starts_with("GET /server2client?sessionId=s-7 "),
            "{request}"
        );
    }

    #[tokio::test]
    async fn open_stream_rejects_error_status() {
        let (url, _seen) = serve_once(json_response("401 Unauthorized", "")).await;
        let transport = HttpTransport::new(HttpTransportConfig::new(url)).unwrap();
        let err = transport.open_stream("stale").await.err().unwrap();
        assert!(matches!(err, GateClientError::HttpStatus { status: 401 }));
    }
}
