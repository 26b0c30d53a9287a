//! One accepted peer: its transport, buffers and protocol state.
//!
//! A [`Connection`] is owned by exactly one task at a time; every operation takes
//! `&mut self`, so reads and writes on one connection are strictly sequential.
//!
//! ```text
//! accept ─► Connected ─┬─► Reading ─┐
//!              ▲       └─► Writing ─┤
//!              └── keep-alive ──────┘
//!                      └─► Closing ─► Closed        (any state ─► Error on I/O failure)
//! ```
//!
//! After a response the connection returns to `Connected` when both sides allow
//! keep-alive; otherwise it moves to `Closing`. Once upgraded it carries WebSocket
//! frames instead of HTTP messages.

mod throttle;
mod transport;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

pub use throttle::{BandwidthLimiter, HealthMonitor};
pub use transport::Transport;

use crate::http::{Limits, Request, RequestError, Response};
use crate::stats::{Scalar, Snapshot};
use crate::websocket::{CloseCode, Frame, FrameError, FrameParser, ParseStatus, ParserConfig};

const READ_CHUNK: usize = 4096;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique, monotonically increasing connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Established and idle; every connection starts here.
    Connected,
    Reading,
    Writing,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Reading => "reading",
            Self::Writing => "writing",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response compression requested for this connection. Recorded and reported; bodies
/// are currently sent uncompressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Deflate,
}

impl CompressionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

/// Per-connection settings, usually derived from the server configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub keep_alive: bool,
    /// How long an idle keep-alive connection waits for its next request.
    pub keep_alive_timeout: Duration,
    pub limits: Limits,
    /// Cap on bytes written per second, if any.
    pub bandwidth_limit: Option<u64>,
    pub health_check_interval: Duration,
    /// How long a WebSocket read may wait for a frame. `None` waits indefinitely.
    pub websocket_read_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(5),
            limits: Limits::default(),
            bandwidth_limit: None,
            health_check_interval: Duration::from_secs(30),
            websocket_read_timeout: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("connection is closed")]
    Closed,

    #[error("peer closed the connection mid-message")]
    UnexpectedEof,

    #[error("bad request: {0}")]
    Request(#[from] RequestError),

    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("connection is not in {expected} mode")]
    WrongMode { expected: &'static str },

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },
}

impl ConnectionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// An accepted peer.
pub struct Connection {
    id: ConnectionId,
    stream: Box<dyn Transport>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    state: ConnectionState,
    config: ConnectionConfig,
    buffer: BytesMut,
    parser: Option<FrameParser>,
    compression: CompressionType,
    attributes: HashMap<String, Scalar>,
    limiter: Option<BandwidthLimiter>,
    health: HealthMonitor,
    bytes_read: u64,
    bytes_written: u64,
    requests: u64,
    created_at: Instant,
    last_activity: Instant,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("websocket", &self.is_websocket())
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(stream: impl Transport, config: ConnectionConfig) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "could not set TCP_NODELAY");
        }
        let now = Instant::now();
        let connection = Self {
            id: ConnectionId::next(),
            stream: Box::new(stream),
            peer_addr,
            local_addr,
            state: ConnectionState::Connected,
            limiter: config.bandwidth_limit.map(BandwidthLimiter::new),
            health: HealthMonitor::new(config.health_check_interval),
            config,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            parser: None,
            compression: CompressionType::None,
            attributes: HashMap::new(),
            bytes_read: 0,
            bytes_written: 0,
            requests: 0,
            created_at: now,
            last_activity: now,
        };
        debug!(connection_id = %connection.id, peer = ?connection.peer_addr, "connection opened");
        connection
    }

    // ── Identity and state ───────────────────────────────────────────────────

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        !matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Error
        )
    }

    pub fn is_websocket(&self) -> bool {
        self.parser.is_some()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Requests read on this connection so far.
    pub fn requests_served(&self) -> u64 {
        self.requests
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// `true` if bytes beyond the last parsed message are already buffered.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.config.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.config.write_timeout = timeout;
    }

    /// Sets both the read and the write timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.set_read_timeout(timeout);
        self.set_write_timeout(timeout);
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.config.keep_alive = keep_alive;
    }

    pub fn set_keep_alive_timeout(&mut self, timeout: Duration) {
        self.config.keep_alive_timeout = timeout;
    }

    pub fn set_compression(&mut self, compression: CompressionType) {
        self.compression = compression;
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn set_bandwidth_limit(&mut self, bytes_per_second: Option<u64>) {
        self.limiter = bytes_per_second.map(BandwidthLimiter::new);
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    // ── Attributes ───────────────────────────────────────────────────────────

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn attribute(&self, name: &str) -> Option<&Scalar> {
        self.attributes.get(name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Scalar> {
        self.attributes.remove(name)
    }

    pub fn clear_attributes(&mut self) {
        self.attributes.clear();
    }

    /// Resets per-exchange state so the socket can serve another request. Buffered
    /// bytes of a following request are kept.
    pub fn prepare_for_reuse(&mut self) {
        if self.is_open() {
            self.state = ConnectionState::Connected;
        }
        self.attributes.clear();
        self.last_activity = Instant::now();
    }

    pub fn info(&self) -> Snapshot {
        let mut info = Snapshot::new();
        info.insert("id".into(), self.id.as_u64().into());
        info.insert(
            "peer".into(),
            self.peer_addr
                .map_or_else(|| "unknown".to_owned(), |a| a.to_string())
                .into(),
        );
        info.insert("state".into(), self.state.as_str().into());
        info.insert("websocket".into(), self.is_websocket().into());
        info.insert("healthy".into(), self.is_healthy().into());
        info.insert("requests".into(), self.requests.into());
        info.insert("bytes_read".into(), self.bytes_read.into());
        info.insert("bytes_written".into(), self.bytes_written.into());
        info.insert("buffered".into(), self.buffer.len().into());
        info.insert("compression".into(), self.compression.as_str().into());
        info.insert(
            "age_ms".into(),
            (self.created_at.elapsed().as_millis() as u64).into(),
        );
        info.insert(
            "idle_ms".into(),
            (self.idle_time().as_millis() as u64).into(),
        );
        info
    }

    // ── HTTP ─────────────────────────────────────────────────────────────────

    /// Reads the next request.
    ///
    /// Returns `Ok(None)` when the peer closed cleanly between requests, or when an idle
    /// keep-alive connection saw no new request within the keep-alive timeout (the
    /// connection is closed in that case).
    pub async fn read_request(&mut self) -> Result<Option<Request>, ConnectionError> {
        self.expect_http()?;
        loop {
            if !self.buffer.is_empty() {
                match Request::parse(&self.buffer, &self.config.limits) {
                    Ok((mut request, consumed)) => {
                        self.buffer.advance(consumed);
                        if let Some(peer) = self.peer_addr {
                            request.set_peer_addr(peer);
                        }
                        self.requests += 1;
                        self.state = ConnectionState::Connected;
                        return Ok(Some(request));
                    }
                    Err(RequestError::Incomplete) => {}
                    Err(e) => {
                        // Still writable so the caller can send the error response.
                        self.state = ConnectionState::Closing;
                        return Err(e.into());
                    }
                }
            }

            let idle = self.requests > 0 && self.buffer.is_empty();
            let timeout = if idle {
                self.config.keep_alive_timeout
            } else {
                self.config.read_timeout
            };

            self.state = ConnectionState::Reading;
            match tokio::time::timeout(timeout, self.fill_buffer()).await {
                Err(_) if idle => {
                    debug!(connection_id = %self.id, "keep-alive timeout");
                    self.close().await;
                    return Ok(None);
                }
                Err(_) => {
                    self.state = ConnectionState::Error;
                    return Err(ConnectionError::Timeout {
                        operation: "read",
                        timeout,
                    });
                }
                Ok(Ok(0)) if self.buffer.is_empty() => {
                    trace!(connection_id = %self.id, "peer closed");
                    self.state = ConnectionState::Closed;
                    return Ok(None);
                }
                Ok(Ok(0)) => {
                    self.state = ConnectionState::Error;
                    return Err(ConnectionError::UnexpectedEof);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(self.io_failure(e)),
            }
        }
    }

    /// Writes `response`, then moves to `Connected` if the exchange keeps the
    /// connection alive or to `Closing` otherwise.
    pub async fn write_response(&mut self, mut response: Response) -> Result<(), ConnectionError> {
        self.expect_http()?;
        let keep_alive = response.is_keep_alive()
            && self.config.keep_alive
            && self.state != ConnectionState::Closing;
        response.set_keep_alive(keep_alive);
        let bytes = response.into_bytes();
        self.write_data(&bytes).await?;
        self.state = if keep_alive {
            ConnectionState::Connected
        } else {
            ConnectionState::Closing
        };
        Ok(())
    }

    /// `true` if the last exchange left the connection ready for another request.
    pub fn is_keep_alive(&self) -> bool {
        self.state == ConnectionState::Connected && self.config.keep_alive
    }

    // ── Raw I/O ──────────────────────────────────────────────────────────────

    /// Returns up to `max` bytes: buffered bytes first, otherwise one read from the
    /// transport. An empty result means the peer closed.
    pub async fn read_data(&mut self, max: usize) -> Result<Bytes, ConnectionError> {
        self.ensure_open()?;
        if self.buffer.is_empty() {
            let timeout = self.config.read_timeout;
            self.timed_fill("read", timeout).await?;
        }
        let take = max.min(self.buffer.len());
        Ok(self.buffer.split_to(take).freeze())
    }

    /// Reads through `delimiter` and returns the bytes including it.
    pub async fn read_until(&mut self, delimiter: &[u8]) -> Result<Bytes, ConnectionError> {
        self.ensure_open()?;
        if delimiter.is_empty() {
            return Ok(Bytes::new());
        }
        let max = self.config.limits.max_header_size;
        let mut searched = 0;
        loop {
            let window = &self.buffer[searched..];
            if let Some(pos) = window
                .windows(delimiter.len())
                .position(|w| w == delimiter)
            {
                let end = searched + pos + delimiter.len();
                return Ok(self.buffer.split_to(end).freeze());
            }
            searched = self.buffer.len().saturating_sub(delimiter.len() - 1);
            if self.buffer.len() > max {
                return Err(ConnectionError::LineTooLong { max });
            }
            let timeout = self.config.read_timeout;
            if self.timed_fill("read", timeout).await? == 0 {
                self.state = ConnectionState::Error;
                return Err(ConnectionError::UnexpectedEof);
            }
        }
    }

    /// Reads one line, without its `\n` or `\r\n` terminator.
    pub async fn read_line(&mut self) -> Result<String, ConnectionError> {
        let line = self.read_until(b"\n").await?;
        let line = line.strip_suffix(b"\n").unwrap_or(&line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(String::from_utf8_lossy(line).into_owned())
    }

    /// Writes and flushes `data`, honouring the write timeout and bandwidth cap.
    pub async fn write_data(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.ensure_open()?;
        self.health.maybe_probe(&*self.stream, Instant::now());
        if let Some(limiter) = &mut self.limiter {
            limiter.throttle(data.len()).await;
        }

        let previous = self.state;
        self.state = ConnectionState::Writing;
        let timeout = self.config.write_timeout;
        let stream = &mut self.stream;
        let write = async {
            stream.write_all(data).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Err(_) => {
                self.state = ConnectionState::Error;
                Err(ConnectionError::Timeout {
                    operation: "write",
                    timeout,
                })
            }
            Ok(Err(e)) => Err(self.io_failure(e)),
            Ok(Ok(())) => {
                self.bytes_written += data.len() as u64;
                self.last_activity = Instant::now();
                self.state = previous;
                Ok(data.len())
            }
        }
    }

    // ── WebSocket ────────────────────────────────────────────────────────────

    /// Switches the connection to WebSocket framing. The `101` response must already
    /// have been written.
    pub fn upgrade_to_websocket(&mut self, config: ParserConfig) -> Result<(), ConnectionError> {
        self.expect_http()?;
        self.ensure_open()?;
        self.parser = Some(FrameParser::new(config));
        self.state = ConnectionState::Connected;
        debug!(connection_id = %self.id, "upgraded to WebSocket");
        Ok(())
    }

    /// Frame parser counters, once upgraded.
    pub fn websocket_statistics(&self) -> Option<Snapshot> {
        self.parser.as_ref().map(FrameParser::statistics)
    }

    pub async fn send_websocket_frame(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        self.expect_websocket()?;
        frame.validate()?;
        let bytes = frame.to_bytes();
        self.write_data(&bytes).await?;
        Ok(())
    }

    /// Reads the next frame. Returns `Ok(None)` when the peer closed between frames.
    pub async fn receive_websocket_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        self.expect_websocket()?;
        loop {
            self.ensure_open()?;
            let Some(parser) = self.parser.as_mut() else {
                return Err(ConnectionError::WrongMode {
                    expected: "websocket",
                });
            };
            if !self.buffer.is_empty() {
                let status = parser.parse(&self.buffer);
                match status {
                    Ok(ParseStatus::Complete { frame, consumed }) => {
                        self.buffer.advance(consumed);
                        return Ok(Some(frame));
                    }
                    Ok(ParseStatus::Incomplete { consumed }) => self.buffer.advance(consumed),
                    // The socket stays writable so the caller can send its close frame.
                    Err(e) => return Err(e.into()),
                }
            }
            let mid_frame = parser.is_parsing();

            let read = match self.config.websocket_read_timeout {
                Some(timeout) => self.timed_fill("websocket read", timeout).await?,
                None => match self.fill_buffer().await {
                    Ok(n) => n,
                    Err(e) => return Err(self.io_failure(e)),
                },
            };
            if read == 0 {
                if mid_frame {
                    self.state = ConnectionState::Error;
                    return Err(ConnectionError::UnexpectedEof);
                }
                self.state = ConnectionState::Closed;
                return Ok(None);
            }
        }
    }

    pub async fn send_websocket_ping(&mut self, payload: impl Into<Bytes>) -> Result<(), ConnectionError> {
        self.send_websocket_frame(&Frame::ping(payload)).await
    }

    pub async fn send_websocket_pong(&mut self, payload: impl Into<Bytes>) -> Result<(), ConnectionError> {
        self.send_websocket_frame(&Frame::pong(payload)).await
    }

    pub async fn send_websocket_close(
        &mut self,
        code: CloseCode,
        reason: &str,
    ) -> Result<(), ConnectionError> {
        self.send_websocket_frame(&Frame::close(Some(code), reason)).await
    }

    // ── Closing ──────────────────────────────────────────────────────────────

    /// Shuts down the write side and marks the connection closed. Idempotent.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Err(e) = self.stream.shutdown().await {
            trace!(connection_id = %self.id, error = %e, "shutdown failed");
        }
        self.state = ConnectionState::Closed;
        debug!(
            connection_id = %self.id,
            requests = self.requests,
            bytes_read = self.bytes_read,
            bytes_written = self.bytes_written,
            "connection closed"
        );
    }

    /// Shuts down the write side, then drains the peer until it closes or `timeout`
    /// elapses, so a final response is not cut off by a reset.
    pub async fn close_gracefully(&mut self, timeout: Duration) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Err(e) = self.stream.shutdown().await {
            trace!(connection_id = %self.id, error = %e, "shutdown failed");
        }
        let stream = &mut self.stream;
        let drain = async {
            let mut sink = [0u8; 1024];
            loop {
                match stream.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            trace!(connection_id = %self.id, "peer did not close in time");
        }
        self.close().await;
    }

    /// Marks the connection closed without any shutdown exchange. The socket is
    /// released when the connection is dropped.
    pub fn force_close(&mut self) {
        self.buffer.clear();
        self.state = ConnectionState::Closed;
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn expect_http(&self) -> Result<(), ConnectionError> {
        if self.is_websocket() {
            return Err(ConnectionError::WrongMode { expected: "http" });
        }
        Ok(())
    }

    fn expect_websocket(&self) -> Result<(), ConnectionError> {
        if !self.is_websocket() {
            return Err(ConnectionError::WrongMode {
                expected: "websocket",
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Error => Err(ConnectionError::Closed),
            _ => Ok(()),
        }
    }

    async fn fill_buffer(&mut self) -> io::Result<usize> {
        self.health.maybe_probe(&*self.stream, Instant::now());
        self.buffer.reserve(READ_CHUNK);
        let n = self.stream.read_buf(&mut self.buffer).await?;
        self.bytes_read += n as u64;
        if n > 0 {
            self.last_activity = Instant::now();
        }
        Ok(n)
    }

    async fn timed_fill(
        &mut self,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<usize, ConnectionError> {
        match tokio::time::timeout(timeout, self.fill_buffer()).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(self.io_failure(e)),
            Err(_) => {
                self.state = ConnectionState::Error;
                Err(ConnectionError::Timeout { operation, timeout })
            }
        }
    }

    fn io_failure(&mut self, e: io::Error) -> ConnectionError {
        warn!(connection_id = %self.id, error = %e, "connection I/O failed");
        self.state = ConnectionState::Error;
        self.health.mark_unhealthy(e.to_string());
        ConnectionError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    fn pair(config: ConnectionConfig) -> (Connection, DuplexStream) {
        let (server, client) = duplex(64 * 1024);
        (Connection::new(server, config), client)
    }

    async fn read_response(client: &mut DuplexStream) -> Response {
        let mut buf = BytesMut::new();
        loop {
            if let Ok((response, _)) = Response::parse(&buf) {
                return response;
            }
            let n = client.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "server closed before a full response");
        }
    }

    #[test]
    fn ids_increase() {
        let (a, _) = duplex(8);
        let (b, _) = duplex(8);
        let first = Connection::new(a, ConnectionConfig::default());
        let second = Connection::new(b, ConnectionConfig::default());
        assert!(second.id() > first.id());
    }

    #[tokio::test]
    async fn new_connection_is_ready_for_io() {
        let (mut conn, mut client) = pair(ConnectionConfig::default());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.is_keep_alive());

        client.write_all(b"ping\n").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "ping");
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn request_split_across_writes() {
        let (mut conn, mut client) = pair(ConnectionConfig::default());
        let writer = tokio::spawn(async move {
            client.write_all(b"POST /x HTTP/1.1\r\nContent-Le").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(b"ngth: 3\r\n\r\nab").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(b"c").await.unwrap();
            client
        });
        let request = conn.read_request().await.unwrap().unwrap();
        assert_eq!(request.path(), "/x");
        assert_eq!(request.body().as_ref(), b"abc");
        assert_eq!(conn.requests_served(), 1);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn keep_alive_cycle_then_idle_close() {
        let config = ConnectionConfig {
            keep_alive_timeout: Duration::from_millis(50),
            ..ConnectionConfig::default()
        };
        let (mut conn, mut client) = pair(config);

        for _ in 0..2 {
            client.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            let response = Response::text("hi").keep_alive(request.is_keep_alive());
            conn.write_response(response).await.unwrap();
            assert_eq!(conn.state(), ConnectionState::Connected);
            let response = read_response(&mut client).await;
            assert_eq!(response.body_as_str(), Some("hi"));
        }

        assert!(conn.read_request().await.unwrap().is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn connection_close_moves_to_closing() {
        let (mut conn, mut client) = pair(ConnectionConfig::default());
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let request = conn.read_request().await.unwrap().unwrap();
        conn.write_response(Response::ok().keep_alive(request.is_keep_alive()))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(!conn.is_keep_alive());
    }

    #[tokio::test]
    async fn server_side_keep_alive_disabled() {
        let config = ConnectionConfig {
            keep_alive: false,
            ..ConnectionConfig::default()
        };
        let (mut conn, mut client) = pair(config);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        conn.read_request().await.unwrap().unwrap();
        conn.write_response(Response::ok()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closing);
        let response = read_response(&mut client).await;
        assert!(!response.is_keep_alive());
    }

    #[tokio::test]
    async fn malformed_request_errors() {
        let (mut conn, mut client) = pair(ConnectionConfig::default());
        client.write_all(b"\x00\x01\x02\r\n\r\n").await.unwrap();
        let err = conn.read_request().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Request(_)));
        assert_eq!(conn.state(), ConnectionState::Closing);

        conn.write_response(Response::from_status(StatusCode::BadRequest))
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert_eq!(response.status(), StatusCode::BadRequest);
        assert!(!response.is_keep_alive());
    }

    #[tokio::test]
    async fn first_read_times_out() {
        let config = ConnectionConfig {
            read_timeout: Duration::from_millis(20),
            ..ConnectionConfig::default()
        };
        let (mut conn, _client) = pair(config);
        let err = conn.read_request().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn peer_close_between_requests() {
        let (mut conn, client) = pair(ConnectionConfig::default());
        drop(client);
        assert!(conn.read_request().await.unwrap().is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn lines_and_delimiters() {
        let (mut conn, mut client) = pair(ConnectionConfig::default());
        client.write_all(b"first\r\nsecond\nrest|tail").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "first");
        assert_eq!(conn.read_line().await.unwrap(), "second");
        assert_eq!(conn.read_until(b"|").await.unwrap().as_ref(), b"rest|");
        assert_eq!(conn.read_data(100).await.unwrap().as_ref(), b"tail");
    }

    #[tokio::test]
    async fn websocket_frames() {
        let (mut conn, mut client) = pair(ConnectionConfig::default());
        assert!(matches!(
            conn.receive_websocket_frame().await,
            Err(ConnectionError::WrongMode { .. })
        ));
        conn.upgrade_to_websocket(ParserConfig::server()).unwrap();
        assert!(conn.is_websocket());
        assert!(matches!(
            conn.read_request().await,
            Err(ConnectionError::WrongMode { .. })
        ));

        let wire = Frame::text("ping?").with_mask([1, 2, 3, 4]).to_bytes();
        client.write_all(&wire[..3]).await.unwrap();
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(&wire[3..]).await.unwrap();
            client
        });
        let frame = conn.receive_websocket_frame().await.unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"ping?");
        let mut client = sender.await.unwrap();

        conn.send_websocket_close(CloseCode::Normal, "done").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[0x88, 6]);
        assert_eq!(n, 8);
    }

    #[tokio::test]
    async fn oversized_control_frame_rejected_on_send() {
        let (mut conn, _client) = pair(ConnectionConfig::default());
        conn.upgrade_to_websocket(ParserConfig::server()).unwrap();
        let err = conn
            .send_websocket_ping(vec![0u8; 200])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(FrameError::ControlFrameTooLarge(200))));
    }

    #[tokio::test]
    async fn attributes_and_info() {
        let (mut conn, _client) = pair(ConnectionConfig::default());
        conn.set_attribute("user", "alice");
        conn.set_attribute("retries", 3_i64);
        assert!(conn.has_attribute("user"));
        assert_eq!(conn.attribute("retries"), Some(&Scalar::Int(3)));
        assert_eq!(conn.remove_attribute("user"), Some(Scalar::from("alice")));
        conn.set_compression(CompressionType::Gzip);

        let info = conn.info();
        assert_eq!(info["state"].as_str(), Some("connected"));
        assert_eq!(info["compression"].as_str(), Some("gzip"));
        assert_eq!(info["peer"].as_str(), Some("unknown"));

        conn.prepare_for_reuse();
        assert!(!conn.has_attribute("retries"));
    }

    #[tokio::test]
    async fn closed_connection_refuses_io() {
        let (mut conn, _client) = pair(ConnectionConfig::default());
        conn.close().await;
        assert!(matches!(
            conn.write_data(b"x").await,
            Err(ConnectionError::Closed)
        ));
        conn.force_close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn graceful_close_drains_peer() {
        let (mut conn, mut client) = pair(ConnectionConfig::default());
        let peer = tokio::spawn(async move {
            let mut buf = Vec::new();
            client.read_to_end(&mut buf).await.unwrap();
            drop(client);
        });
        conn.close_gracefully(Duration::from_secs(1)).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        peer.await.unwrap();
    }
}
