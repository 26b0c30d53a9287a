//! A message-level WebSocket endpoint over an upgraded [`Connection`].

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::frame::{CloseCode, Frame, FrameError, Opcode};
use super::handshake::{self, HandshakeError};
use super::parser::ParserConfig;
use crate::connection::{Connection, ConnectionConfig, ConnectionError, Transport};
use crate::context::Parameters;
use crate::http::{Request, Response};
use crate::stats::{Scalar, Snapshot};

/// Which end of the connection this session speaks for. Clients mask every frame
/// they send; servers never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// We sent a close frame and are waiting for the peer's.
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest assembled message, across all of its fragments.
    pub max_message_size: usize,
    /// Largest single frame payload.
    pub max_frame_size: usize,
    /// Answer pings automatically.
    pub auto_pong: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024,
            max_frame_size: 1024 * 1024,
            auto_pong: true,
        }
    }
}

impl SessionConfig {
    pub fn parser_config(&self, role: Role) -> ParserConfig {
        let config = match role {
            Role::Server => ParserConfig::server(),
            Role::Client => ParserConfig::client(),
        };
        config.with_max_payload_size(self.max_frame_size)
    }
}

/// One complete application message, or a control frame surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<(CloseCode, String)>),
}

impl Message {
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_payload(self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::from(text),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data,
            Self::Close(None) => Bytes::new(),
            Self::Close(Some((_, reason))) => Bytes::from(reason),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data.into())
    }
}

#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The peer broke the protocol; a close frame with the matching code was sent.
    #[error("protocol violation: {0}")]
    Protocol(FrameError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct SessionStats {
    messages_sent: u64,
    messages_received: u64,
    frames_sent: u64,
    frames_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    pings_received: u64,
    pongs_received: u64,
    protocol_errors: u64,
}

pub struct WebSocket {
    conn: Connection,
    role: Role,
    state: SessionState,
    config: SessionConfig,
    fragments: Option<(Opcode, BytesMut)>,
    protocol: Option<String>,
    request: Option<Request>,
    params: Parameters,
    close_override: Option<CloseCode>,
    stats: SessionStats,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("connection", &self.conn.id())
            .field("role", &self.role)
            .field("state", &self.state)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl WebSocket {
    /// Wraps `conn`, upgrading it to frame mode if that has not happened yet.
    pub fn new(
        mut conn: Connection,
        role: Role,
        config: SessionConfig,
    ) -> Result<Self, WebSocketError> {
        if !conn.is_websocket() {
            conn.upgrade_to_websocket(config.parser_config(role))?;
        }
        Ok(Self {
            conn,
            role,
            state: SessionState::Open,
            config,
            fragments: None,
            protocol: None,
            request: None,
            params: Parameters::new(),
            close_override: None,
            stats: SessionStats::default(),
        })
    }

    /// Performs the client side of the opening handshake over `stream`.
    pub async fn connect(
        stream: impl Transport,
        uri: &str,
        host: &str,
        protocols: &[&str],
        config: SessionConfig,
    ) -> Result<Self, WebSocketError> {
        let mut conn = Connection::new(stream, ConnectionConfig::default());
        let key = handshake::generate_key();
        let request = handshake::client_request(uri, host, &key, protocols);
        conn.write_data(&request.to_bytes()).await?;

        let head = conn.read_until(b"\r\n\r\n").await?;
        let (response, _) = Response::parse(&head).map_err(ConnectionError::from)?;
        handshake::verify_accept(&key, &response)?;
        let protocol = response.get_header("sec-websocket-protocol").map(str::to_owned);

        let mut socket = Self::new(conn, Role::Client, config)?;
        socket.protocol = protocol;
        socket.request = Some(request);
        debug!(uri, "WebSocket client connected");
        Ok(socket)
    }

    /// Attaches the upgrade request and the route parameters it matched.
    #[must_use]
    pub fn with_request(mut self, request: Request, params: Parameters) -> Self {
        self.request = Some(request);
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: Option<String>) -> Self {
        self.protocol = protocol;
        self
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// The negotiated subprotocol, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// The request that opened the session.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Replaces the code echoed back when the peer initiates the close handshake.
    pub fn set_close_code_override(&mut self, code: Option<CloseCode>) {
        self.close_override = code;
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.conn.set_attribute(name, value);
    }

    pub fn attribute(&self, name: &str) -> Option<&Scalar> {
        self.conn.attribute(name)
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Scalar> {
        self.conn.remove_attribute(name)
    }

    pub fn statistics(&self) -> Snapshot {
        let s = &self.stats;
        let mut snap = Snapshot::new();
        snap.insert("connection_id".into(), self.conn.id().as_u64().into());
        snap.insert("state".into(), format!("{:?}", self.state).to_lowercase().into());
        snap.insert("messages_sent".into(), s.messages_sent.into());
        snap.insert("messages_received".into(), s.messages_received.into());
        snap.insert("frames_sent".into(), s.frames_sent.into());
        snap.insert("frames_received".into(), s.frames_received.into());
        snap.insert("bytes_sent".into(), s.bytes_sent.into());
        snap.insert("bytes_received".into(), s.bytes_received.into());
        snap.insert("pings_received".into(), s.pings_received.into());
        snap.insert("pongs_received".into(), s.pongs_received.into());
        snap.insert("protocol_errors".into(), s.protocol_errors.into());
        if let Some(parser) = self.conn.websocket_statistics() {
            crate::stats::merge_prefixed(&mut snap, "parser", parser);
        }
        snap
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    pub async fn send(&mut self, message: impl Into<Message>) -> Result<(), WebSocketError> {
        match message.into() {
            Message::Text(text) => self.send_text(text).await,
            Message::Binary(data) => self.send_binary(data).await,
            Message::Ping(data) => self.send_ping(data).await,
            Message::Pong(data) => self.send_pong(data).await,
            Message::Close(None) => self.close_with(None, "").await,
            Message::Close(Some((code, reason))) => self.close(code, &reason).await,
        }
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), WebSocketError> {
        self.send_frame(Frame::text(text)).await?;
        self.stats.messages_sent += 1;
        Ok(())
    }

    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<(), WebSocketError> {
        self.send_frame(Frame::binary(data)).await?;
        self.stats.messages_sent += 1;
        Ok(())
    }

    /// Sends `data` as a fragmented binary message of `chunk`-byte frames.
    pub async fn send_fragmented(
        &mut self,
        data: impl Into<Bytes>,
        chunk: usize,
    ) -> Result<(), WebSocketError> {
        let data = data.into();
        let chunk = chunk.max(1);
        if data.len() <= chunk {
            return self.send_binary(data).await;
        }
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk).min(data.len());
            let piece = data.slice(offset..end);
            let last = end == data.len();
            let frame = if offset == 0 {
                Frame::binary(piece).with_fin(false)
            } else {
                Frame::continuation(piece, last)
            };
            self.send_frame(frame).await?;
            offset = end;
        }
        self.stats.messages_sent += 1;
        Ok(())
    }

    pub async fn send_ping(&mut self, payload: impl Into<Bytes>) -> Result<(), WebSocketError> {
        self.send_frame(Frame::ping(payload)).await
    }

    pub async fn send_pong(&mut self, payload: impl Into<Bytes>) -> Result<(), WebSocketError> {
        self.send_frame(Frame::pong(payload)).await
    }

    /// Starts the close handshake. The session stays readable until the peer's
    /// close frame arrives.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        self.close_with(Some(code), reason).await
    }

    async fn close_with(&mut self, code: Option<CloseCode>, reason: &str) -> Result<(), WebSocketError> {
        if self.state != SessionState::Open {
            return Err(WebSocketError::Closed);
        }
        self.send_frame(Frame::close(code, reason)).await?;
        self.state = SessionState::Closing;
        debug!(connection_id = %self.conn.id(), code = ?code, "close handshake started");
        Ok(())
    }

    /// Completes the session: starts the close handshake if nobody has, then waits up
    /// to `timeout` for the peer's close frame before closing the connection.
    pub async fn finish(&mut self, code: CloseCode, timeout: Duration) {
        if self.state == SessionState::Open && self.close(code, "").await.is_err() {
            self.terminate().await;
            return;
        }
        if self.state == SessionState::Closing {
            let drain = async {
                loop {
                    match self.receive().await {
                        Ok(Some(_)) if self.state == SessionState::Closing => {}
                        _ => break,
                    }
                }
            };
            if tokio::time::timeout(timeout, drain).await.is_err() {
                trace!(connection_id = %self.conn.id(), "peer did not answer close");
            }
        }
        self.terminate().await;
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), WebSocketError> {
        if self.state == SessionState::Closed {
            return Err(WebSocketError::Closed);
        }
        if self.state == SessionState::Closing && !frame.is_control() {
            return Err(WebSocketError::Closed);
        }
        let frame = match self.role {
            Role::Client => frame.with_random_mask(),
            Role::Server => frame,
        };
        let len = frame.payload.len() as u64;
        self.conn.send_websocket_frame(&frame).await?;
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += len;
        Ok(())
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Waits for the next message.
    ///
    /// Fragments are reassembled; pings are answered when auto-pong is on and are
    /// still returned. A close frame completes the close handshake and is returned
    /// as [`Message::Close`]; after that, and when the peer disconnects, `Ok(None)`.
    pub async fn receive(&mut self) -> Result<Option<Message>, WebSocketError> {
        loop {
            if self.state == SessionState::Closed {
                return Ok(None);
            }
            let frame = match self.conn.receive_websocket_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(connection_id = %self.conn.id(), "peer disconnected without close");
                    self.state = SessionState::Closed;
                    return Ok(None);
                }
                Err(ConnectionError::Protocol(err)) => return Err(self.fail(err).await),
                Err(err) => {
                    self.state = SessionState::Closed;
                    return Err(err.into());
                }
            };
            self.stats.frames_received += 1;
            self.stats.bytes_received += frame.payload.len() as u64;

            match frame.opcode {
                Opcode::Ping => {
                    self.stats.pings_received += 1;
                    if self.config.auto_pong && self.state == SessionState::Open {
                        self.send_pong(frame.payload.clone()).await?;
                    }
                    return Ok(Some(Message::Ping(frame.payload)));
                }
                Opcode::Pong => {
                    self.stats.pongs_received += 1;
                    return Ok(Some(Message::Pong(frame.payload)));
                }
                Opcode::Close => return self.on_close(&frame).await.map(Some),
                Opcode::Text | Opcode::Binary if frame.fin => {
                    let message = self.complete(frame.opcode, frame.payload).await?;
                    return Ok(Some(message));
                }
                Opcode::Text | Opcode::Binary => {
                    if self.fragments.is_some() {
                        return Err(self.fail(FrameError::InterleavedDataFrame).await);
                    }
                    self.check_size(frame.payload.len()).await?;
                    self.fragments = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
                Opcode::Continuation => {
                    let Some((opcode, mut buffer)) = self.fragments.take() else {
                        return Err(self.fail(FrameError::UnexpectedContinuation).await);
                    };
                    self.check_size(buffer.len() + frame.payload.len()).await?;
                    buffer.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let message = self.complete(opcode, buffer.freeze()).await?;
                        return Ok(Some(message));
                    }
                    self.fragments = Some((opcode, buffer));
                }
            }
        }
    }

    async fn on_close(&mut self, frame: &Frame) -> Result<Message, WebSocketError> {
        let payload = match frame.close_payload() {
            Ok(payload) => payload,
            Err(err) => return Err(self.fail(err).await),
        };
        if self.state == SessionState::Open {
            let code = self
                .close_override
                .or_else(|| payload.as_ref().map(|(code, _)| *code));
            let reply = match code {
                Some(code) if code.is_sendable() => Frame::close(Some(code), ""),
                Some(_) => Frame::close(Some(CloseCode::Normal), ""),
                None => Frame::close(None, ""),
            };
            if let Err(err) = self.send_frame(reply).await {
                trace!(error = %err, "could not echo close frame");
            }
        }
        debug!(connection_id = %self.conn.id(), close = ?payload, "close handshake complete");
        self.terminate().await;
        Ok(Message::Close(payload))
    }

    async fn complete(&mut self, opcode: Opcode, payload: Bytes) -> Result<Message, WebSocketError> {
        self.check_size(payload.len()).await?;
        self.stats.messages_received += 1;
        if opcode == Opcode::Binary {
            return Ok(Message::Binary(payload));
        }
        match String::from_utf8(payload.to_vec()) {
            Ok(text) => Ok(Message::Text(text)),
            Err(_) => Err(self.fail(FrameError::InvalidUtf8).await),
        }
    }

    async fn check_size(&mut self, size: usize) -> Result<(), WebSocketError> {
        let max = self.config.max_message_size;
        if size > max {
            return Err(self.fail(FrameError::MessageTooLarge { size, max }).await);
        }
        Ok(())
    }

    /// Answers a protocol violation with the matching close code and drops the
    /// connection.
    async fn fail(&mut self, err: FrameError) -> WebSocketError {
        warn!(connection_id = %self.conn.id(), error = %err, "WebSocket protocol error");
        self.stats.protocol_errors += 1;
        self.fragments = None;
        if self.state != SessionState::Closed {
            let frame = Frame::close(Some(err.close_code()), "");
            let frame = match self.role {
                Role::Client => frame.with_random_mask(),
                Role::Server => frame,
            };
            if let Err(e) = self.conn.send_websocket_frame(&frame).await {
                trace!(error = %e, "could not send close frame");
            }
        }
        self.terminate().await;
        WebSocketError::Protocol(err)
    }

    async fn terminate(&mut self) {
        self.state = SessionState::Closed;
        self.fragments = None;
        self.conn.close().await;
    }
}
