//! The HTTP upgrade handshake (RFC 6455 §4).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::{Method, Request, Response, StatusCode};

/// Appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken.
pub const SUPPORTED_VERSION: &str = "13";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("WebSocket upgrade requires GET, got {0}")]
    InvalidMethod(String),

    #[error("missing or invalid Upgrade header")]
    MissingUpgrade,

    #[error("Connection header does not contain 'Upgrade'")]
    MissingConnectionUpgrade,

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Sec-WebSocket-Key must be base64 of 16 bytes")]
    InvalidKey,

    #[error("missing Sec-WebSocket-Version header")]
    MissingVersion,

    #[error("unsupported WebSocket version {0:?}")]
    UnsupportedVersion(String),

    #[error("server answered with status {0} instead of 101")]
    UnexpectedStatus(u16),

    #[error("Sec-WebSocket-Accept does not match the key")]
    InvalidAccept,
}

impl HandshakeError {
    /// Status for the rejection response: `426` for a version mismatch, `400` otherwise.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedVersion(_) | Self::MissingVersion => StatusCode::UpgradeRequired,
            _ => StatusCode::BadRequest,
        }
    }

    /// The response a server sends when refusing the upgrade.
    pub fn to_response(&self) -> Response {
        let response = Response::new(self.status())
            .body(self.to_string())
            .keep_alive(false);
        if self.status() == StatusCode::UpgradeRequired {
            response.header("Sec-WebSocket-Version", SUPPORTED_VERSION)
        } else {
            response
        }
    }
}

/// `base64(SHA-1(key ++ GUID))`.
///
/// # Examples
///
/// ```
/// use kiln::websocket::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Splits a comma-separated header into trimmed, non-empty items.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// The first client-offered subprotocol the server also supports.
pub fn select_protocol(client: &[String], server: &[String]) -> Option<String> {
    client
        .iter()
        .find(|offered| server.iter().any(|s| s.eq_ignore_ascii_case(offered.as_str())))
        .cloned()
}

/// Checks the upgrade request and returns the client's key.
pub fn validate(request: &Request) -> Result<&str, HandshakeError> {
    if request.method() != &Method::Get {
        return Err(HandshakeError::InvalidMethod(request.method().to_string()));
    }
    let headers = request.headers();
    if !headers.has_token("upgrade", "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !headers.has_token("connection", "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    let version = headers
        .get("sec-websocket-version")
        .ok_or(HandshakeError::MissingVersion)?;
    if version.trim() != SUPPORTED_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version.to_owned()));
    }

    let key = headers
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)?;
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => Ok(key),
        _ => Err(HandshakeError::InvalidKey),
    }
}

/// A successful negotiation, ready to be turned into the `101` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub accept_key: String,
    pub protocol: Option<String>,
}

impl Accepted {
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(StatusCode::SwitchingProtocols)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", self.accept_key.as_str());
        if let Some(protocol) = &self.protocol {
            response.add_header("Sec-WebSocket-Protocol", protocol.as_str());
        }
        response
    }
}

/// Validates `request` and negotiates a subprotocol against what the server supports.
///
/// Offered extensions are declined: no frame codec for them exists, so the reply
/// never carries `Sec-WebSocket-Extensions` and the peer must leave RSV1-3 clear.
pub fn accept(request: &Request, protocols: &[String]) -> Result<Accepted, HandshakeError> {
    let key = validate(request)?;
    let offered_protocols = request
        .header("sec-websocket-protocol")
        .map(parse_list)
        .unwrap_or_default();

    Ok(Accepted {
        accept_key: compute_accept_key(key),
        protocol: select_protocol(&offered_protocols, protocols),
    })
}

// ── Client side ──────────────────────────────────────────────────────────────

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Builds a client upgrade request for `uri` on `host`.
pub fn client_request(uri: &str, host: &str, key: &str, protocols: &[&str]) -> Request {
    let request = Request::new(Method::Get, uri)
        .with_header("Host", host)
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Key", key)
        .with_header("Sec-WebSocket-Version", SUPPORTED_VERSION);
    if protocols.is_empty() {
        request
    } else {
        request.with_header("Sec-WebSocket-Protocol", protocols.join(", "))
    }
}

/// Checks a server's answer to a request sent with `key`.
pub fn verify_accept(key: &str, response: &Response) -> Result<(), HandshakeError> {
    if response.status() != StatusCode::SwitchingProtocols {
        return Err(HandshakeError::UnexpectedStatus(response.status().as_u16()));
    }
    if !response.headers().has_token("upgrade", "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    match response.get_header("sec-websocket-accept") {
        Some(accept) if accept.trim() == compute_accept_key(key) => Ok(()),
        _ => Err(HandshakeError::InvalidAccept),
    }
}
