//! Responses: a consuming builder, HTTP/1.1 serialization, and a client-side parser.
//!
//! The server fills in `Server`, `Date` and `Connection` when the application did not
//! set them.

use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::cookie::Cookie;
use super::request::{RequestError, decode_chunked};
use super::{Headers, StatusCode, Version};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// An outgoing (or, via [`Response::parse`], incoming) HTTP/1.x response.
///
/// Framing headers are derived when the response is serialized: `Content-Length`
/// from the body, or `Transfer-Encoding: chunked` if [`chunked`](Self::chunked) was
/// requested.
///
/// ```
/// use kiln::http::{Response, StatusCode};
///
/// let wire = Response::new(StatusCode::Created)
///     .header("Location", "/users/7")
///     .body("created")
///     .keep_alive(false)
///     .into_bytes();
/// let text = String::from_utf8_lossy(&wire);
///
/// assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
/// assert!(text.contains("Content-Length: 7\r\n"));
/// assert!(text.contains("Connection: close\r\n"));
/// assert!(text.ends_with("\r\n\r\ncreated"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: Headers,
    cookies: Vec<Cookie>,
    body: Bytes,
    keep_alive: bool,
    chunked: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::Http11,
            headers: Headers::new(),
            cookies: Vec::new(),
            body: Bytes::new(),
            keep_alive: true,
            chunked: false,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok)
    }

    pub fn text(body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::with_type(TEXT_PLAIN, body.into())
    }

    pub fn html(body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::with_type("text/html; charset=utf-8", body.into())
    }

    /// `200 OK` carrying `value` as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::with_type("application/json", serde_json::to_vec(value)?.into()))
    }

    /// `302 Found` pointing at `location`.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new(StatusCode::Found).header("Location", location)
    }

    pub fn not_found() -> Self {
        Self::from_status(StatusCode::NotFound)
    }

    pub fn internal_error() -> Self {
        Self::from_status(StatusCode::InternalServerError)
    }

    /// A response whose body is the status's reason phrase.
    pub fn from_status(status: StatusCode) -> Self {
        Self::new(status).body(status.canonical_reason())
    }

    fn with_type(content_type: &str, body: Bytes) -> Self {
        Self::ok().header("Content-Type", content_type).body(body)
    }

    // ── Builder ──────────────────────────────────────────────────────────────

    /// Adds a header, keeping earlier values of the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Chooses between `Connection: keep-alive` and `Connection: close`. An explicit
    /// `Connection` header wins over both.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Frames the body with `Transfer-Encoding: chunked` instead of `Content-Length`.
    #[must_use]
    pub fn chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }

    #[must_use]
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    // ── In-place edits, for middleware decorating a downstream response ─────

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Adds `Server` and `Date` unless the application already set them.
    pub fn apply_defaults(&mut self, server_name: &str) {
        if !self.headers.contains("server") {
            self.headers.insert("Server", server_name);
        }
        if !self.headers.contains("date") {
            let now = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
            self.headers.insert("Date", now.to_string());
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body_ref(&self) -> &Bytes {
        &self.body
    }

    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// A response is complete once it has a body, or when its status forbids one.
    pub fn is_complete(&self) -> bool {
        !self.body.is_empty() || self.status.forbids_body()
    }

    // ── Wire format ──────────────────────────────────────────────────────────

    /// Settles the framing, connection and content-type headers.
    fn frame(&mut self) {
        if self.status.forbids_body() {
            self.body.clear();
            self.chunked = false;
            self.headers.remove("content-length");
            self.headers.remove("transfer-encoding");
        } else if self.chunked {
            self.headers.remove("content-length");
            self.headers.set("Transfer-Encoding", "chunked");
        } else {
            self.headers.set("Content-Length", self.body.len().to_string());
        }

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers.insert("Content-Type", TEXT_PLAIN);
        }
        if !self.headers.contains("connection") {
            let token = if self.keep_alive { "keep-alive" } else { "close" };
            self.headers.insert("Connection", token);
        }
    }

    /// Serializes the status line, headers (one `Set-Cookie` line per cookie) and
    /// the framed body.
    pub fn into_bytes(mut self) -> BytesMut {
        self.frame();

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 48 + self.body.len());
        // Writing into a BytesMut cannot fail.
        let _ = write!(buf, "{} {}\r\n", self.version, self.status);
        self.headers.write_to(&mut buf);
        for cookie in &self.cookies {
            let _ = write!(buf, "Set-Cookie: {cookie}\r\n");
        }
        buf.put_slice(b"\r\n");

        if self.chunked {
            if !self.body.is_empty() {
                let _ = write!(buf, "{:x}\r\n", self.body.len());
                buf.put_slice(&self.body);
                buf.put_slice(b"\r\n");
            }
            buf.put_slice(b"0\r\n\r\n");
        } else {
            buf.put_slice(&self.body);
        }
        buf
    }

    /// Parses a serialized response from the front of `buf`, the way a client would.
    ///
    /// Without `Content-Length` or chunked framing the body is empty. `Set-Cookie`
    /// lines stay ordinary headers.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut slots = [httparse::EMPTY_HEADER; 64];
        let mut raw = httparse::Response::new(&mut slots);
        let head_len = match raw.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let status = raw
            .code
            .and_then(StatusCode::from_u16)
            .ok_or(RequestError::MissingField { field: "status" })?;
        let version = raw
            .version
            .and_then(Version::from_minor)
            .ok_or(RequestError::UnsupportedVersion)?;

        let mut response = Self::new(status).version(version);
        for header in raw.headers.iter() {
            let value = std::str::from_utf8(header.value).map_err(|_| {
                RequestError::InvalidHeaderValue {
                    name: header.name.to_owned(),
                }
            })?;
            response.headers.insert(header.name, value.trim());
        }
        response.keep_alive = !response.headers.has_token("connection", "close");

        let rest = &buf[head_len..];
        let body_len = if response.headers.has_token("transfer-encoding", "chunked") {
            let (body, used) = decode_chunked(rest, usize::MAX)?;
            response.chunked = true;
            response.body = body;
            used
        } else {
            let length = match response.headers.get("content-length") {
                None => 0,
                Some(value) => value.parse().map_err(|_| RequestError::InvalidContentLength {
                    value: value.to_owned(),
                })?,
            };
            if rest.len() < length {
                return Err(RequestError::Incomplete);
            }
            response.body = Bytes::copy_from_slice(&rest[..length]);
            length
        };
        Ok((response, head_len + body_len))
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::ok()
    }
}

impl From<StatusCode> for Response {
    fn from(status: StatusCode) -> Self {
        Self::from_status(status)
    }
}
