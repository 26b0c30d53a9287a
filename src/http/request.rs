//! HTTP/1.1 request parsing using the [`httparse`] crate.
//!
//! The head is parsed by `httparse`; the body is framed here from either
//! `Transfer-Encoding: chunked` or `Content-Length`. A request carrying neither has an
//! empty body.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::OnceLock;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::cookie::parse_cookie_header;
use super::url::{UriParts, parse_query, split_uri};
use super::{Headers, Method, StatusCode, Version};

/// Size limits enforced while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted request head (request line plus headers), in bytes.
    pub max_header_size: usize,
    /// Largest accepted decoded body, in bytes.
    pub max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_size: 8 * 1024,
            max_body_size: 1024 * 1024,
        }
    }
}

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request head exceeds maximum allowed size of {max_bytes} bytes")]
    HeaderTooLarge { max_bytes: usize },

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },

    #[error("invalid Content-Length: {value:?}")]
    InvalidContentLength { value: String },

    #[error("malformed chunked body")]
    InvalidChunk,

    #[error("header {name:?} is not valid UTF-8")]
    InvalidHeaderValue { name: String },

    #[error("unsupported HTTP version")]
    UnsupportedVersion,
}

impl RequestError {
    /// The status code a server should answer with when parsing fails this way.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::HeaderTooLarge { .. } => StatusCode::RequestHeaderFieldsTooLarge,
            Self::BodyTooLarge { .. } => StatusCode::PayloadTooLarge,
            Self::UnsupportedVersion => StatusCode::HttpVersionNotSupported,
            _ => StatusCode::BadRequest,
        }
    }
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer. Header names are stored
/// lower-cased. Path, query parameters and cookies are derived from the raw request
/// on first access and cached.
///
/// # Examples
///
/// ```
/// use kiln::http::{Limits, Request};
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, consumed) = Request::parse(raw, &Limits::default()).unwrap();
///
/// assert_eq!(consumed, raw.len());
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: String,
    version: Version,
    headers: Headers,
    body: Bytes,
    peer_addr: Option<SocketAddr>,
    parts: OnceLock<UriParts>,
    query: OnceLock<HashMap<String, String>>,
    cookies: OnceLock<Vec<(String, String)>>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Builds a request by hand, mainly for tests and client code.
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Bytes::new(),
            peer_addr: None,
            parts: OnceLock::new(),
            query: OnceLock::new(),
            cookies: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value);
        self.cookies = OnceLock::new();
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Parses one complete request from the front of `buf`.
    ///
    /// Returns the request and the number of bytes it occupied, so pipelined leftovers
    /// can be kept for the next call.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the head or the body is not fully buffered yet.
    /// - [`RequestError::HeaderTooLarge`] / [`RequestError::BodyTooLarge`]: a limit was hit.
    /// - Any other variant: the data is malformed.
    pub fn parse(buf: &[u8], limits: &Limits) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let head_len = match raw.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial if buf.len() > limits.max_header_size => {
                return Err(RequestError::HeaderTooLarge {
                    max_bytes: limits.max_header_size,
                });
            }
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };
        if head_len > limits.max_header_size {
            return Err(RequestError::HeaderTooLarge {
                max_bytes: limits.max_header_size,
            });
        }

        let method: Method = raw
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
            .unwrap_or_else(|never| match never {});
        let uri = raw
            .path
            .ok_or(RequestError::MissingField { field: "path" })?
            .to_owned();
        let version = raw
            .version
            .ok_or(RequestError::MissingField { field: "version" })
            .and_then(|minor| Version::from_minor(minor).ok_or(RequestError::UnsupportedVersion))?;

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            let value = std::str::from_utf8(header.value).map_err(|_| {
                RequestError::InvalidHeaderValue {
                    name: header.name.to_owned(),
                }
            })?;
            header_map.insert(header.name.to_ascii_lowercase(), value.trim());
        }

        let rest = &buf[head_len..];
        let (body, body_len) = if header_map.has_token("transfer-encoding", "chunked") {
            decode_chunked(rest, limits.max_body_size)?
        } else if let Some(value) = header_map.get("content-length") {
            let length: usize = value
                .trim()
                .parse()
                .map_err(|_| RequestError::InvalidContentLength {
                    value: value.to_owned(),
                })?;
            if length > limits.max_body_size {
                return Err(RequestError::BodyTooLarge {
                    max_bytes: limits.max_body_size,
                });
            }
            if rest.len() < length {
                return Err(RequestError::Incomplete);
            }
            (Bytes::copy_from_slice(&rest[..length]), length)
        } else {
            (Bytes::new(), 0)
        };

        let mut request = Self::new(method, uri).with_version(version);
        request.headers = header_map;
        request.body = body;
        Ok((request, head_len + body_len))
    }

    /// Serializes the request in HTTP/1.1 wire format. Adds `Content-Length` when the
    /// body is non-empty and no framing header was set.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64 + self.headers.len() * 32 + self.body.len());
        buf.put(format!("{} {} {}\r\n", self.method, self.uri, self.version).as_bytes());
        self.headers.write_to(&mut buf);
        let framed =
            self.headers.contains("content-length") || self.headers.contains("transfer-encoding");
        if !self.body.is_empty() && !framed {
            buf.put(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.as_ref());
        buf
    }

    // ── Request line ─────────────────────────────────────────────────────────

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request target as it appeared on the request line.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    fn parts(&self) -> &UriParts {
        self.parts.get_or_init(|| split_uri(&self.uri))
    }

    /// The percent-decoded path, without query or fragment.
    pub fn path(&self) -> &str {
        &self.parts().path
    }

    /// The raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.parts().query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.parts().fragment.as_deref()
    }

    /// All decoded query parameters.
    pub fn query_params(&self) -> &HashMap<String, String> {
        self.query
            .get_or_init(|| self.query_string().map(parse_query).unwrap_or_default())
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params().get(key).map(String::as_str)
    }

    /// Query parameters merged with an `application/x-www-form-urlencoded` body.
    /// Body values win over query values with the same key.
    pub fn form_params(&self) -> HashMap<String, String> {
        let mut params = self.query_params().clone();
        let is_form = self
            .content_type()
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if is_form {
            if let Some(body) = self.body_as_str() {
                params.extend(parse_query(body));
            }
        }
        params
    }

    // ── Headers ──────────────────────────────────────────────────────────────

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn authorization(&self) -> Option<&str> {
        self.header("authorization")
    }

    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }

    /// The value of `Content-Length` parsed as a `usize`, if present and valid.
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present. HTTP/1.0
    /// defaults to close unless `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }

    /// `true` when the request asks to switch to the WebSocket protocol.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == Method::Get
            && self.headers.has_token("upgrade", "websocket")
            && self.headers.has_token("connection", "upgrade")
    }

    /// Cookies sent in `Cookie:` headers, in order.
    pub fn cookies(&self) -> &[(String, String)] {
        self.cookies.get_or_init(|| {
            self.headers
                .get_all("cookie")
                .flat_map(parse_cookie_header)
                .collect()
        })
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    // ── Body ─────────────────────────────────────────────────────────────────

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as UTF-8, or `None` if it is not valid UTF-8.
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Deserializes a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    // ── Transport metadata ───────────────────────────────────────────────────

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = Some(addr);
    }
}

/// Decodes a chunked body at the front of `buf`. Returns the body and the number of
/// bytes consumed, including the terminating chunk and any trailers.
pub(super) fn decode_chunked(buf: &[u8], max_body: usize) -> Result<(Bytes, usize), RequestError> {
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let (line_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(found)) => found,
            Ok(httparse::Status::Partial) => return Err(RequestError::Incomplete),
            Err(_) => return Err(RequestError::InvalidChunk),
        };
        pos += line_len;

        if size == 0 {
            break;
        }
        let size = usize::try_from(size).map_err(|_| RequestError::BodyTooLarge {
            max_bytes: max_body,
        })?;
        if body.len().saturating_add(size) > max_body {
            return Err(RequestError::BodyTooLarge {
                max_bytes: max_body,
            });
        }
        let end = pos + size;
        if buf.len() < end + 2 {
            return Err(RequestError::Incomplete);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(RequestError::InvalidChunk);
        }
        body.put(&buf[pos..end]);
        pos = end + 2;
    }

    // Trailer section: header lines up to an empty line.
    loop {
        let Some(line_end) = buf[pos..].windows(2).position(|w| w == b"\r\n") else {
            return Err(RequestError::Incomplete);
        };
        pos += line_end + 2;
        if line_end == 0 {
            break;
        }
    }

    Ok((body.freeze(), pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<(Request, usize), RequestError> {
        Request::parse(raw, &Limits::default())
    }

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, consumed) = parse(raw).unwrap();
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.host(), Some("localhost"));
        assert_eq!(consumed, raw.len());
        assert!(req.body().is_empty());
    }

    #[test]
    fn header_names_are_lowercased_and_values_trimmed() {
        let raw = b"GET / HTTP/1.1\r\nX-Thing:   spaced  \r\n\r\n";
        let (req, _) = parse(raw).unwrap();
        let names: Vec<_> = req.headers().iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["x-thing"]);
        assert_eq!(req.header("X-THING"), Some("spaced"));
    }

    #[test]
    fn parse_query_and_fragment() {
        let raw = b"GET /search%20all?q=rust+lang&page=2#res HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (req, _) = parse(raw).unwrap();
        assert_eq!(req.path(), "/search all");
        assert_eq!(req.query_string(), Some("q=rust+lang&page=2"));
        assert_eq!(req.query_param("q"), Some("rust lang"));
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.fragment(), Some("res"));
    }

    #[test]
    fn incomplete_head() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn incomplete_body_waits_for_more() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello";
        assert!(matches!(parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn no_length_means_empty_body() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: a\r\n\r\nleftover";
        let (req, consumed) = parse(raw).unwrap();
        assert!(req.body().is_empty());
        assert_eq!(&raw[consumed..], b"leftover");
    }

    #[test]
    fn content_length_body() {
        let raw = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhelloGET";
        let (req, consumed) = parse(raw).unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(req.body().as_ref(), b"hello");
        assert_eq!(&raw[consumed..], b"GET");
    }

    #[test]
    fn chunked_body_with_trailer() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let (req, consumed) = parse(raw).unwrap();
        assert!(req.is_chunked());
        assert_eq!(req.body().as_ref(), b"hello world");
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 100\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n";
        let (req, _) = parse(raw).unwrap();
        assert_eq!(req.body().as_ref(), b"ok");
    }

    #[test]
    fn chunked_partial_is_incomplete() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel";
        assert!(matches!(parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn malformed_chunk() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nokXX0\r\n\r\n";
        let err = parse(raw).unwrap_err();
        assert!(matches!(err, RequestError::InvalidChunk));
        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    #[test]
    fn bad_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n";
        assert!(matches!(
            parse(raw),
            Err(RequestError::InvalidContentLength { .. })
        ));
    }

    #[test]
    fn body_limit() {
        let limits = Limits {
            max_header_size: 1024,
            max_body_size: 4,
        };
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let err = Request::parse(raw, &limits).unwrap_err();
        assert_eq!(err.status(), StatusCode::PayloadTooLarge);
    }

    #[test]
    fn header_limit() {
        let limits = Limits {
            max_header_size: 32,
            max_body_size: 1024,
        };
        let raw = b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        let err = Request::parse(raw, &limits).unwrap_err();
        assert_eq!(err.status(), StatusCode::RequestHeaderFieldsTooLarge);

        let partial = b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        assert!(matches!(
            Request::parse(partial, &limits),
            Err(RequestError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse(b"\x01\x02 nonsense\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    #[test]
    fn keep_alive_rules() {
        let (req, _) = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());
        let (req, _) = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
        let (req, _) = parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
        let (req, _) = parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());
    }

    #[test]
    fn websocket_upgrade_detection() {
        let raw = b"GET /ws HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\n\r\n";
        let (req, _) = parse(raw).unwrap();
        assert!(req.is_websocket_upgrade());
    }

    #[test]
    fn cookies_and_form() {
        let req = Request::new(Method::Post, "/login?next=%2Fhome")
            .with_header("Cookie", "a=1; b=two")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body("user=j+doe&next=%2Fdash");
        assert_eq!(req.cookie("b"), Some("two"));
        assert_eq!(req.cookies().len(), 2);
        let form = req.form_params();
        assert_eq!(form.get("user").map(String::as_str), Some("j doe"));
        assert_eq!(form.get("next").map(String::as_str), Some("/dash"));
        assert_eq!(req.query_param("next"), Some("/home"));
    }

    #[test]
    fn json_body() {
        #[derive(serde::Deserialize)]
        struct Payload {
            id: u32,
        }
        let req = Request::new(Method::Post, "/").with_body(r#"{"id": 7}"#);
        assert_eq!(req.json::<Payload>().unwrap().id, 7);
    }

    #[test]
    fn serialized_request_parses_back() {
        let req = Request::new(Method::Put, "/items/3")
            .with_header("Host", "example.com")
            .with_body("payload");
        let bytes = req.to_bytes();
        let (parsed, consumed) = parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.method(), &Method::Put);
        assert_eq!(parsed.path(), "/items/3");
        assert_eq!(parsed.body().as_ref(), b"payload");
    }
}
