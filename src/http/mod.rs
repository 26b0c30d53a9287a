//! HTTP/1.1 codec: request parsing, response serialization and the types they share.
//!
//! Request parsing is incremental. [`Request::parse`] returns
//! [`RequestError::Incomplete`] until the head *and* the body (fixed-length or chunked)
//! are fully buffered, so callers keep appending bytes and retry.

use std::fmt;
use std::str::FromStr;

pub mod cookie;
pub mod headers;
pub mod request;
pub mod response;
pub mod url;

pub use cookie::{Cookie, SameSite};
pub use headers::Headers;
pub use request::{Limits, Request, RequestError};
pub use response::Response;

macro_rules! status_codes {
    ($($code:literal $name:ident $reason:literal,)+) => {
        /// An HTTP response status code.
        ///
        /// ```
        /// use kiln::http::StatusCode;
        ///
        /// assert_eq!(StatusCode::from_u16(426), Some(StatusCode::UpgradeRequired));
        /// assert_eq!(StatusCode::Ok.canonical_reason(), "OK");
        /// assert!(StatusCode::NoContent.forbids_body());
        /// ```
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum StatusCode {
            $($name = $code,)+
        }

        impl StatusCode {
            /// Looks up a known status code by number.
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)+
                    _ => None,
                }
            }

            pub fn canonical_reason(self) -> &'static str {
                match self {
                    $(Self::$name => $reason,)+
                }
            }
        }
    };
}

status_codes! {
    100 Continue "Continue",
    101 SwitchingProtocols "Switching Protocols",
    200 Ok "OK",
    201 Created "Created",
    202 Accepted "Accepted",
    204 NoContent "No Content",
    206 PartialContent "Partial Content",
    301 MovedPermanently "Moved Permanently",
    302 Found "Found",
    303 SeeOther "See Other",
    304 NotModified "Not Modified",
    307 TemporaryRedirect "Temporary Redirect",
    308 PermanentRedirect "Permanent Redirect",
    400 BadRequest "Bad Request",
    401 Unauthorized "Unauthorized",
    403 Forbidden "Forbidden",
    404 NotFound "Not Found",
    405 MethodNotAllowed "Method Not Allowed",
    408 RequestTimeout "Request Timeout",
    409 Conflict "Conflict",
    410 Gone "Gone",
    411 LengthRequired "Length Required",
    413 PayloadTooLarge "Payload Too Large",
    414 UriTooLong "URI Too Long",
    415 UnsupportedMediaType "Unsupported Media Type",
    422 UnprocessableEntity "Unprocessable Entity",
    426 UpgradeRequired "Upgrade Required",
    429 TooManyRequests "Too Many Requests",
    431 RequestHeaderFieldsTooLarge "Request Header Fields Too Large",
    500 InternalServerError "Internal Server Error",
    501 NotImplemented "Not Implemented",
    502 BadGateway "Bad Gateway",
    503 ServiceUnavailable "Service Unavailable",
    504 GatewayTimeout "Gateway Timeout",
    505 HttpVersionNotSupported "HTTP Version Not Supported",
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_informational(self) -> bool {
        self.class() == 1
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }

    pub fn is_client_error(self) -> bool {
        self.class() == 4
    }

    pub fn is_server_error(self) -> bool {
        self.class() == 5
    }

    /// 1xx, 204 and 304 responses never carry a body.
    pub fn forbids_body(self) -> bool {
        self.is_informational() || matches!(self, Self::NoContent | Self::NotModified)
    }

    fn class(self) -> u16 {
        self.as_u16() / 100
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(status: StatusCode) -> u16 {
        status.as_u16()
    }
}

/// The HTTP/1.x protocol version of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    /// Maps the minor version `httparse` reports.
    pub fn from_minor(minor: u8) -> Option<Self> {
        match minor {
            0 => Some(Self::Http10),
            1 => Some(Self::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! methods {
    ($($name:ident $token:literal,)+) => {
        /// A request method. Tokens are case-sensitive; anything unknown is kept in
        /// [`Method::Custom`].
        ///
        /// ```
        /// use kiln::http::Method;
        ///
        /// let method: Method = "PURGE".parse().unwrap();
        /// assert_eq!(method, Method::Custom("PURGE".into()));
        /// assert!("GET".parse::<Method>().unwrap().is_safe());
        /// ```
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum Method {
            $($name,)+
            Custom(String),
        }

        impl Method {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$name => $token,)+
                    Self::Custom(token) => token.as_str(),
                }
            }
        }

        impl FromStr for Method {
            type Err = std::convert::Infallible;

            fn from_str(token: &str) -> Result<Self, Self::Err> {
                Ok(match token {
                    $($token => Self::$name,)+
                    other => Self::Custom(other.to_owned()),
                })
            }
        }
    };
}

methods! {
    Get "GET",
    Post "POST",
    Put "PUT",
    Delete "DELETE",
    Head "HEAD",
    Options "OPTIONS",
    Patch "PATCH",
    Connect "CONNECT",
    Trace "TRACE",
}

impl Method {
    /// Safe methods (RFC 9110 §9.2.1) do not change server state.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options | Self::Trace)
    }

    pub fn is_idempotent(&self) -> bool {
        self.is_safe() || matches!(self, Self::Put | Self::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_u16() {
        for code in [101, 200, 204, 304, 400, 404, 426, 431, 500, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(status.as_u16(), code);
        }
        assert!(StatusCode::from_u16(299).is_none());
    }

    #[test]
    fn status_classes() {
        assert!(StatusCode::SwitchingProtocols.is_informational());
        assert!(StatusCode::Created.is_success());
        assert!(StatusCode::NotFound.is_client_error());
        assert!(StatusCode::BadGateway.is_server_error());
        assert!(StatusCode::NoContent.forbids_body());
        assert!(StatusCode::NotModified.forbids_body());
        assert!(!StatusCode::Ok.forbids_body());
    }

    #[test]
    fn status_display_includes_reason() {
        assert_eq!(
            StatusCode::RequestHeaderFieldsTooLarge.to_string(),
            "431 Request Header Fields Too Large"
        );
    }

    #[test]
    fn method_parses_custom() {
        let m: Method = "PURGE".parse().unwrap();
        assert_eq!(m, Method::Custom("PURGE".into()));
        assert!(!m.is_safe());
    }

    #[test]
    fn version_from_minor() {
        assert_eq!(Version::from_minor(0), Some(Version::Http10));
        assert_eq!(Version::from_minor(1).unwrap().to_string(), "HTTP/1.1");
        assert_eq!(Version::from_minor(2), None);
    }
}
