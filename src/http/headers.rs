//! Header fields for requests and responses.
//!
//! Parsed requests store names lower-cased. Responses keep whatever casing the
//! application used. Every lookup compares names ASCII case-insensitively, and
//! repeated fields stay in arrival order.

use std::str::FromStr;

use bytes::{BufMut, BytesMut};

/// An ordered list of header fields, allowing repeats.
///
/// ```
/// use kiln::http::Headers;
///
/// let mut headers: Headers = [("Accept", "text/html"), ("Accept", "application/json")]
///     .into_iter()
///     .collect();
/// headers.set("Content-Length", "42");
///
/// assert_eq!(headers.get("accept"), Some("text/html"));
/// assert_eq!(headers.get_all("ACCEPT").count(), 2);
/// assert_eq!(headers.parse::<u64>("content-length"), Some(Ok(42)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    name: String,
    value: String,
}

impl Field {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Appends a field, keeping any existing fields of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replaces every field named `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.is(name))
            .map(|field| field.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |field| field.is(name))
            .map(|field| field.value.as_str())
    }

    /// Parses the first value of `name`, trimmed. `None` if the field is absent.
    pub fn parse<T: FromStr>(&self, name: &str) -> Option<Result<T, T::Err>> {
        self.get(name).map(|value| value.trim().parse())
    }

    /// Whether any value of `name`, read as a comma-separated list, holds `token`.
    ///
    /// `Connection: keep-alive, Upgrade` holds the token `upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// Drops every field named `name`; returns whether there was one.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|field| !field.is(name));
        self.fields.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.is(name))
    }

    /// Number of fields, counting repeats.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|field| (field.name.as_str(), field.value.as_str()))
    }

    /// Writes every field as `name: value\r\n`, without the blank line that ends
    /// the head.
    pub fn write_to(&self, buf: &mut BytesMut) {
        for field in &self.fields {
            buf.reserve(field.name.len() + field.value.len() + 4);
            buf.put_slice(field.name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(field.value.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        headers.extend(iter);
        headers
    }
}

impl<N, V> Extend<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn extend<I: IntoIterator<Item = (N, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case() {
        let headers: Headers = [("Sec-WebSocket-Key", "abc")].into_iter().collect();
        for name in ["sec-websocket-key", "SEC-WEBSOCKET-KEY", "Sec-WebSocket-Key"] {
            assert_eq!(headers.get(name), Some("abc"));
            assert!(headers.contains(name));
        }
        assert_eq!(headers.get("sec-websocket-version"), None);
    }

    #[test]
    fn repeated_fields_keep_order() {
        let mut headers = Headers::new();
        headers.insert("Cookie", "a=1");
        headers.insert("Host", "example.com");
        headers.insert("cookie", "b=2");
        assert_eq!(headers.get_all("COOKIE").collect::<Vec<_>>(), ["a=1", "b=2"]);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn set_collapses_repeats() {
        let mut headers = Headers::new();
        headers.insert("Server", "a");
        headers.insert("server", "b");
        headers.set("Server", "kiln");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("SERVER"), Some("kiln"));

        assert!(headers.remove("server"));
        assert!(!headers.remove("server"));
        assert!(headers.is_empty());
    }

    #[test]
    fn token_lists() {
        let mut headers = Headers::new();
        headers.insert("Connection", "keep-alive, Upgrade");
        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("connection", "Keep-Alive"));
        assert!(!headers.has_token("connection", "close"));
        assert!(!headers.has_token("upgrade", "websocket"));
    }

    #[test]
    fn typed_parse() {
        let mut headers = Headers::new();
        headers.insert("Content-Length", " 17 ");
        headers.insert("Max-Forwards", "lots");
        assert_eq!(headers.parse::<usize>("content-length"), Some(Ok(17)));
        assert!(matches!(headers.parse::<usize>("max-forwards"), Some(Err(_))));
        assert!(headers.parse::<usize>("age").is_none());
    }

    #[test]
    fn wire_format() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        headers.insert("X-Trace", "1");
        let mut buf = BytesMut::new();
        headers.write_to(&mut buf);
        assert_eq!(&buf[..], b"Content-Type: text/plain\r\nX-Trace: 1\r\n");
    }
}
