//! URI splitting and URL decoding.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;

/// The path, query and fragment of a request target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UriParts {
    /// Decoded path. Always starts with `/` for origin-form targets.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    /// Raw fragment, without the leading `#`.
    pub fragment: Option<String>,
}

/// Splits `uri` into path, query and fragment. The path is percent-decoded (`+` is
/// kept literally in paths); query and fragment are returned raw.
///
/// # Examples
///
/// ```
/// use kiln::http::url::split_uri;
///
/// let parts = split_uri("/files/a%20b?x=1#top");
/// assert_eq!(parts.path, "/files/a b");
/// assert_eq!(parts.query.as_deref(), Some("x=1"));
/// assert_eq!(parts.fragment.as_deref(), Some("top"));
/// ```
pub fn split_uri(uri: &str) -> UriParts {
    let (rest, fragment) = match uri.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment.to_owned())),
        None => (uri, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (rest, None),
    };
    UriParts {
        path: percent_decode_str(path).decode_utf8_lossy().into_owned(),
        query,
        fragment,
    }
}

/// Decodes a form or query component: `+` becomes a space, `%XX` becomes the byte
/// `0xXX`. Invalid UTF-8 is replaced rather than rejected.
///
/// # Examples
///
/// ```
/// use kiln::http::url::url_decode;
///
/// assert_eq!(url_decode("hello+world%21"), "hello world!");
/// assert_eq!(url_decode("a%2Bb"), "a+b");
/// ```
pub fn url_decode(input: &str) -> String {
    let spaced = input.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Parses `key=value&key2=value2` into a map, decoding both sides.
///
/// A key without `=` maps to the empty string; empty pairs are skipped; on duplicate
/// keys the last value wins.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (url_decode(key), url_decode(value)),
            None => (url_decode(pair), String::new()),
        })
        .collect()
}
