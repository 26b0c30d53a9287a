//! Route pattern compilation and matching.
//!
//! | Pattern              | Example match              | Captured params                  |
//! |----------------------|----------------------------|----------------------------------|
//! | `/users`             | `/users`                   | *(none)*                         |
//! | `/users/{id}`        | `/users/42`                | `id → "42"`                      |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                      |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "/docs/readme.txt"`  |
//!
//! Trailing slashes are ignored on both patterns and paths. Matching runs on the raw
//! (still percent-encoded) path so an encoded `/` inside a parameter does not split it;
//! captured values are decoded afterwards.

use std::fmt;

use percent_encoding::percent_decode_str;

use crate::http::url::url_decode;

/// Name under which a trailing `/*` capture is stored.
pub const WILDCARD_PARAM: &str = "wildcard";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// How specific a pattern is. Lower ranks win over higher ones at equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatternKind {
    /// Only literal segments.
    Exact = 0,
    /// At least one named parameter.
    Param = 1,
    /// Ends in `/*`.
    Wildcard = 2,
}

/// A compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
    wildcard: bool,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Self {
        let trimmed = if pattern != "/" {
            pattern.trim_end_matches('/')
        } else {
            pattern
        };
        let (body, wildcard) = match trimmed.strip_suffix("/*") {
            Some(prefix) => (prefix, true),
            None if trimmed == "*" => ("", true),
            None => (trimmed, false),
        };

        let segments = body
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if let Some(name) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Segment::Param(name.to_owned())
                } else if let Some(name) = s.strip_prefix(':') {
                    Segment::Param(name.to_owned())
                } else {
                    Segment::Literal(s.to_owned())
                }
            })
            .collect();

        Self {
            raw: pattern.to_owned(),
            segments,
            wildcard,
        }
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> PatternKind {
        if self.wildcard {
            PatternKind::Wildcard
        } else if self.segments.iter().any(|s| matches!(s, Segment::Param(_))) {
            PatternKind::Param
        } else {
            PatternKind::Exact
        }
    }

    /// Parameter names in order of appearance, plus `wildcard` for a trailing `/*`.
    pub fn param_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect();
        if self.wildcard {
            names.push(WILDCARD_PARAM);
        }
        names
    }

    /// Matches a raw request path, returning decoded `(name, value)` captures.
    pub fn matches(&self, raw_path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = raw_path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() < self.segments.len() {
            return None;
        }
        if !self.wildcard && parts.len() != self.segments.len() {
            return None;
        }

        let mut captures = Vec::new();
        for (segment, part) in self.segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(literal) => {
                    if percent_decode_str(part).decode_utf8_lossy() != literal.as_str() {
                        return None;
                    }
                }
                Segment::Param(name) => captures.push((name.clone(), url_decode(part))),
            }
        }

        if self.wildcard {
            let rest: String = parts[self.segments.len()..]
                .iter()
                .map(|part| format!("/{}", percent_decode_str(part).decode_utf8_lossy()))
                .collect();
            captures.push((WILDCARD_PARAM.to_owned(), rest));
        }
        Some(captures)
    }

    /// Fills the pattern's parameters from `lookup`. Returns `None` if one is missing.
    pub fn build<'a>(&self, lookup: impl Fn(&str) -> Option<&'a str>) -> Option<String> {
        let mut url = String::new();
        for segment in &self.segments {
            url.push('/');
            match segment {
                Segment::Literal(literal) => url.push_str(literal),
                Segment::Param(name) => url.push_str(lookup(name)?),
            }
        }
        if self.wildcard {
            let rest = lookup(WILDCARD_PARAM).unwrap_or("");
            if !rest.is_empty() && !rest.starts_with('/') {
                url.push('/');
            }
            url.push_str(rest);
        }
        if url.is_empty() {
            url.push('/');
        }
        Some(url)
    }

    /// Prepends a group prefix.
    pub(crate) fn prefixed(prefix: &str, pattern: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return pattern.to_owned();
        }
        if pattern == "/" || pattern.is_empty() {
            return prefix.to_owned();
        }
        if pattern.starts_with('/') {
            format!("{prefix}{pattern}")
        } else {
            format!("{prefix}/{pattern}")
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// The raw path of a request target: everything before `?` or `#`.
pub(crate) fn raw_path(uri: &str) -> &str {
    let end = uri.find(['?', '#']).unwrap_or(uri.len());
    &uri[..end]
}
