//! Statistics snapshots.
//!
//! Every long-lived component (scheduler, frame parser, connection, WebSocket session,
//! server) exposes its counters as a [`Snapshot`]: a sorted map from a metric name to a
//! [`Scalar`]. Snapshots serialize to flat JSON objects so they can be served from a
//! health endpoint or forwarded to an external metrics system unchanged.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// A single dynamically-typed value: string, integer, float or boolean.
///
/// Used for statistics snapshots and for connection attributes.
///
/// # Examples
///
/// ```
/// use kiln::stats::Scalar;
///
/// assert_eq!(Scalar::from(3_usize), Scalar::Int(3));
/// assert_eq!(Scalar::from("idle").as_str(), Some("idle"));
/// assert_eq!(Scalar::from(true).to_string(), "true");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    /// Returns the contained string, if this is a [`Scalar::Str`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained integer, if this is a [`Scalar::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as a float. Integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Returns the contained boolean, if this is a [`Scalar::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Scalar {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A point-in-time statistics snapshot, ordered by metric name.
pub type Snapshot = BTreeMap<String, Scalar>;

/// Copies every entry of `source` into `target` under `prefix.`.
///
/// Used to nest a component's snapshot inside an aggregate one, e.g. the scheduler's
/// `pending_tasks` becomes `scheduler.pending_tasks` in the server snapshot.
pub fn merge_prefixed(target: &mut Snapshot, prefix: &str, source: Snapshot) {
    for (key, value) in source {
        target.insert(format!("{prefix}.{key}"), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_values_saturate() {
        assert_eq!(Scalar::from(u64::MAX), Scalar::Int(i64::MAX));
    }

    #[test]
    fn float_accessor_widens_ints() {
        assert_eq!(Scalar::Int(4).as_float(), Some(4.0));
        assert_eq!(Scalar::Bool(true).as_float(), None);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let mut snap = Snapshot::new();
        snap.insert("name".into(), "kiln".into());
        snap.insert("count".into(), 2_usize.into());
        snap.insert("ratio".into(), 0.5.into());
        snap.insert("paused".into(), false.into());
        let json = serde_json::to_string(&snap).unwrap();
        assert_eq!(
            json,
            r#"{"count":2,"name":"kiln","paused":false,"ratio":0.5}"#
        );
    }

    #[test]
    fn merge_prefixes_keys() {
        let mut outer = Snapshot::new();
        let mut inner = Snapshot::new();
        inner.insert("size".into(), 4_usize.into());
        merge_prefixed(&mut outer, "scheduler", inner);
        assert_eq!(outer.get("scheduler.size"), Some(&Scalar::Int(4)));
    }
}
