use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The error half of a value channel.
///
/// `AsyncError` is `Clone` so a single failure can be fanned out to every consumer
/// that depends on it (e.g. all inputs of a [`when_all`](super::when_all)).
#[derive(Debug, Clone, Error)]
pub enum AsyncError {
    /// `set_value`/`set_error` was called on a producer that already delivered.
    #[error("a result was already delivered on this channel")]
    AlreadySatisfied,

    /// The result was already taken out of the consumer.
    #[error("the result was already taken")]
    AlreadyTaken,

    /// The producer was dropped without delivering a result.
    #[error("producer dropped before delivering a result")]
    BrokenPromise,

    /// The losing side of a timeout race.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The computation panicked; the payload message is preserved.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The scheduler refused the work (shut down or queue full).
    #[error("scheduler rejected the work: {0}")]
    Rejected(String),

    /// An application error produced by the computation.
    #[error("{0}")]
    Failed(Arc<dyn StdError + Send + Sync>),
}

impl AsyncError {
    /// Wraps an arbitrary error.
    pub fn failed(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(err))
    }

    /// Builds a [`AsyncError::Failed`] from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(Arc::new(std::io::Error::other(message.into())))
    }

    /// Converts a `catch_unwind` payload into [`AsyncError::Panicked`].
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }

    /// Returns `true` for the timeout branch of a race.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Extracts the message from a panic payload (`&str` or `String`), if any.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let err = AsyncError::from_panic(Box::new("boom"));
        assert!(matches!(err, AsyncError::Panicked(ref m) if m == "boom"));

        let err = AsyncError::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(err.to_string(), "task panicked: owned boom");

        let err = AsyncError::from_panic(Box::new(42_u8));
        assert_eq!(err.to_string(), "task panicked: non-string panic payload");
    }

    #[test]
    fn failed_errors_clone_cheaply() {
        let err = AsyncError::msg("database unavailable");
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert_eq!(copy.to_string(), "database unavailable");
    }
}
