//! Handler erasure and handler errors.

use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::context::Context;
use crate::deferred::AsyncError;
use crate::http::{Request, Response, StatusCode};
use crate::websocket::WebSocket;

/// Boxed future returned by every erased handler and middleware.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Type-erased HTTP handler.
///
/// Stored behind `Arc<dyn Fn(…)>` so routes can be cloned into the chain cheaply. You
/// never build one directly; [`Router::get`](super::Router::get) and friends erase the
/// closure for you.
pub type Handler = Arc<dyn Fn(Context) -> BoxFuture<Result<Response, HandlerError>> + Send + Sync>;

/// Type-erased WebSocket handler: receives the open session after the `101`.
pub type WebSocketHandler = Arc<dyn Fn(WebSocket) -> BoxFuture<()> + Send + Sync>;

/// Converts an error raised while handling a request into a response.
pub type ErrorHandler = Arc<dyn Fn(&HandlerError, &Request) -> Response + Send + Sync>;

/// Produces the response for a request no route matched.
pub type NotFoundHandler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// Why a handler failed to produce a response.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler (or a middleware) panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler chose a specific error status.
    #[error("{status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error(transparent)]
    Other(Box<dyn StdError + Send + Sync>),
}

impl HandlerError {
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::status(StatusCode::BadRequest, message)
    }

    pub fn other(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }

    /// The status the default error handler answers with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Status { status, .. } => *status,
            Self::Panicked(_) | Self::Other(_) => StatusCode::InternalServerError,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::status(StatusCode::BadRequest, err.to_string())
    }
}

impl From<AsyncError> for HandlerError {
    fn from(err: AsyncError) -> Self {
        match err {
            AsyncError::Panicked(message) => Self::Panicked(message),
            other => Self::Other(Box::new(other)),
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

/// What a handler may return: a plain [`Response`] or a `Result` whose error converts
/// into [`HandlerError`].
pub trait IntoHandlerResult: Send {
    fn into_handler_result(self) -> Result<Response, HandlerError>;
}

impl IntoHandlerResult for Response {
    fn into_handler_result(self) -> Result<Response, HandlerError> {
        Ok(self)
    }
}

impl<E> IntoHandlerResult for Result<Response, E>
where
    E: Into<HandlerError> + Send,
{
    fn into_handler_result(self) -> Result<Response, HandlerError> {
        self.map_err(Into::into)
    }
}

/// Erases a handler closure.
pub fn handler_fn<H, F, R>(handler: H) -> Handler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult + 'static,
{
    Arc::new(move |ctx: Context| -> BoxFuture<Result<Response, HandlerError>> {
        let future = handler(ctx);
        Box::pin(async move { future.await.into_handler_result() })
    })
}

/// Erases a WebSocket handler closure.
pub fn websocket_fn<H, F>(handler: H) -> WebSocketHandler
where
    H: Fn(WebSocket) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |socket: WebSocket| -> BoxFuture<()> { Box::pin(handler(socket)) })
}

/// Answers with the error's status and message. Panics and opaque errors become a
/// bare `500` so internal details do not leak.
pub fn default_error_handler(err: &HandlerError, _request: &Request) -> Response {
    match err {
        HandlerError::Status { status, message } => Response::new(*status).body(message.clone()),
        _ => Response::internal_error(),
    }
}

pub fn default_not_found(_request: &Request) -> Response {
    Response::not_found()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::block_on;
    use crate::http::Method;

    #[test]
    fn plain_and_fallible_handlers_erase() {
        let plain = handler_fn(|_ctx| async { Response::text("ok") });
        let fallible = handler_fn(|ctx: Context| async move {
            let value: serde_json::Value = ctx.json()?;
            Ok::<_, HandlerError>(Response::text(value.to_string()))
        });

        let ctx = || Context::new(Request::new(Method::Post, "/").with_body("not json"));
        assert!(block_on(plain(ctx())).is_ok());
        let err = block_on(fallible(ctx())).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BadRequest);
    }

    #[test]
    fn default_error_handler_hides_internals() {
        let request = Request::new(Method::Get, "/");
        let io = HandlerError::from(std::io::Error::other("disk on fire"));
        let response = default_error_handler(&io, &request);
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_ne!(response.body_as_str(), Some("disk on fire"));

        let teapot = HandlerError::status(StatusCode::Forbidden, "nope");
        let response = default_error_handler(&teapot, &request);
        assert_eq!(response.status(), StatusCode::Forbidden);
        assert_eq!(response.body_as_str(), Some("nope"));
    }

    #[test]
    fn async_panics_map_to_panicked() {
        let err = HandlerError::from(AsyncError::Panicked("boom".into()));
        assert!(matches!(err, HandlerError::Panicked(ref m) if m == "boom"));
    }
}
