//! Middleware pipeline: composable before/after logic around route handlers.
//!
//! A [`MiddlewareChain`] is an ordered list of [`Middleware`]. Executing it walks the
//! list front to back through a [`Next`] cursor and finally calls the endpoint (the
//! matched route's handler). Each middleware may:
//!
//! - **pass through**: `next.run(ctx).await`;
//! - **short-circuit**: return a [`Response`] without calling `next`, so neither the
//!   handler nor any later middleware runs;
//! - **decorate**: call `next`, then adjust the response it gets back.
//!
//! [`MiddlewareChain::execute`] is the suspending path; [`MiddlewareChain::execute_blocking`]
//! drives the very same future on the calling thread, so both obey identical ordering.

use std::{fmt, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::deferred::block_on;
use crate::{Request, Response, context::Context};

/// Boxed future produced by middleware and endpoints.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// The innermost step of a chain: usually the matched route's handler, already wrapped
/// so that handler errors are turned into responses.
pub type Endpoint = Arc<dyn Fn(Context) -> BoxResponse + Send + Sync>;

/// The core middleware trait.
///
/// Middleware is shared across connections, so it must be `Send + Sync` and must not
/// hold locks across an `.await`.
///
/// ```rust,no_run
/// use kiln::{Response, context::Context, middleware::{BoxResponse, Middleware, Next}};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse;

    /// Name used in route listings and logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A cursor into the remaining middleware for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so each middleware can forward at most
/// once.
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    // Which middleware the next `run` invokes.
    index: usize,
    endpoint: Endpoint,
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &(self.chain.len() - self.index.min(self.chain.len())))
            .finish()
    }
}

impl Next {
    pub fn new(chain: Arc<[Arc<dyn Middleware>]>, endpoint: Endpoint) -> Self {
        Self {
            chain,
            index: 0,
            endpoint,
        }
    }

    /// Invokes the next middleware, or the endpoint once the chain is exhausted.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                self.index += 1;
                middleware.handle(ctx, self).await
            }
            None => (self.endpoint)(ctx).await,
        }
    }
}

/// An ordered list of middleware, built at configuration time and read-only afterwards.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.middleware.iter().map(|m| m.name()))
            .finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn add_shared(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Appends every middleware of `other`, after the ones already present.
    pub fn extend(&mut self, other: &MiddlewareChain) {
        self.middleware.extend(other.middleware.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }

    /// Runs `ctx` through every middleware and then `endpoint`.
    pub fn execute(&self, ctx: Context, endpoint: Endpoint) -> BoxResponse {
        let chain: Arc<[Arc<dyn Middleware>]> = self.middleware.clone().into();
        Box::pin(Next::new(chain, endpoint).run(ctx))
    }

    /// The same pipeline, driven to completion on the calling thread.
    ///
    /// Must not be called from a thread that a runtime needs to make progress on.
    pub fn execute_blocking(&self, ctx: Context, endpoint: Endpoint) -> Response {
        block_on(self.execute(ctx, endpoint))
    }
}

// ── Closure middleware ───────────────────────────────────────────────────────

/// Middleware built from a closure; see [`from_fn`].
pub struct FnMiddleware<F> {
    f: F,
}

/// Wraps `f(ctx, next)` as middleware.
///
/// ```rust,no_run
/// use kiln::middleware::{MiddlewareChain, from_fn};
///
/// let mut chain = MiddlewareChain::new();
/// chain.add(from_fn(|ctx, next| async move {
///     next.run(ctx).await.header("X-Powered-By", "kiln")
/// }));
/// ```
pub fn from_fn<F, Fut>(f: F) -> FnMiddleware<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    FnMiddleware { f }
}

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin((self.f)(ctx, next))
    }

    fn name(&self) -> &str {
        "from_fn"
    }
}

// ── Built-ins ────────────────────────────────────────────────────────────────

/// Logs each request as `METHOD /path - STATUS (elapsed)` once the response is ready.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_owned();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx).await;

            let elapsed = start.elapsed();
            let status = response.status().as_u16();
            tracing::info!(
                %method,
                %path,
                status,
                ?elapsed,
                "{method} {path} - {status} ({elapsed:?})"
            );
            response
        })
    }

    fn name(&self) -> &str {
        "logger"
    }
}

/// Runs `inner` only for requests matching a predicate; other requests skip straight
/// to the next middleware.
pub struct ConditionalMiddleware {
    predicate: Box<dyn Fn(&Request) -> bool + Send + Sync>,
    inner: Arc<dyn Middleware>,
}

impl ConditionalMiddleware {
    pub fn new<P>(predicate: P, inner: impl Middleware + 'static) -> Self
    where
        P: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            inner: Arc::new(inner),
        }
    }

    /// Applies `inner` only to paths under `prefix`.
    pub fn for_prefix(prefix: impl Into<String>, inner: impl Middleware + 'static) -> Self {
        let prefix = prefix.into();
        Self::new(move |req| req.path().starts_with(&prefix), inner)
    }
}

impl Middleware for ConditionalMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        if (self.predicate)(ctx.request()) {
            self.inner.handle(ctx, next)
        } else {
            Box::pin(next.run(ctx))
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, StatusCode};
    use parking_lot::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Record {
        label: &'static str,
        trace: Trace,
    }

    impl Middleware for Record {
        fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
            let label = self.label;
            let trace = self.trace.clone();
            Box::pin(async move {
                trace.lock().push(format!("{label}:before"));
                let response = next.run(ctx).await;
                trace.lock().push(format!("{label}:after"));
                response
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn handle(&self, _ctx: Context, _next: Next) -> BoxResponse {
            Box::pin(async { Response::new(StatusCode::Forbidden).body("denied") })
        }
    }

    fn endpoint(trace: Trace) -> Endpoint {
        Arc::new(move |_ctx: Context| -> BoxResponse {
            let trace = trace.clone();
            Box::pin(async move {
                trace.lock().push("handler".into());
                Response::text("handled")
            })
        })
    }

    fn ctx(path: &str) -> Context {
        Context::new(Request::new(Method::Get, path))
    }

    #[tokio::test]
    async fn runs_in_chain_order() {
        let trace: Trace = Arc::default();
        let mut chain = MiddlewareChain::new();
        chain
            .add(Record { label: "a", trace: trace.clone() })
            .add(Record { label: "b", trace: trace.clone() });

        let response = chain.execute(ctx("/"), endpoint(trace.clone())).await;
        assert_eq!(response.body_as_str(), Some("handled"));
        assert_eq!(
            *trace.lock(),
            vec!["a:before", "b:before", "handler", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let trace: Trace = Arc::default();
        let mut chain = MiddlewareChain::new();
        chain
            .add(Record { label: "a", trace: trace.clone() })
            .add(Deny)
            .add(Record { label: "c", trace: trace.clone() });

        let response = chain.execute(ctx("/"), endpoint(trace.clone())).await;
        assert_eq!(response.status(), StatusCode::Forbidden);
        assert_eq!(response.body_as_str(), Some("denied"));
        assert_eq!(*trace.lock(), vec!["a:before", "a:after"]);
    }

    #[test]
    fn blocking_path_matches_async_path() {
        let trace: Trace = Arc::default();
        let mut chain = MiddlewareChain::new();
        chain
            .add(Record { label: "a", trace: trace.clone() })
            .add(Deny);
        let response = chain.execute_blocking(ctx("/"), endpoint(trace.clone()));
        assert_eq!(response.status(), StatusCode::Forbidden);
        assert_eq!(*trace.lock(), vec!["a:before", "a:after"]);
    }

    #[tokio::test]
    async fn closure_middleware_decorates() {
        let mut chain = MiddlewareChain::new();
        chain.add(from_fn(|ctx, next: Next| async move {
            next.run(ctx).await.header("X-Layer", "outer")
        }));
        let response = chain.execute(ctx("/"), endpoint(Trace::default())).await;
        assert_eq!(response.get_header("x-layer"), Some("outer"));
    }

    #[tokio::test]
    async fn conditional_applies_by_prefix() {
        let mut chain = MiddlewareChain::new();
        chain.add(ConditionalMiddleware::for_prefix("/admin", Deny));

        let open = chain.execute(ctx("/public"), endpoint(Trace::default())).await;
        assert_eq!(open.status(), StatusCode::Ok);
        let admin = chain.execute(ctx("/admin/users"), endpoint(Trace::default())).await;
        assert_eq!(admin.status(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let mut chain = MiddlewareChain::new();
        chain.add(LoggerMiddleware);
        assert_eq!(chain.names(), vec!["logger"]);
        let response = chain.execute(ctx("/"), endpoint(Trace::default())).await;
        assert_eq!(response.body_as_str(), Some("handled"));
    }
}
