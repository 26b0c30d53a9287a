//! Request routing: map methods and URL patterns to handlers.
//!
//! [`Router`] holds routes, global middleware, a not-found handler and an error
//! handler. It is configured up front and only read while serving.
//!
//! Selection among routes whose method, pattern and constraints all match:
//!
//! 1. higher [`priority`](RouteBuilder::priority) wins;
//! 2. at equal priority an exact (all-literal) pattern beats a parameterized one, which
//!    beats a trailing wildcard;
//! 3. otherwise the route registered first wins.
//!
//! ```rust,no_run
//! use kiln::{Response, Router};
//! use kiln::context::Context;
//!
//! let mut router = Router::new();
//! router.get("/ping", |_ctx| async { Response::text("pong") });
//! router
//!     .get("/users/{id}", |ctx: Context| async move {
//!         Response::text(ctx.param("id").unwrap_or_default().to_owned())
//!     })
//!     .name("user.show")
//!     .where_param("id", r"\d+");
//! assert_eq!(router.url_for("user.show", &[("id", "7")]).unwrap(), "/users/7");
//! ```

mod handler;
mod pattern;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use regex::Regex;
use thiserror::Error;
use tracing::{error, info, warn};

pub use handler::{
    BoxFuture, ErrorHandler, Handler, HandlerError, IntoHandlerResult, NotFoundHandler,
    WebSocketHandler, default_error_handler, default_not_found, handler_fn, websocket_fn,
};
pub use pattern::{Pattern, PatternKind, WILDCARD_PARAM};

use crate::context::{Context, Parameters};
use crate::deferred::{block_on, panic_message};
use crate::middleware::{BoxResponse, Endpoint, Middleware, MiddlewareChain};
use crate::websocket::{WebSocket, handshake::SUPPORTED_VERSION};
use crate::{Method, Request, Response, StatusCode};

/// Characters escaped when a parameter value is substituted into a URL.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error("route {pattern}: invalid constraint on {param}: {source}")]
    InvalidConstraint {
        pattern: String,
        param: String,
        #[source]
        source: regex::Error,
    },

    #[error("route {pattern}: constraint on unknown parameter {param}")]
    UnknownParameter { pattern: String, param: String },

    #[error("route name {0:?} is used twice")]
    DuplicateName(String),

    #[error("no route named {0:?}")]
    UnknownName(String),

    #[error("route {name:?} needs parameter {param}")]
    MissingParameter { name: String, param: String },
}

enum Target {
    Http(Handler),
    WebSocket(WebSocketHandler),
}

/// One registered endpoint.
pub struct Route {
    method: Method,
    pattern: Pattern,
    target: Target,
    name: Option<String>,
    constraints: Vec<(String, Regex)>,
    priority: i32,
    middleware: MiddlewareChain,
    index: usize,
    errors: Vec<RouteError>,
}

impl Route {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.target, Target::WebSocket(_))
    }

    fn accepts(&self, params: &Parameters) -> bool {
        self.constraints
            .iter()
            .all(|(name, re)| params.get(name).is_some_and(|value| re.is_match(value)))
    }

    /// Sort key: smallest wins.
    fn rank(&self) -> (i32, PatternKind, usize) {
        (-self.priority, self.pattern.kind(), self.index)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern.as_str())
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("websocket", &self.is_websocket())
            .finish_non_exhaustive()
    }
}

/// Fluent per-route options, returned by every registration method.
pub struct RouteBuilder<'a> {
    route: &'a mut Route,
}

impl RouteBuilder<'_> {
    /// Names the route for [`Router::url_for`].
    pub fn name(self, name: impl Into<String>) -> Self {
        self.route.name = Some(name.into());
        self
    }

    /// Requires parameter `param` to match `regex` in full. A request whose value does
    /// not match falls through to the next candidate route.
    pub fn where_param(self, param: &str, regex: &str) -> Self {
        let pattern = self.route.pattern.as_str().to_owned();
        if !self.route.pattern.param_names().contains(&param) {
            self.route.errors.push(RouteError::UnknownParameter {
                pattern,
                param: param.to_owned(),
            });
            return self;
        }
        match Regex::new(&format!("^(?:{regex})$")) {
            Ok(re) => self.route.constraints.push((param.to_owned(), re)),
            Err(source) => self.route.errors.push(RouteError::InvalidConstraint {
                pattern,
                param: param.to_owned(),
                source,
            }),
        }
        self
    }

    pub fn priority(self, priority: i32) -> Self {
        self.route.priority = priority;
        self
    }

    /// Middleware that runs for this route only, after the global and group layers.
    pub fn middleware(self, middleware: impl Middleware + 'static) -> Self {
        self.route.middleware.add(middleware);
        self
    }
}

/// A read-only description of a route, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub method: Method,
    pub pattern: String,
    pub name: Option<String>,
    pub priority: i32,
    pub websocket: bool,
    pub middleware: Vec<String>,
}

/// A matched route and its decoded path parameters.
pub struct RouteMatch<'r> {
    pub route: &'r Route,
    pub params: Parameters,
}

macro_rules! method_shortcuts {
    ($($name:ident => $method:expr),* $(,)?) => {
        $(
            pub fn $name<H, F, R>(&mut self, path: &str, handler: H) -> RouteBuilder<'_>
            where
                H: Fn(Context) -> F + Send + Sync + 'static,
                F: Future<Output = R> + Send + 'static,
                R: IntoHandlerResult + 'static,
            {
                self.add($method, path, handler)
            }
        )*
    };
}

pub struct Router {
    routes: Vec<Route>,
    middleware: MiddlewareChain,
    not_found: NotFoundHandler,
    error_handler: ErrorHandler,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            middleware: MiddlewareChain::new(),
            not_found: Arc::new(default_not_found),
            error_handler: Arc::new(default_error_handler),
        }
    }

    // ── Registration ─────────────────────────────────────────────────────────

    method_shortcuts! {
        get => Method::Get,
        post => Method::Post,
        put => Method::Put,
        delete => Method::Delete,
        patch => Method::Patch,
        head => Method::Head,
        options => Method::Options,
    }

    /// Registers `handler` for `method` requests matching `path`.
    pub fn add<H, F, R>(&mut self, method: Method, path: &str, handler: H) -> RouteBuilder<'_>
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult + 'static,
    {
        self.push(method, path, Target::Http(handler_fn(handler)), MiddlewareChain::new())
    }

    /// Registers a WebSocket endpoint. Upgrade requests to `path` are handed the open
    /// session; plain requests get `426 Upgrade Required`.
    pub fn websocket<H, F>(&mut self, path: &str, handler: H) -> RouteBuilder<'_>
    where
        H: Fn(WebSocket) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        self.push(
            Method::Get,
            path,
            Target::WebSocket(websocket_fn(handler)),
            MiddlewareChain::new(),
        )
    }

    /// Adds middleware that wraps every request, matched or not.
    pub fn middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.middleware.add(middleware);
        self
    }

    /// Registers routes under `prefix`; middleware added to the group applies to the
    /// group's routes registered after it.
    pub fn group(&mut self, prefix: &str, f: impl FnOnce(&mut RouteGroup<'_>)) -> &mut Self {
        let mut group = RouteGroup {
            router: self,
            prefix: prefix.to_owned(),
            middleware: MiddlewareChain::new(),
        };
        f(&mut group);
        self
    }

    pub fn not_found<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.not_found = Arc::new(handler);
        self
    }

    /// Replaces the handler that turns handler errors and panics into responses.
    /// It receives the failed request's method and target; headers and body have
    /// already been consumed by then.
    pub fn on_error<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&HandlerError, &Request) -> Response + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    fn push(
        &mut self,
        method: Method,
        path: &str,
        target: Target,
        middleware: MiddlewareChain,
    ) -> RouteBuilder<'_> {
        let index = self.routes.len();
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            target,
            name: None,
            constraints: Vec::new(),
            priority: 0,
            middleware,
            index,
            errors: Vec::new(),
        });
        RouteBuilder {
            route: &mut self.routes[index],
        }
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        self.routes
            .iter()
            .map(|route| RouteInfo {
                method: route.method.clone(),
                pattern: route.pattern.as_str().to_owned(),
                name: route.name.clone(),
                priority: route.priority,
                websocket: route.is_websocket(),
                middleware: route.middleware.names().into_iter().map(str::to_owned).collect(),
            })
            .collect()
    }

    /// Logs the route table at `info` level.
    pub fn print(&self) {
        for line in self.to_string().lines() {
            info!("{line}");
        }
    }

    /// Checks every route's options. Called by the server before it starts accepting.
    pub fn validate(&self) -> Result<(), RouteError> {
        let mut names = std::collections::HashSet::new();
        for route in &self.routes {
            if let Some(err) = route.errors.first() {
                return Err(err.clone());
            }
            if let Some(name) = &route.name {
                if !names.insert(name.as_str()) {
                    return Err(RouteError::DuplicateName(name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Builds the URL of the route called `name`, percent-encoding the values.
    pub fn url_for(&self, name: &str, params: &[(&str, &str)]) -> Result<String, RouteError> {
        let route = self
            .routes
            .iter()
            .find(|r| r.name.as_deref() == Some(name))
            .ok_or_else(|| RouteError::UnknownName(name.to_owned()))?;

        let encoded: Vec<(&str, String)> = params
            .iter()
            .map(|(k, v)| {
                let value = if *k == WILDCARD_PARAM {
                    (*v).to_owned()
                } else {
                    utf8_percent_encode(v, SEGMENT).to_string()
                };
                (*k, value)
            })
            .collect();
        let lookup = |param: &str| {
            encoded
                .iter()
                .find(|(k, _)| *k == param)
                .map(|(_, v)| v.as_str())
        };

        route.pattern.build(lookup).ok_or_else(|| {
            let missing = route
                .pattern
                .param_names()
                .into_iter()
                .find(|p| *p != WILDCARD_PARAM && lookup(*p).is_none())
                .unwrap_or_default();
            RouteError::MissingParameter {
                name: name.to_owned(),
                param: missing.to_owned(),
            }
        })
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// The best route for `method` and `uri`, if any.
    pub fn find(&self, method: &Method, uri: &str) -> Option<RouteMatch<'_>> {
        let path = pattern::raw_path(uri);
        self.routes
            .iter()
            .filter(|route| &route.method == method)
            .filter_map(|route| {
                let params: Parameters = route.pattern.matches(path)?.into_iter().collect();
                route.accepts(&params).then_some(RouteMatch { route, params })
            })
            .min_by_key(|m| m.route.rank())
    }

    /// The WebSocket handler for an upgrade request, with its path parameters.
    pub fn find_websocket(&self, request: &Request) -> Option<(WebSocketHandler, Parameters)> {
        let matched = self.find(request.method(), request.uri())?;
        match &matched.route.target {
            Target::WebSocket(handler) => Some((Arc::clone(handler), matched.params)),
            Target::Http(_) => None,
        }
    }

    /// Runs `request` through the middleware chain to its handler.
    ///
    /// Handler errors and panics in handlers or middleware are turned into responses by
    /// the error handler; this never fails.
    pub async fn route(&self, request: Request) -> Response {
        let method = request.method().clone();
        let uri = request.uri().to_owned();
        let (chain, endpoint, ctx) = self.prepare(request);

        match AssertUnwindSafe(chain.execute(ctx, endpoint)).catch_unwind().await {
            Ok(response) => response,
            Err(payload) => {
                let err = HandlerError::Panicked(panic_message(payload.as_ref()));
                error!(%method, %uri, error = %err, "middleware panicked");
                (self.error_handler)(&err, &Request::new(method, uri))
            }
        }
    }

    /// [`route`](Self::route), driven to completion on the calling thread.
    pub fn route_blocking(&self, request: Request) -> Response {
        block_on(self.route(request))
    }

    fn prepare(&self, request: Request) -> (MiddlewareChain, Endpoint, Context) {
        let mut chain = self.middleware.clone();
        let Some(matched) = self.find(request.method(), request.uri()) else {
            let not_found = Arc::clone(&self.not_found);
            let endpoint: Endpoint = Arc::new(move |ctx: Context| -> BoxResponse {
                let response = not_found(ctx.request());
                Box::pin(async move { response })
            });
            return (chain, endpoint, Context::new(request));
        };

        chain.extend(&matched.route.middleware);
        let endpoint = match &matched.route.target {
            Target::Http(handler) => guarded(Arc::clone(handler), Arc::clone(&self.error_handler)),
            Target::WebSocket(_) => upgrade_required(),
        };
        (chain, endpoint, Context::new(request).with_params(matched.params))
    }
}

impl fmt::Display for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for route in &self.routes {
            write!(f, "{:<8}{}", route.method.as_str(), route.pattern)?;
            if route.is_websocket() {
                f.write_str(" [ws]")?;
            }
            if let Some(name) = &route.name {
                write!(f, " ({name})")?;
            }
            if route.priority != 0 {
                write!(f, " priority={}", route.priority)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Wraps a handler so that its errors and panics become error-handler responses.
fn guarded(handler: Handler, on_error: ErrorHandler) -> Endpoint {
    Arc::new(move |ctx: Context| -> BoxResponse {
        let handler = Arc::clone(&handler);
        let on_error = Arc::clone(&on_error);
        let method = ctx.request().method().clone();
        let uri = ctx.request().uri().to_owned();
        Box::pin(async move {
            let result = match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
            };
            match result {
                Ok(response) => response,
                Err(err) => {
                    warn!(%method, %uri, error = %err, "handler failed");
                    on_error(&err, &Request::new(method, uri))
                }
            }
        })
    })
}

fn upgrade_required() -> Endpoint {
    Arc::new(|_ctx: Context| -> BoxResponse {
        Box::pin(async {
            Response::new(StatusCode::UpgradeRequired)
                .header("Upgrade", "websocket")
                .header("Sec-WebSocket-Version", SUPPORTED_VERSION)
                .body("this endpoint only speaks WebSocket")
        })
    })
}

/// Routes registered under a common prefix; see [`Router::group`].
pub struct RouteGroup<'a> {
    router: &'a mut Router,
    prefix: String,
    middleware: MiddlewareChain,
}

impl RouteGroup<'_> {
    method_shortcuts! {
        get => Method::Get,
        post => Method::Post,
        put => Method::Put,
        delete => Method::Delete,
        patch => Method::Patch,
        head => Method::Head,
        options => Method::Options,
    }

    pub fn add<H, F, R>(&mut self, method: Method, path: &str, handler: H) -> RouteBuilder<'_>
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult + 'static,
    {
        let path = Pattern::prefixed(&self.prefix, path);
        self.router.push(
            method,
            &path,
            Target::Http(handler_fn(handler)),
            self.middleware.clone(),
        )
    }

    pub fn websocket<H, F>(&mut self, path: &str, handler: H) -> RouteBuilder<'_>
    where
        H: Fn(WebSocket) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let path = Pattern::prefixed(&self.prefix, path);
        self.router.push(
            Method::Get,
            &path,
            Target::WebSocket(websocket_fn(handler)),
            self.middleware.clone(),
        )
    }

    pub fn middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.middleware.add(middleware);
        self
    }

    /// A nested group; it inherits this group's prefix and middleware.
    pub fn group(&mut self, prefix: &str, f: impl FnOnce(&mut RouteGroup<'_>)) -> &mut Self {
        let mut nested = RouteGroup {
            prefix: Pattern::prefixed(&self.prefix, prefix),
            middleware: self.middleware.clone(),
            router: &mut *self.router,
        };
        f(&mut nested);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Next, from_fn};

    fn req(method: Method, uri: &str) -> Request {
        Request::new(method, uri)
    }

    async fn body(router: &Router, method: Method, uri: &str) -> String {
        let response = router.route(req(method, uri)).await;
        response.body_as_str().unwrap_or_default().to_owned()
    }

    #[tokio::test]
    async fn exact_route_beats_param_route() {
        let mut router = Router::new();
        router.get("/users/{id}", |ctx: Context| async move {
            Response::text(format!("user {}", ctx.param("id").unwrap_or_default()))
        });
        router.get("/users/active", |_ctx| async { Response::text("active") });

        assert_eq!(body(&router, Method::Get, "/users/active").await, "active");
        assert_eq!(body(&router, Method::Get, "/users/42").await, "user 42");
    }

    #[tokio::test]
    async fn param_routes_tie_break_on_priority_then_order() {
        let mut router = Router::new();
        router.get("/a/{x}", |_ctx| async { Response::text("first") });
        router.get("/a/:y", |_ctx| async { Response::text("second") });
        assert_eq!(body(&router, Method::Get, "/a/1").await, "first");

        router.get("/a/{z}", |_ctx| async { Response::text("third") }).priority(10);
        assert_eq!(body(&router, Method::Get, "/a/1").await, "third");
    }

    #[tokio::test]
    async fn wildcard_ranks_last() {
        let mut router = Router::new();
        router.get("/static/*", |ctx: Context| async move {
            Response::text(ctx.param(WILDCARD_PARAM).unwrap_or_default().to_owned())
        });
        router.get("/static/{file}", |_ctx| async { Response::text("param") });
        assert_eq!(body(&router, Method::Get, "/static/app.js").await, "param");
        assert_eq!(body(&router, Method::Get, "/static/js/app.js").await, "/js/app.js");
    }

    #[tokio::test]
    async fn constraint_falls_through() {
        let mut router = Router::new();
        router
            .get("/items/{id}", |_ctx| async { Response::text("numeric") })
            .where_param("id", r"\d+");
        router.get("/items/{slug}", |_ctx| async { Response::text("slug") });
        assert!(router.validate().is_ok());

        assert_eq!(body(&router, Method::Get, "/items/12").await, "numeric");
        assert_eq!(body(&router, Method::Get, "/items/12a").await, "slug");
    }

    #[test]
    fn invalid_constraints_fail_validation() {
        let mut router = Router::new();
        router
            .get("/x/{id}", |_ctx| async { Response::ok() })
            .where_param("id", "(unclosed");
        assert!(matches!(router.validate(), Err(RouteError::InvalidConstraint { .. })));

        let mut router = Router::new();
        router
            .get("/x/{id}", |_ctx| async { Response::ok() })
            .where_param("nope", ".*");
        assert!(matches!(router.validate(), Err(RouteError::UnknownParameter { .. })));

        let mut router = Router::new();
        router.get("/a", |_ctx| async { Response::ok() }).name("dup");
        router.get("/b", |_ctx| async { Response::ok() }).name("dup");
        assert!(matches!(router.validate(), Err(RouteError::DuplicateName(_))));
    }

    #[tokio::test]
    async fn method_must_match() {
        let mut router = Router::new();
        router.post("/submit", |_ctx| async { Response::new(StatusCode::Created) });
        assert_eq!(
            router.route(req(Method::Get, "/submit")).await.status(),
            StatusCode::NotFound
        );
        assert_eq!(
            router.route(req(Method::Post, "/submit?x=1")).await.status(),
            StatusCode::Created
        );
    }

    #[tokio::test]
    async fn custom_not_found() {
        let mut router = Router::new();
        router.not_found(|request| {
            Response::new(StatusCode::NotFound).body(format!("nothing at {}", request.path()))
        });
        assert_eq!(body(&router, Method::Get, "/missing").await, "nothing at /missing");
    }

    #[tokio::test]
    async fn handler_errors_and_panics_use_error_handler() {
        let mut router = Router::new();
        router.get("/fail", |_ctx| async {
            Err::<Response, _>(HandlerError::status(StatusCode::Conflict, "taken"))
        });
        router.get("/panic", |_ctx| async {
            if true {
                panic!("boom");
            }
            Response::ok()
        });

        let response = router.route(req(Method::Get, "/fail")).await;
        assert_eq!(response.status(), StatusCode::Conflict);
        assert_eq!(response.body_as_str(), Some("taken"));

        let response = router.route(req(Method::Get, "/panic")).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);

        router.on_error(|err, request| {
            Response::new(StatusCode::ServiceUnavailable).body(format!("{} {err}", request.path()))
        });
        assert_eq!(body(&router, Method::Get, "/panic").await, "/panic handler panicked: boom");
    }

    #[tokio::test]
    async fn panicking_middleware_is_contained() {
        struct Explode;
        impl Middleware for Explode {
            fn handle(&self, _ctx: Context, _next: Next) -> BoxResponse {
                panic!("middleware exploded")
            }
        }
        let mut router = Router::new();
        router.middleware(Explode);
        router.get("/", |_ctx| async { Response::ok() });
        let response = router.route(req(Method::Get, "/")).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn groups_prefix_and_scope_middleware() {
        let mut router = Router::new();
        router.get("/health", |_ctx| async { Response::text("ok") });
        router.group("/api", |api| {
            api.middleware(from_fn(|ctx, next: Next| async move {
                next.run(ctx).await.header("X-Api", "1")
            }));
            api.get("/users", |_ctx| async { Response::text("users") });
            api.group("/v2", |v2| {
                v2.get("/users/{id}", |ctx: Context| async move {
                    Response::text(ctx.param("id").unwrap_or_default().to_owned())
                })
                .name("v2.user");
            });
        });

        let response = router.route(req(Method::Get, "/api/users")).await;
        assert_eq!(response.body_as_str(), Some("users"));
        assert_eq!(response.get_header("x-api"), Some("1"));

        let response = router.route(req(Method::Get, "/api/v2/users/9")).await;
        assert_eq!(response.body_as_str(), Some("9"));
        assert_eq!(response.get_header("x-api"), Some("1"));

        let response = router.route(req(Method::Get, "/health")).await;
        assert_eq!(response.get_header("x-api"), None);
        assert_eq!(router.url_for("v2.user", &[("id", "9")]).unwrap(), "/api/v2/users/9");
    }

    #[tokio::test]
    async fn global_middleware_wraps_not_found() {
        let mut router = Router::new();
        router.middleware(from_fn(|ctx, next: Next| async move {
            next.run(ctx).await.header("X-Global", "yes")
        }));
        let response = router.route(req(Method::Get, "/nothing")).await;
        assert_eq!(response.status(), StatusCode::NotFound);
        assert_eq!(response.get_header("x-global"), Some("yes"));
    }

    #[test]
    fn url_for_encodes_and_reports_missing() {
        let mut router = Router::new();
        router.get("/files/{name}", |_ctx| async { Response::ok() }).name("file");
        assert_eq!(
            router.url_for("file", &[("name", "a b/c")]).unwrap(),
            "/files/a%20b%2Fc"
        );
        assert!(matches!(
            router.url_for("file", &[]),
            Err(RouteError::MissingParameter { ref param, .. }) if param == "name"
        ));
        assert!(matches!(router.url_for("nope", &[]), Err(RouteError::UnknownName(_))));
    }

    #[tokio::test]
    async fn websocket_route_refuses_plain_get() {
        let mut router = Router::new();
        router.websocket("/ws/{room}", |_socket| async {});
        let response = router.route(req(Method::Get, "/ws/lobby")).await;
        assert_eq!(response.status(), StatusCode::UpgradeRequired);

        let (_, params) = router.find_websocket(&req(Method::Get, "/ws/lobby")).unwrap();
        assert_eq!(params.get("room"), Some("lobby"));
        assert!(router.find_websocket(&req(Method::Get, "/other")).is_none());
    }

    #[test]
    fn blocking_dispatch_and_listing() {
        let mut router = Router::new();
        router.get("/", |_ctx| async { Response::text("root") }).name("root");
        router.websocket("/ws", |_socket| async {});
        let response = router.route_blocking(req(Method::Get, "/"));
        assert_eq!(response.body_as_str(), Some("root"));

        let routes = router.routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].name.as_deref(), Some("root"));
        assert!(routes[1].websocket);
        let table = router.to_string();
        assert!(table.contains("GET     / (root)"));
        assert!(table.contains("/ws [ws]"));
    }
}
