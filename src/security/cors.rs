//! Cross-Origin Resource Sharing.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    Method, Response, StatusCode,
    context::Context,
    middleware::{BoxResponse, Middleware, Next},
};

#[derive(Debug, Clone)]
struct CorsPolicy {
    origins: Vec<String>,
    methods: Vec<String>,
    headers: Vec<String>,
    max_age: Duration,
    credentials: bool,
}

impl CorsPolicy {
    /// The value for `Access-Control-Allow-Origin`, or `None` if `origin` is refused.
    fn allow_origin(&self, origin: &str) -> Option<String> {
        if self.origins.iter().any(|o| o == "*") && !self.credentials {
            Some("*".to_owned())
        } else if self.origins.iter().any(|o| o == "*" || o.eq_ignore_ascii_case(origin)) {
            Some(origin.to_owned())
        } else {
            None
        }
    }

    fn decorate(&self, response: &mut Response, allow_origin: &str) {
        response.set_header("Access-Control-Allow-Origin", allow_origin);
        if self.credentials {
            response.set_header("Access-Control-Allow-Credentials", "true");
        }
        if allow_origin != "*" {
            response.add_header("Vary", "Origin");
        }
    }
}

/// Validates `Origin`, answers preflight requests and adds `Access-Control-*` headers
/// to actual responses.
///
/// - Requests without `Origin`, or from an origin not on the list, pass through
///   untouched.
/// - A preflight (`OPTIONS` with `Access-Control-Request-Method`) is answered with
///   `204` and the handler is not called.
/// - A specific (non-`*`) origin is echoed back together with `Vary: Origin`.
///
/// ```rust
/// use kiln::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Request-Id");
/// ```
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    policy: Arc<CorsPolicy>,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// No allowed origins yet; `GET`, `POST`, `PUT`, `DELETE` and the `Content-Type`
    /// and `Authorization` headers.
    pub fn new() -> Self {
        Self {
            policy: Arc::new(CorsPolicy {
                origins: Vec::new(),
                methods: ["GET", "POST", "PUT", "DELETE"].map(String::from).to_vec(),
                headers: ["Content-Type", "Authorization"].map(String::from).to_vec(),
                max_age: Duration::from_secs(3600),
                credentials: false,
            }),
        }
    }

    /// Every origin allowed.
    pub fn permissive() -> Self {
        Self::new().allow_origin("*")
    }

    fn policy_mut(&mut self) -> &mut CorsPolicy {
        Arc::make_mut(&mut self.policy)
    }

    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.policy_mut().origins.push(origin.into());
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        let method = method.into().to_ascii_uppercase();
        let methods = &mut self.policy_mut().methods;
        if !methods.contains(&method) {
            methods.push(method);
        }
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.policy_mut().headers.push(header.into());
        self
    }

    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.policy_mut().max_age = max_age;
        self
    }

    /// Allows cookies and credentials. A `*` origin is then echoed as the concrete
    /// request origin, since browsers reject `*` with credentials.
    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.policy_mut().credentials = allow;
        self
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let policy = Arc::clone(&self.policy);

        Box::pin(async move {
            let request = ctx.request();
            let Some(allow_origin) = request.origin().and_then(|o| policy.allow_origin(o)) else {
                return next.run(ctx).await;
            };
            let preflight = request.method() == &Method::Options
                && request.headers().contains("access-control-request-method");

            if preflight {
                let mut response = Response::new(StatusCode::NoContent)
                    .header("Access-Control-Allow-Methods", policy.methods.join(", "))
                    .header("Access-Control-Allow-Headers", policy.headers.join(", "))
                    .header(
                        "Access-Control-Max-Age",
                        policy.max_age.as_secs().to_string(),
                    );
                policy.decorate(&mut response, &allow_origin);
                return response;
            }

            let mut response = next.run(ctx).await;
            policy.decorate(&mut response, &allow_origin);
            response
        })
    }

    fn name(&self) -> &str {
        "cors"
    }
}
