//! Security-related middleware.

mod cors;

pub use cors::CorsMiddleware;
