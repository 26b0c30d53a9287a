//! # kiln
//!
//! An HTTP/1.1 and WebSocket server engine with its own work-stealing task scheduler.
//!
//! Tokio drives the sockets. Handlers run on kiln's [`Scheduler`](scheduler::Scheduler),
//! a fixed pool of OS threads whose work items can also be suspendable tasks that
//! wait on one-shot [`deferred`] values without holding a thread.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kiln::{Response, Router, Server, ServerConfig};
//! use kiln::websocket::{Message, WebSocket};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/users/{id}", |ctx| async move {
//!         let id = ctx.param("id").unwrap_or_default().to_owned();
//!         Response::text(format!("user {id}"))
//!     });
//!     router.websocket("/echo", |mut socket: WebSocket| async move {
//!         while let Ok(Some(message)) = socket.receive().await {
//!             if let Message::Text(_) | Message::Binary(_) = message {
//!                 if socket.send(message).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         }
//!     });
//!
//!     let config = ServerConfig::default().with_host("127.0.0.1").with_port(8080);
//!     Server::bind(config, router).await?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod deferred;
pub mod http;
pub mod middleware;
pub mod router;
pub mod scheduler;
pub mod security;
pub mod server;
pub mod stats;
pub mod websocket;

pub use config::{ConfigError, ServerConfig};
pub use context::Context;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::{HandlerError, Router};
pub use server::{Server, ServerError, ServerHandle};
