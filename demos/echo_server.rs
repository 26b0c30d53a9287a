//! A small kiln server: a few HTTP routes, a WebSocket echo endpoint and a health
//! endpoint.
//!
//! ```text
//! cargo run --example echo_server [config.toml]
//! curl localhost:8080/hello/world
//! curl localhost:8080/health
//! ```

use std::time::Duration;

use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln::middleware::LoggerMiddleware;
use kiln::security::CorsMiddleware;
use kiln::websocket::{CloseCode, Message, WebSocket};
use kiln::{Context, HandlerError, Response, Router, Server, ServerConfig};

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

async fn echo(mut socket: WebSocket) {
    tracing::info!(peer = ?socket.peer_addr(), protocol = ?socket.protocol(), "echo session started");
    loop {
        match socket.receive().await {
            Ok(Some(message @ (Message::Text(_) | Message::Binary(_)))) => {
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            Ok(Some(Message::Close(_))) | Ok(None) => break,
            Ok(Some(_)) => {}
            Err(e) => {
                tracing::warn!(error = %e, "echo session failed");
                break;
            }
        }
    }
    socket.finish(CloseCode::Normal, Duration::from_secs(2)).await;
}

fn routes() -> Router {
    let mut router = Router::new();
    router.middleware(LoggerMiddleware);

    router
        .get("/hello/{name}", |ctx: Context| async move {
            let name = ctx.param("name").unwrap_or("stranger").to_owned();
            Response::text(format!("Hello, {name}!"))
        })
        .name("hello");

    router.post("/greet", |ctx: Context| async move {
        let greeting: Greeting = ctx.json()?;
        Ok::<_, HandlerError>(Response::json(&serde_json::json!({
            "message": format!("Hello, {}!", greeting.name),
        }))?)
    });

    router.group("/api", |api| {
        api.middleware(CorsMiddleware::permissive());
        api.get("/time", |_ctx| async {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            Response::text(now.as_secs().to_string())
        });
    });

    router.websocket("/echo", echo);
    router
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln=debug,echo_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default()
            .with_host("127.0.0.1")
            .with_health_endpoint("/health"),
    };

    let router = routes();
    router.print();

    let server = Server::bind(config, router).await?;
    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            handle.shutdown();
        }
    });

    tracing::info!(address = %server.local_addr(), "echo server ready");
    server.run().await?;
    Ok(())
}
