//! The accept loop and per-connection driver.
//!
//! Tokio drives socket I/O: every accepted connection gets its own task that reads
//! requests sequentially off the [`Connection`]. Handlers do not run on those tasks;
//! each routed request is spawned onto the server's [`Scheduler`] and raced against
//! `request_timeout`, so a slow or blocking handler never stalls socket I/O.
//!
//! ```rust,no_run
//! use kiln::{Response, Router, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/", |_ctx| async { Response::text("Hello, World!") });
//!
//!     let config = ServerConfig::default().with_host("127.0.0.1").with_port(8080);
//!     let server = Server::bind(config, router).await?;
//!     let handle = server.handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         handle.shutdown();
//!     });
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

mod events;
mod registry;
mod shutdown;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use events::{EventSink, ServerEvent, TracingSink};
pub use registry::{ConnectionEntry, ConnectionRegistry, Registration};
pub use shutdown::ShutdownSignal;

use crate::config::{ConfigError, ServerConfig};
use crate::connection::{Connection, ConnectionError, Transport};
use crate::context::Parameters;
use crate::http::{Method, Request, Response, StatusCode};
use crate::router::{RouteError, Router, WebSocketHandler};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerError};
use crate::stats::{Snapshot, merge_prefixed};
use crate::websocket::{Role, WebSocket, handshake};

/// Errors that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid route table: {0}")]
    Routes(#[from] RouteError),

    #[error("failed to start scheduler: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("TLS is configured but no acceptor was provided")]
    MissingAcceptor,
}

/// Wraps freshly accepted TCP streams, typically in TLS.
///
/// The server only sees the resulting [`Transport`]; certificate handling lives
/// entirely in the acceptor.
pub trait Acceptor: Send + Sync + 'static {
    fn accept(
        &self,
        stream: TcpStream,
    ) -> Pin<Box<dyn Future<Output = io::Result<Box<dyn Transport>>> + Send + '_>>;
}

#[derive(Debug)]
struct ServerStats {
    started_at: Instant,
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    websocket_upgrades: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl ServerStats {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            websocket_upgrades: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_io(&self, conn: &Connection) {
        self.bytes_read.fetch_add(conn.bytes_read(), Ordering::Relaxed);
        self.bytes_written.fetch_add(conn.bytes_written(), Ordering::Relaxed);
    }
}

/// State shared by the accept loop, every connection task and every [`ServerHandle`].
struct Shared {
    config: ServerConfig,
    router: Arc<Router>,
    scheduler: Scheduler,
    registry: ConnectionRegistry,
    stats: ServerStats,
    events: Arc<dyn EventSink>,
    shutdown: ShutdownSignal,
}

/// Configures and binds a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    router: Router,
    events: Arc<dyn EventSink>,
    acceptor: Option<Arc<dyn Acceptor>>,
}

impl ServerBuilder {
    #[must_use]
    pub fn event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Arc::new(sink);
        self
    }

    #[must_use]
    pub fn acceptor(mut self, acceptor: impl Acceptor) -> Self {
        self.acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Validates the configuration and route table, starts the scheduler and binds
    /// the listener. Nothing is accepted until [`Server::run`].
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] and [`ServerError::Routes`] for invalid setup,
    /// [`ServerError::MissingAcceptor`] when TLS paths are set without an acceptor,
    /// [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(self) -> Result<Server, ServerError> {
        self.config.validate()?;
        self.router.validate()?;
        if self.config.is_tls() && self.acceptor.is_none() {
            return Err(ServerError::MissingAcceptor);
        }

        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let scheduler = Scheduler::with_config(
            SchedulerConfig::default()
                .with_threads(self.config.thread_pool_size)
                .with_runtime(tokio::runtime::Handle::current()),
        )?;

        Ok(Server {
            listener,
            local_addr,
            acceptor: self.acceptor,
            shared: Arc::new(Shared {
                config: self.config,
                router: Arc::new(self.router),
                scheduler,
                registry: ConnectionRegistry::new(),
                stats: ServerStats::new(),
                events: self.events,
                shutdown: ShutdownSignal::new(),
            }),
        })
    }
}

/// The kiln HTTP/1.1 and WebSocket server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: Option<Arc<dyn Acceptor>>,
    shared: Arc<Shared>,
}

impl Server {
    pub fn builder(config: ServerConfig, router: Router) -> ServerBuilder {
        ServerBuilder {
            config,
            router,
            events: Arc::new(TracingSink),
            acceptor: None,
        }
    }

    /// Shorthand for `Server::builder(config, router).bind()`.
    ///
    /// # Errors
    ///
    /// See [`ServerBuilder::bind`].
    pub async fn bind(config: ServerConfig, router: Router) -> Result<Self, ServerError> {
        Self::builder(config, router).bind().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle for statistics and shutdown that outlives [`run`](Self::run).
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
            local_addr: self.local_addr,
        }
    }

    /// Accepts connections until shutdown is triggered, then drains.
    ///
    /// Draining stops the listener, waits up to `graceful_shutdown_timeout` for live
    /// connections to finish, aborts the rest and finally shuts the scheduler down.
    ///
    /// # Errors
    ///
    /// [`ServerError::Io`] if the scheduler shutdown task fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            local_addr,
            acceptor,
            shared,
        } = self;
        info!(address = %local_addr, "kiln listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                () = shared.shutdown.wait() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "connection accepted");
                    let shared = Arc::clone(&shared);
                    let acceptor = acceptor.clone();
                    connections.spawn(async move {
                        shared.serve(stream, peer, acceptor).await;
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "connection task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        info!(live = connections.len(), "shutting down");
        let grace = shared.config.graceful_shutdown_timeout;
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                remaining = connections.len(),
                "graceful shutdown timed out, aborting connections"
            );
            connections.shutdown().await;
        }

        let scheduler = shared.scheduler.clone();
        tokio::task::spawn_blocking(move || scheduler.shutdown())
            .await
            .map_err(io::Error::other)?;
        info!("server stopped");
        Ok(())
    }
}

/// Shared view of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Triggers graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.trigger() {
            info!("shutdown requested");
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shared.shutdown.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn statistics(&self) -> Snapshot {
        self.shared.statistics()
    }
}

impl Shared {
    fn statistics(&self) -> Snapshot {
        let stats = &self.stats;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let mut snap = Snapshot::new();
        snap.insert(
            "uptime_ms".into(),
            u64::try_from(stats.started_at.elapsed().as_millis())
                .unwrap_or(u64::MAX)
                .into(),
        );
        snap.insert("connections.active".into(), self.registry.len().into());
        snap.insert(
            "connections.websocket".into(),
            self.registry.websocket_count().into(),
        );
        snap.insert(
            "connections.accepted".into(),
            load(&stats.connections_accepted).into(),
        );
        snap.insert(
            "connections.rejected".into(),
            load(&stats.connections_rejected).into(),
        );
        snap.insert("requests.total".into(), load(&stats.total_requests).into());
        snap.insert("requests.failed".into(), load(&stats.failed_requests).into());
        snap.insert(
            "websocket.upgrades".into(),
            load(&stats.websocket_upgrades).into(),
        );
        snap.insert("bytes.read".into(), load(&stats.bytes_read).into());
        snap.insert("bytes.written".into(), load(&stats.bytes_written).into());
        merge_prefixed(&mut snap, "scheduler", self.scheduler.statistics());
        snap
    }

    async fn serve(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<Arc<dyn Acceptor>>,
    ) {
        let transport: Box<dyn Transport> = match acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(transport) => transport,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "transport handshake failed");
                    return;
                }
            },
            None => Box::new(stream),
        };

        let mut conn = Connection::new(transport, self.config.connection_config());
        let id = conn.id();
        let Some(registration) =
            self.registry
                .try_register(id, Some(peer), self.config.max_connections)
        else {
            warn!(peer = %peer, max = self.config.max_connections, "connection limit reached");
            ServerStats::bump(&self.stats.connections_rejected);
            self.events
                .on_event(&ServerEvent::ConnectionRejected { peer: Some(peer) });
            let response = Response::new(StatusCode::ServiceUnavailable)
                .body("server at capacity")
                .keep_alive(false);
            if let Err(e) = conn.write_response(self.finalize(response)).await {
                debug!(peer = %peer, error = %e, "could not send 503");
            }
            conn.close().await;
            return;
        };

        ServerStats::bump(&self.stats.connections_accepted);
        self.events.on_event(&ServerEvent::ConnectionOpened {
            id,
            peer: Some(peer),
        });

        let requests = self.serve_http(conn, &registration).await;
        self.events
            .on_event(&ServerEvent::ConnectionClosed { id, requests });
    }

    /// The HTTP request loop. Hands the connection over to a WebSocket session when a
    /// request upgrades. Returns the number of requests read.
    async fn serve_http(&self, mut conn: Connection, registration: &Registration) -> u64 {
        let id = conn.id();
        loop {
            let next = tokio::select! {
                () = self.shutdown.wait() => break,
                next = conn.read_request() => next,
            };
            let request = match next {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(ConnectionError::Request(e)) => {
                    warn!(connection_id = %id, error = %e, "malformed request");
                    ServerStats::bump(&self.stats.failed_requests);
                    self.events.on_event(&ServerEvent::RequestFailed {
                        connection: id,
                        error: e.to_string(),
                    });
                    let response = Response::new(e.status())
                        .body(e.to_string())
                        .keep_alive(false);
                    if let Err(e) = conn.write_response(self.finalize(response)).await {
                        debug!(connection_id = %id, error = %e, "could not send error response");
                    }
                    break;
                }
                Err(e) => {
                    debug!(connection_id = %id, error = %e, "read failed");
                    break;
                }
            };

            if self.config.enable_websocket && request.is_websocket_upgrade() {
                if let Some((handler, params)) = self.router.find_websocket(&request) {
                    return self
                        .upgrade(conn, request, handler, params, registration)
                        .await;
                }
            }

            let method = request.method().clone();
            let path = request.path().to_owned();
            let keep_alive = request.is_keep_alive() && !self.shutdown.is_triggered();
            let started = Instant::now();

            let mut response = self.dispatch(request).await;
            if !keep_alive {
                response.set_keep_alive(false);
            }
            let status = response.status();

            ServerStats::bump(&self.stats.total_requests);
            if status.is_server_error() {
                ServerStats::bump(&self.stats.failed_requests);
            }
            if let Err(e) = conn.write_response(self.finalize(response)).await {
                warn!(connection_id = %id, error = %e, "failed to write response");
                self.events.on_event(&ServerEvent::RequestFailed {
                    connection: id,
                    error: e.to_string(),
                });
                break;
            }
            self.events.on_event(&ServerEvent::RequestCompleted {
                connection: id,
                method,
                path,
                status,
                elapsed: started.elapsed(),
            });

            if !conn.is_keep_alive() {
                break;
            }
            conn.prepare_for_reuse();
        }

        conn.close().await;
        self.stats.record_io(&conn);
        conn.requests_served()
    }

    /// Produces the response for one request: the health endpoint, or the router on
    /// the scheduler with a deadline.
    async fn dispatch(&self, request: Request) -> Response {
        if let Some(health) = &self.config.health_endpoint {
            if request.method() == &Method::Get && request.path() == health {
                return Response::json(&self.statistics()).unwrap_or_else(|e| {
                    error!(error = %e, "failed to serialize statistics");
                    Response::internal_error()
                });
            }
        }

        let router = Arc::clone(&self.router);
        let work = match self
            .scheduler
            .spawn(async move { router.route(request).await })
        {
            Ok(work) => work,
            Err(e) => {
                warn!(error = %e, "scheduler rejected request");
                return Response::new(StatusCode::ServiceUnavailable).body("server is busy");
            }
        };

        let timeout = self.config.request_timeout;
        let outcome = match self.scheduler.with_timeout(work, timeout) {
            Ok(deadline) => deadline.await,
            Err(e) => {
                warn!(error = %e, "scheduler rejected request timer");
                return Response::new(StatusCode::ServiceUnavailable).body("server is busy");
            }
        };
        match outcome {
            Ok(response) => response,
            // The handler may still be running; the connection is not reused.
            Err(e) if e.is_timeout() => {
                warn!(?timeout, "request timed out");
                Response::new(StatusCode::ServiceUnavailable)
                    .keep_alive(false)
                    .body("request timed out")
            }
            Err(e) => {
                error!(error = %e, "request task failed");
                Response::internal_error()
            }
        }
    }

    /// Completes the opening handshake and runs the WebSocket handler.
    async fn upgrade(
        &self,
        mut conn: Connection,
        request: Request,
        handler: WebSocketHandler,
        params: Parameters,
        registration: &Registration,
    ) -> u64 {
        let id = conn.id();
        let requests = conn.requests_served();
        let settings = &self.config.websocket;

        let accepted = match handshake::accept(&request, &settings.protocols) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "websocket handshake rejected");
                ServerStats::bump(&self.stats.failed_requests);
                let response = e.to_response();
                if let Err(e) = conn.write_response(self.finalize(response)).await {
                    debug!(connection_id = %id, error = %e, "could not send handshake error");
                }
                conn.close().await;
                self.stats.record_io(&conn);
                return requests;
            }
        };

        if let Err(e) = conn.write_response(self.finalize(accepted.to_response())).await {
            warn!(connection_id = %id, error = %e, "failed to send 101");
            self.stats.record_io(&conn);
            return requests;
        }
        self.stats.record_io(&conn);

        let path = request.path().to_owned();
        let socket = match WebSocket::new(conn, Role::Server, self.config.session_config()) {
            Ok(socket) => socket
                .with_request(request, params)
                .with_protocol(accepted.protocol.clone()),
            Err(e) => {
                warn!(connection_id = %id, error = %e, "failed to start websocket session");
                return requests;
            }
        };

        registration.mark_websocket();
        ServerStats::bump(&self.stats.total_requests);
        ServerStats::bump(&self.stats.websocket_upgrades);
        self.events.on_event(&ServerEvent::WebSocketUpgraded {
            connection: id,
            path,
            protocol: accepted.protocol,
        });

        let session = handler(socket);
        let shutdown = self.shutdown.wait();
        tokio::select! {
            () = session => {}
            () = shutdown => debug!(connection_id = %id, "websocket ended by shutdown"),
        }
        requests
    }

    /// Server-wide response decoration: `Server`, `Date` and configured default headers.
    fn finalize(&self, mut response: Response) -> Response {
        response.apply_defaults(&self.config.server_name);
        for (name, value) in &self.config.default_headers {
            if !response.headers().contains(name) {
                response.add_header(name.as_str(), value.as_str());
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_config() -> ServerConfig {
        ServerConfig::default()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_thread_pool_size(2)
    }

    #[tokio::test]
    async fn invalid_config_fails_before_binding() {
        let config = local_config().with_max_connections(0);
        let err = Server::bind(config, Router::new()).await.err().unwrap();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[tokio::test]
    async fn invalid_routes_fail_before_binding() {
        let mut router = Router::new();
        router
            .get("/users/{id}", |_ctx| async { Response::ok() })
            .where_param("id", "[");
        let err = Server::bind(local_config(), router).await.err().unwrap();
        assert!(matches!(err, ServerError::Routes(_)));
    }

    #[tokio::test]
    async fn tls_without_acceptor_is_rejected() {
        let dir = std::env::temp_dir();
        let cert = dir.join(format!("kiln-test-{}.crt", std::process::id()));
        let key = dir.join(format!("kiln-test-{}.key", std::process::id()));
        std::fs::write(&cert, "cert").unwrap();
        std::fs::write(&key, "key").unwrap();

        let config = local_config().with_tls(&cert, &key);
        let err = Server::bind(config, Router::new()).await.err().unwrap();
        assert!(matches!(err, ServerError::MissingAcceptor));

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn statistics_and_shutdown() {
        let server = Server::bind(local_config(), Router::new()).await.unwrap();
        let handle = server.handle();
        let running = tokio::spawn(server.run());

        let stats = handle.statistics();
        assert_eq!(stats["connections.active"].as_int(), Some(0));
        assert_eq!(stats["scheduler.size"].as_int(), Some(2));

        handle.shutdown();
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(handle.scheduler().is_shutdown());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finalize_adds_server_and_default_headers() {
        let config = local_config()
            .with_server_name("kiln-test")
            .with_default_header("X-Frame-Options", "DENY");
        let server = Server::bind(config, Router::new()).await.unwrap();
        let response = server
            .shared
            .finalize(Response::ok().header("X-Frame-Options", "SAMEORIGIN"));
        assert_eq!(response.get_header("server"), Some("kiln-test"));
        assert_eq!(response.get_header("x-frame-options"), Some("SAMEORIGIN"));
        assert!(response.get_header("date").is_some());
        server.handle().shutdown();
        server.run().await.unwrap();
    }
}
