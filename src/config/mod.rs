//! Server configuration.
//!
//! [`ServerConfig`] can be built in code through its `with_*` methods or loaded from a
//! TOML file. Every field has a default, so a file only needs the keys it changes.
//! Durations are written as integer milliseconds:
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 9000
//! keep_alive_timeout = 2000
//!
//! [default_headers]
//! X-Frame-Options = "DENY"
//!
//! [websocket]
//! max_message_size = 65536
//! protocols = ["chat"]
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ConnectionConfig;
use crate::http::Limits;
use crate::websocket::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Serializes a [`Duration`] as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Everything the server needs to know before it binds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind. An IP address or a host name.
    pub host: String,
    /// `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Connections served at once; extra connections get `503`.
    pub max_connections: usize,
    /// Worker threads in the scheduler that runs handlers.
    pub thread_pool_size: usize,
    /// Read timeout while a request is in flight.
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    /// How long an idle keep-alive connection waits for its next request.
    #[serde(with = "duration_ms")]
    pub keep_alive_timeout: Duration,
    /// Upper bound on handler execution; exceeded requests get `503`.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Write timeout for responses and frames.
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,
    /// Largest accepted request body, in bytes.
    pub max_request_size: usize,
    /// Largest accepted request head, in bytes.
    pub max_header_size: usize,
    pub enable_keep_alive: bool,
    pub enable_compression: bool,
    pub enable_websocket: bool,
    /// Value of the `Server` response header.
    pub server_name: String,
    /// How long shutdown waits for live connections before abandoning them.
    #[serde(with = "duration_ms")]
    pub graceful_shutdown_timeout: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<PathBuf>,
    /// Path of the built-in statistics endpoint; disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    /// Headers added to every response that does not already carry them.
    pub default_headers: BTreeMap<String, String>,
    pub websocket: WebSocketSettings,
}

/// The `[websocket]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    /// Subprotocols the server is willing to speak, in preference order.
    pub protocols: Vec<String>,
    pub auto_pong: bool,
    /// How long the server waits for the peer's close frame.
    #[serde(with = "duration_ms")]
    pub close_timeout: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            max_frame_size: session.max_frame_size,
            max_message_size: session.max_message_size,
            protocols: Vec::new(),
            auto_pong: session.auto_pong,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
            max_connections: 1000,
            thread_pool_size: thread::available_parallelism().map_or(4, |n| n.get()),
            connection_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
            max_request_size: limits.max_body_size,
            max_header_size: limits.max_header_size,
            enable_keep_alive: true,
            enable_compression: false,
            enable_websocket: true,
            server_name: concat!("kiln/", env!("CARGO_PKG_VERSION")).to_owned(),
            graceful_shutdown_timeout: Duration::from_secs(10),
            tls_cert_path: None,
            tls_key_path: None,
            health_endpoint: None,
            default_headers: BTreeMap::new(),
            websocket: WebSocketSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or mistyped values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Parse`] if it is
    /// not valid TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Semantic checks that the type system cannot express. Every problem found is
    /// reported, not just the first.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] listing each problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if !is_valid_host(&self.host) {
            problems.push(format!("host {:?} is not an IP address or host name", self.host));
        }
        if self.max_connections == 0 {
            problems.push("max_connections must be at least 1".to_owned());
        }
        if self.thread_pool_size == 0 {
            problems.push("thread_pool_size must be at least 1".to_owned());
        }
        if self.max_header_size == 0 {
            problems.push("max_header_size must be at least 1".to_owned());
        }
        if self.max_header_size > self.max_request_size {
            problems.push(format!(
                "max_header_size ({}) exceeds max_request_size ({})",
                self.max_header_size, self.max_request_size
            ));
        }
        for (name, value) in [
            ("connection_timeout", self.connection_timeout),
            ("keep_alive_timeout", self.keep_alive_timeout),
            ("request_timeout", self.request_timeout),
            ("response_timeout", self.response_timeout),
        ] {
            if value.is_zero() {
                problems.push(format!("{name} must be greater than zero"));
            }
        }
        if self.server_name.contains(['\r', '\n']) {
            problems.push("server_name must not contain line breaks".to_owned());
        }
        if let Some(path) = &self.health_endpoint {
            if !path.starts_with('/') {
                problems.push(format!("health_endpoint {path:?} must start with '/'"));
            }
        }

        match (&self.tls_cert_path, &self.tls_key_path) {
            (None, None) => {}
            (Some(cert), Some(key)) => {
                for (name, path) in [("tls_cert_path", cert), ("tls_key_path", key)] {
                    if !path.is_file() {
                        problems.push(format!("{name} {} is not a readable file", path.display()));
                    }
                }
            }
            _ => problems.push("tls_cert_path and tls_key_path must be set together".to_owned()),
        }

        let ws = &self.websocket;
        if ws.max_frame_size == 0 {
            problems.push("websocket.max_frame_size must be at least 1".to_owned());
        }
        if ws.max_frame_size > ws.max_message_size {
            problems.push(format!(
                "websocket.max_frame_size ({}) exceeds websocket.max_message_size ({})",
                ws.max_frame_size, ws.max_message_size
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_header_size: self.max_header_size,
            max_body_size: self.max_request_size,
        }
    }

    /// Per-connection settings derived from this configuration.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            read_timeout: self.connection_timeout,
            write_timeout: self.response_timeout,
            keep_alive: self.enable_keep_alive,
            keep_alive_timeout: self.keep_alive_timeout,
            limits: self.limits(),
            ..ConnectionConfig::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_message_size: self.websocket.max_message_size,
            max_frame_size: self.websocket.max_frame_size,
            auto_pong: self.websocket.auto_pong,
        }
    }

    // ── Builders ─────────────────────────────────────────────────────────────

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_thread_pool_size(mut self, threads: usize) -> Self {
        self.thread_pool_size = threads;
        self
    }

    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.enable_keep_alive = enabled;
        self
    }

    #[must_use]
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    #[must_use]
    pub fn with_max_header_size(mut self, bytes: usize) -> Self {
        self.max_header_size = bytes;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    #[must_use]
    pub fn with_websocket(mut self, enabled: bool) -> Self {
        self.enable_websocket = enabled;
        self
    }

    #[must_use]
    pub fn with_websocket_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.websocket.protocols.push(protocol.into());
        self
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    #[must_use]
    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls_cert_path = Some(cert.into());
        self.tls_key_path = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_health_endpoint(mut self, path: impl Into<String>) -> Self {
        self.health_endpoint = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }
}

fn is_valid_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
