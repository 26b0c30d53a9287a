//! Server lifecycle events.
//!
//! An [`EventSink`] is handed to the server when it is built and receives every
//! [`ServerEvent`] synchronously, on the task that produced it. Sinks must therefore
//! return quickly; forward to a channel if the work is heavy.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use crate::connection::ConnectionId;
use crate::http::{Method, StatusCode};

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ConnectionOpened {
        id: ConnectionId,
        peer: Option<SocketAddr>,
    },
    /// Turned away because `max_connections` were already live.
    ConnectionRejected { peer: Option<SocketAddr> },
    ConnectionClosed { id: ConnectionId, requests: u64 },
    RequestCompleted {
        connection: ConnectionId,
        method: Method,
        path: String,
        status: StatusCode,
        elapsed: Duration,
    },
    /// A request could not be read or answered.
    RequestFailed {
        connection: ConnectionId,
        error: String,
    },
    WebSocketUpgraded {
        connection: ConnectionId,
        path: String,
        protocol: Option<String>,
    },
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &ServerEvent);
}

impl<F> EventSink for F
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent) {
        self(event);
    }
}

/// The default sink: every event as a `debug!` line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::ConnectionOpened { id, peer } => {
                debug!(connection_id = %id, peer = ?peer, "connection opened");
            }
            ServerEvent::ConnectionRejected { peer } => {
                debug!(peer = ?peer, "connection rejected");
            }
            ServerEvent::ConnectionClosed { id, requests } => {
                debug!(connection_id = %id, requests, "connection closed");
            }
            ServerEvent::RequestCompleted {
                connection,
                method,
                path,
                status,
                elapsed,
            } => {
                debug!(
                    connection_id = %connection,
                    %method,
                    %path,
                    status = status.as_u16(),
                    ?elapsed,
                    "request completed"
                );
            }
            ServerEvent::RequestFailed { connection, error } => {
                debug!(connection_id = %connection, %error, "request failed");
            }
            ServerEvent::WebSocketUpgraded {
                connection,
                path,
                protocol,
            } => {
                debug!(connection_id = %connection, %path, ?protocol, "websocket upgraded");
            }
        }
    }
}
