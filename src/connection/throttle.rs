//! Write throttling and passive socket health probing.

use std::time::{Duration, Instant};

use tracing::warn;

use super::Transport;

/// Caps bytes written per one-second window. Once a write pushes the window over the
/// cap, the writer is delayed by a fixed step before continuing.
#[derive(Debug, Clone)]
pub struct BandwidthLimiter {
    bytes_per_second: u64,
    window: Duration,
    delay: Duration,
    window_start: Instant,
    window_bytes: u64,
    throttled: u64,
}

impl BandwidthLimiter {
    pub const WINDOW: Duration = Duration::from_secs(1);
    pub const DELAY: Duration = Duration::from_millis(10);

    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            window: Self::WINDOW,
            delay: Self::DELAY,
            window_start: Instant::now(),
            window_bytes: 0,
            throttled: 0,
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second
    }

    /// How many writes have been delayed so far.
    pub fn throttled(&self) -> u64 {
        self.throttled
    }

    /// Records `bytes` written at `now` and returns the delay to apply, if any.
    pub fn record(&mut self, bytes: usize, now: Instant) -> Option<Duration> {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.window_bytes = 0;
        }
        self.window_bytes = self.window_bytes.saturating_add(bytes as u64);
        if self.window_bytes > self.bytes_per_second {
            self.throttled += 1;
            Some(self.delay)
        } else {
            None
        }
    }

    /// Records a write and sleeps if the window is over its cap.
    pub async fn throttle(&mut self, bytes: usize) {
        if let Some(delay) = self.record(bytes, Instant::now()) {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Periodically asks the transport for a pending socket error. A failed probe marks the
/// connection unhealthy; it never closes it.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    interval: Duration,
    last_probe: Instant,
    healthy: bool,
    last_error: Option<String>,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_probe: Instant::now(),
            healthy: true,
            last_error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Probes `transport` when at least one interval has passed since the last probe.
    pub fn maybe_probe<T: Transport + ?Sized>(&mut self, transport: &T, now: Instant) {
        if now.duration_since(self.last_probe) < self.interval {
            return;
        }
        self.probe(transport, now);
    }

    pub fn probe<T: Transport + ?Sized>(&mut self, transport: &T, now: Instant) {
        self.last_probe = now;
        let failure = match transport.take_error() {
            Ok(None) => return,
            Ok(Some(err)) | Err(err) => err,
        };
        warn!(error = %failure, "connection health probe failed");
        self.healthy = false;
        self.last_error = Some(failure.to_string());
    }

    /// Marks the connection unhealthy after an I/O failure seen elsewhere.
    pub fn mark_unhealthy(&mut self, reason: impl Into<String>) {
        self.healthy = false;
        self.last_error = Some(reason.into());
    }
}
