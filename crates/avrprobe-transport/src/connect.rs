//! Connection establishment with capped exponential backoff.
//!
//! Device emulators and bridges often come up a few seconds after the test
//! process starts. [`connect`] keeps calling an opener until it succeeds or
//! the attempt budget in [`Backoff`] runs out.

use std::future::Future;
use std::time::Duration;

use avrprobe_core::error::{Error, Result};
use avrprobe_core::transport::Transport;

use crate::serial::{SerialConfig, SerialTransport};
use crate::tcp::TcpTransport;
use crate::ws::WsTransport;

/// Retry budget for [`connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// Total number of connection attempts (at least one is always made).
    pub max_attempts: u32,
    /// Sleep after the first failure.
    pub initial_interval: Duration,
    /// Upper bound for the doubled sleep.
    pub max_interval: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    pub fn new(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            max_interval,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// The interval following `current`.
    fn next_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_interval)
    }
}

/// Call `open` until it succeeds, sleeping between failures.
///
/// After each failed attempt the current interval is slept, then doubled
/// (capped at `max_interval`). A success returns immediately. After
/// `max_attempts` failures the result is [`Error::ConnectionUnavailable`]
/// naming `target`.
pub async fn connect<T, F, Fut>(target: &str, backoff: &Backoff, mut open: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = backoff.max_attempts.max(1);
    let mut interval = backoff.initial_interval.min(backoff.max_interval);

    for attempt in 1..=attempts {
        match open().await {
            Ok(transport) => {
                if attempt > 1 {
                    tracing::info!(%target, attempt, "connected after retrying");
                }
                return Ok(transport);
            }
            Err(e) => {
                tracing::warn!(
                    %target,
                    attempt,
                    max_attempts = attempts,
                    retry_in_ms = interval.as_millis(),
                    error = %e,
                    "connection attempt failed"
                );
                tokio::time::sleep(interval).await;
                interval = backoff.next_interval(interval);
            }
        }
    }

    tracing::error!(%target, attempts, "giving up on connection");
    Err(Error::ConnectionUnavailable {
        target: target.to_string(),
        attempts,
    })
}

/// Open the structured-protocol socket named by `target`.
///
/// `ws://` and `wss://` URLs open a [`WsTransport`]; `tcp://host:port` or a
/// bare `host:port` opens a [`TcpTransport`].
pub async fn open_socket(target: &str, timeout: Duration) -> Result<Box<dyn Transport>> {
    if target.starts_with("ws://") || target.starts_with("wss://") {
        let transport = WsTransport::connect_with_timeout(target, timeout).await?;
        return Ok(Box::new(transport));
    }
    let addr = target.strip_prefix("tcp://").unwrap_or(target);
    if addr.contains("://") {
        return Err(Error::InvalidRequest(format!(
            "unsupported socket scheme: {target}"
        )));
    }
    let transport = TcpTransport::connect_with_timeout(addr, timeout).await?;
    Ok(Box::new(transport))
}

/// Open the serial device at `port`.
pub async fn open_serial(port: &str, config: SerialConfig) -> Result<Box<dyn Transport>> {
    let transport = SerialTransport::open_with_config(port, config).await?;
    Ok(Box::new(transport))
}
