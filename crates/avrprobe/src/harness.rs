//! The composition root: two captured transports plus correlation and
//! waiting.
//!
//! A [`Harness`] owns one [`CapturedStream`] for the serial line protocol
//! and one for the structured socket protocol. Test code sends through the
//! harness and then waits for replies or state changes, possibly on the
//! other transport.
//!
//! # Example
//!
//! ```no_run
//! use avrprobe::{HarnessBuilder, PinValue};
//!
//! # async fn example() -> avrprobe::Result<()> {
//! let harness = HarnessBuilder::new()
//!     .serial_port("/dev/ttyUSB0")
//!     .socket("ws://localhost:8080")
//!     .connect()
//!     .await?;
//! harness.start()?;
//! harness.wait_for_steady_state().await?;
//!
//! harness.set_pin_mode("D12", "digital").await?;
//! harness.send_line("alp://ppsw/12/1").await?;
//! harness.wait_for_state("D12", PinValue::Digital(true)).await?;
//!
//! harness.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};

use avrprobe_capture::{
    CaptureConfig, CapturedStream, Mark, Snapshot, StreamStatus, Termination,
};
use avrprobe_core::error::{Error, Result};
use avrprobe_core::line::{self, LineReply};
use avrprobe_core::message::{Payload, RawMessage};
use avrprobe_core::transport::{Transport, TransportKind};
use avrprobe_transport::{Backoff, SerialConfig, connect, open_serial, open_socket};

use crate::correlate::{CorrelationToken, ReplyCorrelator};
use crate::pin::{PinValue, StateView};
use crate::wait::ConditionWaiter;
use crate::wait::predicate::{self, LinePattern, StateMatch};

/// Default deadline for a correlated reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(20);
/// Default deadline for a state to converge.
pub const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for a serial line to appear.
pub const DEFAULT_LINE_TIMEOUT: Duration = Duration::from_secs(30);

/// Dual-transport request/reply harness.
pub struct Harness {
    serial: CapturedStream,
    socket: CapturedStream,
    correlator: ReplyCorrelator,
    waiter: ConditionWaiter,
    state_view: StateView,
    reply_timeout: Duration,
    state_timeout: Duration,
    line_timeout: Duration,
}

impl Harness {
    /// Start capturing on both transports.
    ///
    /// Both streams are checked before either is started, so a stream that
    /// was already started or stopped leaves the other one idle. `stop()`
    /// must still be called to release the transports.
    pub fn start(&self) -> Result<()> {
        for kind in [TransportKind::Serial, TransportKind::Socket] {
            match self.stream(kind).status() {
                StreamStatus::Idle => {}
                StreamStatus::Stopped => return Err(Error::UseAfterStop),
                StreamStatus::Running | StreamStatus::RemoteClosed | StreamStatus::Failed => {
                    return Err(Error::DoubleStart);
                }
            }
        }
        self.serial.start()?;
        self.socket.start()?;
        tracing::info!("harness capturing on serial and socket");
        Ok(())
    }

    /// Stop both transports.
    ///
    /// Both streams are always stopped; the first error (serial first) is
    /// returned. Calling `stop()` again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let serial = self.serial.stop().await;
        let socket = self.socket.stop().await;
        for (kind, outcome) in [(TransportKind::Serial, &serial), (TransportKind::Socket, &socket)] {
            match outcome {
                Ok(Termination::RemoteClosed) => {
                    tracing::info!(%kind, "transport had been closed by the peer")
                }
                Ok(Termination::Stopped) => {}
                Err(e) => tracing::warn!(%kind, error = %e, "transport failed during capture"),
            }
        }
        serial?;
        socket?;
        Ok(())
    }

    pub fn stream(&self, kind: TransportKind) -> &CapturedStream {
        match kind {
            TransportKind::Serial => &self.serial,
            TransportKind::Socket => &self.socket,
        }
    }

    pub fn correlator(&self) -> &ReplyCorrelator {
        &self.correlator
    }

    pub fn state_view(&self) -> &StateView {
        &self.state_view
    }

    pub fn snapshot(&self, kind: TransportKind) -> Snapshot {
        self.stream(kind).snapshot()
    }

    pub fn mark(&self, kind: TransportKind) -> Mark {
        self.stream(kind).mark()
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send a payload as-is and return the token it already carries, if any.
    pub async fn send(
        &self,
        kind: TransportKind,
        payload: Payload,
    ) -> Result<Option<CorrelationToken>> {
        let token = match &payload {
            Payload::Line(text) => self.correlator.token_of_line(text),
            Payload::Json(value) => self.correlator.token_of_structured(value),
        };
        tracing::debug!(%kind, %payload, ?token, "sending");
        self.stream(kind).send_payload(&payload).await?;
        Ok(token)
    }

    /// Send a line unchanged. A line without `id` expects no reply.
    pub async fn send_line(&self, line: &str) -> Result<Option<CorrelationToken>> {
        self.send(TransportKind::Serial, Payload::Line(line.to_string()))
            .await
    }

    /// Send a line with a fresh `id` and return its token.
    pub async fn send_line_request(&self, line: &str) -> Result<CorrelationToken> {
        let (tagged, token) = self.correlator.tag_line(line);
        self.send(TransportKind::Serial, Payload::Line(tagged)).await?;
        Ok(token)
    }

    /// Send a structured request with a fresh token and return the token.
    pub async fn send_structured(&self, request: Value) -> Result<CorrelationToken> {
        let (tagged, token) = self.correlator.tag_structured(request)?;
        self.send(TransportKind::Socket, Payload::Json(tagged)).await?;
        Ok(token)
    }

    // -----------------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------------

    /// Wait on `kind`'s buffer until `predicate` yields a value.
    pub async fn wait_for<T, F>(
        &self,
        kind: TransportKind,
        description: &str,
        timeout: Duration,
        predicate: F,
    ) -> Result<T>
    where
        F: FnMut(&Snapshot) -> Option<T>,
    {
        self.waiter
            .wait_for(self.stream(kind).buffer(), timeout, description, predicate)
            .await
    }

    /// Wait for the completed reply to `token`, anywhere in the history.
    pub async fn wait_for_reply(&self, token: &CorrelationToken) -> Result<Arc<RawMessage>> {
        self.wait_for_reply_within(token, self.reply_timeout).await
    }

    pub async fn wait_for_reply_within(
        &self,
        token: &CorrelationToken,
        timeout: Duration,
    ) -> Result<Arc<RawMessage>> {
        let correlator = &self.correlator;
        self.wait_for(
            token.kind(),
            &format!("reply to {token}"),
            timeout,
            predicate::exists(|m| correlator.is_match(m, token)),
        )
        .await
    }

    /// Send `line` with a fresh id and return the device's verdict.
    pub async fn request_line(&self, line: &str) -> Result<LineReply> {
        let token = self.send_line_request(line).await?;
        let reply = self.wait_for_reply(&token).await?;
        reply
            .payload
            .as_line()
            .and_then(|text| self.correlator.line_reply(text))
            .ok_or_else(|| Error::MalformedPayload(format!("not a line reply: {}", reply.payload)))
    }

    /// Send a structured request and wait for its executed reply.
    pub async fn request_structured(&self, request: Value) -> Result<Arc<RawMessage>> {
        let token = self.send_structured(request).await?;
        self.wait_for_reply(&token).await
    }

    /// Wait until a serial line matching `pattern` has been captured.
    pub async fn wait_for_line(&self, pattern: &LinePattern) -> Result<Arc<RawMessage>> {
        self.wait_for_line_since(Mark::START, pattern).await
    }

    /// Wait for a serial line matching `pattern` captured after `mark`.
    pub async fn wait_for_line_since(
        &self,
        mark: Mark,
        pattern: &LinePattern,
    ) -> Result<Arc<RawMessage>> {
        self.wait_for(
            TransportKind::Serial,
            &format!("line {pattern:?} after #{}", mark.position()),
            self.line_timeout,
            predicate::exists_since(mark, predicate::line_matches(pattern)),
        )
        .await
    }

    /// Wait until the current state of `key` satisfies `expected`.
    pub async fn wait_for_state(
        &self,
        key: &str,
        expected: impl Into<StateMatch>,
    ) -> Result<Arc<RawMessage>> {
        self.wait_for_state_within(key, expected, self.state_timeout)
            .await
    }

    pub async fn wait_for_state_within(
        &self,
        key: &str,
        expected: impl Into<StateMatch>,
        timeout: Duration,
    ) -> Result<Arc<RawMessage>> {
        let expected = expected.into();
        let description = format!("{key} to be {expected:?}");
        self.wait_for(
            TransportKind::Socket,
            &description,
            timeout,
            predicate::latest_matches(&self.state_view, key, expected),
        )
        .await
    }

    /// The current value of `key` on the socket, if any was reported.
    pub fn current_state(&self, key: &str) -> Option<Value> {
        let snapshot = self.socket.snapshot();
        self.state_view.current(&snapshot, key).cloned()
    }

    /// Send a no-op notification and wait for the device to acknowledge it.
    ///
    /// A `ko` reply to the notification fails immediately with
    /// [`Error::InvalidRequest`] instead of waiting out the deadline.
    pub async fn wait_for_steady_state(&self) -> Result<()> {
        let id = self.correlator.next_line_id();
        let notification = line::steady_state_probe(id).to_string();
        self.send_line(&notification).await?;

        let correlator = &self.correlator;
        let reply = self
            .wait_for(
                TransportKind::Serial,
                &format!("steady-state acknowledgement id={id}"),
                self.reply_timeout,
                |snapshot: &Snapshot| {
                    snapshot.iter().find_map(|m| {
                        m.payload
                            .as_line()
                            .and_then(|text| correlator.line_reply(text))
                            .filter(|reply| reply.id == id)
                    })
                },
            )
            .await?;
        if !reply.ok {
            tracing::warn!(id, "device rejected the steady-state notification");
            return Err(Error::InvalidRequest(format!(
                "steady-state notification id={id} rejected by the device"
            )));
        }
        tracing::info!(id, "device reached steady state");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pin conveniences
    // -----------------------------------------------------------------------

    /// Ask the device to monitor `pin` in `mode` (`digital` or `analog`).
    pub async fn set_pin_mode(&self, pin: &str, mode: &str) -> Result<Arc<RawMessage>> {
        self.request_structured(json!({"type": "pinMode", "pin": pin, "mode": mode}))
            .await
    }

    /// Drive input `pin` to `value`.
    pub async fn set_pin_state(&self, pin: &str, value: PinValue) -> Result<Arc<RawMessage>> {
        self.request_structured(json!({"type": "pinState", "pin": pin, "state": value.to_json()}))
            .await
    }
}

// ===========================================================================
// Builder
// ===========================================================================

/// Fluent builder for [`Harness`].
///
/// Every setting has a default; only the endpoints are required when
/// connecting with [`connect`](Self::connect).
pub struct HarnessBuilder {
    serial_port: Option<String>,
    serial_config: SerialConfig,
    socket: Option<String>,
    backoff: Backoff,
    connect_timeout: Duration,
    capture: CaptureConfig,
    poll_interval: Duration,
    reply_timeout: Duration,
    state_timeout: Duration,
    line_timeout: Duration,
    state_view: StateView,
    reply_field: Option<String>,
    executed_field: Option<String>,
    line_reply_pattern: Option<Regex>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        HarnessBuilder {
            serial_port: None,
            serial_config: SerialConfig::default(),
            socket: None,
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(5),
            capture: CaptureConfig::default(),
            poll_interval: crate::wait::DEFAULT_POLL_INTERVAL,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            state_timeout: DEFAULT_STATE_TIMEOUT,
            line_timeout: DEFAULT_LINE_TIMEOUT,
            state_view: StateView::default(),
            reply_field: None,
            executed_field: None,
            line_reply_pattern: None,
        }
    }

    /// Serial device path (e.g. `/dev/ttyUSB0`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Serial line rate (default: 115200).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.serial_config.baud_rate = baud;
        self
    }

    pub fn serial_config(mut self, config: SerialConfig) -> Self {
        self.serial_config = config;
        self
    }

    /// Socket endpoint: `ws://`/`wss://` URL, `tcp://host:port` or
    /// `host:port`.
    pub fn socket(mut self, target: &str) -> Self {
        self.socket = Some(target.to_string());
        self
    }

    /// Retry policy for opening both transports.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Timeout for a single socket connection attempt (default: 5s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn capture_config(mut self, config: CaptureConfig) -> Self {
        self.capture = config;
        self
    }

    /// Re-poll interval for waits (default: 100ms).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Deadline for correlated replies (default: 20s).
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Deadline for state convergence (default: 30s).
    pub fn state_timeout(mut self, timeout: Duration) -> Self {
        self.state_timeout = timeout;
        self
    }

    /// Deadline for serial lines to appear (default: 30s).
    pub fn line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    /// Use one deadline for every kind of wait.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.reply_timeout(timeout)
            .state_timeout(timeout)
            .line_timeout(timeout)
    }

    /// Which structured messages carry state (default: `pinState`).
    pub fn state_view(mut self, view: StateView) -> Self {
        self.state_view = view;
        self
    }

    /// Field carrying the structured token (default: `replyId`).
    pub fn reply_field(mut self, field: &str) -> Self {
        self.reply_field = Some(field.to_string());
        self
    }

    /// Field marking a structured reply as completed (default: `executed`).
    pub fn executed_field(mut self, field: &str) -> Self {
        self.executed_field = Some(field.to_string());
        self
    }

    /// Recognise line replies with a custom pattern; see
    /// [`ReplyCorrelator::with_line_reply_pattern`].
    pub fn line_reply_pattern(mut self, pattern: Regex) -> Self {
        self.line_reply_pattern = Some(pattern);
        self
    }

    /// Build a harness over caller-provided transports (e.g. the mocks from
    /// `avrprobe-test-harness`). Capture starts at [`Harness::start`].
    pub fn build_with_transports(
        self,
        serial: Box<dyn Transport>,
        socket: Box<dyn Transport>,
    ) -> Result<Harness> {
        let mut correlator = ReplyCorrelator::new();
        if let Some(field) = &self.reply_field {
            correlator = correlator.with_reply_field(field);
        }
        if let Some(field) = &self.executed_field {
            correlator = correlator.with_executed_field(field);
        }
        if let Some(pattern) = self.line_reply_pattern {
            correlator = correlator.with_line_reply_pattern(pattern)?;
        }

        Ok(Harness {
            serial: CapturedStream::new(TransportKind::Serial, serial, self.capture.clone()),
            socket: CapturedStream::new(TransportKind::Socket, socket, self.capture),
            correlator,
            waiter: ConditionWaiter::new(self.poll_interval),
            state_view: self.state_view,
            reply_timeout: self.reply_timeout,
            state_timeout: self.state_timeout,
            line_timeout: self.line_timeout,
        })
    }

    /// Open the serial port and the socket, retrying each with backoff.
    ///
    /// Requires [`serial_port`](Self::serial_port) and
    /// [`socket`](Self::socket).
    pub async fn connect(self) -> Result<Harness> {
        let port = self
            .serial_port
            .clone()
            .ok_or_else(|| Error::InvalidRequest("serial_port is required for connect()".into()))?;
        let target = self
            .socket
            .clone()
            .ok_or_else(|| Error::InvalidRequest("socket is required for connect()".into()))?;

        let serial_config = self.serial_config.clone();
        let serial = connect(&port, &self.backoff, || {
            open_serial(&port, serial_config.clone())
        })
        .await?;

        let timeout = self.connect_timeout;
        let socket = connect(&target, &self.backoff, || open_socket(&target, timeout)).await?;

        self.build_with_transports(serial, socket)
    }
}
