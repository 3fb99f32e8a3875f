//! Error types for avrprobe.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport failures, decode failures,
//! wait deadlines and lifecycle misuse are all captured here.

use std::time::Duration;

/// The error type for all avrprobe operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A wait condition was never satisfied before its deadline.
    ///
    /// Expected in negative-path tests. The capture task keeps running;
    /// only the wait call that produced this error has failed.
    #[error("timed out after {waited:?} waiting for {condition} (last seen: {last_seen})")]
    Timeout {
        /// Human-readable description of the condition.
        condition: String,
        /// How long the caller actually waited.
        waited: Duration,
        /// Rendering of the most recent captured messages.
        last_seen: String,
    },

    /// A single transport receive attempt produced no data in time.
    ///
    /// The capture loop treats this as "nothing yet" and keeps polling.
    #[error("timeout waiting for data")]
    ReceiveTimeout,

    /// An inbound frame could not be decoded.
    ///
    /// Never fatal to the capture loop: the frame is logged and dropped.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The retry budget for opening a transport was exhausted.
    #[error("{target} unavailable after {attempts} connection attempts")]
    ConnectionUnavailable {
        /// The endpoint that could not be reached.
        target: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The remote end closed the channel.
    #[error("transport closed by peer")]
    TransportClosed,

    /// `start()` was called on a stream that is already capturing.
    #[error("capture already started")]
    DoubleStart,

    /// The stream has not been started yet.
    #[error("capture not started")]
    NotStarted,

    /// The stream (or harness) has already been stopped.
    #[error("used after stop")]
    UseAfterStop,

    /// A request could not be encoded or tagged.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A transport-level error (serial port, TCP socket, WebSocket).
    #[error("transport error: {0}")]
    Transport(String),

    /// No connection has been established.
    #[error("not connected")]
    NotConnected,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
