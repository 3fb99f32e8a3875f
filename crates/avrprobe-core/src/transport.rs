//! Transport trait for device communication.
//!
//! The [`Transport`] trait abstracts over the physical link to a device.
//! Implementations exist for serial ports, TCP sockets, WebSockets
//! (`avrprobe-transport`), and mock transports for testing
//! (`avrprobe-test-harness`).
//!
//! Capture tasks operate on a `Transport` rather than directly on a serial
//! port or socket, so the same correlation logic runs against real devices
//! and against deterministic in-memory doubles.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Which of the two independent channels a transport carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Newline-terminated text lines over a serial device.
    Serial,
    /// JSON objects over a WebSocket or TCP stream.
    Socket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => f.write_str("serial"),
            TransportKind::Socket => f.write_str("socket"),
        }
    }
}

/// Asynchronous byte-level duplex transport to a device.
///
/// Framing is not the transport's concern: callers run received bytes
/// through a [`FrameBuffer`](crate::codec::FrameBuffer). Message-oriented
/// transports (WebSocket) present each inbound frame as one
/// newline-terminated line.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes.
    ///
    /// Implementations should return once all bytes have been handed to
    /// the underlying device or socket.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes into the provided buffer.
    ///
    /// Returns the number of bytes read. Waits up to `timeout`; returns
    /// [`Error::ReceiveTimeout`](crate::error::Error::ReceiveTimeout) if
    /// nothing arrives and
    /// [`Error::TransportClosed`](crate::error::Error::TransportClosed)
    /// once the peer has closed the channel.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport.
    ///
    /// After `close()`, `send()` and `receive()` return
    /// [`Error::NotConnected`](crate::error::Error::NotConnected).
    /// Closing twice is harmless.
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
