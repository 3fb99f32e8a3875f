//! Transport implementations for avrprobe.
//!
//! This crate provides concrete implementations of the
//! [`Transport`](avrprobe_core::Transport) trait from `avrprobe-core`:
//!
//! - [`SerialTransport`]: USB virtual COM ports and pseudo-terminals carrying
//!   the `alp://` line protocol
//! - [`TcpTransport`]: newline-delimited JSON over plain TCP
//! - [`WsTransport`]: JSON messages over a WebSocket, one per frame
//!
//! plus [`connect`], which opens any of them with capped exponential
//! backoff against an endpoint that may not be listening yet.
//!
//! # Example
//!
//! ```no_run
//! use avrprobe_transport::{Backoff, connect, open_socket};
//! use std::time::Duration;
//!
//! # async fn example() -> avrprobe_core::Result<()> {
//! let url = "ws://localhost:8080";
//! let socket = connect(url, &Backoff::default(), || {
//!     open_socket(url, Duration::from_secs(5))
//! })
//! .await?;
//! # drop(socket);
//! # Ok(())
//! # }
//! ```

pub mod connect;
pub mod serial;
pub mod tcp;
pub mod ws;

pub use connect::{Backoff, connect, open_serial, open_socket};
pub use serial::{DEFAULT_BAUD_RATE, FlowControl, SerialConfig, SerialTransport};
pub use tcp::TcpTransport;
pub use ws::WsTransport;
