//! # avrprobe -- dual-transport protocol correlation for device tests
//!
//! `avrprobe` drives a microcontroller (or its emulator) over two
//! independent channels at once: a serial line speaking the
//! `alp://verb/args?id=N` text protocol, and a socket (WebSocket or plain
//! TCP) carrying JSON objects. Tests send on either side and then assert,
//! without races, that a reply or state change eventually shows up,
//! possibly on the *other* side.
//!
//! ## Quick Start
//!
//! ```no_run
//! use avrprobe::{HarnessBuilder, LinePattern, PinValue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let harness = HarnessBuilder::new()
//!         .serial_port("/dev/ttyUSB0")
//!         .socket("ws://localhost:8080")
//!         .connect()
//!         .await?;
//!     harness.start()?;
//!     harness.wait_for_steady_state().await?;
//!
//!     // Serial command, socket observation.
//!     harness.set_pin_mode("D12", "digital").await?;
//!     harness.send_line("alp://ppsw/12/1").await?;
//!     harness.wait_for_state("D12", PinValue::Digital(true)).await?;
//!
//!     // Socket command, serial observation.
//!     assert!(harness.request_line("alp://srld/12").await?.ok);
//!     harness.set_pin_state("D12", PinValue::Digital(true)).await?;
//!     harness.wait_for_line(&LinePattern::exact("alp://dred/12/1")).await?;
//!
//!     harness.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                   | Purpose                                          |
//! |-------------------------|--------------------------------------------------|
//! | `avrprobe-core`         | `Transport` trait, codec, line protocol, errors  |
//! | `avrprobe-capture`      | Background capture task and append-only buffer   |
//! | `avrprobe-transport`    | Serial, TCP, WebSocket; connect with backoff     |
//! | `avrprobe-test-harness` | Mock transports and a scripted device double     |
//! | **`avrprobe`**          | This crate: correlation, waits, the `Harness`    |
//!
//! ## Waiting
//!
//! Every wait is bounded by a deadline and never consumes traffic. Two
//! condition shapes cover most assertions:
//!
//! - **exists anywhere** ([`wait::predicate::exists`]): a reply may already
//!   be in the buffer when the wait starts, so the whole history is
//!   scanned;
//! - **most recent only** ([`wait::predicate::latest_matches`]): the
//!   current state of a key is the value of its latest message; transient
//!   earlier values never satisfy the wait.

pub use avrprobe_capture::{CaptureConfig, CapturedStream, Mark, Snapshot, StreamStatus, Termination};
pub use avrprobe_core::*;
pub use avrprobe_transport::{Backoff, SerialConfig};

pub mod correlate;
pub mod harness;
pub mod pin;
pub mod wait;

pub use correlate::{CorrelationToken, ReplyCorrelator};
pub use harness::{Harness, HarnessBuilder};
pub use pin::{PinValue, StateView};
pub use wait::ConditionWaiter;
pub use wait::predicate::{LinePattern, StateMatch};

/// Concrete transports, re-exported for callers that build their own.
pub mod transports {
    pub use avrprobe_transport::*;
}
