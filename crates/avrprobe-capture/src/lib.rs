//! Background capture for avrprobe transports.
//!
//! Each open transport is wrapped in a [`CapturedStream`]: one tokio task
//! owns the transport exclusively, appends every decoded inbound frame to an
//! append-only [`Buffer`], and performs outbound writes on behalf of callers.
//! Readers only ever look at [`Snapshot`]s, so waiting never consumes or
//! reorders traffic.
//!
//! # Architecture
//!
//! - [`buffer`] -- the shared append-only buffer, marks, and snapshots
//! - [`capture`] -- the stream lifecycle and the select loop

pub mod buffer;
pub mod capture;

pub use buffer::{Buffer, Mark, Snapshot};
pub use capture::{CaptureConfig, CapturedStream, StreamStatus, Termination};
