//! avrprobe-core: Core traits, message types, codecs, and errors for avrprobe.
//!
//! This crate defines the transport-agnostic pieces shared by the capture
//! loop, the concrete transports, and the correlation harness.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level duplex channel
//! - [`Codec`] / [`FrameBuffer`] -- newline framing and payload decode
//! - [`RawMessage`] / [`Payload`] -- what the capture loop stores
//! - [`line`] -- the `scheme://verb/args?id=N` serial protocol
//! - [`Error`] / [`Result`] -- error handling

pub mod codec;
pub mod error;
pub mod line;
pub mod message;
pub mod transport;

// Re-export key types at crate root for ergonomic `use avrprobe_core::*`.
pub use codec::{Codec, FrameBuffer};
pub use error::{Error, Result};
pub use line::{LineCommand, LineReply};
pub use message::{Payload, RawMessage};
pub use transport::{Transport, TransportKind};
