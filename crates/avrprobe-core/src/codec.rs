//! Frame splitting and payload encode/decode for both transport kinds.
//!
//! Both protocols are newline-delimited on the wire: the serial side carries
//! ASCII/UTF-8 command lines, the socket side carries one compact JSON object
//! per line (WebSocket frames are normalised to lines by the transport).
//!
//! All encoding/decoding in this module is pure -- no I/O is performed.

use crate::error::{Error, Result};
use crate::message::Payload;
use crate::transport::TransportKind;

/// The byte that terminates every frame.
pub const TERMINATOR: u8 = b'\n';

/// Default longest frame accepted, terminator excluded.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Accumulates raw bytes and yields complete newline-terminated frames.
///
/// A frame longer than the limit is dropped whole: its bytes are discarded
/// up to and including the terminator that ends it, so no fragment of it
/// is ever yielded as a frame of its own.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_len: usize,
    /// Inside an oversized frame; drop bytes until the next terminator.
    discarding: bool,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len: max_frame_len.max(1),
            discarding: false,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, mut data: &[u8]) {
        if self.discarding {
            match data.iter().position(|&b| b == TERMINATOR) {
                Some(pos) => {
                    self.discarding = false;
                    data = &data[pos + 1..];
                }
                None => return,
            }
        }
        self.buf.extend_from_slice(data);

        let partial_start = self
            .buf
            .iter()
            .rposition(|&b| b == TERMINATOR)
            .map_or(0, |pos| pos + 1);
        if self.buf.len() - partial_start > self.max_frame_len {
            tracing::warn!(
                limit = self.max_frame_len,
                "frame exceeds limit, discarding until next terminator"
            );
            self.buf.truncate(partial_start);
            self.discarding = true;
        }
    }

    /// Take the next complete frame (without its terminator), if any.
    ///
    /// Complete frames over the limit are skipped.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let pos = self.buf.iter().position(|&b| b == TERMINATOR)?;
            let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
            frame.pop();
            if frame.len() <= self.max_frame_len {
                return Some(frame);
            }
            tracing::warn!(
                len = frame.len(),
                limit = self.max_frame_len,
                "discarding oversized frame"
            );
        }
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Stateless codec selecting the wire shape for a transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Text lines (`scheme://verb/args?id=N`).
    Line,
    /// JSON objects, one per line.
    Json,
}

impl Codec {
    /// The codec used on the given transport.
    pub fn for_kind(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Serial => Codec::Line,
            TransportKind::Socket => Codec::Json,
        }
    }

    /// Encode an outgoing payload to terminated wire bytes.
    pub fn encode(self, payload: &Payload) -> Result<Vec<u8>> {
        match (self, payload) {
            (Codec::Line, Payload::Line(line)) => {
                let line = line.trim_end_matches(['\r', '\n']);
                if line.contains('\n') {
                    return Err(Error::InvalidRequest(
                        "line payload contains an embedded newline".into(),
                    ));
                }
                let mut out = Vec::with_capacity(line.len() + 1);
                out.extend_from_slice(line.as_bytes());
                out.push(TERMINATOR);
                Ok(out)
            }
            (Codec::Json, Payload::Json(value)) => {
                let mut out = serde_json::to_vec(value)
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?;
                out.push(TERMINATOR);
                Ok(out)
            }
            (codec, payload) => Err(Error::InvalidRequest(format!(
                "{codec:?} codec cannot encode {payload}"
            ))),
        }
    }

    /// Decode one frame (terminator already removed).
    ///
    /// Blank frames decode to `Ok(None)` and are simply skipped.
    pub fn decode(self, frame: &[u8]) -> Result<Option<Payload>> {
        let frame = frame.strip_suffix(b"\r").unwrap_or(frame);
        let text = std::str::from_utf8(frame)
            .map_err(|e| Error::MalformedPayload(format!("invalid UTF-8: {e}")))?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        match self {
            Codec::Line => Ok(Some(Payload::Line(text.to_string()))),
            Codec::Json => {
                let value: serde_json::Value = serde_json::from_str(text)
                    .map_err(|e| Error::MalformedPayload(format!("{e}: {text}")))?;
                if !value.is_object() {
                    return Err(Error::MalformedPayload(format!(
                        "expected a JSON object, got {text}"
                    )));
                }
                Ok(Some(Payload::Json(value)))
            }
        }
    }
}
