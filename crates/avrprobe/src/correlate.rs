//! Request/reply correlation by embedded identifier.
//!
//! Replies are matched by the token carried inside them, never by the order
//! in which requests were sent: a reply may arrive late, out of order, or
//! before anyone starts waiting for it.
//!
//! - Line requests carry `?id=N`; the reply is a line reply (by default
//!   `alp://rply/ok?id=N` or `.../ko?id=N`) with the same id.
//! - Structured requests carry a random UUID under `replyId`; the reply is
//!   an object echoing that token with `"executed": true`.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use regex::Regex;
use serde_json::Value;

use avrprobe_core::error::{Error, Result};
use avrprobe_core::line::{self, LineReply};
use avrprobe_core::message::RawMessage;
use avrprobe_core::transport::TransportKind;

/// Default field carrying the structured correlation token.
pub const DEFAULT_REPLY_FIELD: &str = "replyId";

/// Default field marking a structured reply as completed.
pub const DEFAULT_EXECUTED_FIELD: &str = "executed";

/// An identifier embedded in a request and echoed by its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationToken {
    /// The `id` query value of a line command.
    Line(u32),
    /// The `replyId` of a structured request.
    Structured(String),
}

impl CorrelationToken {
    /// The transport the reply arrives on.
    pub fn kind(&self) -> TransportKind {
        match self {
            CorrelationToken::Line(_) => TransportKind::Serial,
            CorrelationToken::Structured(_) => TransportKind::Socket,
        }
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationToken::Line(id) => write!(f, "id={id}"),
            CorrelationToken::Structured(token) => write!(f, "token {token}"),
        }
    }
}

/// Issues tokens and recognises the replies that carry them.
///
/// Tokens are never reused by one correlator: line ids come from a
/// monotonically increasing counter, structured tokens are UUID v4.
#[derive(Debug)]
pub struct ReplyCorrelator {
    next_id: AtomicU32,
    reply_field: String,
    executed_field: String,
    line_reply: Option<Regex>,
}

impl Default for ReplyCorrelator {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            reply_field: DEFAULT_REPLY_FIELD.to_string(),
            executed_field: DEFAULT_EXECUTED_FIELD.to_string(),
            line_reply: None,
        }
    }
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `field` instead of `replyId` for structured tokens.
    pub fn with_reply_field(mut self, field: &str) -> Self {
        self.reply_field = field.to_string();
        self
    }

    /// Use `field` instead of `executed` as the completion flag.
    pub fn with_executed_field(mut self, field: &str) -> Self {
        self.executed_field = field.to_string();
        self
    }

    /// Recognise line replies with a custom pattern instead of
    /// `scheme://rply/ok|ko?id=N`.
    ///
    /// The pattern must have a named group `id`; an optional `status`
    /// group decides ok (`ok`) versus rejected (anything else).
    pub fn with_line_reply_pattern(mut self, pattern: Regex) -> Result<Self> {
        if !pattern.capture_names().flatten().any(|name| name == "id") {
            return Err(Error::InvalidRequest(format!(
                "line reply pattern {pattern} has no `id` group"
            )));
        }
        self.line_reply = Some(pattern);
        Ok(self)
    }

    pub fn reply_field(&self) -> &str {
        &self.reply_field
    }

    /// A fresh line id.
    pub fn next_line_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Give `line` a fresh `id`, replacing any it already had.
    pub fn tag_line(&self, line: &str) -> (String, CorrelationToken) {
        let id = self.next_line_id();
        (line::set_id(line, id), CorrelationToken::Line(id))
    }

    /// Inject a fresh UUID token into a structured request.
    pub fn tag_structured(&self, mut request: Value) -> Result<(Value, CorrelationToken)> {
        let Some(object) = request.as_object_mut() else {
            return Err(Error::InvalidRequest(format!(
                "structured request must be an object: {request}"
            )));
        };
        let token = uuid::Uuid::new_v4().to_string();
        object.insert(self.reply_field.clone(), Value::String(token.clone()));
        Ok((request, CorrelationToken::Structured(token)))
    }

    /// The token a caller already embedded in `line`, if any.
    pub fn token_of_line(&self, line: &str) -> Option<CorrelationToken> {
        line::id_of(line).map(CorrelationToken::Line)
    }

    /// The token a caller already embedded in a structured request.
    pub fn token_of_structured(&self, request: &Value) -> Option<CorrelationToken> {
        request
            .get(&self.reply_field)
            .and_then(Value::as_str)
            .map(|token| CorrelationToken::Structured(token.to_string()))
    }

    /// Interpret `text` as a line reply.
    pub fn line_reply(&self, text: &str) -> Option<LineReply> {
        let Some(pattern) = &self.line_reply else {
            return line::parse_reply(text);
        };
        let caps = pattern.captures(text.trim())?;
        let id = caps.name("id")?.as_str().parse().ok()?;
        let ok = caps.name("status").is_none_or(|s| s.as_str() == "ok");
        Some(LineReply { ok, id })
    }

    /// Whether `message` is the completed reply for `token`.
    ///
    /// A structured reply with the right token but without the completion
    /// flag set to `true` does not match.
    pub fn is_match(&self, message: &RawMessage, token: &CorrelationToken) -> bool {
        match token {
            CorrelationToken::Line(id) => message
                .payload
                .as_line()
                .and_then(|text| self.line_reply(text))
                .is_some_and(|reply| reply.id == *id),
            CorrelationToken::Structured(token) => {
                let payload = &message.payload;
                payload.field(&self.reply_field).and_then(Value::as_str) == Some(token.as_str())
                    && payload.field(&self.executed_field) == Some(&Value::Bool(true))
            }
        }
    }
}
