//! Serial line protocol: `scheme://verb/arg1/arg2?id=N`.
//!
//! Commands that carry an `id` expect exactly one reply, either
//! `scheme://rply/ok?id=N` (executed) or `scheme://rply/ko?id=N`
//! (rejected). A command without `id` expects no correlated reply.
//!
//! # Example
//!
//! ```
//! use avrprobe_core::line::{LineCommand, parse_reply};
//!
//! let cmd = LineCommand::new("alp", "ppsw", ["12", "1"]).with_id(42);
//! assert_eq!(cmd.to_string(), "alp://ppsw/12/1?id=42");
//!
//! let reply = parse_reply("alp://rply/ok?id=42").unwrap();
//! assert!(reply.ok);
//! assert_eq!(reply.id, 42);
//! ```

use std::fmt;

use crate::error::{Error, Result};

/// Default scheme used by the line protocol.
pub const DEFAULT_SCHEME: &str = "alp";

/// Verb the device uses for replies.
pub const REPLY_VERB: &str = "rply";

/// A parsed line-protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCommand {
    pub scheme: String,
    pub verb: String,
    pub args: Vec<String>,
    pub id: Option<u32>,
}

impl LineCommand {
    pub fn new<I, S>(scheme: &str, verb: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scheme: scheme.to_string(),
            verb: verb.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            id: None,
        }
    }

    /// Attach (or replace) the correlation id.
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Parse `scheme://verb/args...?id=N`.
    ///
    /// Query parameters other than `id` are ignored.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (scheme, rest) = line
            .split_once("://")
            .ok_or_else(|| Error::MalformedPayload(format!("missing scheme: {line}")))?;
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let mut parts = path.split('/');
        let verb = parts
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::MalformedPayload(format!("missing verb: {line}")))?;
        let args = parts.map(str::to_string).collect();

        let id = match query {
            Some(q) => query_id(q)?,
            None => None,
        };

        Ok(Self {
            scheme: scheme.to_string(),
            verb: verb.to_string(),
            args,
            id,
        })
    }
}

impl fmt::Display for LineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.verb)?;
        for arg in &self.args {
            write!(f, "/{arg}")?;
        }
        if let Some(id) = self.id {
            write!(f, "?id={id}")?;
        }
        Ok(())
    }
}

/// A reply to a correlated line command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineReply {
    /// `true` for `ok`, `false` for `ko`.
    pub ok: bool,
    pub id: u32,
}

/// Parse a reply line. Returns `None` for anything that is not a
/// well-formed `rply/ok` or `rply/ko` carrying an id.
pub fn parse_reply(line: &str) -> Option<LineReply> {
    let cmd = LineCommand::parse(line).ok()?;
    if cmd.verb != REPLY_VERB {
        return None;
    }
    let ok = match cmd.args.first().map(String::as_str) {
        Some("ok") => true,
        Some("ko") => false,
        _ => return None,
    };
    Some(LineReply { ok, id: cmd.id? })
}

/// The `id` query value of any line, with or without a scheme.
pub fn id_of(line: &str) -> Option<u32> {
    let (_, query) = line.trim().split_once('?')?;
    query_id(query).ok().flatten()
}

/// Return `line` with its `id` query parameter set to `id`.
///
/// An existing `id` is replaced; other query parameters are kept.
pub fn set_id(line: &str, id: u32) -> String {
    let line = line.trim();
    let (path, query) = match line.split_once('?') {
        Some((path, query)) => (path, query),
        None => (line, ""),
    };
    let mut params: Vec<&str> = query
        .split('&')
        .filter(|p| !p.is_empty() && !p.starts_with("id="))
        .collect();
    let id_param = format!("id={id}");
    params.push(&id_param);
    format!("{path}?{}", params.join("&"))
}

/// The no-op notification used to confirm the device is ready.
pub fn steady_state_probe(id: u32) -> LineCommand {
    LineCommand::new(DEFAULT_SCHEME, "notn", ["0", "0"]).with_id(id)
}

fn query_id(query: &str) -> Result<Option<u32>> {
    for param in query.split('&') {
        if let Some(value) = param.strip_prefix("id=") {
            return value
                .parse()
                .map(Some)
                .map_err(|_| Error::MalformedPayload(format!("invalid id: {value}")));
        }
    }
    Ok(None)
}
