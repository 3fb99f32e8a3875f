//! Append-only message buffer shared between one capture task and any
//! number of readers.
//!
//! The writer appends under a short `parking_lot` lock; readers copy the
//! list of `Arc`s under the same lock and then work on their private
//! [`Snapshot`]. Nothing is ever removed or reordered, so every snapshot is
//! a prefix of every later one.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use avrprobe_core::message::{Payload, RawMessage};

/// A position in a buffer: the number of messages captured at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Mark(usize);

impl Mark {
    /// The mark before any message.
    pub const START: Mark = Mark(0);

    /// Number of messages captured before this mark.
    pub fn position(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
struct Inner {
    messages: Mutex<Vec<Arc<RawMessage>>>,
    changed: Notify,
}

/// Cloneable handle to a shared append-only buffer.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    inner: Arc<Inner>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload, assigning it the next capture index.
    pub fn append(&self, payload: Payload) -> Arc<RawMessage> {
        let message = {
            let mut messages = self.inner.messages.lock();
            let message = Arc::new(RawMessage::new(messages.len(), payload));
            messages.push(message.clone());
            message
        };
        self.inner.changed.notify_waiters();
        message
    }

    /// Copy of everything captured so far.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            messages: self.inner.messages.lock().clone(),
        }
    }

    /// Current end of the buffer.
    pub fn mark(&self) -> Mark {
        Mark(self.len())
    }

    pub fn len(&self) -> usize {
        self.inner.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A future that completes on the next append.
    ///
    /// Call [`Notified::enable`] before taking a snapshot so an append that
    /// races with the snapshot still wakes the waiter.
    pub fn changed(&self) -> Notified<'_> {
        self.inner.changed.notified()
    }
}

/// An immutable point-in-time copy of a buffer.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    messages: Vec<Arc<RawMessage>>,
}

impl Snapshot {
    pub fn messages(&self) -> &[Arc<RawMessage>] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<RawMessage>> {
        self.messages.iter()
    }

    /// The mark just past the last message in this snapshot.
    pub fn end(&self) -> Mark {
        Mark(self.messages.len())
    }

    /// Messages captured at or after `mark`.
    pub fn since(&self, mark: Mark) -> &[Arc<RawMessage>] {
        &self.messages[mark.0.min(self.messages.len())..]
    }

    /// The first message (in capture order) matching `pred`.
    pub fn find<F>(&self, mut pred: F) -> Option<&Arc<RawMessage>>
    where
        F: FnMut(&RawMessage) -> bool,
    {
        self.messages.iter().find(|m| pred(m))
    }

    /// The most recently captured message matching `pred`.
    pub fn latest_where<F>(&self, mut pred: F) -> Option<&Arc<RawMessage>>
    where
        F: FnMut(&RawMessage) -> bool,
    {
        self.messages.iter().rev().find(|m| pred(m))
    }

    /// Whether `self` is a prefix of `later`.
    pub fn is_prefix_of(&self, later: &Snapshot) -> bool {
        self.messages.len() <= later.messages.len()
            && self
                .messages
                .iter()
                .zip(&later.messages)
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }

    /// Render the last `n` messages for diagnostics.
    pub fn tail(&self, n: usize) -> String {
        if self.messages.is_empty() {
            return "<empty>".to_string();
        }
        let start = self.messages.len().saturating_sub(n);
        let mut out = String::new();
        if start > 0 {
            let _ = write!(out, "... {start} earlier; ");
        }
        for (i, message) in self.messages[start..].iter().enumerate() {
            if i > 0 {
                out.push_str("; ");
            }
            let _ = write!(out, "{message}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> Payload {
        Payload::Line(s.to_string())
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let buffer = Buffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.append(line("a")).seq, 0);
        assert_eq!(buffer.append(line("b")).seq, 1);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let buffer = Buffer::new();
        buffer.append(line("a"));
        let before = buffer.snapshot();
        buffer.append(line("b"));
        let after = buffer.snapshot();

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert!(before.is_prefix_of(&after));
        assert!(!after.is_prefix_of(&before));
    }

    #[test]
    fn since_mark() {
        let buffer = Buffer::new();
        buffer.append(line("old"));
        let mark = buffer.mark();
        buffer.append(line("new"));

        let snap = buffer.snapshot();
        let recent: Vec<_> = snap.since(mark).iter().map(|m| m.to_string()).collect();
        assert_eq!(recent, vec!["#1 new"]);
        assert!(snap.since(Mark(10)).is_empty());
        assert_eq!(snap.since(Mark::START).len(), 2);
    }

    #[test]
    fn latest_where_uses_capture_order() {
        let buffer = Buffer::new();
        buffer.append(line("k=1"));
        buffer.append(line("other"));
        buffer.append(line("k=2"));

        let snap = buffer.snapshot();
        let latest = snap.latest_where(|m| m.payload.to_string().starts_with("k=")).unwrap();
        assert_eq!(latest.seq, 2);
        let first = snap.find(|m| m.payload.to_string().starts_with("k=")).unwrap();
        assert_eq!(first.seq, 0);
    }

    #[test]
    fn tail_rendering() {
        let buffer = Buffer::new();
        assert_eq!(buffer.snapshot().tail(3), "<empty>");
        for s in ["a", "b", "c", "d"] {
            buffer.append(line(s));
        }
        assert_eq!(buffer.snapshot().tail(2), "... 2 earlier; #2 c; #3 d");
        assert_eq!(buffer.snapshot().tail(10), "#0 a; #1 b; #2 c; #3 d");
    }

    #[tokio::test]
    async fn changed_wakes_on_append() {
        let buffer = Buffer::new();
        let writer = buffer.clone();

        let notified = buffer.changed();
        tokio::pin!(notified);
        notified.as_mut().enable();

        tokio::spawn(async move {
            writer.append(line("x"));
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .unwrap();
        assert_eq!(buffer.len(), 1);
    }
}
