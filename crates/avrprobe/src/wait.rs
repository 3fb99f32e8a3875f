//! Bounded waiting on conditions over captured traffic.
//!
//! [`ConditionWaiter::wait_for`] re-evaluates a predicate against fresh
//! snapshots of a [`Buffer`] until it yields a value or the deadline passes.
//! It wakes on every append and otherwise re-polls at a fixed interval, so
//! it never busy-spins and never sleeps past the deadline. Waiting never
//! consumes messages: a reply that arrived before the wait started is still
//! found.
//!
//! The [`predicate`] module holds the standard condition shapes.

use std::time::Duration;

use tokio::time::Instant;

use avrprobe_capture::{Buffer, Snapshot};
use avrprobe_core::error::{Error, Result};

/// Default re-poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of trailing messages rendered into a timeout error.
const LAST_SEEN: usize = 5;

/// Generic bounded polling over buffer snapshots.
#[derive(Debug, Clone, Copy)]
pub struct ConditionWaiter {
    poll_interval: Duration,
}

impl Default for ConditionWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl ConditionWaiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Evaluate `predicate` until it returns `Some`, for at most `timeout`.
    ///
    /// The predicate is always evaluated at least once. On expiry the error
    /// is [`Error::Timeout`] carrying `description`, the time actually
    /// waited, and the tail of the last snapshot examined. The capture task
    /// is unaffected.
    pub async fn wait_for<T, F>(
        &self,
        buffer: &Buffer,
        timeout: Duration,
        description: &str,
        mut predicate: F,
    ) -> Result<T>
    where
        F: FnMut(&Snapshot) -> Option<T>,
    {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut polls = 0u32;

        loop {
            // Register for wake-up before looking, so an append landing
            // between the snapshot and the sleep is not missed.
            let changed = buffer.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let snapshot = buffer.snapshot();
            polls += 1;
            if let Some(found) = predicate(&snapshot) {
                tracing::debug!(condition = description, polls, "condition met");
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - start;
                tracing::debug!(condition = description, ?waited, polls, "condition timed out");
                return Err(Error::Timeout {
                    condition: description.to_string(),
                    waited,
                    last_seen: snapshot.tail(LAST_SEEN),
                });
            }

            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

/// Standard predicate shapes for [`ConditionWaiter::wait_for`].
pub mod predicate {
    use std::sync::Arc;

    use regex::Regex;
    use serde_json::Value;

    use avrprobe_capture::{Mark, Snapshot};
    use avrprobe_core::error::{Error, Result};
    use avrprobe_core::message::RawMessage;

    use crate::pin::{PinValue, StateView};

    /// A text condition on a line or a value.
    #[derive(Debug, Clone)]
    pub enum LinePattern {
        /// Equal after trimming surrounding whitespace.
        Exact(String),
        /// Regular expression matched at the start of the text.
        Regex(Regex),
    }

    impl LinePattern {
        pub fn exact(text: &str) -> Self {
            LinePattern::Exact(text.trim().to_string())
        }

        /// Compile `pattern`, anchored at the start of the text.
        pub fn regex(pattern: &str) -> Result<Self> {
            Regex::new(&format!("^(?:{pattern})"))
                .map(LinePattern::Regex)
                .map_err(|e| Error::InvalidRequest(format!("bad pattern {pattern:?}: {e}")))
        }

        pub fn matches(&self, text: &str) -> bool {
            match self {
                LinePattern::Exact(expected) => text.trim() == expected,
                LinePattern::Regex(re) => re.is_match(text),
            }
        }
    }

    /// What the current value of a key must look like.
    #[derive(Debug, Clone)]
    pub enum StateMatch {
        /// JSON equality.
        Equals(Value),
        /// Pin-level equality (`true` equals `1`).
        Pin(PinValue),
        /// Pattern over the value's text (strings unquoted).
        Pattern(LinePattern),
    }

    impl StateMatch {
        pub fn matches(&self, value: &Value) -> bool {
            match self {
                StateMatch::Equals(expected) => value == expected,
                StateMatch::Pin(expected) => expected.matches(value),
                StateMatch::Pattern(pattern) => match value {
                    Value::String(s) => pattern.matches(s),
                    other => pattern.matches(&other.to_string()),
                },
            }
        }
    }

    impl From<Value> for StateMatch {
        fn from(value: Value) -> Self {
            StateMatch::Equals(value)
        }
    }

    impl From<PinValue> for StateMatch {
        fn from(value: PinValue) -> Self {
            StateMatch::Pin(value)
        }
    }

    impl From<bool> for StateMatch {
        fn from(level: bool) -> Self {
            StateMatch::Pin(PinValue::Digital(level))
        }
    }

    impl From<LinePattern> for StateMatch {
        fn from(pattern: LinePattern) -> Self {
            StateMatch::Pattern(pattern)
        }
    }

    /// Most-recent-only convergence: succeeds iff the latest state message
    /// for `key` carries a value satisfying `expected`. Earlier (transient)
    /// values are ignored.
    pub fn latest_matches(
        view: &StateView,
        key: &str,
        expected: impl Into<StateMatch>,
    ) -> impl FnMut(&Snapshot) -> Option<Arc<RawMessage>> {
        let view = view.clone();
        let key = key.to_string();
        let expected = expected.into();
        move |snapshot| {
            let latest = view.latest(snapshot, &key)?;
            let value = view.value_for(latest, &key)?;
            expected.matches(value).then(|| latest.clone())
        }
    }

    /// Exists-anywhere: the first message in the full history satisfying
    /// `pred`.
    pub fn exists<F>(mut pred: F) -> impl FnMut(&Snapshot) -> Option<Arc<RawMessage>>
    where
        F: FnMut(&RawMessage) -> bool,
    {
        move |snapshot| snapshot.find(|m| pred(m)).cloned()
    }

    /// Like [`exists`], restricted to messages captured after `mark`.
    pub fn exists_since<F>(mark: Mark, mut pred: F) -> impl FnMut(&Snapshot) -> Option<Arc<RawMessage>>
    where
        F: FnMut(&RawMessage) -> bool,
    {
        move |snapshot| snapshot.since(mark).iter().find(|m| pred(m)).cloned()
    }

    /// A line payload matching `pattern`.
    pub fn line_matches(pattern: &LinePattern) -> impl Fn(&RawMessage) -> bool + '_ {
        move |message| {
            message
                .payload
                .as_line()
                .is_some_and(|text| pattern.matches(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::predicate::*;
    use super::*;
    use crate::pin::{PinValue, StateView};
    use avrprobe_core::message::Payload;
    use serde_json::json;

    fn pin_state(pin: &str, state: serde_json::Value) -> Payload {
        Payload::Json(json!({"type": "pinState", "pin": pin, "state": state}))
    }

    // -----------------------------------------------------------------------
    // Timing
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn never_true_times_out_no_earlier_than_deadline() {
        let buffer = Buffer::new();
        let waiter = ConditionWaiter::default();
        let timeout = Duration::from_millis(1500);

        let start = Instant::now();
        let result: Result<()> = waiter
            .wait_for(&buffer, timeout, "nothing", |_| None)
            .await;
        let elapsed = start.elapsed();

        assert!(elapsed >= timeout, "returned after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_millis(50));
        match result {
            Err(Error::Timeout {
                condition,
                waited,
                last_seen,
            }) => {
                assert_eq!(condition, "nothing");
                assert!(waited >= timeout);
                assert_eq!(last_seen, "<empty>");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_at_interval_not_busy() {
        let buffer = Buffer::new();
        let waiter = ConditionWaiter::new(Duration::from_millis(100));
        let mut evaluations = 0u32;

        let _ = waiter
            .wait_for(&buffer, Duration::from_secs(1), "count", |_| {
                evaluations += 1;
                None::<()>
            })
            .await;
        // One evaluation up front plus one per 100ms interval.
        assert!((10..=12).contains(&evaluations), "{evaluations} evaluations");
    }

    #[tokio::test]
    async fn append_wakes_waiter_before_poll_interval() {
        let buffer = Buffer::new();
        let writer = buffer.clone();
        let waiter = ConditionWaiter::new(Duration::from_secs(10));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(Payload::Line("alp://rply/ok?id=1".into()));
        });

        let start = std::time::Instant::now();
        let found = waiter
            .wait_for(
                &buffer,
                Duration::from_secs(5),
                "reply",
                exists(|m| m.payload.as_line() == Some("alp://rply/ok?id=1")),
            )
            .await
            .unwrap();
        assert_eq!(found.seq, 0);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn timeout_reports_last_seen_tail() {
        let buffer = Buffer::new();
        buffer.append(Payload::Line("alp://dred/12/0".into()));
        let waiter = ConditionWaiter::new(Duration::from_millis(5));

        let err = waiter
            .wait_for(&buffer, Duration::from_millis(20), "dred high", |_| None::<()>)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("dred high"), "{text}");
        assert!(text.contains("#0 alp://dred/12/0"), "{text}");
    }

    // -----------------------------------------------------------------------
    // Predicates
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn exists_scans_history_from_before_the_wait() {
        let buffer = Buffer::new();
        buffer.append(Payload::Line("alp://rply/ok?id=3".into()));
        buffer.append(Payload::Line("alp://dred/12/1".into()));

        let found = ConditionWaiter::default()
            .wait_for(
                &buffer,
                Duration::ZERO,
                "early reply",
                exists(|m| m.payload.as_line() == Some("alp://rply/ok?id=3")),
            )
            .await
            .unwrap();
        assert_eq!(found.seq, 0);
    }

    #[tokio::test]
    async fn exists_since_ignores_messages_before_mark() {
        let buffer = Buffer::new();
        buffer.append(Payload::Line("alp://dred/12/1".into()));
        let mark = buffer.mark();

        let pattern = LinePattern::exact("alp://dred/12/1");
        let waiter = ConditionWaiter::new(Duration::from_millis(5));
        let result = waiter
            .wait_for(
                &buffer,
                Duration::from_millis(30),
                "fresh dred",
                exists_since(mark, line_matches(&pattern)),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));

        buffer.append(Payload::Line("alp://dred/12/1".into()));
        let found = waiter
            .wait_for(
                &buffer,
                Duration::from_millis(30),
                "fresh dred",
                exists_since(mark, line_matches(&pattern)),
            )
            .await
            .unwrap();
        assert_eq!(found.seq, 1);
    }

    #[tokio::test]
    async fn latest_matches_ignores_transient_values() {
        let buffer = Buffer::new();
        let view = StateView::pin_state();
        buffer.append(pin_state("D12", json!(true)));
        buffer.append(pin_state("D12", json!(false)));
        buffer.append(pin_state("D12", json!(true)));

        let waiter = ConditionWaiter::new(Duration::from_millis(5));
        let found = waiter
            .wait_for(
                &buffer,
                Duration::from_millis(50),
                "D12 high",
                latest_matches(&view, "D12", true),
            )
            .await
            .unwrap();
        assert_eq!(found.seq, 2);

        // `false` appears in history but is not the current state.
        let result = waiter
            .wait_for(
                &buffer,
                Duration::from_millis(50),
                "D12 low",
                latest_matches(&view, "D12", PinValue::Digital(false)),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn latest_matches_converges_when_state_changes() {
        let buffer = Buffer::new();
        let writer = buffer.clone();
        let view = StateView::pin_state();
        buffer.append(pin_state("D12", json!(0)));

        tokio::spawn(async move {
            for value in [10, 50, 127] {
                tokio::time::sleep(Duration::from_millis(10)).await;
                writer.append(pin_state("D12", json!(value)));
            }
        });

        let found = ConditionWaiter::new(Duration::from_millis(5))
            .wait_for(
                &buffer,
                Duration::from_secs(2),
                "D12 at 127",
                latest_matches(&view, "D12", json!(127)),
            )
            .await
            .unwrap();
        assert_eq!(found.payload.field("state"), Some(&json!(127)));
    }

    #[test]
    fn line_patterns() {
        let exact = LinePattern::exact(" alp://dred/12/1 ");
        assert!(exact.matches("alp://dred/12/1"));
        assert!(!exact.matches("alp://dred/12/10"));

        let re = LinePattern::regex(r"alp://ared/5/\d+").unwrap();
        assert!(re.matches("alp://ared/5/987"));
        // Anchored at the start only.
        assert!(re.matches("alp://ared/5/987 trailing"));
        assert!(!re.matches("x alp://ared/5/987"));

        assert!(LinePattern::regex("(").is_err());
    }

    #[test]
    fn state_match_pattern_uses_unquoted_text() {
        let pattern = StateMatch::from(LinePattern::regex("dig").unwrap());
        assert!(pattern.matches(&json!("digital")));
        assert!(StateMatch::from(LinePattern::regex("12").unwrap()).matches(&json!(127)));
    }
}
