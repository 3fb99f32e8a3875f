//! Background capture task for one transport.
//!
//! One tokio task owns the transport exclusively once capture has started.
//! It drains every received frame into the stream's [`Buffer`] and performs
//! outbound writes on behalf of callers, so nothing outside the task can
//! steal bytes from the buffer.
//!
//! The loop uses `tokio::select! { biased; }` to prioritise:
//! 1. Cancellation (from [`CapturedStream::stop`])
//! 2. Outbound writes
//! 3. Receive with a short per-attempt timeout

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use avrprobe_core::codec::{Codec, DEFAULT_MAX_FRAME_LEN, FrameBuffer};
use avrprobe_core::error::{Error, Result};
use avrprobe_core::message::Payload;
use avrprobe_core::transport::{Transport, TransportKind};

use crate::buffer::{Buffer, Mark, Snapshot};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Tuning for a capture task.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Timeout for a single receive attempt. Bounds how long cancellation
    /// and outbound writes can be delayed by an idle transport.
    pub receive_timeout: Duration,
    /// Size of the receive scratch buffer.
    pub read_chunk: usize,
    /// Bound on a single write, and on closing the transport at exit.
    pub send_timeout: Duration,
    /// Longest inbound frame kept; longer frames are dropped whole.
    pub max_frame_len: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(100),
            read_chunk: 1024,
            send_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Lifecycle state of a [`CapturedStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Created, not yet started.
    Idle,
    /// Capture task running.
    Running,
    /// The peer closed the transport; the task has exited.
    RemoteClosed,
    /// The transport failed; the error is returned by `stop()`.
    Failed,
    /// `stop()` has completed.
    Stopped,
}

impl StreamStatus {
    /// Whether the capture task has exited for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RemoteClosed | Self::Failed | Self::Stopped)
    }
}

/// How a stream ended, as reported by [`CapturedStream::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stopped on request (or already stopped).
    Stopped,
    /// The peer had closed the transport before `stop()`.
    RemoteClosed,
}

/// A write request handed to the capture task.
struct Outbound {
    data: Vec<u8>,
    reply: oneshot::Sender<Result<()>>,
}

/// Why the capture loop exited.
enum Exit {
    Stopped,
    RemoteClosed,
    Failed(Error),
}

struct Running {
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    task: JoinHandle<Exit>,
}

enum Lifecycle {
    Idle(Box<dyn Transport>),
    Running(Running),
    Stopped,
}

/// One transport plus its background capture task and buffer.
///
/// All methods take `&self`, so a stream can be shared (e.g. in an `Arc`)
/// and stopped from a different task than the one that started it.
pub struct CapturedStream {
    kind: TransportKind,
    codec: Codec,
    config: CaptureConfig,
    buffer: Buffer,
    lifecycle: Mutex<Lifecycle>,
    status: Arc<Mutex<StreamStatus>>,
}

impl CapturedStream {
    /// Wrap an open transport. Capture begins at [`start`](Self::start).
    pub fn new(kind: TransportKind, transport: Box<dyn Transport>, config: CaptureConfig) -> Self {
        Self {
            kind,
            codec: Codec::for_kind(kind),
            config,
            buffer: Buffer::new(),
            lifecycle: Mutex::new(Lifecycle::Idle(transport)),
            status: Arc::new(Mutex::new(StreamStatus::Idle)),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.lock()
    }

    /// Spawn the capture task.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`Error::DoubleStart`] if already running and
    /// [`Error::UseAfterStop`] after `stop()`.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let transport = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle(transport) => transport,
            other @ Lifecycle::Running(_) => {
                *lifecycle = other;
                return Err(Error::DoubleStart);
            }
            Lifecycle::Stopped => return Err(Error::UseAfterStop),
        };

        let (tx, rx) = mpsc::channel::<Outbound>(32);
        let cancel = CancellationToken::new();
        *self.status.lock() = StreamStatus::Running;

        let task = tokio::spawn(capture_loop(
            transport,
            self.kind,
            self.codec,
            self.config.clone(),
            self.buffer.clone(),
            self.status.clone(),
            rx,
            cancel.clone(),
        ));

        *lifecycle = Lifecycle::Running(Running { tx, cancel, task });
        debug!(kind = %self.kind, "capture started");
        Ok(())
    }

    /// Write raw bytes through the capture task.
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        let tx = match &*self.lifecycle.lock() {
            Lifecycle::Idle(_) => return Err(Error::NotStarted),
            Lifecycle::Stopped => return Err(Error::UseAfterStop),
            Lifecycle::Running(running) => running.tx.clone(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Outbound {
            data,
            reply: reply_tx,
        })
        .await
        .map_err(|_| Error::TransportClosed)?;

        match tokio::time::timeout(self.config.send_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => Err(Error::Transport(format!(
                "{} write not completed within {:?}",
                self.kind, self.config.send_timeout
            ))),
        }
    }

    /// Encode a payload with this stream's codec and send it.
    pub async fn send_payload(&self, payload: &Payload) -> Result<()> {
        let data = self.codec.encode(payload)?;
        self.send(data).await
    }

    /// Copy of everything captured so far. Never waits on I/O.
    pub fn snapshot(&self) -> Snapshot {
        self.buffer.snapshot()
    }

    /// Current end of the buffer.
    pub fn mark(&self) -> Mark {
        self.buffer.mark()
    }

    /// The underlying buffer (for change notification).
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Stop capturing, close the transport, and wait for the task to exit.
    ///
    /// Returns how the stream ended, or the transport error that made the
    /// capture loop fail. Calling `stop()` again is a no-op.
    pub async fn stop(&self) -> Result<Termination> {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);

        let outcome = match previous {
            Lifecycle::Stopped => return Ok(Termination::Stopped),
            Lifecycle::Idle(mut transport) => {
                debug!(kind = %self.kind, "closing never-started stream");
                transport.close().await.map(|()| Termination::Stopped)
            }
            Lifecycle::Running(Running { tx, cancel, task }) => {
                cancel.cancel();
                drop(tx);
                match task.await {
                    Ok(Exit::Stopped) => Ok(Termination::Stopped),
                    Ok(Exit::RemoteClosed) => Ok(Termination::RemoteClosed),
                    Ok(Exit::Failed(e)) => Err(e),
                    Err(e) => Err(Error::Transport(format!("capture task panicked: {e}"))),
                }
            }
        };

        *self.status.lock() = StreamStatus::Stopped;
        debug!(kind = %self.kind, ?outcome, "capture stopped");
        outcome
    }
}

impl Drop for CapturedStream {
    fn drop(&mut self) {
        if let Lifecycle::Running(running) = &*self.lifecycle.get_mut() {
            debug!(kind = %self.kind, "CapturedStream dropped while running, cancelling");
            running.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Capture loop
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn capture_loop(
    mut transport: Box<dyn Transport>,
    kind: TransportKind,
    codec: Codec,
    config: CaptureConfig,
    buffer: Buffer,
    status: Arc<Mutex<StreamStatus>>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) -> Exit {
    let mut frames = FrameBuffer::with_max_frame_len(config.max_frame_len);
    let mut chunk = vec![0u8; config.read_chunk.max(1)];

    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(%kind, "capture task cancelled");
                break Exit::Stopped;
            }

            req = rx.recv() => {
                match req {
                    Some(Outbound { data, reply }) => {
                        trace!(%kind, bytes = data.len(), "writing");
                        let write = tokio::time::timeout(config.send_timeout, transport.send(&data));
                        tokio::select! {
                            biased;

                            _ = cancel.cancelled() => {
                                debug!(%kind, "capture task cancelled during a write");
                                let _ = reply.send(Err(Error::UseAfterStop));
                                break Exit::Stopped;
                            }

                            result = write => match result {
                                Ok(result) => {
                                    let _ = reply.send(result);
                                }
                                Err(_) => {
                                    let message = format!(
                                        "{kind} write stalled for {:?}",
                                        config.send_timeout
                                    );
                                    warn!(%kind, "write stalled, stopping capture");
                                    *status.lock() = StreamStatus::Failed;
                                    let _ = reply.send(Err(Error::Transport(message.clone())));
                                    break Exit::Failed(Error::Transport(message));
                                }
                            },
                        }
                    }
                    None => {
                        debug!(%kind, "outbound channel closed, exiting capture task");
                        break Exit::Stopped;
                    }
                }
            }

            result = transport.receive(&mut chunk, config.receive_timeout) => {
                match result {
                    Ok(n) => {
                        frames.extend(&chunk[..n]);
                        drain_frames(&mut frames, kind, codec, &buffer);
                    }
                    Err(Error::ReceiveTimeout) => {}
                    Err(Error::TransportClosed) => {
                        debug!(%kind, "peer closed transport");
                        *status.lock() = StreamStatus::RemoteClosed;
                        break Exit::RemoteClosed;
                    }
                    Err(e) => {
                        warn!(%kind, error = %e, "transport failed, stopping capture");
                        *status.lock() = StreamStatus::Failed;
                        break Exit::Failed(e);
                    }
                }
            }
        }
    };

    match tokio::time::timeout(config.send_timeout, transport.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%kind, error = %e, "failed to close transport (continuing anyway)"),
        Err(_) => warn!(%kind, "transport close timed out, dropping it"),
    }
    exit
}

/// Decode every complete frame and append it. Malformed frames are dropped.
fn drain_frames(frames: &mut FrameBuffer, kind: TransportKind, codec: Codec, buffer: &Buffer) {
    while let Some(frame) = frames.next_frame() {
        match codec.decode(&frame) {
            Ok(Some(payload)) => {
                let message = buffer.append(payload);
                trace!(%kind, seq = message.seq, payload = %message.payload, "captured");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%kind, error = %e, "discarding malformed frame");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use avrprobe_test_harness::MockTransport;
    use serde_json::json;

    fn serial_stream() -> (CapturedStream, avrprobe_test_harness::MockPeer) {
        let (transport, peer) = MockTransport::pair();
        let stream = CapturedStream::new(
            TransportKind::Serial,
            Box::new(transport),
            CaptureConfig {
                receive_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );
        (stream, peer)
    }

    async fn wait_len(stream: &CapturedStream, n: usize) -> Snapshot {
        for _ in 0..200 {
            let snap = stream.snapshot();
            if snap.len() >= n {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("only {} of {n} messages captured", stream.snapshot().len());
    }

    fn lines(snap: &Snapshot) -> Vec<String> {
        snap.iter().map(|m| m.payload.to_string()).collect()
    }

    // =======================================================================
    // Capture
    // =======================================================================

    #[tokio::test]
    async fn captures_in_arrival_order_exactly_once() {
        let (stream, peer) = serial_stream();
        stream.start().unwrap();

        let expected: Vec<String> = (0..50).map(|i| format!("alp://dred/12/{i}")).collect();
        for line in &expected {
            peer.push_line(line);
        }

        let snap = wait_len(&stream, expected.len()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let snap_later = stream.snapshot();

        assert_eq!(lines(&snap), expected);
        assert_eq!(snap_later.len(), expected.len());
        for (i, message) in snap.iter().enumerate() {
            assert_eq!(message.seq, i);
        }

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let (stream, peer) = serial_stream();
        stream.start().unwrap();

        peer.push_bytes(b"alp://rply/");
        peer.push_bytes(b"ok?id=7\r\nalp://dred");
        peer.push_bytes(b"/12/1\n");

        let snap = wait_len(&stream, 2).await;
        assert_eq!(lines(&snap), vec!["alp://rply/ok?id=7", "alp://dred/12/1"]);

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn snapshots_are_monotonic() {
        let (stream, peer) = serial_stream();
        stream.start().unwrap();

        let mut previous = stream.snapshot();
        for i in 0..20 {
            peer.push_line(&format!("line {i}"));
            tokio::time::sleep(Duration::from_millis(2)).await;
            let current = stream.snapshot();
            assert!(previous.is_prefix_of(&current));
            previous = current;
        }

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_json_is_skipped_without_stopping_capture() {
        let (transport, peer) = MockTransport::pair();
        let stream = CapturedStream::new(
            TransportKind::Socket,
            Box::new(transport),
            CaptureConfig::default(),
        );
        stream.start().unwrap();

        peer.push_json(&json!({"type": "pinState", "pin": "D12", "state": false}));
        peer.push_line("{this is not json");
        peer.push_line("");
        peer.push_json(&json!({"type": "pinState", "pin": "D12", "state": true}));

        let snap = wait_len(&stream, 2).await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.messages()[1].payload.field("state"), Some(&json!(true)));
        assert_eq!(stream.status(), StreamStatus::Running);

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn large_json_object_is_captured_whole() {
        let (transport, peer) = MockTransport::pair();
        let stream = CapturedStream::new(
            TransportKind::Socket,
            Box::new(transport),
            CaptureConfig {
                receive_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );
        stream.start().unwrap();

        let note = "z".repeat(10_000);
        peer.push_json(&json!({"type": "pinState", "pin": "D12", "state": true, "note": note}));
        peer.push_json(&json!({"type": "pinState", "pin": "D13", "state": false}));

        let snap = wait_len(&stream, 2).await;
        let pins: Vec<_> = snap.iter().map(|m| m.payload.field("pin").cloned()).collect();
        assert_eq!(pins, vec![Some(json!("D12")), Some(json!("D13"))]);
        assert_eq!(snap.messages()[0].payload.field("note"), Some(&json!(note)));

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn line_over_frame_limit_is_dropped_whole() {
        let (transport, peer) = MockTransport::pair();
        let stream = CapturedStream::new(
            TransportKind::Serial,
            Box::new(transport),
            CaptureConfig {
                receive_timeout: Duration::from_millis(10),
                max_frame_len: 1024,
                ..Default::default()
            },
        );
        stream.start().unwrap();

        peer.push_line(&format!("alp://cust/{}?id=5", "y".repeat(3000)));
        peer.push_line("alp://dred/12/1");

        let snap = wait_len(&stream, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(lines(&stream.snapshot()), vec!["alp://dred/12/1"]);
        assert_eq!(snap.len(), 1);
        assert_eq!(stream.status(), StreamStatus::Running);

        stream.stop().await.unwrap();
    }

    // =======================================================================
    // Sending
    // =======================================================================

    #[tokio::test]
    async fn send_goes_through_capture_task() {
        let (stream, peer) = serial_stream();
        peer.expect(b"alp://notn/0/0?id=0\n", b"alp://rply/ok?id=0\n");
        stream.start().unwrap();

        stream
            .send_payload(&Payload::Line("alp://notn/0/0?id=0".into()))
            .await
            .unwrap();

        let snap = wait_len(&stream, 1).await;
        assert_eq!(lines(&snap), vec!["alp://rply/ok?id=0"]);
        assert_eq!(peer.sent_lines(), vec!["alp://notn/0/0?id=0"]);

        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_before_start_is_rejected() {
        let (stream, _peer) = serial_stream();
        let result = stream.send(b"x\n".to_vec()).await;
        assert!(matches!(result, Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn send_after_remote_close_reports_closed() {
        let (stream, peer) = serial_stream();
        stream.start().unwrap();
        peer.close();

        for _ in 0..200 {
            if stream.status() == StreamStatus::RemoteClosed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stream.status(), StreamStatus::RemoteClosed);

        let result = stream.send(b"x\n".to_vec()).await;
        assert!(matches!(result, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn stalled_write_fails_the_stream_and_stop_returns() {
        let (transport, peer) = MockTransport::pair();
        let stream = CapturedStream::new(
            TransportKind::Serial,
            Box::new(transport),
            CaptureConfig {
                receive_timeout: Duration::from_millis(10),
                send_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        stream.start().unwrap();
        peer.stall_writes();

        let result = stream.send(b"alp://ppsw/12/1\n".to_vec()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        for _ in 0..100 {
            if stream.status() == StreamStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stream.status(), StreamStatus::Failed);

        let stopped = tokio::time::timeout(Duration::from_secs(2), stream.stop())
            .await
            .expect("stop() must not hang on a stalled write");
        assert!(matches!(stopped, Err(Error::Transport(msg)) if msg.contains("stalled")));
        assert!(peer.host_closed());
    }

    #[tokio::test]
    async fn stop_interrupts_a_write_in_progress() {
        let (transport, peer) = MockTransport::pair();
        let stream = Arc::new(CapturedStream::new(
            TransportKind::Serial,
            Box::new(transport),
            CaptureConfig {
                receive_timeout: Duration::from_millis(10),
                send_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        ));
        stream.start().unwrap();
        peer.stall_writes();

        let writer = stream.clone();
        let pending_send =
            tokio::spawn(async move { writer.send(b"alp://ppsw/12/1\n".to_vec()).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), stream.stop())
            .await
            .expect("stop() must not wait for the stalled write");
        assert_eq!(stopped.unwrap(), Termination::Stopped);
        assert!(pending_send.await.unwrap().is_err());
    }

    // =======================================================================
    // Lifecycle
    // =======================================================================

    #[tokio::test]
    async fn double_start_is_an_error() {
        let (stream, _peer) = serial_stream();
        stream.start().unwrap();
        assert!(matches!(stream.start(), Err(Error::DoubleStart)));
        assert_eq!(stream.status(), StreamStatus::Running);
        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn use_after_stop_is_an_error() {
        let (stream, _peer) = serial_stream();
        stream.start().unwrap();
        stream.stop().await.unwrap();

        assert!(matches!(stream.start(), Err(Error::UseAfterStop)));
        let result = stream.send(b"x\n".to_vec()).await;
        assert!(matches!(result, Err(Error::UseAfterStop)));
    }

    #[tokio::test]
    async fn stop_closes_transport_and_is_idempotent() {
        let (stream, peer) = serial_stream();
        stream.start().unwrap();
        peer.push_line("kept");
        wait_len(&stream, 1).await;

        assert_eq!(stream.stop().await.unwrap(), Termination::Stopped);
        assert!(peer.host_closed());
        assert_eq!(stream.status(), StreamStatus::Stopped);

        assert_eq!(stream.stop().await.unwrap(), Termination::Stopped);
        // Captured history survives shutdown.
        assert_eq!(stream.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn stop_of_idle_stream_closes_transport() {
        let (stream, peer) = serial_stream();
        assert_eq!(stream.status(), StreamStatus::Idle);
        assert_eq!(stream.stop().await.unwrap(), Termination::Stopped);
        assert!(peer.host_closed());
    }

    #[tokio::test]
    async fn remote_close_is_surfaced_to_stop() {
        let (stream, peer) = serial_stream();
        stream.start().unwrap();
        peer.push_line("bye");
        peer.close();

        wait_len(&stream, 1).await;
        for _ in 0..200 {
            if stream.status() == StreamStatus::RemoteClosed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stream.stop().await.unwrap(), Termination::RemoteClosed);
    }

    #[tokio::test]
    async fn transport_failure_is_returned_by_stop() {
        let (stream, peer) = serial_stream();
        stream.start().unwrap();
        peer.fail("device unplugged");

        for _ in 0..200 {
            if stream.status() == StreamStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stream.status(), StreamStatus::Failed);

        let result = stream.stop().await;
        assert!(matches!(result, Err(Error::Transport(msg)) if msg == "device unplugged"));
        // Second stop is a no-op.
        assert_eq!(stream.stop().await.unwrap(), Termination::Stopped);
    }

    #[tokio::test]
    async fn stop_from_another_task() {
        let (stream, peer) = serial_stream();
        let stream = Arc::new(stream);
        stream.start().unwrap();

        let remote = stream.clone();
        let result = tokio::spawn(async move { remote.stop().await })
            .await
            .unwrap();
        assert_eq!(result.unwrap(), Termination::Stopped);
        assert!(peer.host_closed());
    }
}
