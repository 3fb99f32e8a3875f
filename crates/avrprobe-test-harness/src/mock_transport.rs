//! In-memory transport for deterministic testing of capture and correlation.
//!
//! [`MockTransport::pair`] returns the transport half (handed to the code
//! under test) and a [`MockPeer`] that plays the device: it injects inbound
//! data, observes everything the transport sent, and can close the channel
//! or make it fail. Scripted replies can be pre-loaded so a request written
//! by the code under test is answered automatically.
//!
//! # Example
//!
//! ```
//! use avrprobe_test_harness::MockTransport;
//!
//! let (transport, peer) = MockTransport::pair();
//! // When the host sends the steady-state probe, answer it.
//! peer.expect(b"alp://notn/0/0?id=0\n", b"alp://rply/ok?id=0\n");
//! // Unsolicited traffic can be pushed at any time.
//! peer.push_line("alp://dred/12/0");
//! # drop(transport);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};

use avrprobe_core::error::{Error, Result};
use avrprobe_core::transport::Transport;

/// Something the peer delivers to the transport's receive side.
#[derive(Debug)]
enum Inbound {
    Data(Vec<u8>),
    Close,
    Fail(String),
}

/// A pre-loaded request/response pair.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes the host is expected to send.
    request: Vec<u8>,
    /// The bytes delivered back when the matching request is sent.
    response: Vec<u8>,
}

#[derive(Debug, Default)]
struct Shared {
    /// Log of all bytes sent through the transport, one entry per `send()`.
    sent_log: Mutex<Vec<Vec<u8>>>,
    /// Signalled on every send and when the transport half is dropped.
    sent: Notify,
    /// Scripted replies, matched against every send (first match wins).
    expectations: Mutex<Vec<Expectation>>,
    /// Set once the host side has called `close()`.
    host_closed: AtomicBool,
    /// Set once the transport half has been dropped.
    transport_dropped: AtomicBool,
    /// While set, `send()` never completes.
    stall_writes: AtomicBool,
}

/// The transport half of a mock pair.
#[derive(Debug)]
pub struct MockTransport {
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    /// Loops scripted replies back into the inbound queue.
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    /// Bytes from the last inbound chunk not yet handed to `receive()`.
    pending: Vec<u8>,
    connected: bool,
    remote_closed: bool,
    shared: Arc<Shared>,
}

/// The device half of a mock pair.
#[derive(Debug)]
pub struct MockPeer {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    /// Index into the sent log of the next chunk `recv_sent()` returns.
    read_cursor: usize,
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Create a connected transport and the peer that drives it.
    pub fn pair() -> (MockTransport, MockPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let transport = MockTransport {
            inbound_rx,
            inbound_tx: inbound_tx.clone(),
            pending: Vec::new(),
            connected: true,
            remote_closed: false,
            shared: shared.clone(),
        };
        let peer = MockPeer {
            inbound_tx,
            read_cursor: 0,
            shared,
        };
        (transport, peer)
    }

    /// Set the connected state.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

impl MockPeer {
    /// Deliver raw bytes to the transport's receive side.
    pub fn push_bytes(&self, data: &[u8]) {
        let _ = self.inbound_tx.send(Inbound::Data(data.to_vec()));
    }

    /// Deliver one newline-terminated line.
    pub fn push_line(&self, line: &str) {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.push_bytes(&data);
    }

    /// Deliver one JSON value as a newline-terminated line.
    pub fn push_json(&self, value: &serde_json::Value) {
        self.push_line(&value.to_string());
    }

    /// Close the channel from the device side.
    ///
    /// Data pushed before the close is still delivered first.
    pub fn close(&self) {
        let _ = self.inbound_tx.send(Inbound::Close);
    }

    /// Make the next receive (after any queued data) fail with
    /// [`Error::Transport`].
    pub fn fail(&self, message: &str) {
        let _ = self.inbound_tx.send(Inbound::Fail(message.to_string()));
    }

    /// Answer `request` with `response` whenever the host sends it.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        self.shared.expectations.lock().push(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// All data the host has sent so far, one entry per `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.shared.sent_log.lock().clone()
    }

    /// Sent data decoded as text lines (terminators removed).
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent_data()
            .iter()
            .flat_map(|chunk| {
                String::from_utf8_lossy(chunk)
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Wait for the next chunk the host sends, in send order.
    ///
    /// Returns `None` once the transport half has been dropped and every
    /// chunk has been returned. Cancel-safe: a chunk is only consumed when
    /// it is returned.
    pub async fn recv_sent(&mut self) -> Option<Vec<u8>> {
        loop {
            let notified = self.shared.sent.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(chunk) = self.shared.sent_log.lock().get(self.read_cursor).cloned() {
                self.read_cursor += 1;
                return Some(chunk);
            }
            if self.shared.transport_dropped.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Make every later `send()` hang, like a port held by flow control.
    pub fn stall_writes(&self) {
        self.shared.stall_writes.store(true, Ordering::SeqCst);
    }

    /// Whether the host side has called `close()`.
    pub fn host_closed(&self) -> bool {
        self.shared.host_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if self.remote_closed {
            return Err(Error::TransportClosed);
        }

        if self.shared.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        self.shared.sent_log.lock().push(data.to_vec());
        self.shared.sent.notify_waiters();

        let response = self
            .shared
            .expectations
            .lock()
            .iter()
            .find(|e| e.request == data)
            .map(|e| e.response.clone());
        if let Some(response) = response {
            let _ = self.inbound_tx.send(Inbound::Data(response));
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if !self.pending.is_empty() {
            return Ok(self.drain_pending(buf));
        }
        if self.remote_closed {
            return Err(Error::TransportClosed);
        }

        match tokio::time::timeout(timeout, self.inbound_rx.recv()).await {
            Ok(Some(Inbound::Data(data))) => {
                self.pending = data;
                Ok(self.drain_pending(buf))
            }
            Ok(Some(Inbound::Close)) | Ok(None) => {
                self.remote_closed = true;
                Err(Error::TransportClosed)
            }
            Ok(Some(Inbound::Fail(message))) => Err(Error::Transport(message)),
            Err(_) => Err(Error::ReceiveTimeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.pending.clear();
        self.shared.host_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.remote_closed
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.shared.transport_dropped.store(true, Ordering::SeqCst);
        self.shared.sent.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pushed_line_is_received() {
        let (mut mock, peer) = MockTransport::pair();
        peer.push_line("alp://rply/ok?id=0");

        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"alp://rply/ok?id=0\n");
    }

    #[tokio::test]
    async fn scripted_reply_follows_matching_send() {
        let (mut mock, peer) = MockTransport::pair();
        peer.expect(b"alp://notn/0/0?id=0\n", b"alp://rply/ok?id=0\n");

        mock.send(b"alp://notn/0/0?id=0\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"alp://rply/ok?id=0\n");
    }

    #[tokio::test]
    async fn unscripted_send_is_recorded_without_reply() {
        let (mut mock, mut peer) = MockTransport::pair();
        mock.send(b"alp://ppsw/12/1\n").await.unwrap();
        mock.send(b"alp://ppsw/12/0\n").await.unwrap();

        assert_eq!(peer.sent_lines(), vec!["alp://ppsw/12/1", "alp://ppsw/12/0"]);
        assert_eq!(peer.recv_sent().await.unwrap(), b"alp://ppsw/12/1\n");

        let mut buf = [0u8; 64];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::ReceiveTimeout)));
    }

    #[tokio::test]
    async fn recv_sent_waits_then_ends_after_drop() {
        let (mut mock, mut peer) = MockTransport::pair();

        let reader = tokio::spawn(async move {
            let mut chunks = Vec::new();
            while let Some(chunk) = peer.recv_sent().await {
                chunks.push(chunk);
            }
            chunks
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        mock.send(b"alp://notn/0/0?id=1\n").await.unwrap();
        mock.send(b"alp://notn/0/0?id=2\n").await.unwrap();
        drop(mock);

        let chunks = reader.await.unwrap();
        assert_eq!(
            chunks,
            vec![
                b"alp://notn/0/0?id=1\n".to_vec(),
                b"alp://notn/0/0?id=2\n".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn stalled_write_never_completes() {
        let (mut mock, peer) = MockTransport::pair();
        peer.stall_writes();

        let result = tokio::time::timeout(Duration::from_millis(20), mock.send(b"x\n")).await;
        assert!(result.is_err());
        assert!(peer.sent_data().is_empty());
    }

    #[tokio::test]
    async fn receive_without_data_times_out() {
        let (mut mock, _peer) = MockTransport::pair();
        let mut buf = [0u8; 64];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::ReceiveTimeout)));
    }

    #[tokio::test]
    async fn partial_receive_keeps_remainder() {
        let (mut mock, peer) = MockTransport::pair();
        peer.push_bytes(&[0xAA, 0xBB, 0xCC, 0xDD]);

        let mut buf = [0u8; 2];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0xAA, 0xBB]);

        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0xCC, 0xDD]);
    }

    #[tokio::test]
    async fn peer_close_after_data() {
        let (mut mock, peer) = MockTransport::pair();
        peer.push_line("last");
        peer.close();

        let mut buf = [0u8; 64];
        assert!(mock.receive(&mut buf, Duration::from_millis(100)).await.is_ok());
        let result = mock.receive(&mut buf, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::TransportClosed)));
        assert!(!mock.is_connected());

        let result = mock.send(b"x\n").await;
        assert!(matches!(result, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn peer_fail_surfaces_transport_error() {
        let (mut mock, peer) = MockTransport::pair();
        peer.fail("device unplugged");

        let mut buf = [0u8; 64];
        let result = mock.receive(&mut buf, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Transport(msg)) if msg == "device unplugged"));
    }

    #[tokio::test]
    async fn host_close_is_observable() {
        let (mut mock, peer) = MockTransport::pair();
        assert!(mock.is_connected());
        assert!(!peer.host_closed());

        mock.close().await.unwrap();
        assert!(!mock.is_connected());
        assert!(peer.host_closed());

        let result = mock.send(&[0x01]).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn set_connected_false_rejects_io() {
        let (mut mock, _peer) = MockTransport::pair();
        mock.set_connected(false);

        let mut buf = [0u8; 8];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }
}
