//! Mock TCP peer for socket-level testing.
//!
//! [`MockTcpServer`] is a lightweight line-oriented TCP listener with a
//! scripted conversation: optional greeting lines sent on accept, then an
//! ordered list of expected request lines, each answered with zero or more
//! response lines. It lets the TCP transport and the harness be exercised
//! over a real loopback socket without a device.
//!
//! # Example
//!
//! ```
//! use avrprobe_test_harness::MockTcpServer;
//!
//! # async fn example() -> avrprobe_core::Result<()> {
//! let mut server = MockTcpServer::new().await?;
//! server.expect(
//!     r#"{"type":"pinMode","pin":"D12","mode":"digital"}"#,
//!     &[r#"{"type":"pinMode","executed":true}"#],
//! );
//! server.start();
//! let addr = server.addr().to_string();
//! // ... connect a TcpTransport to `addr` and test ...
//! # Ok(())
//! # }
//! ```

use avrprobe_core::error::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One scripted exchange.
#[derive(Debug, Clone)]
struct TcpExpectation {
    /// The line we expect the client to send (without terminator).
    request: String,
    /// Lines written back when the request arrives.
    responses: Vec<String>,
}

/// A scripted single-connection TCP peer.
///
/// The server listens on a random localhost port as soon as it is created,
/// so clients may connect before [`start`](MockTcpServer::start) is called;
/// the connection is accepted once the script is running.
pub struct MockTcpServer {
    addr: String,
    listener: Option<TcpListener>,
    greeting: Vec<String>,
    expectations: Vec<TcpExpectation>,
    close_when_done: bool,
    server_handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl MockTcpServer {
    /// Bind a new mock server on `127.0.0.1` with a random port.
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TCP server: {e}")))?;
        let addr = listener.local_addr().map_err(Error::Io)?.to_string();

        Ok(Self {
            addr,
            listener: Some(listener),
            greeting: Vec::new(),
            expectations: Vec::new(),
            close_when_done: false,
            server_handle: None,
        })
    }

    /// Send `line` to the client immediately after accepting it.
    pub fn greet(&mut self, line: &str) {
        self.greeting.push(line.to_string());
    }

    /// Add an expected request line and the lines to answer it with.
    pub fn expect(&mut self, request: &str, responses: &[&str]) {
        self.expectations.push(TcpExpectation {
            request: request.to_string(),
            responses: responses.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Close the connection once every expectation has been served,
    /// instead of waiting for the client to hang up.
    pub fn close_when_done(&mut self, close: bool) {
        self.close_when_done = close;
    }

    /// The `host:port` the server is listening on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Spawn the server task. It accepts a single client and plays the
    /// script. Call [`wait`](MockTcpServer::wait) to collect the outcome.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let greeting = std::mem::take(&mut self.greeting);
        let expectations = std::mem::take(&mut self.expectations);
        let close_when_done = self.close_when_done;

        let handle = tokio::spawn(async move {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {e}"))?;
            tracing::debug!(%peer, "mock TCP server accepted client");

            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            for line in &greeting {
                write_half
                    .write_all(format!("{line}\n").as_bytes())
                    .await
                    .map_err(|e| format!("greeting write error: {e}"))?;
            }

            for (i, expectation) in expectations.iter().enumerate() {
                let received = lines
                    .next_line()
                    .await
                    .map_err(|e| format!("expectation {i}: read error: {e}"))?
                    .ok_or_else(|| format!("expectation {i}: client disconnected"))?;

                if received.trim_end() != expectation.request {
                    return Err(format!(
                        "expectation {i}: request mismatch: expected {:?}, got {:?}",
                        expectation.request, received
                    ));
                }

                for response in &expectation.responses {
                    write_half
                        .write_all(format!("{response}\n").as_bytes())
                        .await
                        .map_err(|e| format!("expectation {i}: write error: {e}"))?;
                }
                write_half
                    .flush()
                    .await
                    .map_err(|e| format!("expectation {i}: flush error: {e}"))?;
            }

            if close_when_done {
                let _ = write_half.shutdown().await;
                return Ok(());
            }

            // Hold the connection open until the client hangs up.
            while let Ok(Some(_)) = lines.next_line().await {}
            Ok(())
        });

        self.server_handle = Some(handle);
    }

    /// Wait for the server task to complete and return any script error.
    pub async fn wait(self) -> std::result::Result<(), String> {
        match self.server_handle {
            Some(handle) => handle
                .await
                .map_err(|e| format!("server task panicked: {e}"))?,
            None => Ok(()),
        }
    }
}
