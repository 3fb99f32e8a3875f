//! WebSocket transport for the structured (JSON) protocol.
//!
//! [`WsTransport`] adapts a message-oriented WebSocket to the byte-oriented
//! [`Transport`] trait so the capture loop can treat it like any other
//! newline-delimited stream:
//!
//! - each inbound text frame becomes one `\n`-terminated line (embedded CR/LF,
//!   only legal as insignificant whitespace in JSON, become spaces);
//! - binary frames are handled the same way when they are valid UTF-8;
//! - ping/pong is answered by tungstenite, a close frame ends the stream;
//! - outbound bytes are split on `\n` and every non-empty line is sent as a
//!   single text frame.

use async_trait::async_trait;
use avrprobe_core::error::{Error, Result};
use avrprobe_core::transport::Transport;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::tcp::DEFAULT_CONNECT_TIMEOUT;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client transport.
pub struct WsTransport {
    stream: Option<WsStream>,
    url: String,
    /// Bytes of already-received frames not yet handed to `receive()`.
    pending: Vec<u8>,
}

impl WsTransport {
    /// Connect to a `ws://` or `wss://` URL using the default timeout.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_timeout(url, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect and complete the WebSocket handshake within `timeout`.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self> {
        tracing::debug!(url = %url, timeout_ms = timeout.as_millis(), "Connecting WebSocket");

        let (stream, _response) = match tokio::time::timeout(timeout, connect_async(url)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "WebSocket connection failed");
                return Err(Error::Transport(format!("cannot connect to {url}: {e}")));
            }
            Err(_) => {
                tracing::debug!(url = %url, "WebSocket connection timed out");
                return Err(Error::Transport(format!(
                    "connection to {url} timed out after {timeout:?}"
                )));
            }
        };

        tracing::info!(url = %url, "WebSocket connection established");
        Ok(Self {
            stream: Some(stream),
            url: url.to_string(),
            pending: Vec::new(),
        })
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

/// Flatten one frame's text into a single terminated line.
fn frame_to_line(text: &str) -> Vec<u8> {
    let mut line: Vec<u8> = text
        .trim_end_matches(['\r', '\n'])
        .bytes()
        .map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b })
        .collect();
    line.push(b'\n');
    line
}

fn map_ws_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Error::TransportClosed
        }
        tungstenite::Error::Protocol(tungstenite::error::ProtocolError::ResetWithoutClosingHandshake) => {
            Error::TransportClosed
        }
        tungstenite::Error::Io(e) => Error::Io(e),
        other => Error::Transport(other.to_string()),
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::InvalidRequest(format!("WebSocket payload is not UTF-8: {e}")))?;

        for line in text.split('\n').map(|l| l.trim_end_matches('\r')) {
            if line.is_empty() {
                continue;
            }
            tracing::trace!(url = %self.url, data = %line, "Sending frame");
            stream
                .send(Message::Text(line.to_string().into()))
                .await
                .map_err(|e| {
                    tracing::error!(url = %self.url, error = %e, "Failed to send frame");
                    map_ws_error(e)
                })?;
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }
        if !self.pending.is_empty() {
            return Ok(self.drain_pending(buf));
        }
        let url = self.url.clone();
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let next_line = async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(frame_to_line(text.as_str())),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => return Ok(frame_to_line(text)),
                        Err(_) => {
                            tracing::warn!(url = %url, bytes = bytes.len(), "Ignoring non-UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(url = %url, ?frame, "Peer sent close frame");
                        return Err(Error::TransportClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(map_ws_error(e)),
                    None => return Err(Error::TransportClosed),
                }
            }
        };

        let result = tokio::time::timeout(timeout, next_line).await;
        match result {
            Ok(Ok(line)) => {
                tracing::trace!(url = %self.url, bytes = line.len(), "Received frame");
                self.pending = line;
                Ok(self.drain_pending(buf))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ReceiveTimeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.pending.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                tracing::debug!(url = %self.url, error = %e, "WebSocket close handshake failed (continuing anyway)");
            }
            tracing::info!(url = %self.url, "WebSocket connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if self.stream.is_some() {
            tracing::debug!(url = %self.url, "WsTransport dropped, closing connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// A one-connection WebSocket server that sends `frames`, then echoes
    /// every text frame it receives until the client closes.
    async fn ws_server(frames: Vec<Message>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            for frame in frames {
                ws.send(frame).await.unwrap();
            }
            let mut received = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    received.push(text.as_str().to_string());
                    ws.send(Message::Text(text)).await.unwrap();
                }
            }
            received
        });
        (url, handle)
    }

    async fn read_line(transport: &mut WsTransport) -> Result<String> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        while !out.ends_with(b"\n") {
            let n = transport.receive(&mut buf, Duration::from_secs(2)).await?;
            out.extend_from_slice(&buf[..n]);
        }
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn frames_flatten_to_single_lines() {
        assert_eq!(frame_to_line("{\"a\":1}"), b"{\"a\":1}\n");
        assert_eq!(frame_to_line("{\r\n  \"a\": 1\n}\n"), b"{    \"a\": 1 }\n");
    }

    #[tokio::test]
    async fn each_text_frame_becomes_one_line() {
        let (url, server) = ws_server(vec![
            Message::Text("{\"type\":\"pinState\",\"pin\":\"D12\",\"state\":true}".into()),
            Message::Binary(b"{\"type\":\"pinState\",\"pin\":\"D12\",\"state\":false}".to_vec().into()),
        ])
        .await;

        let mut transport = WsTransport::connect(&url).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(
            read_line(&mut transport).await.unwrap(),
            "{\"type\":\"pinState\",\"pin\":\"D12\",\"state\":true}\n"
        );
        assert_eq!(
            read_line(&mut transport).await.unwrap(),
            "{\"type\":\"pinState\",\"pin\":\"D12\",\"state\":false}\n"
        );

        transport.close().await.unwrap();
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outbound_lines_are_separate_frames() {
        let (url, server) = ws_server(Vec::new()).await;
        let mut transport = WsTransport::connect(&url).await.unwrap();

        transport
            .send(b"{\"type\":\"a\"}\n{\"type\":\"b\"}\r\n\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut transport).await.unwrap(), "{\"type\":\"a\"}\n");
        assert_eq!(read_line(&mut transport).await.unwrap(), "{\"type\":\"b\"}\n");

        transport.close().await.unwrap();
        assert_eq!(server.await.unwrap(), vec!["{\"type\":\"a\"}", "{\"type\":\"b\"}"]);
    }

    #[tokio::test]
    async fn idle_receive_times_out() {
        let (url, server) = ws_server(Vec::new()).await;
        let mut transport = WsTransport::connect(&url).await.unwrap();

        let mut buf = [0u8; 64];
        let result = transport.receive(&mut buf, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::ReceiveTimeout)));

        transport.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_frame_is_transport_closed() {
        let (url, _server) = ws_server(vec![Message::Close(None)]).await;
        let mut transport = WsTransport::connect(&url).await.unwrap();

        let result = read_line(&mut transport).await;
        assert!(matches!(result, Err(Error::TransportClosed)), "got {result:?}");
    }

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let result = WsTransport::connect_with_timeout(&url, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
