//! A scripted stand-in for a microcontroller behind two transports.
//!
//! [`VirtualAvr`] drives a pair of [`MockPeer`]s: it answers line commands
//! arriving on the serial peer and structured requests arriving on the
//! socket peer, and reports monitored pin changes on the socket as
//! `pinState` messages. It understands just enough of the line protocol to
//! produce realistic cross-transport traffic for harness tests:
//!
//! | Line command        | Effect                                          |
//! |---------------------|-------------------------------------------------|
//! | `notn/0/0`          | no-op (steady-state probe)                      |
//! | `notn/P`            | analog output of pin P set to 0                 |
//! | `ppsw/P/V`          | digital output of pin P set to `V != 0`         |
//! | `ppin/P/V`          | analog output of pin P set to V                 |
//! | `tone/P/...`        | analog output of pin P set to 127               |
//! | `srld/P`, `srla/P`  | start reporting input P as `dred`/`ared` lines  |
//! | `spld/P`, `spla/P`  | stop reporting input P                          |
//! | anything else       | rejected (`rply/ko`)                            |
//!
//! Commands carrying `?id=N` are answered with `alp://rply/ok?id=N` or
//! `alp://rply/ko?id=N`. Structured `pinMode`/`pinState` requests are echoed
//! back with `"executed": true`; unknown request types are echoed with
//! `"executed": false`.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;

use avrprobe_core::line::LineCommand;

use crate::mock_transport::MockPeer;

/// Handle to the running device double. Dropping it leaves the task
/// running until both transports are gone; call [`stop`](Self::stop) to
/// end it explicitly.
pub struct VirtualAvr {
    task: JoinHandle<()>,
}

impl VirtualAvr {
    /// Spawn the device task on the given serial and socket peers.
    pub fn start(serial: MockPeer, socket: MockPeer) -> Self {
        let task = tokio::spawn(run(serial, socket));
        Self { task }
    }

    /// Abort the device task.
    pub fn stop(self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct Device {
    /// Monitoring mode per socket pin name ("D12" -> "digital").
    modes: HashMap<String, String>,
    /// Inputs set by the host through `pinState` requests.
    inputs: HashMap<String, Value>,
    /// Input pins whose changes are reported on the serial line.
    listening: HashSet<String>,
}

async fn run(mut serial: MockPeer, mut socket: MockPeer) {
    let mut device = Device::default();
    loop {
        tokio::select! {
            chunk = serial.recv_sent() => {
                let Some(chunk) = chunk else { break };
                for line in String::from_utf8_lossy(&chunk).lines() {
                    device.on_line(line.trim(), &serial, &socket);
                }
            }
            chunk = socket.recv_sent() => {
                let Some(chunk) = chunk else { break };
                for line in String::from_utf8_lossy(&chunk).lines() {
                    match serde_json::from_str::<Value>(line) {
                        Ok(Value::Object(request)) => device.on_request(request, &serial, &socket),
                        _ => tracing::debug!(line, "virtual device ignoring socket data"),
                    }
                }
            }
        }
    }
}

impl Device {
    fn on_line(&mut self, line: &str, serial: &MockPeer, socket: &MockPeer) {
        if line.is_empty() {
            return;
        }
        let Ok(cmd) = LineCommand::parse(line) else {
            tracing::debug!(line, "virtual device ignoring unparsable line");
            return;
        };
        let pin = cmd.args.first().cloned().unwrap_or_default();
        let value = cmd.args.get(1).and_then(|v| v.parse::<i64>().ok());

        let mut report = None;
        let ok = match (cmd.verb.as_str(), cmd.args.len()) {
            ("notn", 2) if cmd.args == ["0", "0"] => true,
            ("notn", 1) => {
                report = Some((format!("D{pin}"), json!(0)));
                true
            }
            ("ppsw", 2) => match value {
                Some(v) => {
                    report = Some((format!("D{pin}"), json!(v != 0)));
                    true
                }
                None => false,
            },
            ("ppin", 2) => match value {
                Some(v) => {
                    report = Some((format!("D{pin}"), json!(v)));
                    true
                }
                None => false,
            },
            ("tone", n) if n >= 2 => {
                report = Some((format!("D{pin}"), json!(127)));
                true
            }
            ("srld", 1) | ("srla", 1) => true,
            ("spld", 1) | ("spla", 1) => true,
            _ => false,
        };

        if let Some(id) = cmd.id {
            let verdict = if ok { "ok" } else { "ko" };
            serial.push_line(&format!("alp://rply/{verdict}?id={id}"));
        }
        if !ok {
            return;
        }

        match cmd.verb.as_str() {
            "srld" => {
                let name = format!("D{pin}");
                self.listening.insert(name.clone());
                self.report_input(&name, serial);
            }
            "srla" => {
                let name = format!("A{pin}");
                self.listening.insert(name.clone());
                self.report_input(&name, serial);
            }
            "spld" => {
                self.listening.remove(&format!("D{pin}"));
            }
            "spla" => {
                self.listening.remove(&format!("A{pin}"));
            }
            _ => {}
        }

        if let Some((name, state)) = report {
            self.report_output(&name, state, socket);
        }
    }

    fn on_request(&mut self, mut request: Map<String, Value>, serial: &MockPeer, socket: &MockPeer) {
        let kind = request.get("type").and_then(Value::as_str).unwrap_or("");
        let pin = request
            .get("pin")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let executed = match kind {
            "pinMode" => {
                let mode = request
                    .get("mode")
                    .and_then(Value::as_str)
                    .unwrap_or("digital")
                    .to_string();
                self.modes.insert(pin, mode);
                true
            }
            "pinState" => {
                let state = request.get("state").cloned().unwrap_or(Value::Null);
                self.inputs.insert(pin.clone(), state);
                if self.listening.contains(&pin) {
                    self.report_input(&pin, serial);
                }
                true
            }
            _ => false,
        };

        if request.contains_key("replyId") {
            request.insert("executed".into(), Value::Bool(executed));
            socket.push_json(&Value::Object(request));
        }
    }

    /// Emit a `dred`/`ared` line for an input pin.
    fn report_input(&self, name: &str, serial: &MockPeer) {
        let number = &name[1..];
        let raw = match self.inputs.get(name) {
            Some(Value::Bool(b)) => i64::from(*b),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            _ => 0,
        };
        let verb = if name.starts_with('A') { "ared" } else { "dred" };
        serial.push_line(&format!("alp://{verb}/{number}/{raw}"));
    }

    /// Emit a `pinState` message for a monitored output pin.
    fn report_output(&self, name: &str, state: Value, socket: &MockPeer) {
        let Some(mode) = self.modes.get(name) else {
            return;
        };
        let state = match (mode.as_str(), &state) {
            ("digital", Value::Number(n)) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
            ("analog", Value::Bool(b)) => json!(i64::from(*b)),
            _ => state,
        };
        socket.push_json(&json!({"type": "pinState", "pin": name, "state": state}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockTransport;
    use avrprobe_core::transport::Transport;
    use std::time::Duration;

    async fn read_line(transport: &mut MockTransport) -> String {
        let mut buf = [0u8; 256];
        let n = transport
            .receive(&mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).trim_end().to_string()
    }

    #[tokio::test]
    async fn answers_steady_state_probe() {
        let (mut serial, serial_peer) = MockTransport::pair();
        let (_socket, socket_peer) = MockTransport::pair();
        let device = VirtualAvr::start(serial_peer, socket_peer);

        serial.send(b"alp://notn/0/0?id=0\n").await.unwrap();
        assert_eq!(read_line(&mut serial).await, "alp://rply/ok?id=0");

        device.stop();
    }

    #[tokio::test]
    async fn rejects_unknown_command() {
        let (mut serial, serial_peer) = MockTransport::pair();
        let (_socket, socket_peer) = MockTransport::pair();
        let device = VirtualAvr::start(serial_peer, socket_peer);

        serial.send(b"alp://XXXX/123/abc/X-Y-Z?id=42\n").await.unwrap();
        assert_eq!(read_line(&mut serial).await, "alp://rply/ko?id=42");

        device.stop();
    }

    #[tokio::test]
    async fn reports_monitored_digital_pin_on_socket() {
        let (mut serial, serial_peer) = MockTransport::pair();
        let (mut socket, socket_peer) = MockTransport::pair();
        let device = VirtualAvr::start(serial_peer, socket_peer);

        socket
            .send(b"{\"type\":\"pinMode\",\"pin\":\"D12\",\"mode\":\"digital\",\"replyId\":\"r1\"}\n")
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&read_line(&mut socket).await).unwrap();
        assert_eq!(reply["replyId"], "r1");
        assert_eq!(reply["executed"], true);

        serial.send(b"alp://ppsw/12/1\n").await.unwrap();
        let state: Value = serde_json::from_str(&read_line(&mut socket).await).unwrap();
        assert_eq!(state, json!({"type": "pinState", "pin": "D12", "state": true}));

        device.stop();
    }

    #[tokio::test]
    async fn reports_listened_input_on_serial() {
        let (mut serial, serial_peer) = MockTransport::pair();
        let (mut socket, socket_peer) = MockTransport::pair();
        let device = VirtualAvr::start(serial_peer, socket_peer);

        serial.send(b"alp://srla/5?id=42\n").await.unwrap();
        let mut lines = Vec::new();
        while lines.len() < 2 {
            let chunk = read_line(&mut serial).await;
            lines.extend(chunk.lines().map(str::to_string));
        }
        assert_eq!(lines, vec!["alp://rply/ok?id=42", "alp://ared/5/0"]);

        socket
            .send(b"{\"type\":\"pinState\",\"pin\":\"A5\",\"state\":987}\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut serial).await, "alp://ared/5/987");

        device.stop();
    }
}
