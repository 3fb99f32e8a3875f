// avrprobe -- CLI tool for driving a device (or its emulator) over its
// serial line protocol and its socket protocol at the same time.
//
// Usage:
//   avrprobe --serial /dev/ttyUSB0 --socket ws://localhost:8080 steady
//   avrprobe --serial /dev/ttyUSB0 --socket ws://localhost:8080 request alp://srld/12
//   avrprobe --serial /dev/ttyUSB0 --socket ws://localhost:8080 \
//       send alp://ppsw/12/1 --expect 'alp://dred/12/\d' --regex
//   avrprobe --serial /dev/ttyUSB0 --socket 127.0.0.1:9000 \
//       structured '{"type": "pinMode", "pin": "D12", "mode": "digital"}'
//   avrprobe ... pin-mode D12 digital
//   avrprobe ... pin-set D12 high
//   avrprobe ... pin-wait D12 high
//   avrprobe ... monitor --duration 30
//
// Endpoints may also come from AVRPROBE_SERIAL and AVRPROBE_SOCKET.
// Log verbosity follows RUST_LOG (default: info).

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use avrprobe::{
    Backoff, Harness, HarnessBuilder, LinePattern, Mark, PinValue, StateMatch, TransportKind,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// avrprobe -- correlates requests and replies across a device's serial and
/// socket transports.
#[derive(Parser)]
#[command(name = "avrprobe", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3).
    #[arg(long, env = "AVRPROBE_SERIAL")]
    serial: String,

    /// Serial baud rate.
    #[arg(long, default_value_t = avrprobe::transports::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Socket endpoint: ws://host:port/path, wss://..., tcp://host:port or
    /// host:port.
    #[arg(long, env = "AVRPROBE_SOCKET")]
    socket: String,

    /// Connection attempts per transport before giving up.
    #[arg(long, default_value_t = 20)]
    connect_attempts: u32,

    /// Deadline in seconds for every wait (replies, lines, state).
    #[arg(long)]
    timeout: Option<u64>,

    /// Skip the steady-state handshake before running the command.
    #[arg(long)]
    no_handshake: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the device until it acknowledges a no-op command.
    Steady,

    /// Send a serial line unchanged, optionally waiting for a matching line.
    Send {
        /// The line to send (e.g. alp://ppsw/12/1).
        line: String,

        /// Wait for a serial line matching this text after sending.
        #[arg(long)]
        expect: Option<String>,

        /// Treat --expect as a regular expression anchored at the start.
        #[arg(long, requires = "expect")]
        regex: bool,
    },

    /// Send a serial line with a fresh id and print the device's verdict.
    Request {
        /// The line to send; any existing id is replaced.
        line: String,
    },

    /// Send a JSON object on the socket with a fresh token and print the
    /// executed reply.
    Structured {
        /// The request object (e.g. '{"type": "pinMode", "pin": "D12"}').
        json: String,
    },

    /// Ask the device to monitor a pin in the given mode.
    PinMode {
        /// Pin name (e.g. D12, A5).
        pin: String,
        /// digital or analog.
        mode: String,
    },

    /// Drive an input pin to a value (high/low/on/off/true/false or an integer).
    PinSet { pin: String, value: PinValue },

    /// Wait until the reported state of a pin equals a value.
    PinWait { pin: String, value: PinValue },

    /// Print traffic on both transports as it is captured.
    Monitor {
        /// Duration in seconds (0 = until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },
}

// ---------------------------------------------------------------------------
// Harness construction
// ---------------------------------------------------------------------------

async fn create_harness(cli: &Cli) -> Result<Harness> {
    if cli.connect_attempts == 0 {
        bail!("--connect-attempts must be at least 1");
    }

    let mut builder = HarnessBuilder::new()
        .serial_port(&cli.serial)
        .baud_rate(cli.baud)
        .socket(&cli.socket)
        .backoff(Backoff::default().max_attempts(cli.connect_attempts));
    if let Some(secs) = cli.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    let harness = builder
        .connect()
        .await
        .with_context(|| format!("failed to connect to {} and {}", cli.serial, cli.socket))?;
    harness.start().context("failed to start capture")?;
    Ok(harness)
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

async fn cmd_steady(harness: &Harness) -> Result<()> {
    harness
        .wait_for_steady_state()
        .await
        .context("device did not reach steady state")?;
    println!("Device ready");
    Ok(())
}

async fn cmd_send(harness: &Harness, line: &str, expect: Option<&str>, regex: bool) -> Result<()> {
    let pattern = match expect {
        Some(text) if regex => Some(LinePattern::regex(text)?),
        Some(text) => Some(LinePattern::exact(text)),
        None => None,
    };

    let mark = harness.mark(TransportKind::Serial);
    let token = harness.send_line(line).await?;
    match &token {
        Some(token) => println!("Sent {line} ({token})"),
        None => println!("Sent {line}"),
    }

    if let Some(pattern) = pattern {
        let found = harness
            .wait_for_line_since(mark, &pattern)
            .await
            .context("expected line did not arrive")?;
        println!("Matched {found}");
    }
    Ok(())
}

async fn cmd_request(harness: &Harness, line: &str) -> Result<()> {
    let reply = harness.request_line(line).await?;
    let verdict = if reply.ok { "ok" } else { "ko" };
    println!("{line} -> {verdict} (id={})", reply.id);
    if !reply.ok {
        bail!("device rejected {line}");
    }
    Ok(())
}

async fn cmd_structured(harness: &Harness, json: &str) -> Result<()> {
    let request: serde_json::Value =
        serde_json::from_str(json).with_context(|| format!("invalid JSON: {json}"))?;
    let reply = harness.request_structured(request).await?;
    println!("Executed {reply}");
    Ok(())
}

async fn cmd_pin_mode(harness: &Harness, pin: &str, mode: &str) -> Result<()> {
    harness
        .set_pin_mode(pin, mode)
        .await
        .with_context(|| format!("failed to set {pin} to {mode}"))?;
    println!("{pin} monitored as {mode}");
    Ok(())
}

async fn cmd_pin_set(harness: &Harness, pin: &str, value: PinValue) -> Result<()> {
    harness
        .set_pin_state(pin, value)
        .await
        .with_context(|| format!("failed to drive {pin} {value}"))?;
    println!("{pin} driven {value}");
    Ok(())
}

async fn cmd_pin_wait(harness: &Harness, pin: &str, value: PinValue) -> Result<()> {
    let message = harness.wait_for_state(pin, StateMatch::Pin(value)).await?;
    println!("{pin} is {value} ({message})");
    Ok(())
}

async fn cmd_monitor(harness: &Harness, duration_secs: u64) -> Result<()> {
    println!("Monitoring serial and socket traffic (Ctrl-C to stop)...");

    let deadline = (duration_secs > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(duration_secs));
    let mut serial_seen = Mark::START;
    let mut socket_seen = Mark::START;

    loop {
        serial_seen = print_new(harness, TransportKind::Serial, serial_seen);
        socket_seen = print_new(harness, TransportKind::Socket, socket_seen);

        if let Some(dl) = deadline {
            if tokio::time::Instant::now() >= dl {
                println!("Monitor duration elapsed.");
                break;
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }

        let serial = harness.stream(TransportKind::Serial).status();
        let socket = harness.stream(TransportKind::Socket).status();
        if serial.is_terminal() && socket.is_terminal() {
            println!("Both transports closed.");
            break;
        }
    }

    print_new(harness, TransportKind::Serial, serial_seen);
    print_new(harness, TransportKind::Socket, socket_seen);
    Ok(())
}

/// Print messages captured on `kind` after `seen`; returns the new mark.
fn print_new(harness: &Harness, kind: TransportKind, seen: Mark) -> Mark {
    let snapshot = harness.snapshot(kind);
    for message in snapshot.since(seen) {
        println!("[{kind}] {message}");
    }
    snapshot.end()
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let harness = create_harness(&cli).await?;

    let result = run(&harness, &cli).await;

    if let Err(e) = harness.stop().await {
        tracing::warn!(error = %e, "transport failed before shutdown");
    }
    result
}

async fn run(harness: &Harness, cli: &Cli) -> Result<()> {
    let handshake = !cli.no_handshake
        && !matches!(cli.command, Command::Steady | Command::Monitor { .. });
    if handshake {
        cmd_steady(harness).await?;
    }

    match &cli.command {
        Command::Steady => cmd_steady(harness).await,
        Command::Send {
            line,
            expect,
            regex,
        } => cmd_send(harness, line, expect.as_deref(), *regex).await,
        Command::Request { line } => cmd_request(harness, line).await,
        Command::Structured { json } => cmd_structured(harness, json).await,
        Command::PinMode { pin, mode } => cmd_pin_mode(harness, pin, mode).await,
        Command::PinSet { pin, value } => cmd_pin_set(harness, pin, *value).await,
        Command::PinWait { pin, value } => cmd_pin_wait(harness, pin, *value).await,
        Command::Monitor { duration } => cmd_monitor(harness, *duration).await,
    }
}
