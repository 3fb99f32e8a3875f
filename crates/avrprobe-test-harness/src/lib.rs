//! avrprobe-test-harness: Mock transports and device doubles for avrprobe.
//!
//! This crate provides [`MockTransport`] (with its driving [`MockPeer`]) for
//! deterministic in-memory testing of capture and correlation,
//! [`MockTcpServer`] for exercising socket transports over loopback, and
//! [`VirtualAvr`], a scripted device that answers both transports.

pub mod mock_tcp;
pub mod mock_transport;
pub mod virtual_avr;

pub use mock_tcp::MockTcpServer;
pub use mock_transport::{MockPeer, MockTransport};
pub use virtual_avr::VirtualAvr;
