//! Serial Protocol Communication
//!
//! Implements the line-oriented ASCII protocol spoken by the traffic-signal
//! microcontroller, plus port discovery and the startup handshake.

pub mod command;
mod error;
pub mod serial;
pub mod session;

pub use command::{DeviceMessage, OutboundCommand};
pub use error::{ConnectError, TransportError};
pub use serial::{candidate_ports, clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use session::{SerialSession, Transport};

/// Default baud rate for the signal controller link
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// How long to wait for the controller's ready banner after opening the port.
/// The board resets on open and runs its bootloader first, so the banner can
/// arrive several seconds late on slow USB adapters.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 8_000;

/// Substring of the banner line that marks the controller as ready
pub const READY_MARKER: &str = "initialized";
