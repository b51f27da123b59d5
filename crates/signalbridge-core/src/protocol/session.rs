//! Transport session
//!
//! Owns the byte stream to the controller and performs the power-on
//! handshake. The controller resets when the port opens and runs its
//! bootloader before printing a banner, so `open` must tolerate several
//! seconds of silence and stray diagnostics before the ready marker.

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{
    serial::{clear_buffers, configure_port, open_port},
    ConnectError, TransportError, READY_MARKER,
};

/// Byte-stream transport carrying newline-delimited ASCII lines.
///
/// The communication loop is the only caller once a connection is live;
/// implementations do not need internal locking. A fake implementation is
/// the seam used to test wire behavior without hardware.
pub trait Transport: Send {
    /// Write one already-terminated line to the device
    fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Return the next complete inbound line, or `None` if no full line is
    /// buffered yet. Must not block beyond the port's short read timeout.
    fn read_line(&mut self) -> Result<Option<String>, TransportError>;
}

/// How long to sleep between banner polls during the handshake
const HANDSHAKE_POLL: Duration = Duration::from_millis(20);

/// Read banner lines off a transport until the ready marker appears.
///
/// Non-marker lines are logged and discarded. Fails with
/// [`ConnectError::HandshakeTimeout`] once the deadline passes, whether
/// the link was silent or streaming unrelated output the whole time.
pub fn await_ready(transport: &mut dyn Transport, timeout: Duration) -> Result<(), ConnectError> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match transport.read_line()? {
            Some(line) if line.to_lowercase().contains(READY_MARKER) => {
                debug!(line = %line, "ready marker observed");
                return Ok(());
            }
            Some(line) => {
                debug!(line = %line, "discarding banner line");
            }
            None => std::thread::sleep(HANDSHAKE_POLL.min(timeout)),
        }
    }
    Err(ConnectError::HandshakeTimeout)
}

/// A live serial session to the signal controller
pub struct SerialSession {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialSession {
    /// Open the named port and wait for the controller's ready banner.
    ///
    /// If the ready marker does not arrive before `handshake_timeout`, the
    /// port is dropped and `HandshakeTimeout` is returned; a half-open
    /// stream is never handed to the caller.
    pub fn open(
        address: &str,
        baud_rate: u32,
        handshake_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let mut port = open_port(address, Some(baud_rate))?;
        configure_port(port.as_mut())?;

        let mut session = Self {
            port,
            pending: Vec::new(),
        };
        await_ready(&mut session, handshake_timeout)?;
        info!(address, baud_rate, "controller ready");
        Ok(session)
    }

    /// Discard anything buffered on the port, e.g. stale banner output
    pub fn discard_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        clear_buffers(self.port.as_mut())
    }

    /// Split the first complete line off the pending buffer
    fn take_pending_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).trim_end().to_string())
    }
}

impl Transport for SerialSession {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        // write_all lands in the kernel tty buffer; at this line length and
        // baud rate the inter-command delay covers actual transmission, so
        // a blocking tcdrain-style flush is deliberately avoided.
        self.port
            .write_all(line.as_bytes())
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        if let Some(line) = self.take_pending_line() {
            return Ok(Some(line));
        }

        let available = self
            .port
            .bytes_to_read()
            .map_err(|e| TransportError::Read(e.to_string()))?;
        if available == 0 {
            return Ok(None);
        }

        let mut buffer = [0u8; 512];
        let to_read = (available as usize).min(buffer.len());
        match self.port.read(&mut buffer[..to_read]) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.pending.extend_from_slice(&buffer[..n]);
                Ok(self.take_pending_line())
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(TransportError::Read(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport used to exercise handshake logic
    struct ScriptedTransport {
        lines: VecDeque<String>,
    }

    impl Transport for ScriptedTransport {
        fn write_line(&mut self, _line: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn read_line(&mut self) -> Result<Option<String>, TransportError> {
            Ok(self.lines.pop_front())
        }
    }

    #[test]
    fn test_marker_accepted_after_banners() {
        let mut transport = ScriptedTransport {
            lines: VecDeque::from(vec![
                "bootloader v2.1".to_string(),
                "Traffic Controller initialized".to_string(),
            ]),
        };
        assert!(await_ready(&mut transport, Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_missing_marker_times_out() {
        let mut transport = ScriptedTransport {
            lines: VecDeque::from(vec!["bootloader v2.1".to_string()]),
        };
        let err = await_ready(&mut transport, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ConnectError::HandshakeTimeout));
    }

    #[test]
    fn test_endless_banner_chatter_times_out() {
        // Wrong firmware streaming diagnostics must not pin the handshake
        struct ChattyTransport;
        impl Transport for ChattyTransport {
            fn write_line(&mut self, _line: &str) -> Result<(), TransportError> {
                Ok(())
            }
            fn read_line(&mut self) -> Result<Option<String>, TransportError> {
                Ok(Some("diagnostic: sensors warming up".to_string()))
            }
        }

        let started = Instant::now();
        let err = await_ready(&mut ChattyTransport, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ConnectError::HandshakeTimeout));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_read_error_propagates() {
        struct FailingTransport;
        impl Transport for FailingTransport {
            fn write_line(&mut self, _line: &str) -> Result<(), TransportError> {
                Ok(())
            }
            fn read_line(&mut self) -> Result<Option<String>, TransportError> {
                Err(TransportError::Read("device gone".to_string()))
            }
        }

        let err = await_ready(&mut FailingTransport, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ConnectError::Transport(_)));
    }
}
