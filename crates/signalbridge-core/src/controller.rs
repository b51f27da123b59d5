//! Controller facade
//!
//! Handles the connection lifecycle with the signal controller and exposes
//! the thread-safe command surface used by the dispatcher and the
//! request-handling layer. All serial I/O happens on one background worker;
//! every other caller only ever touches the channels.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{
    candidate_ports, list_ports, ConnectError, DeviceMessage, OutboundCommand, SerialSession,
    Transport, DEFAULT_BAUD_RATE, HANDSHAKE_TIMEOUT_MS,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Port open, handshake in progress
    Connecting,
    /// Connected and ready
    Connected,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Errors surfaced by facade operations on an unconnected controller
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Operation attempted while disconnected
    #[error("not connected to signal controller")]
    NotConnected,
}

/// Controller configuration.
///
/// Every timing literal the communication loop relies on lives here so that
/// tests can shrink them and deployments can stretch them.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Baud rate of the controller link
    pub baud_rate: u32,
    /// How long to wait for the ready banner after opening the port
    pub handshake_timeout: Duration,
    /// Idle sleep between communication loop iterations
    pub poll_interval: Duration,
    /// Pause after each command write, covering the controller's parse latency
    pub inter_command_delay: Duration,
    /// Pause after a transport error before the next attempt
    pub error_backoff: Duration,
    /// Consecutive transport errors tolerated before giving up the link
    pub max_consecutive_errors: u32,
    /// Wait after a disconnect request for the final STOP to flush
    pub disconnect_grace: Duration,
    /// Bound on waiting for the worker thread to exit
    pub join_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            poll_interval: Duration::from_millis(100),
            inter_command_delay: Duration::from_millis(50),
            error_backoff: Duration::from_millis(200),
            max_consecutive_errors: 5,
            disconnect_grace: Duration::from_millis(300),
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// Connection status snapshot returned to status consumers
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Whether the link is usable
    pub connected: bool,
    /// Current state machine position
    pub state: ConnectionState,
    /// Address of the active connection, if any
    pub address: Option<String>,
    /// Serial-like device addresses visible on this host
    pub available_addresses: Vec<String>,
}

/// State shared between the facade and the communication loop
struct Shared {
    state: AtomicU8,
    address: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically move from `from` to `to`; false if another caller won
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Facade over the single physical controller connection.
///
/// One instance per process; construct it at the composition root and hand
/// out shared references. All operations are callable from concurrent
/// tasks: enqueue operations are lock-free on the wire side, and `connect`/
/// `disconnect` serialize through the state machine.
pub struct TrafficController {
    config: ControllerConfig,
    shared: Arc<Shared>,
    commands: Mutex<Option<Sender<OutboundCommand>>>,
    responses: Mutex<Option<Receiver<DeviceMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TrafficController {
    /// Create a controller facade (not yet connected)
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                address: Mutex::new(None),
            }),
            commands: Mutex::new(None),
            responses: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether commands can currently be enqueued
    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    /// Serial-like device addresses visible on this host, annotated by
    /// their USB descriptors. Pure query; connection state is untouched.
    pub fn available_addresses(&self) -> Vec<String> {
        list_ports().iter().map(|p| p.describe()).collect()
    }

    /// Connection and port status for status endpoints
    pub fn status(&self) -> StatusSnapshot {
        let state = self.shared.state();
        StatusSnapshot {
            connected: state == ConnectionState::Connected,
            state,
            address: self.shared.address.lock().expect("address lock").clone(),
            available_addresses: self.available_addresses(),
        }
    }

    /// Connect to the controller, auto-detecting the address if none given.
    ///
    /// Opens the port, completes the ready handshake, starts the
    /// communication loop, and enqueues an initial STATUS probe. On any
    /// failure the state returns to `Disconnected` with no worker running.
    pub fn connect(&self, address: Option<&str>) -> Result<(), ConnectError> {
        if !self
            .shared
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(ConnectError::AlreadyConnected);
        }

        let address = match address {
            Some(addr) => addr.to_string(),
            None => match candidate_ports().first() {
                Some(port) => {
                    info!(port = %port.describe(), "auto-detected controller port");
                    port.name.clone()
                }
                None => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    return Err(ConnectError::NoDeviceFound);
                }
            },
        };

        let mut session =
            match SerialSession::open(&address, self.config.baud_rate, self.config.handshake_timeout)
            {
                Ok(session) => session,
                Err(e) => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            };

        // Stray banner chatter after the marker would otherwise show up as
        // the first "responses"
        if let Err(e) = session.discard_input() {
            debug!(error = %e, "could not clear stale input");
        }

        self.attach(Box::new(session), &address)
    }

    /// Attach an already-opened transport and start the communication loop.
    ///
    /// This is the seam `connect` uses after the serial handshake; tests and
    /// simulators inject fake transports through it. The transport must
    /// already be past any readiness handshake.
    pub fn connect_transport(
        &self,
        transport: Box<dyn Transport>,
        address: &str,
    ) -> Result<(), ConnectError> {
        if !self
            .shared
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(ConnectError::AlreadyConnected);
        }
        self.attach(transport, address)
    }

    /// Channel and worker setup once a transport is ready; the caller holds
    /// the `Connecting` state. A worker that fails to spawn (an OS resource
    /// failure, not a contract violation) rolls everything back to
    /// `Disconnected` and surfaces the cause.
    fn attach(&self, transport: Box<dyn Transport>, address: &str) -> Result<(), ConnectError> {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let (resp_tx, resp_rx) = std::sync::mpsc::channel();

        *self.shared.address.lock().expect("address lock") = Some(address.to_string());
        *self.commands.lock().expect("commands lock") = Some(cmd_tx.clone());
        *self.responses.lock().expect("responses lock") = Some(resp_rx);

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        shared.set_state(ConnectionState::Connected);

        let spawned = std::thread::Builder::new()
            .name("signalbridge-comm".to_string())
            .spawn(move || communication_loop(transport, cmd_rx, resp_tx, shared, config));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                *self.commands.lock().expect("commands lock") = None;
                *self.responses.lock().expect("responses lock") = None;
                *self.shared.address.lock().expect("address lock") = None;
                warn!(error = %e, "could not start communication worker");
                return Err(ConnectError::WorkerSpawn(e.to_string()));
            }
        };
        *self.worker.lock().expect("worker lock") = Some(handle);

        // Initial probe so a status line is waiting for the first observer
        let _ = cmd_tx.send(OutboundCommand::Status);
        info!(address, "controller connected");
        Ok(())
    }

    /// Disconnect from the controller.
    ///
    /// Safe to call at any time, including before a successful connect and
    /// repeatedly. Flips the state first so the loop's run condition goes
    /// false, best-effort queues a STOP (flushed by the loop's exit drain),
    /// then joins the worker within a bounded timeout.
    pub fn disconnect(&self) {
        let was_connected = self.shared.state() == ConnectionState::Connected;
        self.shared.set_state(ConnectionState::Disconnected);

        let sender = self.commands.lock().expect("commands lock").take();
        if let Some(tx) = sender {
            if was_connected {
                let _ = tx.send(OutboundCommand::Stop);
                std::thread::sleep(self.config.disconnect_grace);
            }
            // Dropping the sender lets the loop's exit drain terminate
        }

        let handle = self.worker.lock().expect("worker lock").take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + self.config.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(timeout = ?self.config.join_timeout, "communication loop did not stop in time");
            }
        }

        *self.responses.lock().expect("responses lock") = None;
        *self.shared.address.lock().expect("address lock") = None;
        if was_connected {
            info!("controller disconnected");
        }
    }

    /// Enqueue START; fails without side effects when disconnected
    pub fn start_traffic_system(&self) -> Result<(), ControllerError> {
        self.enqueue(OutboundCommand::Start)
    }

    /// Enqueue STOP; fails without side effects when disconnected
    pub fn stop_traffic_system(&self) -> Result<(), ControllerError> {
        self.enqueue(OutboundCommand::Stop)
    }

    /// Enqueue a STATUS probe; the reply arrives via [`Self::drain_responses`]
    pub fn request_status(&self) -> Result<(), ControllerError> {
        self.enqueue(OutboundCommand::Status)
    }

    /// Enqueue an UPDATE carrying one road's observed traffic state
    pub fn update_road_data(
        &self,
        road_id: u32,
        vehicle_count: u32,
        has_emergency: bool,
    ) -> Result<(), ControllerError> {
        self.enqueue(OutboundCommand::Update {
            road_id,
            vehicle_count,
            has_emergency,
        })
    }

    /// Take every response line received since the last drain
    pub fn drain_responses(&self) -> Vec<DeviceMessage> {
        let guard = self.responses.lock().expect("responses lock");
        let mut drained = Vec::new();
        if let Some(rx) = guard.as_ref() {
            while let Ok(msg) = rx.try_recv() {
                drained.push(msg);
            }
        }
        drained
    }

    fn enqueue(&self, command: OutboundCommand) -> Result<(), ControllerError> {
        if self.shared.state() != ConnectionState::Connected {
            return Err(ControllerError::NotConnected);
        }
        let guard = self.commands.lock().expect("commands lock");
        match guard.as_ref() {
            Some(tx) => tx.send(command).map_err(|_| ControllerError::NotConnected),
            None => Err(ControllerError::NotConnected),
        }
    }
}

impl Drop for TrafficController {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// The background worker owning all direct I/O with the device.
///
/// One iteration: write at most one queued command (then pause for the
/// controller's parse latency), drain whatever inbound lines are buffered,
/// then yield. Transport errors are counted; delivery of the erroring
/// command is never retried. After `max_consecutive_errors` in a row the
/// loop exits and the state flips to `Disconnected`.
fn communication_loop(
    mut transport: Box<dyn Transport>,
    commands: Receiver<OutboundCommand>,
    responses: Sender<DeviceMessage>,
    shared: Arc<Shared>,
    config: ControllerConfig,
) {
    let mut consecutive_errors = 0u32;

    while shared.state() == ConnectionState::Connected {
        let mut errored = false;

        match commands.try_recv() {
            Ok(command) => {
                let line = command.to_line();
                match transport.write_line(&line) {
                    Ok(()) => {
                        debug!(command = %line.trim_end(), "sent");
                        std::thread::sleep(config.inter_command_delay);
                    }
                    Err(e) => {
                        warn!(command = %line.trim_end(), error = %e, "command write failed");
                        errored = true;
                    }
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }

        if !errored {
            loop {
                match transport.read_line() {
                    Ok(Some(line)) => {
                        debug!(line = %line, "controller response");
                        let _ = responses.send(DeviceMessage::parse(&line));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "transport read failed");
                        errored = true;
                        break;
                    }
                }
            }
        }

        if errored {
            consecutive_errors += 1;
            if consecutive_errors >= config.max_consecutive_errors {
                warn!(
                    errors = consecutive_errors,
                    "transport failing, giving up the link"
                );
                break;
            }
            std::thread::sleep(config.error_backoff);
        } else {
            consecutive_errors = 0;
            std::thread::sleep(config.poll_interval);
        }
    }

    // Flush anything queued before the state flipped, notably the STOP a
    // disconnect request enqueues after flipping it. The blocking receive
    // waits out one grace window so that STOP is caught even when this
    // thread reached the drain first; sender drop ends the drain early.
    loop {
        match commands.recv_timeout(config.disconnect_grace) {
            Ok(command) => {
                let line = command.to_line();
                if transport.write_line(&line).is_ok() {
                    debug!(command = %line.trim_end(), "flushed at exit");
                    std::thread::sleep(config.inter_command_delay);
                }
            }
            Err(_) => break,
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    debug!("communication loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_config_default() {
        let config = ControllerConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.max_consecutive_errors, 5);
    }

    #[test]
    fn test_initial_state() {
        let controller = TrafficController::new(ControllerConfig::default());
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert!(!controller.is_connected());
        assert!(controller.status().address.is_none());
    }

    #[test]
    fn test_operations_fail_when_disconnected() {
        let controller = TrafficController::new(ControllerConfig::default());
        assert!(matches!(
            controller.start_traffic_system(),
            Err(ControllerError::NotConnected)
        ));
        assert!(matches!(
            controller.stop_traffic_system(),
            Err(ControllerError::NotConnected)
        ));
        assert!(matches!(
            controller.request_status(),
            Err(ControllerError::NotConnected)
        ));
        assert!(matches!(
            controller.update_road_data(1, 4, false),
            Err(ControllerError::NotConnected)
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let controller = TrafficController::new(ControllerConfig::default());
        controller.disconnect();
        controller.disconnect();
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_worker_spawn_failure_is_a_connect_error() {
        let err = ConnectError::WorkerSpawn("resource exhausted".to_string());
        assert_eq!(
            err.to_string(),
            "failed to start communication worker: resource exhausted"
        );
    }

    #[test]
    fn test_state_roundtrip() {
        assert_eq!(
            ConnectionState::from_u8(ConnectionState::Connected as u8),
            ConnectionState::Connected
        );
        assert_eq!(
            ConnectionState::from_u8(ConnectionState::Connecting as u8),
            ConnectionState::Connecting
        );
        assert_eq!(ConnectionState::from_u8(99), ConnectionState::Disconnected);
    }
}
