//! Protocol errors

use thiserror::Error;

/// Errors that can occur while establishing a connection
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("device address unavailable: {0}")]
    AddressUnavailable(String),

    #[error("no ready banner within the handshake window")]
    HandshakeTimeout,

    #[error("no candidate device address found")]
    NoDeviceFound,

    #[error("already connected")]
    AlreadyConnected,

    #[error("failed to start communication worker: {0}")]
    WorkerSpawn(String),

    #[error("transport failure during handshake: {0}")]
    Transport(#[from] TransportError),
}

/// Errors on an established connection
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("serial write failed: {0}")]
    Write(String),

    #[error("serial read failed: {0}")]
    Read(String),

    #[error("serial port error: {0}")]
    Port(String),
}
