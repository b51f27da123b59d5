//! # Signalbridge Core Library
//!
//! Core functionality for the signalbridge traffic-signal coordinator.
//!
//! This library provides:
//! - Serial coordination with the signal controller (port discovery,
//!   startup handshake, single-writer communication loop)
//! - A thread-safe controller facade for concurrent detection pipelines
//! - Priority-ordered, throttled dispatch of per-road traffic updates
//! - A retrying client for the external vehicle-detection service
//!
//! The HTTP/WebSocket request layer and the controller firmware are
//! external collaborators; the process's composition root constructs one
//! [`controller::TrafficController`] and shares it with the request layer
//! and a [`dispatch::Dispatcher`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use signalbridge_core::prelude::*;
//! use std::sync::Arc;
//!
//! let controller = Arc::new(TrafficController::new(ControllerConfig::default()));
//! controller.connect(None)?;
//! controller.start_traffic_system()?;
//!
//! let dispatcher = Dispatcher::new(controller.clone(), DispatchConfig::default());
//! let report = dispatcher.dispatch(vec![
//!     RoadSnapshot { road_id: 1, vehicle_count: 4, has_emergency_vehicle: false },
//! ])?;
//! ```

#![warn(missing_docs)]

pub mod controller;
pub mod detect;
pub mod dispatch;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::controller::{
        ConnectionState, ControllerConfig, ControllerError, StatusSnapshot, TrafficController,
    };
    pub use crate::detect::{DetectionClient, DetectionConfig, DetectionError, Prediction};
    pub use crate::dispatch::{
        BatchReport, DispatchConfig, DispatchError, Dispatcher, RoadSnapshot,
    };
    pub use crate::protocol::{ConnectError, DeviceMessage, OutboundCommand, TransportError};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
