//! # MotorLink Core Library
//!
//! Host-side driver for byte-addressed motor controllers.
//!
//! This library provides:
//! - The 3-byte serial command/response protocol
//! - A single-flight request queue with timeouts and automatic reconnect
//! - A declarative memory map of named controller parameters
//! - Value scaling (words, percent of range, flags, hex and ASCII)
//! - A simulated controller for running without hardware
//! - A manager keeping controllers open on several ports
//!
//! ## Example
//!
//! ```rust,ignore
//! use motorlink_core::prelude::*;
//!
//! let config = DriverConfig::for_port("/dev/ttyUSB0");
//! let controller = MotorController::open_serial(config, default_map()?)?;
//! controller.open().await?;
//!
//! let hours = controller.get_named("meters.runtime_hours").await?;
//! println!("Runtime: {}", hours.value().unwrap());
//!
//! let everything = controller.get_named("status").await?;
//! println!("{}", serde_json::to_string_pretty(&everything)?);
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod demo;
pub mod manager;
pub mod map;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{DriverConfig, Parity, SerialSettings};
    pub use crate::demo::{DemoController, DemoHandle, DemoMode};
    pub use crate::manager::ControllerManager;
    pub use crate::map::{default_map, Descriptor, ParamRequest, Reading, Registry, Scale, Value};
    pub use crate::protocol::{
        ConnectionState, Counters, DriverEvent, MotorController, ProtocolError, RequestError,
        SerialTransport, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
