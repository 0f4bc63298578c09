//! Serial Protocol Communication
//!
//! Implements the 3-byte command/response protocol spoken by the motor
//! controller: frame encoding, response framing, the single-flight request
//! queue and the driver task that owns the serial link.
//!
//! Only one frame is ever outstanding on the wire. Each response is matched to
//! the frame at the head of the queue, so no sequence numbers are needed.

pub mod codec;
pub mod commands;
mod controller;
mod counters;
mod engine;
mod error;
mod frame;
mod monitor;
mod queue;
pub mod serial;
mod transport;

pub use codec::Response;
pub use commands::{Opcode, NO_CLOCK_SENTINEL, UNRECOGNIZED_SENTINEL};
pub use controller::MotorController;
pub use counters::Counters;
pub use error::{ProtocolError, RequestError};
pub use frame::{Frame, ResponseDecoder};
pub use monitor::{ConnectionState, DriverEvent};
pub use serial::{list_ports, PortInfo, SerialTransport, UsbAdapter};
pub use transport::{EventSender, Transport, TransportEvent};

/// Default baud rate for controller communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default time to wait for each response, in milliseconds
pub const DEFAULT_ITEM_TIMEOUT_MS: u64 = 1000;

/// Default liveness probe period, in milliseconds
pub const DEFAULT_PING_INTERVAL_MS: u64 = 2000;

/// Default period between reopen attempts, in milliseconds
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;

/// Default silence after which a partial response is handed up as malformed
pub const DEFAULT_RESPONSE_GAP_MS: u64 = 20;

/// Size of every request and response frame
pub const FRAME_LEN: usize = 3;
