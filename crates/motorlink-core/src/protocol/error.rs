//! Protocol errors

use thiserror::Error;

use crate::map::RegistryError;

/// Errors raised by the transport, the driver lifecycle, or configuration
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport is closed")]
    TransportClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Driver is no longer running")]
    Stopped,

    #[error("Memory map error: {0}")]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Reason a read request did not complete
///
/// Every request resolves exactly once, either with a reading or with one of
/// these. None of them stop the driver; the queue moves on to the next request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No response arrived within the item timeout
    #[error("Message timeout")]
    Timeout,

    /// The controller answered with the no-clock sentinel
    #[error("Controller has no clock")]
    NoClock,

    /// Malformed frame or command-not-recognized sentinel
    #[error("Invalid response from controller")]
    InvalidResponse,

    /// The frame could not be written because the port is gone
    #[error("Port closed")]
    TransportClosed,

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// Flushed by `cancel_all` or a deliberate close
    #[error("Request cancelled")]
    Cancelled,

    /// The request resolved to zero addresses
    #[error("Item has nothing to get")]
    EmptyRequest,

    #[error("Driver is no longer running")]
    Stopped,
}

impl From<RegistryError> for RequestError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownParameter(name) => RequestError::UnknownParameter(name),
            other => RequestError::UnknownParameter(other.to_string()),
        }
    }
}
