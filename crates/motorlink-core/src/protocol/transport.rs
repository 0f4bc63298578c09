//! Transport boundary
//!
//! The driver talks to the controller through a [`Transport`]: something that
//! can be opened, written to and closed, and that reports incoming bytes,
//! errors and unexpected closure as [`TransportEvent`]s.

use tokio::sync::mpsc;

use super::{Frame, ProtocolError};

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One response frame's worth of bytes (or fewer, if the stream ended)
    Data(Vec<u8>),
    /// A transport-level error that did not by itself close the link
    Error(String),
    /// The link went away
    Closed,
}

/// Channel a transport reports its events on
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Duplex endpoint the driver owns exclusively
///
/// Methods are called from the driver task only. `write` must not block:
/// implementations hand the frame to their own I/O machinery and report the
/// response later through the event channel given to `open`.
pub trait Transport: Send + 'static {
    /// Name for logs, e.g. the port path
    fn describe(&self) -> String;

    /// Open the link; events for this session go to `events`
    fn open(&mut self, events: EventSender) -> Result<(), ProtocolError>;

    /// Queue a frame for transmission
    ///
    /// Fails with [`ProtocolError::TransportClosed`] if the link is down.
    fn write(&mut self, frame: &Frame) -> Result<(), ProtocolError>;

    /// Forget any partially received response
    ///
    /// Called before every write and when a response times out. Transports
    /// that deliver whole frames have nothing to forget.
    fn discard_input(&mut self) {}

    /// Close the link; no further events are sent for this session
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

impl Transport for Box<dyn Transport> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn open(&mut self, events: EventSender) -> Result<(), ProtocolError> {
        (**self).open(events)
    }

    fn write(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        (**self).write(frame)
    }

    fn discard_input(&mut self) {
        (**self).discard_input()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
