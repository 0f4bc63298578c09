//! Connection state tracking
//!
//! Owns the open/connected status and publishes every lifecycle transition to
//! subscribers. Transitions are published before the method returns, so an
//! observer sees them in the order the driver made them.

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use super::Frame;

/// Link status as seen by callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Port is not open
    #[default]
    Closed,
    /// An open attempt is in progress
    Opening,
    /// Port is open but the controller has not answered yet
    Disconnected,
    /// Port is open and the controller is answering
    Connected,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Connected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Lifecycle and traffic notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Port opened
    Open,
    /// Port closed
    Close,
    /// A reconnect attempt is starting
    Reopening,
    /// Controller answered for the first time since it was last lost
    Connected,
    /// Controller stopped answering
    Disconnected,
    /// Frame about to be written
    Sending(Frame),
    /// Response bytes received
    Receiving(Vec<u8>),
    /// Transport error
    Error(String),
}

pub(crate) struct ConnectionMonitor {
    state: ConnectionState,
    events: broadcast::Sender<DriverEvent>,
    status: watch::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (status, _) = watch::channel(ConnectionState::Closed);
        Self {
            state: ConnectionState::Closed,
            events,
            status,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    /// Sender handles use to create their own subscriptions
    pub fn event_sender(&self) -> broadcast::Sender<DriverEvent> {
        self.events.clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    pub fn emit(&self, event: DriverEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set(&mut self, state: ConnectionState) {
        self.state = state;
        self.status.send_replace(state);
    }

    pub fn opening(&mut self) {
        self.set(ConnectionState::Opening);
    }

    pub fn open_failed(&mut self) {
        self.set(ConnectionState::Closed);
    }

    pub fn opened(&mut self) {
        self.set(ConnectionState::Disconnected);
        info!("port open");
        self.emit(DriverEvent::Open);
    }

    /// Port went away; returns false if it was not open
    pub fn closed(&mut self) -> bool {
        if !self.state.is_open() {
            self.set(ConnectionState::Closed);
            return false;
        }
        self.device_lost();
        self.set(ConnectionState::Closed);
        info!("port closed");
        self.emit(DriverEvent::Close);
        true
    }

    /// A valid response arrived
    pub fn device_answered(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.set(ConnectionState::Connected);
            info!("controller connected");
            self.emit(DriverEvent::Connected);
        }
    }

    /// The controller timed out or reported it cannot run
    pub fn device_lost(&mut self) {
        if self.state == ConnectionState::Connected {
            self.set(ConnectionState::Disconnected);
            warn!("controller disconnected");
            self.emit(DriverEvent::Disconnected);
        }
    }

    pub fn transport_error(&self, message: String) {
        warn!("transport error: {}", message);
        self.emit(DriverEvent::Error(message));
    }

    pub fn reopening(&self) {
        self.emit(DriverEvent::Reopening);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain(rx: &mut broadcast::Receiver<DriverEvent>) -> Vec<DriverEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_open_connect_close_sequence() {
        let mut monitor = ConnectionMonitor::new(16);
        let mut rx = monitor.subscribe();
        let status = monitor.watch();

        monitor.opening();
        assert_eq!(*status.borrow(), ConnectionState::Opening);
        monitor.opened();
        monitor.device_answered();
        monitor.device_answered();
        assert!(monitor.state().is_connected());
        assert!(monitor.closed());

        assert_eq!(
            drain(&mut rx),
            vec![
                DriverEvent::Open,
                DriverEvent::Connected,
                DriverEvent::Disconnected,
                DriverEvent::Close,
            ]
        );
        assert_eq!(*status.borrow(), ConnectionState::Closed);
    }

    #[test]
    fn test_disconnected_emitted_once() {
        let mut monitor = ConnectionMonitor::new(16);
        let mut rx = monitor.subscribe();
        monitor.opened();
        monitor.device_answered();
        monitor.device_lost();
        monitor.device_lost();
        assert_eq!(
            drain(&mut rx),
            vec![DriverEvent::Open, DriverEvent::Connected, DriverEvent::Disconnected]
        );
        assert!(monitor.state().is_open());
    }

    #[test]
    fn test_close_when_not_open_is_silent() {
        let mut monitor = ConnectionMonitor::new(16);
        let mut rx = monitor.subscribe();
        monitor.opening();
        monitor.open_failed();
        assert!(!monitor.closed());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let monitor = ConnectionMonitor::new(1);
        monitor.transport_error("gone".into());
        monitor.reopening();
    }
}
