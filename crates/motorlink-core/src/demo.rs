//! Demo Mode - Simulated motor controller for testing
//!
//! An in-memory [`Transport`] that answers read frames from a simulated
//! EEPROM/RAM image, so the driver can be exercised without hardware. A
//! [`DemoHandle`] lets tests script the controller: switch its answering mode,
//! inject raw bytes, pull the cable, and inspect what was written.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::protocol::{
    EventSender, Frame, Opcode, ProtocolError, Transport, TransportEvent, NO_CLOCK_SENTINEL,
    UNRECOGNIZED_SENTINEL,
};

const EEPROM_SIZE: usize = 256;
const RAM_SIZE: usize = 512;

/// How the simulated controller answers frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DemoMode {
    /// Answer from the memory image
    #[default]
    Normal,
    /// Answer every frame with the no-clock sentinel
    NoClock,
    /// Answer every frame with the not-recognized sentinel
    Unrecognized,
    /// Never answer
    Silent,
    /// Record frames but only answer what the handle injects
    Manual,
}

struct DemoState {
    mode: DemoMode,
    eeprom: [u8; EEPROM_SIZE],
    ram: [u8; RAM_SIZE],
    written: Vec<Frame>,
    session: Option<EventSender>,
    plugged: bool,
    fail_writes: bool,
    open_count: usize,
    discards: usize,
    /// Drift applied to RAM reads, if enabled
    wander: Option<StdRng>,
}

impl DemoState {
    fn new() -> Self {
        let mut eeprom = [0u8; EEPROM_SIZE];
        let mut ram = [0u8; RAM_SIZE];

        // Identification
        eeprom[0x00] = 0x05;
        eeprom[0x01] = 0x1A;
        eeprom[0x02] = 0x2B;
        eeprom[0x03] = 0x11;
        eeprom[0x04] = b'C';
        // Configuration
        eeprom[0x10] = 0x60;
        eeprom[0x11] = 0x80;
        eeprom[0x12] = 0x40;
        eeprom[0x13] = 0x01;
        eeprom[0x14] = 0xC8;
        eeprom[0x15] = 0x0C;
        // Meters: 300 runtime hours, 12 low battery hours
        eeprom[0x62] = 0x01;
        eeprom[0x63] = 0x2C;
        eeprom[0x64] = 0x03;
        eeprom[0x65] = 0x00;
        eeprom[0x66] = 0x0C;
        eeprom[0x67] = 0x02;
        eeprom[0x68] = 0x01;
        eeprom[0x69] = 0x00;

        // Live status
        ram[0x25] = 0b1010_0000;
        ram[0x26] = 0x01;
        ram[0x30] = 0x00;
        ram[0x45] = 0x32;
        ram[0x46] = 0x19;
        ram[0x47] = 0x04;
        ram[0x120] = 0x80;
        ram[0x122] = 0x40;

        Self {
            mode: DemoMode::Normal,
            eeprom,
            ram,
            written: Vec::new(),
            session: None,
            plugged: true,
            fail_writes: false,
            open_count: 0,
            discards: 0,
            wander: None,
        }
    }

    fn send(&self, event: TransportEvent) -> bool {
        match &self.session {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn read_ram(&mut self, address: usize) -> u8 {
        if let Some(rng) = self.wander.as_mut() {
            let step: i16 = rng.gen_range(-2..=2);
            let next = (self.ram[address] as i16 + step).clamp(0, 255);
            self.ram[address] = next as u8;
        }
        self.ram[address]
    }

    /// Execute a frame against the memory image
    fn execute(&mut self, frame: &Frame) -> [u8; 3] {
        let address = frame.address() as usize;
        let data = frame.data();
        let value = match frame.opcode() {
            Some(Opcode::ReadNonVolatile) => self.eeprom[address],
            Some(Opcode::ReadRamLow) => self.read_ram(address),
            Some(Opcode::ReadRamHigh) => self.read_ram(256 + address),
            Some(Opcode::WriteNonVolatile) => {
                self.eeprom[address] = data;
                data
            }
            Some(Opcode::WriteRamLow) => {
                self.ram[address] = data;
                data
            }
            Some(Opcode::WriteRamHigh) => {
                self.ram[256 + address] = data;
                data
            }
            Some(Opcode::Reset) => 0,
            None => return UNRECOGNIZED_SENTINEL,
        };
        [value, 0, 0]
    }
}

/// Simulated controller transport
pub struct DemoController {
    state: Arc<Mutex<DemoState>>,
}

impl Default for DemoController {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoController {
    /// Create a simulated controller answering from its memory image
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DemoState::new())),
        }
    }

    /// Create a simulated controller in the given mode
    pub fn with_mode(mode: DemoMode) -> Self {
        let demo = Self::new();
        demo.handle().set_mode(mode);
        demo
    }

    /// Make live RAM values drift a little on every read
    pub fn with_live_values(self) -> Self {
        lock(&self.state).wander = Some(StdRng::from_entropy());
        self
    }

    /// Handle for scripting this controller from outside the driver
    pub fn handle(&self) -> DemoHandle {
        DemoHandle {
            state: Arc::clone(&self.state),
        }
    }
}

fn lock(state: &Mutex<DemoState>) -> MutexGuard<'_, DemoState> {
    // A panicking test thread must not wedge the simulator
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transport for DemoController {
    fn describe(&self) -> String {
        "demo".to_string()
    }

    fn open(&mut self, events: EventSender) -> Result<(), ProtocolError> {
        let mut state = lock(&self.state);
        if !state.plugged {
            return Err(ProtocolError::ConnectionFailed("demo controller unplugged".into()));
        }
        state.session = Some(events);
        state.open_count += 1;
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut state = lock(&self.state);
        if state.session.is_none() {
            return Err(ProtocolError::TransportClosed);
        }
        if state.fail_writes {
            return Err(ProtocolError::SerialError("write failed".into()));
        }
        state.written.push(*frame);
        debug!(frame = %frame, mode = ?state.mode, "demo controller received frame");

        let reply = match state.mode {
            DemoMode::Normal => state.execute(frame),
            DemoMode::NoClock => NO_CLOCK_SENTINEL,
            DemoMode::Unrecognized => UNRECOGNIZED_SENTINEL,
            DemoMode::Silent | DemoMode::Manual => return Ok(()),
        };
        state.send(TransportEvent::Data(reply.to_vec()));
        Ok(())
    }

    fn discard_input(&mut self) {
        lock(&self.state).discards += 1;
    }

    fn close(&mut self) {
        lock(&self.state).session = None;
    }

    fn is_open(&self) -> bool {
        lock(&self.state).session.is_some()
    }
}

/// Scripting handle for a [`DemoController`]
#[derive(Clone)]
pub struct DemoHandle {
    state: Arc<Mutex<DemoState>>,
}

impl DemoHandle {
    pub fn set_mode(&self, mode: DemoMode) {
        lock(&self.state).mode = mode;
    }

    /// Deliver raw bytes as if the controller had sent them
    ///
    /// Returns false if the port is not open.
    pub fn inject(&self, bytes: &[u8]) -> bool {
        lock(&self.state).send(TransportEvent::Data(bytes.to_vec()))
    }

    /// Report a transport error without closing the port
    pub fn raise_error(&self, message: &str) -> bool {
        lock(&self.state).send(TransportEvent::Error(message.to_string()))
    }

    /// Every frame written so far
    pub fn written(&self) -> Vec<Frame> {
        lock(&self.state).written.clone()
    }

    /// Written frames as raw bytes
    pub fn written_bytes(&self) -> Vec<[u8; 3]> {
        lock(&self.state).written.iter().map(|f| *f.as_bytes()).collect()
    }

    pub fn clear_written(&self) {
        lock(&self.state).written.clear();
    }

    /// Pull the cable: the open session reports closure and reopening fails
    pub fn unplug(&self) {
        let mut state = lock(&self.state);
        state.plugged = false;
        if let Some(tx) = state.session.take() {
            let _ = tx.send(TransportEvent::Closed);
        }
    }

    /// Reconnect the cable so the next open succeeds
    pub fn plug_in(&self) {
        lock(&self.state).plugged = true;
    }

    /// Make every write fail while leaving the port open
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    pub fn set_eeprom(&self, address: u8, value: u8) {
        lock(&self.state).eeprom[address as usize] = value;
    }

    /// Set a RAM byte; addresses 256 and up live in the high bank
    pub fn set_ram(&self, address: u16, value: u8) {
        let mut state = lock(&self.state);
        if let Some(slot) = state.ram.get_mut(address as usize) {
            *slot = value;
        }
    }

    /// How many times the port has been opened
    pub fn open_count(&self) -> usize {
        lock(&self.state).open_count
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).session.is_some()
    }

    /// How many times the driver asked to forget partial input
    pub fn discard_count(&self) -> usize {
        lock(&self.state).discards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn open(demo: &mut DemoController) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        demo.open(tx).unwrap();
        rx
    }

    #[test]
    fn test_answers_from_memory() {
        let mut demo = DemoController::new();
        let mut rx = open(&mut demo);

        demo.write(&Frame::new(Opcode::ReadNonVolatile, 0x62, 0)).unwrap();
        demo.write(&Frame::new(Opcode::ReadRamHigh, 0x20, 0)).unwrap();
        demo.write(&Frame::new(Opcode::ReadRamLow, 0x46, 0)).unwrap();

        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Data(vec![0x01, 0, 0]));
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Data(vec![0x80, 0, 0]));
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Data(vec![0x19, 0, 0]));
        assert_eq!(demo.handle().written().len(), 3);
    }

    #[test]
    fn test_write_frames_update_memory() {
        let mut demo = DemoController::new();
        let mut rx = open(&mut demo);
        demo.write(&Frame::new(Opcode::WriteRamHigh, 0x20, 0x10)).unwrap();
        demo.write(&Frame::new(Opcode::ReadRamHigh, 0x20, 0)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Data(vec![0x10, 0, 0]));
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Data(vec![0x10, 0, 0]));
    }

    #[test]
    fn test_sentinel_modes() {
        let mut demo = DemoController::with_mode(DemoMode::NoClock);
        let mut rx = open(&mut demo);
        demo.write(&Frame::new(Opcode::ReadRamLow, 0x25, 0)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Data(vec![0x77, 0x77, 0x77]));

        demo.handle().set_mode(DemoMode::Unrecognized);
        demo.write(&Frame::new(Opcode::ReadRamLow, 0x25, 0)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Data(vec![0x07, 0x07, 0x07]));

        demo.handle().set_mode(DemoMode::Manual);
        demo.write(&Frame::new(Opcode::ReadRamLow, 0x25, 0)).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(demo.handle().inject(&[0x42, 0, 0]));
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Data(vec![0x42, 0, 0]));
    }

    #[test]
    fn test_unplug_and_replug() {
        let mut demo = DemoController::new();
        let handle = demo.handle();
        let mut rx = open(&mut demo);

        handle.unplug();
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Closed);
        assert!(!demo.is_open());
        assert!(matches!(
            demo.write(&Frame::new(Opcode::ReadRamLow, 0x25, 0)),
            Err(ProtocolError::TransportClosed)
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(demo.open(tx).is_err());

        handle.plug_in();
        let _rx = open(&mut demo);
        assert_eq!(handle.open_count(), 2);
    }

    #[test]
    fn test_live_values_stay_in_range() {
        let mut demo = DemoController::new().with_live_values();
        let mut rx = open(&mut demo);
        for _ in 0..50 {
            demo.write(&Frame::new(Opcode::ReadRamHigh, 0x20, 0)).unwrap();
        }
        let mut count = 0;
        while let Ok(TransportEvent::Data(bytes)) = rx.try_recv() {
            assert_eq!(bytes.len(), 3);
            assert!(bytes[0] >= 0x80 - 100 && bytes[0] <= 0x80 + 100);
            count += 1;
        }
        assert_eq!(count, 50);
    }
}
