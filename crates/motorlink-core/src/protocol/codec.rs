//! Frame codec
//!
//! Pure conversions between descriptors, wire frames and decoded values.

use byteorder::{BigEndian, ByteOrder};

use super::{Frame, Opcode, FRAME_LEN, NO_CLOCK_SENTINEL, UNRECOGNIZED_SENTINEL};
use crate::map::{Descriptor, Scale, StorageClass, Value};

/// Classification of a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Payload byte
    Data(u8),
    /// `77 77 77`: controller present but unsynchronized
    NoClock,
    /// `07 07 07`: command not recognized
    Unrecognized,
    /// Anything that is not exactly three bytes
    Malformed,
}

fn read_opcode(storage: StorageClass, address: u16) -> (Opcode, u8) {
    match storage {
        StorageClass::NonVolatile => (Opcode::ReadNonVolatile, address as u8),
        StorageClass::RamLow | StorageClass::RamHigh if address < 256 => {
            (Opcode::ReadRamLow, address as u8)
        }
        _ => (Opcode::ReadRamHigh, (address % 256) as u8),
    }
}

fn write_opcode(storage: StorageClass, address: u16) -> (Opcode, u8) {
    match storage {
        StorageClass::NonVolatile => (Opcode::WriteNonVolatile, address as u8),
        StorageClass::RamLow | StorageClass::RamHigh if address < 256 => {
            (Opcode::WriteRamLow, address as u8)
        }
        _ => (Opcode::WriteRamHigh, (address % 256) as u8),
    }
}

/// Build the read frame for one of a descriptor's addresses
pub fn encode_read(descriptor: &Descriptor, address_index: usize) -> Option<Frame> {
    let address = *descriptor.addresses().get(address_index)?;
    let (opcode, addr) = read_opcode(descriptor.storage(), address);
    Some(Frame::new(opcode, addr, 0))
}

/// Build the write frame for one of a descriptor's addresses
pub fn encode_write(descriptor: &Descriptor, address_index: usize, data: u8) -> Option<Frame> {
    let address = *descriptor.addresses().get(address_index)?;
    let (opcode, addr) = write_opcode(descriptor.storage(), address);
    Some(Frame::new(opcode, addr, data))
}

/// Build the controller reset frame
pub fn encode_reset() -> Frame {
    Frame::new(Opcode::Reset, 0, 0)
}

/// Classify a response frame
pub fn classify(bytes: &[u8]) -> Response {
    if bytes.len() != FRAME_LEN {
        return Response::Malformed;
    }
    if bytes == NO_CLOCK_SENTINEL {
        Response::NoClock
    } else if bytes == UNRECOGNIZED_SENTINEL {
        Response::Unrecognized
    } else {
        Response::Data(bytes[0])
    }
}

/// Convert a raw byte to percent of range, clamped to 0..=100
pub fn raw_to_percent(raw: u8, min: u8, max: u8) -> u8 {
    if max == 0 {
        return 0;
    }
    let pct = ((raw as f64 - min as f64) * 100.0 / max as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Convert a percent back to a raw byte, clamped to `[min, max]`
pub fn percent_to_raw(value: u8, min: u8, max: u8) -> u8 {
    let raw = (value as f64 * max as f64 / 100.0 - min as f64).round();
    raw.clamp(min as f64, max as f64) as u8
}

/// Decode the raw bytes collected for a descriptor
///
/// `raw` holds one byte per address, in address order.
pub fn decode(descriptor: &Descriptor, raw: &[u8]) -> Value {
    let (min, max) = descriptor.bounds();
    let first = raw.first().copied().unwrap_or(0);

    match descriptor.scale() {
        Scale::Byte => Value::Number(first as u32),
        Scale::Word => Value::Number(word(raw) as u32),
        Scale::Hex8 => Value::Text(format!("{:02x}", first)),
        Scale::Hex16 => Value::Text(format!("{:04x}", word(raw))),
        Scale::Percent => Value::Percent(raw_to_percent(first, min, max)),
        Scale::InvertedPercent => Value::Percent(100 - raw_to_percent(first, min, max)),
        Scale::Flags { .. } => Value::Flags(first),
        Scale::Ascii => Value::Text((first as char).to_string()),
    }
}

/// Convert an engineering value to the raw byte for a write frame
///
/// Returns None when the value kind does not fit the descriptor's scale.
pub fn encode_value(descriptor: &Descriptor, value: &Value) -> Option<u8> {
    let (min, max) = descriptor.bounds();
    match (descriptor.scale(), value) {
        (Scale::Byte, Value::Number(n)) => u8::try_from(*n).ok(),
        (Scale::Percent, Value::Percent(p)) => Some(percent_to_raw(*p, min, max)),
        (Scale::InvertedPercent, Value::Percent(p)) => {
            Some(percent_to_raw(100u8.saturating_sub(*p), min, max))
        }
        (Scale::Flags { .. }, Value::Flags(f)) => Some(*f),
        (Scale::Hex8, Value::Text(s)) => u8::from_str_radix(s, 16).ok(),
        (Scale::Ascii, Value::Text(s)) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() => Some(c as u8),
                _ => None,
            }
        }
        _ => None,
    }
}

fn word(raw: &[u8]) -> u16 {
    if raw.len() >= 2 {
        BigEndian::read_u16(raw)
    } else {
        raw.first().copied().unwrap_or(0) as u16
    }
}
