//! Protocol opcodes
//!
//! Defines the command bytes understood by the controller's serial bridge.

use serde::{Deserialize, Serialize};

/// Response sent when the controller has no clock (not synchronized)
pub const NO_CLOCK_SENTINEL: [u8; 3] = [0x77, 0x77, 0x77];

/// Response sent when the command byte was not recognized
pub const UNRECOGNIZED_SENTINEL: [u8; 3] = [0x07, 0x07, 0x07];

/// First byte of every outgoing frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Write a byte to RAM below address 256
    WriteRamLow,

    /// Read a byte from RAM below address 256
    ReadRamLow,

    /// Write a byte to EEPROM
    WriteNonVolatile,

    /// Read a byte from EEPROM
    ReadNonVolatile,

    /// Reset the controller
    Reset,

    /// Write a byte to RAM at 256 and above (address sent modulo 256)
    WriteRamHigh,

    /// Read a byte from RAM at 256 and above (address sent modulo 256)
    ReadRamHigh,
}

impl Opcode {
    /// Get the command byte
    pub fn byte(&self) -> u8 {
        match self {
            Opcode::WriteRamLow => 0x00,
            Opcode::ReadRamLow => 0x01,
            Opcode::WriteNonVolatile => 0x06,
            Opcode::ReadNonVolatile => 0x07,
            Opcode::Reset => 0x0F,
            Opcode::WriteRamHigh => 0x20,
            Opcode::ReadRamHigh => 0x21,
        }
    }

    /// Look up an opcode from its command byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Opcode::WriteRamLow),
            0x01 => Some(Opcode::ReadRamLow),
            0x06 => Some(Opcode::WriteNonVolatile),
            0x07 => Some(Opcode::ReadNonVolatile),
            0x0F => Some(Opcode::Reset),
            0x20 => Some(Opcode::WriteRamHigh),
            0x21 => Some(Opcode::ReadRamHigh),
            _ => None,
        }
    }

    /// Check if this opcode reads a value back
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Opcode::ReadRamLow | Opcode::ReadNonVolatile | Opcode::ReadRamHigh
        )
    }
}
