//! Parameter descriptors
//!
//! A descriptor says where a value lives on the controller and how its raw
//! bytes turn into something a person can read.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use super::RegistryError;

/// Highest RAM address reachable through the high-bank opcodes
pub const RAM_ADDRESS_LIMIT: u16 = 512;

/// Which memory region an address refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    /// EEPROM
    NonVolatile,
    /// RAM reachable only through the low-bank opcodes (addresses below 256)
    RamLow,
    /// RAM split into banks; the opcode is chosen per address
    RamHigh,
}

/// Conversion from raw bytes to an engineering value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    /// First byte as an integer
    Byte,
    /// First two bytes as a big-endian 16-bit integer
    Word,
    /// First byte as a 2-digit hex string
    Hex8,
    /// First two bytes as a 4-digit hex string
    Hex16,
    /// Percent of the `(min, max)` range
    Percent,
    /// `100 - percent`, for inputs wired backwards
    InvertedPercent,
    /// Raw bit field; bits in `active_low` read as active when clear
    Flags { active_low: u8 },
    /// First byte as an ASCII character
    Ascii,
}

impl Scale {
    /// Number of raw bytes this scale consumes
    pub fn width(&self) -> usize {
        match self {
            Scale::Word | Scale::Hex16 => 2,
            _ => 1,
        }
    }

    fn uses_range(&self) -> bool {
        matches!(self, Scale::Percent | Scale::InvertedPercent)
    }
}

/// Describes one addressable controller value
#[derive(Debug)]
pub struct Descriptor {
    key: String,
    name: String,
    addresses: Vec<u16>,
    storage: StorageClass,
    min: u8,
    max: u8,
    scale: Scale,
    units: String,
    writable: bool,
    last_value: RwLock<Option<Vec<u8>>>,
}

impl Descriptor {
    /// Start describing an EEPROM value
    pub fn eeprom(name: impl Into<String>, addresses: Vec<u16>) -> DescriptorBuilder {
        DescriptorBuilder::new(name.into(), StorageClass::NonVolatile, addresses)
    }

    /// Start describing a low-bank RAM value
    pub fn ram_low(name: impl Into<String>, addresses: Vec<u16>) -> DescriptorBuilder {
        DescriptorBuilder::new(name.into(), StorageClass::RamLow, addresses)
    }

    /// Start describing a banked RAM value
    pub fn ram_high(name: impl Into<String>, addresses: Vec<u16>) -> DescriptorBuilder {
        DescriptorBuilder::new(name.into(), StorageClass::RamHigh, addresses)
    }

    /// Registry path, e.g. `status.pwm`
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Human readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    pub fn storage(&self) -> StorageClass {
        self.storage
    }

    /// Raw `(min, max)` bounds
    pub fn bounds(&self) -> (u8, u8) {
        (self.min, self.max)
    }

    pub fn scale(&self) -> Scale {
        self.scale
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether `bit` of a flag value reads as active, honoring the active-low mask
    pub fn flag_active(&self, raw: u8, bit: u8) -> bool {
        let active_low = match self.scale {
            Scale::Flags { active_low } => active_low,
            _ => 0,
        };
        let mask = 1u8 << (bit & 7);
        ((raw ^ active_low) & mask) != 0
    }

    /// Last raw bytes decoded for this descriptor
    pub fn last_value(&self) -> Option<Vec<u8>> {
        self.last_value.read().ok().and_then(|guard| guard.clone())
    }

    pub(crate) fn remember(&self, raw: &[u8]) {
        if let Ok(mut guard) = self.last_value.write() {
            *guard = Some(raw.to_vec());
        }
    }
}

/// Builder for [`Descriptor`]
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    name: String,
    addresses: Vec<u16>,
    storage: StorageClass,
    min: u8,
    max: u8,
    scale: Scale,
    units: String,
    writable: bool,
}

impl DescriptorBuilder {
    fn new(name: String, storage: StorageClass, addresses: Vec<u16>) -> Self {
        Self {
            name,
            addresses,
            storage,
            min: 0,
            max: 255,
            scale: Scale::Byte,
            units: String::new(),
            writable: false,
        }
    }

    pub fn bounds(mut self, min: u8, max: u8) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn scale(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Validate and freeze the descriptor under the given registry path
    pub fn build(self, key: impl Into<String>) -> Result<Descriptor, RegistryError> {
        let key = key.into();
        let invalid = |reason: String| RegistryError::InvalidDescriptor {
            name: key.clone(),
            reason,
        };

        if self.addresses.is_empty() {
            return Err(invalid("no addresses".into()));
        }

        let limit = match self.storage {
            StorageClass::NonVolatile | StorageClass::RamLow => 256,
            StorageClass::RamHigh => RAM_ADDRESS_LIMIT,
        };
        if let Some(addr) = self.addresses.iter().find(|a| **a >= limit) {
            return Err(invalid(format!(
                "address {:#06x} out of range for {:?}",
                addr, self.storage
            )));
        }

        if self.min > self.max {
            return Err(invalid(format!("min {} above max {}", self.min, self.max)));
        }
        if self.scale.uses_range() && self.max == 0 {
            return Err(invalid("percent scale needs a non-zero max".into()));
        }
        if self.addresses.len() < self.scale.width() {
            return Err(invalid(format!(
                "{:?} needs {} addresses",
                self.scale,
                self.scale.width()
            )));
        }

        Ok(Descriptor {
            key,
            name: self.name,
            addresses: self.addresses,
            storage: self.storage,
            min: self.min,
            max: self.max,
            scale: self.scale,
            units: self.units,
            writable: self.writable,
            last_value: RwLock::new(None),
        })
    }
}
