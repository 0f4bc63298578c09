//! Driver configuration
//!
//! Serial line settings plus the engine's timing knobs. Loads from JSON files
//! such as:
//!
//! ```json
//! { "port": "/dev/ttyUSB0", "baudrate": 115200 }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::map::HEARTBEAT;
use crate::protocol::{
    ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_ITEM_TIMEOUT_MS, DEFAULT_PING_INTERVAL_MS,
    DEFAULT_RECONNECT_INTERVAL_MS, DEFAULT_RESPONSE_GAP_MS,
};

/// Serial parity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line settings, passed through to the port unchanged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,

    #[serde(default = "default_baud_rate", alias = "baudrate", alias = "baudRate")]
    pub baud_rate: u32,

    #[serde(default = "default_data_bits", alias = "dataBits")]
    pub data_bits: u8,

    #[serde(default = "default_stop_bits", alias = "stopBits")]
    pub stop_bits: u8,

    #[serde(default)]
    pub parity: Parity,

    /// Line silence that ends a partial response
    #[serde(default = "default_response_gap_ms")]
    pub response_gap_ms: u64,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_response_gap_ms() -> u64 {
    DEFAULT_RESPONSE_GAP_MS
}

impl SerialSettings {
    /// 8N1 at the default baud rate
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            response_gap_ms: DEFAULT_RESPONSE_GAP_MS,
        }
    }

    pub fn response_gap(&self) -> Duration {
        Duration::from_millis(self.response_gap_ms)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.port.is_empty() {
            return Err(ProtocolError::InvalidConfig("port name is empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(ProtocolError::InvalidConfig("baud rate is zero".into()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ProtocolError::InvalidConfig(format!(
                "unsupported data bits: {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ProtocolError::InvalidConfig(format!(
                "unsupported stop bits: {}",
                self.stop_bits
            )));
        }
        if self.response_gap_ms == 0 {
            return Err(ProtocolError::InvalidConfig(
                "response_gap_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::new(String::new())
    }
}

/// Complete driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(flatten)]
    pub serial: SerialSettings,

    /// How long to wait for each response
    #[serde(default = "default_item_timeout_ms")]
    pub item_timeout_ms: u64,

    /// Liveness probe period
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Period between reopen attempts after the port closes
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Registry path of the parameter the liveness probe reads
    #[serde(default = "default_heartbeat")]
    pub heartbeat: String,

    /// Buffered lifecycle events per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_item_timeout_ms() -> u64 {
    DEFAULT_ITEM_TIMEOUT_MS
}

fn default_ping_interval_ms() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

fn default_heartbeat() -> String {
    HEARTBEAT.to_string()
}

fn default_event_capacity() -> usize {
    256
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            item_timeout_ms: default_item_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            heartbeat: default_heartbeat(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl DriverConfig {
    /// Default timings for the given port
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            serial: SerialSettings::new(port),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidConfig(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Check timing values; serial settings are checked when the port opens
    pub fn validate(&self) -> Result<(), ProtocolError> {
        for (name, value) in [
            ("item_timeout_ms", self.item_timeout_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
        ] {
            if value == 0 {
                return Err(ProtocolError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.event_capacity == 0 {
            return Err(ProtocolError::InvalidConfig(
                "event_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
