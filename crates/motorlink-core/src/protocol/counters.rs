//! Link statistics

use serde::Serialize;

/// Running totals kept by the driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Frames handed to the transport
    pub sent: u64,
    /// Responses matched to an in-flight frame
    pub received: u64,
    /// Items that saw no response in time
    pub timeouts: u64,
    /// No-clock sentinels received
    pub no_clock: u64,
    /// Malformed or unrecognized responses
    pub invalid: u64,
    /// Transport errors reported
    pub port_errors: u64,
    /// Unexpected port closures
    pub port_closed: u64,
}

impl Counters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
