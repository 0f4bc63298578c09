//! Default controller memory map
//!
//! Addresses for the standard motor controller firmware. EEPROM holds
//! identification, lifetime meters and configuration; RAM holds live status.

use super::{Descriptor, Registry, RegistryError, Scale};

/// Parameter polled by the liveness probe
pub const HEARTBEAT: &str = "status.pwm";

/// Build the registry for the standard controller firmware
pub fn default_map() -> Result<Registry, RegistryError> {
    Registry::builder()
        // Identification
        .param(
            "ident.product_type",
            Descriptor::eeprom("Product Type", vec![0x00]).scale(Scale::Hex8),
        )
        .param(
            "ident.serial_number",
            Descriptor::eeprom("Serial Number", vec![0x01, 0x02]).scale(Scale::Hex16),
        )
        .param(
            "ident.firmware_version",
            Descriptor::eeprom("Firmware Version", vec![0x03]),
        )
        .param(
            "ident.hardware_revision",
            Descriptor::eeprom("Hardware Revision", vec![0x04]).scale(Scale::Ascii),
        )
        // Lifetime meters
        .param(
            "meters.runtime_hours",
            Descriptor::eeprom("Runtime Hours", vec![0x62, 0x63])
                .scale(Scale::Word)
                .units("h"),
        )
        .param(
            "meters.charge_no_float",
            Descriptor::eeprom("Incomplete Charge", vec![0x64]),
        )
        .param(
            "meters.low_batt_hours",
            Descriptor::eeprom("Low Batt Hours", vec![0x65, 0x66])
                .scale(Scale::Word)
                .units("h"),
        )
        .param(
            "meters.overtemp_counter",
            Descriptor::eeprom("Overtemp Faults", vec![0x67]),
        )
        .param(
            "meters.throttle_fault_counter",
            Descriptor::eeprom("Throttle Faults", vec![0x68]),
        )
        // Faults
        .param(
            "fault.active",
            Descriptor::ram_low("Active Faults", vec![0x30]).scale(Scale::Flags { active_low: 0 }),
        )
        .param(
            "fault.last_code",
            Descriptor::eeprom("Last Fault Code", vec![0x69]).scale(Scale::Hex8),
        )
        // Configuration
        .param(
            "config.max_speed",
            Descriptor::eeprom("Max Speed", vec![0x10])
                .bounds(0x20, 0xFE)
                .scale(Scale::Percent)
                .units("%")
                .writable(),
        )
        .param(
            "config.accel_rate",
            Descriptor::eeprom("Acceleration Rate", vec![0x11])
                .bounds(0x08, 0xFF)
                .scale(Scale::Percent)
                .units("%")
                .writable(),
        )
        .param(
            "config.decel_rate",
            Descriptor::eeprom("Deceleration Rate", vec![0x12])
                .bounds(0x08, 0xFF)
                .scale(Scale::InvertedPercent)
                .units("%")
                .writable(),
        )
        .param(
            "config.throttle_type",
            Descriptor::eeprom("Throttle Type", vec![0x13]).writable(),
        )
        .param(
            "config.low_batt_cutoff",
            Descriptor::eeprom("Low Battery Cutoff", vec![0x14])
                .units("V")
                .writable(),
        )
        .param(
            "config.input_polarity",
            Descriptor::eeprom("Input Polarity", vec![0x15])
                .scale(Scale::Flags { active_low: 0x0C })
                .writable(),
        )
        // Live status
        .param(
            "status.pwm",
            Descriptor::ram_high("PWM", vec![0x120])
                .scale(Scale::Percent)
                .units("%"),
        )
        .param(
            "status.speed",
            Descriptor::ram_high("Speed", vec![0x122])
                .scale(Scale::Percent)
                .units("%"),
        )
        .param(
            "status.target_port_b",
            Descriptor::ram_low("Port B", vec![0x25]).scale(Scale::Flags { active_low: 0 }),
        )
        .param(
            "status.target_port_c",
            Descriptor::ram_low("Port C", vec![0x26]).scale(Scale::Flags { active_low: 0x01 }),
        )
        .param(
            "status.throttle_v",
            Descriptor::ram_low("Throttle Voltage", vec![0x45]).units("V/10"),
        )
        .param(
            "status.temperature",
            Descriptor::ram_low("Temperature", vec![0x46]).units("C"),
        )
        .param(
            "status.current",
            Descriptor::ram_low("Current", vec![0x47]).units("A"),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::StorageClass;

    #[test]
    fn test_default_map_builds() {
        let map = default_map().expect("default map is valid");
        assert_eq!(
            map.groups().collect::<Vec<_>>(),
            vec!["ident", "meters", "fault", "config", "status"]
        );
        assert_eq!(map.len(), 24);
    }

    #[test]
    fn test_heartbeat_is_banked_ram() {
        let map = default_map().unwrap();
        let heartbeat = map.lookup(HEARTBEAT).unwrap();
        assert_eq!(heartbeat.storage(), StorageClass::RamHigh);
        assert_eq!(heartbeat.addresses(), &[0x120]);
    }

    #[test]
    fn test_meters_match_eeprom_layout() {
        let map = default_map().unwrap();
        let meters = map.resolve("meters").unwrap().expand();
        let addrs: Vec<u16> = meters.iter().flat_map(|d| d.addresses().to_vec()).collect();
        assert_eq!(addrs, vec![0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68]);
    }
}
