use motorlink_core::map::{default_map, Descriptor, ParamRequest, Registry, RegistryError, Scale, StorageClass, Value, HEARTBEAT};
use motorlink_core::protocol::codec::{self, Response};
use motorlink_core::protocol::Opcode;
use pretty_assertions::assert_eq;

#[test]
fn test_every_default_parameter_encodes() {
    let map = default_map().unwrap();
    for descriptor in map.iter() {
        for index in 0..descriptor.addresses().len() {
            let frame = codec::encode_read(&descriptor, index)
                .unwrap_or_else(|| panic!("{} has no frame {}", descriptor.key(), index));
            let opcode = frame.opcode().unwrap();
            assert!(opcode.is_read(), "{} encodes {:?}", descriptor.key(), opcode);
            match descriptor.storage() {
                StorageClass::NonVolatile => assert_eq!(opcode, Opcode::ReadNonVolatile),
                StorageClass::RamLow => assert_eq!(opcode, Opcode::ReadRamLow),
                StorageClass::RamHigh => {
                    let address = descriptor.addresses()[index];
                    let expected = if address < 256 { Opcode::ReadRamLow } else { Opcode::ReadRamHigh };
                    assert_eq!(opcode, expected);
                }
            }
            assert_eq!(frame.data(), 0);
        }
    }
}

#[test]
fn test_heartbeat_frame() {
    let map = default_map().unwrap();
    let heartbeat = map.lookup(HEARTBEAT).unwrap();
    assert_eq!(codec::encode_read(&heartbeat, 0).unwrap().to_string(), "21 20 00");
}

#[test]
fn test_whole_map_frame_count() {
    let map = default_map().unwrap();
    let everything = map.resolve("").unwrap();
    // three parameters span two addresses
    assert_eq!(everything.frame_count(), map.len() + 3);
}

#[test]
fn test_nonvolatile_percent_scenario() {
    let map = Registry::builder()
        .param(
            "config.max_speed",
            Descriptor::eeprom("Max Speed", vec![0x10])
                .bounds(0x20, 0xFE)
                .scale(Scale::Percent),
        )
        .build()
        .unwrap();
    let max_speed = map.lookup("config.max_speed").unwrap();

    let reply = [0x60, 0x00, 0x00];
    let raw = match codec::classify(&reply) {
        Response::Data(byte) => byte,
        other => panic!("unexpected {:?}", other),
    };
    let expected = ((0x60 - 0x20) as f64 * 100.0 / 0xFE as f64).round() as u8;
    assert_eq!(codec::decode(&max_speed, &[raw]), Value::Percent(expected));
}

#[test]
fn test_sentinels_never_decode() {
    assert_eq!(codec::classify(&[0x77, 0x77, 0x77]), Response::NoClock);
    assert_eq!(codec::classify(&[0x07, 0x07, 0x07]), Response::Unrecognized);
    assert_eq!(codec::classify(&[0x60, 0x00]), Response::Malformed);
}

#[test]
fn test_selected_paths_expand_in_request_order() {
    let map = default_map().unwrap();
    let request = map
        .select(["status.pwm", "meters.runtime_hours", "ident.product_type"])
        .unwrap();
    let keys: Vec<String> = request.expand().iter().map(|d| d.key().to_string()).collect();
    assert_eq!(
        keys,
        vec!["status.pwm", "meters.runtime_hours", "ident.product_type"]
    );

    let nested = ParamRequest::bundle([("first", request.clone()), ("again", request)]);
    assert_eq!(nested.expand().len(), 6);
}

#[test]
fn test_invalid_descriptors_are_rejected() {
    let too_high = Registry::builder()
        .param("status.bad", Descriptor::ram_high("Bad", vec![0x200]))
        .build();
    assert!(matches!(too_high, Err(RegistryError::InvalidDescriptor { .. })));

    let eeprom_high = Registry::builder()
        .param("config.bad", Descriptor::eeprom("Bad", vec![0x100]))
        .build();
    assert!(matches!(eeprom_high, Err(RegistryError::InvalidDescriptor { .. })));

    let word_one_address = Registry::builder()
        .param("meters.bad", Descriptor::eeprom("Bad", vec![0x62]).scale(Scale::Word))
        .build();
    assert!(word_one_address.is_err());
}
