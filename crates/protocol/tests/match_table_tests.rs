//! Device match table tests
//!
//! Covers the built-in table, filter syntax and module aliases.

use protocol::{CAEN_DEVICE_TABLE, DeviceMatch, ProtocolError, is_supported};

// ============================================================================
// Built-in Table
// ============================================================================

#[test]
fn test_builtin_table_contents() {
    let expected = [
        (0x0547, 0x1002),
        (0x21e1, 0x0000),
        (0x21e1, 0x0001),
        (0x21e1, 0x0005),
    ];
    assert_eq!(CAEN_DEVICE_TABLE.len(), expected.len());
    for (vid, pid) in expected {
        assert!(is_supported(vid, pid, &[]), "{:04x}:{:04x}", vid, pid);
    }
}

#[test]
fn test_unlisted_devices_rejected() {
    assert!(!is_supported(0x21e1, 0x0002, &[]));
    assert!(!is_supported(0x0547, 0x1003, &[]));
    assert!(!is_supported(0x1234, 0x5678, &[]));
}

#[test]
fn test_extra_matches_extend_table() {
    let extra = [DeviceMatch::vendor(0x04f9), DeviceMatch::device(0x1234, 0x5678)];
    assert!(is_supported(0x04f9, 0xffff, &extra));
    assert!(is_supported(0x1234, 0x5678, &extra));
    assert!(!is_supported(0x1234, 0x5679, &extra));
    assert!(is_supported(0x21e1, 0x0001, &extra));
}

#[test]
fn test_modalias() {
    assert_eq!(
        CAEN_DEVICE_TABLE[0].modalias(),
        "usb:v0547p1002d*dc*dsc*dp*ic*isc*ip*in*"
    );
    assert_eq!(
        DeviceMatch::vendor(0x21e1).modalias(),
        "usb:v21E1p*d*dc*dsc*dp*ic*isc*ip*in*"
    );
}

// ============================================================================
// Filter Syntax
// ============================================================================

#[test]
fn test_parse_filters() {
    assert_eq!(
        DeviceMatch::parse("0x1234:0x5678").unwrap(),
        DeviceMatch::device(0x1234, 0x5678)
    );
    assert_eq!(
        DeviceMatch::parse("21e1:0001").unwrap(),
        DeviceMatch::device(0x21e1, 0x0001)
    );
    assert_eq!(
        DeviceMatch::parse("0xABCD:*").unwrap(),
        DeviceMatch::vendor(0xabcd)
    );
}

#[test]
fn test_parse_invalid_filters() {
    assert!(matches!(
        DeviceMatch::parse("*:0x1234"),
        Err(ProtocolError::InvalidFilter(_))
    ));
    assert!(matches!(
        DeviceMatch::parse("0x1234"),
        Err(ProtocolError::InvalidFilter(_))
    ));
    assert!(DeviceMatch::parse("0x1234:0x5678:0x9abc").is_err());
    assert!(matches!(
        DeviceMatch::parse("0xGHIJ:0x5678"),
        Err(ProtocolError::InvalidHexId { field: "VID", .. })
    ));
    assert!(matches!(
        DeviceMatch::parse("0x1234:0x56789"),
        Err(ProtocolError::InvalidHexId { field: "PID", .. })
    ));
}

#[test]
fn test_display_round_trips_through_parse() {
    for entry in CAEN_DEVICE_TABLE {
        assert_eq!(DeviceMatch::parse(&entry.to_string()).unwrap(), *entry);
    }
    let vendor = DeviceMatch::vendor(0x04f9);
    assert_eq!(vendor.to_string(), "04f9:*");
}
