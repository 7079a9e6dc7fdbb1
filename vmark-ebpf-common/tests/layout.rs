use vmark_ebpf_common::{action, tag, FwKey, FwStep, FwValue, MAX_STEPS};

#[test]
fn test_fw_key_size() {
    // 4 + 2 + 2 + 6 + 2 = 16 bytes
    assert_eq!(size_of::<FwKey>(), FwKey::LEN);
}

#[test]
fn test_fw_step_size() {
    // 1 + 1 + 2 + 4 = 8 bytes
    assert_eq!(size_of::<FwStep>(), FwStep::LEN);
}

#[test]
fn test_fw_value_size() {
    // 1 + 5*8 + 9 = 50 bytes (packed)
    assert_eq!(size_of::<FwValue>(), FwValue::LEN);
}

#[test]
fn test_key_byte_offsets() {
    let key = FwKey::new(0x0403_0201, 0x0605, 0x0807);
    let bytes = key.to_bytes();
    // Native byte order on a little-endian host.
    if cfg!(target_endian = "little") {
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..6], &[0x05, 0x06]);
        assert_eq!(&bytes[6..8], &[0x07, 0x08]);
    }
    assert_eq!(&bytes[8..16], &[0u8; 8]);
    assert_eq!(FwKey::from_bytes(&bytes), key);
}

#[test]
fn test_value_roundtrip() {
    let steps = [
        FwStep::pop(),
        FwStep::push(tag::CVLAN, 11),
        FwStep::push(tag::SVLAN, 100),
        FwStep::forward(7),
    ];
    let value = FwValue::from_steps(&steps).expect("4 steps fit");
    assert_eq!(value.num_actions(), 4);

    let bytes = value.to_bytes();
    assert_eq!(bytes[0], 4);
    // First step begins at offset 1 (packed layout).
    assert_eq!(bytes[1], action::POP);
    assert_eq!(bytes[9], action::PUSH);
    assert_eq!(bytes[10], tag::CVLAN);
    assert_eq!(FwValue::from_bytes(&bytes), value);
}

#[test]
fn test_value_rejects_too_many_steps() {
    let steps = [FwStep::pop(); MAX_STEPS + 1];
    assert!(FwValue::from_steps(&steps).is_none());
}
