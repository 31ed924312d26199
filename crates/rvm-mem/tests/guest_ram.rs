use rvm_mem::{GuestRam, RamError};

#[test]
fn read_write_round_trip_at_region_edges() {
    let ram = GuestRam::new(0x8000_0000, 0x1_0000).unwrap();

    ram.write_from(0x8000_0000, &[1, 2, 3, 4]).unwrap();
    let mut buf = [0u8; 4];
    ram.read_into(0x8000_0000, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);

    // Last addressable bytes.
    ram.write_from(0x8000_FFFC, &[9, 8, 7, 6]).unwrap();
    ram.read_into(0x8000_FFFC, &mut buf).unwrap();
    assert_eq!(buf, [9, 8, 7, 6]);
}

#[test]
fn bounds_hold_exactly() {
    // write_from(addr, n) succeeds iff addr >= begin and addr + n <= end.
    let ram = GuestRam::new(0x8000_0000, 0x1_0000).unwrap();
    let buf = [0u8; 32];

    assert!(ram.write_from(0x8000_0000, &buf).is_ok());
    assert!(ram.write_from(0x8000_FFE0, &buf).is_ok());
    assert!(ram.write_from(0x8000_FFE1, &buf).is_err());
    assert!(ram.write_from(0x7FFF_FFFF, &buf).is_err());
    assert!(ram.write_from(0xFFFF_FFFF_FFFF_FFF0, &buf).is_err());

    let mut out = [0u8; 32];
    assert!(ram.read_into(0x8000_FFE0, &mut out).is_ok());
    assert!(ram.read_into(0x8000_FFE1, &mut out).is_err());
}

#[test]
fn failed_write_leaves_ram_unchanged() {
    let ram = GuestRam::new(0x8000_0000, 0x1_0000).unwrap();
    let mut snapshot = vec![0u8; 0x20];
    ram.write_from(0x8000_FFF0, &[0xAAu8; 0x10]).unwrap();
    ram.read_into(0x8000_FFE0, &mut snapshot).unwrap();

    // Straddles the end of RAM: must be rejected with no partial effect.
    let err = ram.write_from(0x8000_FFF0, &[0x55u8; 32]).unwrap_err();
    assert!(matches!(err, RamError::OutOfBounds { .. }));

    let mut after = vec![0u8; 0x20];
    ram.read_into(0x8000_FFE0, &mut after).unwrap();
    assert_eq!(snapshot, after);
}

#[test]
fn construction_rejects_empty_and_wrapping_regions() {
    assert!(matches!(GuestRam::new(0x8000_0000, 0), Err(RamError::Empty)));
    assert!(matches!(
        GuestRam::new(u64::MAX - 0xFFF, 0x2000),
        Err(RamError::AddressWrap { .. })
    ));
}

#[test]
fn word_helpers_are_little_endian() {
    let ram = GuestRam::new(0x1000, 0x1000).unwrap();
    ram.write_u32(0x1010, 0x1234_5678).unwrap();
    let mut bytes = [0u8; 4];
    ram.read_into(0x1010, &mut bytes).unwrap();
    assert_eq!(bytes, [0x78, 0x56, 0x34, 0x12]);
    assert_eq!(ram.read_u32(0x1010).unwrap(), 0x1234_5678);
}

#[test]
fn shared_across_threads() {
    use std::sync::Arc;

    let ram = Arc::new(GuestRam::new(0, 0x1000).unwrap());
    let writers: Vec<_> = (0..4u64)
        .map(|i| {
            let ram = ram.clone();
            std::thread::spawn(move || {
                ram.write_from(i * 0x400, &[i as u8; 0x400]).unwrap();
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    for i in 0..4u64 {
        let mut buf = [0u8; 0x400];
        ram.read_into(i * 0x400, &mut buf).unwrap();
        assert_eq!(buf, [i as u8; 0x400]);
    }
}
