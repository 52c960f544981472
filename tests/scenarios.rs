//! End-to-end scenarios against `Fs<MemoryBlockDevice>`, one per named case.
//! Geometry throughout (unless noted): page_size=512, block_size=8 pages,
//! hash_size=4, metadata_size=32, max_file_name_size=12.

use tinyfs::{Fs, FormatParams, FsError, MemoryBlockDevice};

fn default_params() -> FormatParams {
    FormatParams {
        block_size_pages: 8,
        address_size: 2,
        hash_size: 4,
        max_file_name_size: 12,
        metadata_entry_size: None,
        erase_first: true,
    }
}

#[test]
fn scenario_a_single_file_write_read() {
    let device = MemoryBlockDevice::new(1000, 512);
    let mut fs = Fs::format(device, default_params()).unwrap();

    let mut handle = fs.open(b"test.aaa").unwrap();

    let mut payload = [0u8; 512];
    for (i, b) in payload.iter_mut().enumerate().take(26) {
        *b = b'a' + i as u8;
    }
    for b in payload.iter_mut().skip(26) {
        *b = 0x2E;
    }
    fs.write(&mut handle, 0, &payload, 0).unwrap();

    let mut readback = [0u8; 512];
    fs.read(&mut handle, 0, &mut readback, 0).unwrap();
    assert_eq!(readback, payload);

    fs.close(&mut handle).unwrap();
    assert_eq!(handle.eof_page, 1);
    assert_eq!(handle.eof_byte, 0);

    let sb = fs.superblock();
    let expected_data_block = sb.first_data_page() + 5 * sb.block_size_pages() as u32;
    assert_eq!(handle.data_block, expected_data_block);
}

#[test]
fn scenario_b_hash_collision() {
    let device = MemoryBlockDevice::new(1000, 512);
    let mut fs = Fs::format(device, default_params()).unwrap();

    // djb2a("playwright") == djb2a("snush") == 195669366; see hash.rs's own
    // unit test for the hash derivation. Both names land in the same hash
    // slot bucket but get distinct metadata slots via the append-only,
    // no-chaining directory (spec §4.4).
    let mut h1 = fs.open(b"playwright").unwrap();
    let mut h2 = fs.open(b"snush").unwrap();

    fs.write(&mut h1, 0, b"one", 0).unwrap();
    fs.write(&mut h2, 0, b"two", 0).unwrap();

    let sb = fs.superblock();
    let expected_h1 = sb.first_data_page() + 5 * sb.block_size_pages() as u32;
    let expected_h2 = sb.first_data_page() + 7 * sb.block_size_pages() as u32;
    assert_eq!(h1.data_block, expected_h1);
    assert_eq!(h2.data_block, expected_h2);

    let mut buf1 = [0u8; 3];
    let mut buf2 = [0u8; 3];
    fs.read(&mut h1, 0, &mut buf1, 0).unwrap();
    fs.read(&mut h2, 0, &mut buf2, 0).unwrap();
    assert_eq!(&buf1, b"one");
    assert_eq!(&buf2, b"two");

    fs.close(&mut h1).unwrap();
    fs.close(&mut h2).unwrap();
}

#[test]
fn scenario_c_create_delete_idempotence() {
    let device = MemoryBlockDevice::new(1000, 512);
    let mut fs = Fs::format(device, default_params()).unwrap();

    let mut handle = fs.open(b"file.0").unwrap();
    fs.close(&mut handle).unwrap();
    assert_eq!(handle.directory_slot, 0);

    fs.remove(b"file.0").unwrap();
    assert!(!fs.exists(b"file.0").unwrap());

    let mut reopened = fs.open(b"file.0").unwrap();
    // the freed slot (0) must be reused rather than appended past it
    assert_eq!(reopened.directory_slot, 0);
    assert_eq!(reopened.page_count(), 0);
    fs.close(&mut reopened).unwrap();
}

#[test]
fn scenario_d_grow_across_child_boundary() {
    // Large enough to hold a full degenerate tree (2048 data blocks) plus
    // the promoted child/root blocks this test allocates.
    let device = MemoryBlockDevice::new(40_000, 512);
    let mut fs = Fs::format(device, default_params()).unwrap();
    let mut handle = fs.open(b"big").unwrap();

    let degenerate_capacity = fs.superblock().degenerate_capacity_pages();
    assert_eq!(degenerate_capacity, 16384);

    // Fast-forward the cached EOF to the last page the degenerate tree can
    // hold without promotion; only the two pages actually straddling the
    // boundary are written for real.
    handle.eof_page = degenerate_capacity as u32 - 1;
    handle.eof_byte = 0;

    let last_degenerate_page = degenerate_capacity as u32 - 1;
    let payload = [0xABu8; 512];
    fs.write(&mut handle, last_degenerate_page, &payload, 0).unwrap();
    assert_eq!(handle.eof_page, degenerate_capacity as u32);
    assert_eq!(handle.eof_byte, 0);
    assert!(!handle.promoted);

    let first_promoted_page = degenerate_capacity as u32;
    let payload2 = [0xCDu8; 512];
    fs.write(&mut handle, first_promoted_page, &payload2, 0).unwrap();
    assert!(handle.promoted);
    assert_eq!(handle.eof_page, degenerate_capacity as u32 + 1);

    let mut back1 = [0u8; 512];
    fs.read(&mut handle, last_degenerate_page, &mut back1, 0).unwrap();
    assert_eq!(back1, payload);

    let mut back2 = [0u8; 512];
    fs.read(&mut handle, first_promoted_page, &mut back2, 0).unwrap();
    assert_eq!(back2, payload2);

    fs.close(&mut handle).unwrap();
}

#[test]
fn scenario_e_write_past_eof_rejected() {
    let device = MemoryBlockDevice::new(1000, 512);
    let mut fs = Fs::format(device, default_params()).unwrap();
    let mut handle = fs.open(b"fresh").unwrap();

    let payload = [0u8; 512];
    assert!(matches!(
        fs.write(&mut handle, 5, &payload, 0),
        Err(FsError::WritePastEnd)
    ));

    fs.write(&mut handle, 0, &payload, 0).unwrap();
    fs.write(&mut handle, 1, &payload, 0).unwrap();
    fs.write(&mut handle, 2, &payload, 0).unwrap();
    assert_eq!(handle.eof_page, 3);

    fs.close(&mut handle).unwrap();
}

#[test]
fn scenario_f_remount_preserves_flushed_data() {
    let device = MemoryBlockDevice::new(1000, 512);
    let mut fs = Fs::format(device, default_params()).unwrap();

    let mut handle = fs.open(b"a").unwrap();
    let payload = [0x42u8; 512];
    fs.write(&mut handle, 0, &payload, 0).unwrap();
    fs.close(&mut handle).unwrap();

    let device = fs.into_device();
    let mut remounted = Fs::mount(device).unwrap();
    let mut reopened = remounted.open(b"a").unwrap();
    let mut buf = [0u8; 512];
    remounted.read(&mut reopened, 0, &mut buf, 0).unwrap();
    assert_eq!(buf, payload);
}

#[test]
fn scenario_f_remount_without_flush_loses_eof() {
    let device = MemoryBlockDevice::new(1000, 512);
    let mut fs = Fs::format(device, default_params()).unwrap();

    let mut handle = fs.open(b"b").unwrap();
    let payload = [0x99u8; 512];
    fs.write(&mut handle, 0, &payload, 0).unwrap();
    // deliberately skip fs.close/fs.flush here

    let device = fs.into_device();
    let mut remounted = Fs::mount(device).unwrap();
    let mut reopened = remounted.open(b"b").unwrap();
    let mut buf = [0u8; 512];
    assert!(matches!(
        remounted.read(&mut reopened, 0, &mut buf, 0),
        Err(FsError::Eof)
    ));
}
