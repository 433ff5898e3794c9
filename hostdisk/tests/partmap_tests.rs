//! Partition table scanning over in-memory disks

mod common;

use common::builder::write_ebr;
use common::{gpt_disk, msdos_disk, MemoryBlockDevice};
use morpheus_hostdisk::partmap::{self, PartKind, Scheme, GPT_BIOS_BOOT, GPT_LDM_DATA};

#[test]
fn test_msdos_primaries_keep_slot_numbers() {
    let mut dev = msdos_disk(8192, &[(0, 0x83, 2048, 1024), (2, 0x07, 4096, 2048)]);
    let map = partmap::scan(&mut dev).unwrap();

    assert_eq!(map.scheme, Some(Scheme::Msdos));
    assert_eq!(map.len(), 2);
    let p3 = map.get(3).unwrap();
    assert_eq!(p3.kind, PartKind::Msdos(0x07));
    assert_eq!((p3.start, p3.len), (4096, 2048));
    assert_eq!(p3.name(), "msdos3");
    assert!(map.get(2).is_none());
    assert_eq!(map.first_start(), Some(2048));
}

#[test]
fn test_logical_chain() {
    let mut dev = msdos_disk(16384, &[(0, 0x83, 2048, 1024), (1, 0x05, 8192, 8192)]);
    write_ebr(&mut dev, 8192, (0x83, 63, 1000), Some(2048));
    write_ebr(&mut dev, 8192 + 2048, (0x82, 63, 500), None);

    let map = partmap::scan(&mut dev).unwrap();
    assert_eq!(map.extended, Some(8192));
    assert_eq!(map.len(), 3);

    let l5 = map.get(5).unwrap();
    assert_eq!(l5.start, 8192 + 63);
    let l6 = map.get(6).unwrap();
    assert_eq!(l6.start, 8192 + 2048 + 63);
    assert_eq!(l6.kind, PartKind::Msdos(0x82));
    assert_eq!(map.find_by_start(8192 + 2048 + 63).unwrap().number, 6);
}

#[test]
fn test_gpt_entries_numbered_by_index() {
    let mut dev = gpt_disk(
        8192,
        &[(GPT_BIOS_BOOT, 34, 2047), (GPT_LDM_DATA, 2048, 6143)],
    );
    let map = partmap::scan(&mut dev).unwrap();

    assert_eq!(map.scheme, Some(Scheme::Gpt));
    assert_eq!(map.len(), 2);
    let bios = map.find_kind(PartKind::Gpt(GPT_BIOS_BOOT)).unwrap();
    assert_eq!((bios.number, bios.start, bios.len), (1, 34, 2014));
    let data = map.get(2).unwrap();
    assert_eq!(data.name(), "gpt2");
    assert_eq!(data.end(), 6144);
    assert_eq!(map.extended, None);
}

#[test]
fn test_native_block_entries_on_4k_devices() {
    // entries count 4096-byte blocks: 256 blocks is sector 2048
    let dev = msdos_disk(8192, &[(0, 0x83, 256, 128), (1, 0x05, 512, 256)]);
    let mut dev = dev.with_block_size(4096);
    // EBR at block 512, its logical at +8 blocks, next EBR at ext+64 blocks
    write_ebr(&mut dev, 512 * 8, (0x83, 8, 16), Some(64));
    write_ebr(&mut dev, (512 + 64) * 8, (0x07, 8, 32), None);

    let map = partmap::scan(&mut dev).unwrap();
    let p1 = map.get(1).unwrap();
    assert_eq!((p1.start, p1.len), (2048, 1024));
    assert_eq!(map.extended, Some(4096));
    assert_eq!(map.first_start(), Some(2048));

    let l5 = map.get(5).unwrap();
    assert_eq!((l5.start, l5.len), ((512 + 8) * 8, 16 * 8));
    let l6 = map.get(6).unwrap();
    assert_eq!((l6.start, l6.len), ((512 + 64 + 8) * 8, 32 * 8));
    assert!(map.iter().all(|p| p.end() <= 8192));
}

#[test]
fn test_blank_disk_has_no_scheme() {
    let mut dev = MemoryBlockDevice::new(64);
    let map = partmap::scan(&mut dev).unwrap();
    assert_eq!(map.scheme, None);
    assert!(map.is_empty());
    assert_eq!(map.first_start(), None);
}

#[test]
fn test_protective_mbr_without_gpt() {
    let mut dev = msdos_disk(64, &[(0, 0xEE, 1, 63)]);
    let map = partmap::scan(&mut dev).unwrap();
    assert_eq!(map.scheme, None);
}
