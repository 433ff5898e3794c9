//! Handle layer and host-backed disks over image files

mod common;

use common::TempFile;
use gpt_disk_io::BlockIo;
use gpt_disk_types::Lba;
use morpheus_hostdisk::fd::{self, AccessMode, Fd, OpenFlags};
use morpheus_hostdisk::{HostDisk, HostdiskError};

fn patterned(sectors: usize) -> Vec<u8> {
    (0..sectors * 512).map(|i| (i / 512) as u8).collect()
}

#[test]
fn test_open_close_leaves_no_state() {
    let file = TempFile::new("hd-residual", &patterned(32));
    for _ in 0..3 {
        let mut disk = HostDisk::open_path(file.as_str()).unwrap();
        let mut buf = [0u8; 512];
        disk.read_blocks(Lba(7), &mut buf).unwrap();
        assert_eq!(buf[0], 7);
        assert!(disk.data().fd.is_valid());
        disk.close().unwrap();
    }

    let disk = HostDisk::open_path(file.as_str()).unwrap();
    assert!(!disk.data().fd.is_valid());
    assert_eq!(disk.data().access_mode, None);
    assert!(disk.data().dev.is_empty());
}

#[test]
fn test_flush_is_idempotent() {
    let file = TempFile::new("hd-flush", &patterned(8));
    let mut disk = HostDisk::open_path(file.as_str()).unwrap();

    disk.flush().unwrap();
    disk.write_blocks(Lba(3), &[0x5A; 512]).unwrap();
    disk.flush().unwrap();
    disk.flush().unwrap();
    assert_eq!(disk.data().access_mode, Some(AccessMode::WriteOnly));
    disk.close().unwrap();

    let bytes = std::fs::read(file.path()).unwrap();
    assert!(bytes[3 * 512..4 * 512].iter().all(|&b| b == 0x5A));
    assert_eq!(bytes[4 * 512], 4);
}

#[test]
fn test_reads_past_the_end_fail_cleanly() {
    let file = TempFile::new("hd-end", &patterned(4));
    let mut disk = HostDisk::open_path(file.as_str()).unwrap();
    let mut buf = [0u8; 1024];

    let err = disk.read_blocks(Lba(3), &mut buf).unwrap_err();
    assert!(matches!(err, HostdiskError::OutOfRange { .. }));

    // unaligned transfer sizes are refused too
    let err = disk.read_blocks(Lba(0), &mut buf[..100]).unwrap_err();
    assert!(matches!(err, HostdiskError::OutOfRange { .. }));

    disk.read_blocks(Lba(2), &mut buf).unwrap();
    assert_eq!((buf[0], buf[512]), (2, 3));
}

#[test]
fn test_raw_sector_transfers_check_length() {
    let file = TempFile::new("hd-raw", &patterned(8));
    let mut disk = HostDisk::open_path(file.as_str()).unwrap();

    let err = disk.read_sectors(1, &mut [0u8; 100]).unwrap_err();
    assert!(matches!(err, HostdiskError::OutOfRange { .. }));
    let err = disk.write_sectors(1, &[0u8; 700]).unwrap_err();
    assert!(matches!(err, HostdiskError::OutOfRange { .. }));
    let err = disk.read_sectors(7, &mut [0u8; 1024]).unwrap_err();
    assert!(matches!(err, HostdiskError::OutOfRange { .. }));

    let mut buf = [0u8; 1024];
    disk.read_sectors(6, &mut buf).unwrap();
    assert_eq!((buf[0], buf[512]), (6, 7));
    disk.close().unwrap();

    // nothing was written by the refused call
    assert_eq!(std::fs::read(file.path()).unwrap(), patterned(8));
}

#[test]
fn test_open_device_reports_no_limit_on_whole_disk() {
    let file = TempFile::new("hd-open-device", &patterned(16));
    let mut disk = HostDisk::open_path(file.as_str()).unwrap();

    assert_eq!(disk.open_device(4, AccessMode::ReadOnly).unwrap(), None);
    assert_eq!(disk.data().dev, file.as_str());

    let err = disk.open_device(17, AccessMode::ReadOnly).unwrap_err();
    assert!(err.to_string().contains("attempt to seek outside of"));
}

#[test]
fn test_fd_write_then_read() {
    let file = TempFile::new("fd-rw", &[0u8; 2048]);
    let mut handle = Fd::open(file.path(), OpenFlags::RDWR).unwrap();
    assert!(handle.is_valid());
    assert_eq!(handle.get_size("fd-rw").unwrap(), (2048, fd::SECTOR_BITS));

    handle.seek("fd-rw", 1).unwrap();
    assert_eq!(handle.write(b"hostdisk").unwrap(), 8);
    handle.sync().unwrap();
    handle.configure_device_driver();
    handle.close();

    let bytes = std::fs::read(file.path()).unwrap();
    assert_eq!(&bytes[512..520], b"hostdisk");
}

#[test]
fn test_failed_open_gives_no_handle() {
    let result = Fd::open("/nonexistent/hostdisk/sdz", OpenFlags::RDONLY);
    let err = result.unwrap_err();
    let os = err.os_error().unwrap().to_string();
    assert_eq!(fd::strerror(), os);
    assert!(err.to_string().contains("/nonexistent/hostdisk/sdz"));
}
