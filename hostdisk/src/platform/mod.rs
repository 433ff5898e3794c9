//! Platform backends
//!
//! Everything that differs between host operating systems lives behind
//! `HostBackend`: how a device reports its size, where partition offsets
//! come from, whether disk nodes are block or character specials. The rest
//! of the crate only talks to `Platform`, which is picked at build time.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   fd / devmap / partstart / disk / embed     │
//! └──────────────────────┬───────────────────────┘
//!                        │ HostBackend (Platform)
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//! ┌─────────────────┐        ┌────────────────────┐
//! │  linux (ioctl,  │        │ unix (BSD / macOS, │
//! │  sysfs)         │        │ char devices)      │
//! └─────────────────┘        └────────────────────┘
//! ```

use std::fs::File;
use std::path::Path;

use crate::error::Result;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(not(target_os = "linux"))]
pub mod unix;

#[cfg(target_os = "linux")]
pub type Platform = linux::Linux;
#[cfg(not(target_os = "linux"))]
pub type Platform = unix::GenericUnix;

/// Capability-tagged host backend
pub trait HostBackend {
    /// Disk nodes are character specials (BSD family, macOS, Solaris)
    const DISK_DEVS_ARE_CHAR: bool;

    /// `fstat` on a device node gives a usable file type
    const FD_STAT_IS_FUNCTIONAL: bool;

    /// Size in bytes and log2 of the native sector size of an open device.
    ///
    /// `Ok(None)` means the platform cannot query this node; the caller
    /// falls back to `st_size` with 512-byte sectors.
    fn fd_size_os(file: &File, name: &str) -> Result<Option<(u64, u32)>>;

    /// Partition start in 512-byte sectors, `None` when no platform
    /// mechanism gives a definite answer.
    fn find_partition_start_os(dev: &Path) -> Option<u64>;

    /// Post-open driver adjustment (retry suppression on floppies)
    fn configure_device_driver(file: &File);

    /// Drop the kernel buffer cache of a block device we hold open
    fn flush_buffer_cache(file: &File);

    /// Drop the buffer cache of a device before anything opens it
    fn flush_initial_buffer(os_dev: &Path);

    /// Whether the device number belongs to the floppy driver
    fn is_floppy_rdev(rdev: u64) -> bool;

    /// Whole-disk device paths in OS enumeration order
    fn enumerate_disks() -> Vec<String>;

    /// Whole-disk path for a partition node, if the OS can tell directly
    fn parent_disk_os(dev: &Path) -> Option<String>;
}

/// True when `file_type` is the kind of special file disks show up as
pub fn is_disk_node(file_type: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;

    if Platform::DISK_DEVS_ARE_CHAR {
        file_type.is_char_device()
    } else {
        file_type.is_block_device()
    }
}

/// log2 of a sector size, `None` unless it is a non-zero power of two
pub fn sector_size_log2(sector_size: u64) -> Option<u32> {
    if sector_size == 0 || sector_size & (sector_size - 1) != 0 {
        return None;
    }
    Some(sector_size.trailing_zeros())
}
