//! Generic Unix backend (BSD family, macOS, illumos)
//!
//! Disk nodes are character specials here. Size queries use the native
//! disk ioctls where we know them; partition offsets have no portable
//! query, so the resolver falls back to scanning the parent disk.

use std::fs::{self, File};
use std::path::Path;

use log::debug;

use super::{sector_size_log2, HostBackend};
use crate::error::{HostdiskError, Result};

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
mod ioctls {
    // _IOR('d', 129, off_t) / _IOR('d', 128, u_int)
    pub const MEDIA_SIZE: u64 = 0x4008_6481;
    pub const SECTOR_SIZE: u64 = 0x4004_6480;
    pub const DISK_PREFIXES: &[&str] = &["ada", "da", "nvd", "vtbd", "mmcsd", "md", "fd"];
}

#[cfg(target_os = "macos")]
mod ioctls {
    // DKIOCGETBLOCKCOUNT / DKIOCGETBLOCKSIZE
    pub const BLOCK_COUNT: u64 = 0x4008_6419;
    pub const SECTOR_SIZE: u64 = 0x4004_6418;
    pub const DISK_PREFIXES: &[&str] = &["rdisk"];
}

#[cfg(not(any(target_os = "freebsd", target_os = "dragonfly", target_os = "macos")))]
mod ioctls {
    pub const DISK_PREFIXES: &[&str] = &["rwd", "rsd", "rld", "rfd"];
}

#[allow(dead_code)]
fn ioctl_read<T>(file: &File, request: u64, out: &mut T) -> bool {
    use std::os::unix::io::AsRawFd;
    // SAFETY: `out` is a live, properly sized buffer for this request.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, out as *mut T) };
    ret == 0
}

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
fn query_size(file: &File) -> Option<(u64, u64)> {
    let mut size: libc::off_t = 0;
    let mut sector: libc::c_uint = 0;
    if !ioctl_read(file, ioctls::MEDIA_SIZE, &mut size)
        || !ioctl_read(file, ioctls::SECTOR_SIZE, &mut sector)
    {
        return None;
    }
    Some((size as u64, sector as u64))
}

#[cfg(target_os = "macos")]
fn query_size(file: &File) -> Option<(u64, u64)> {
    let mut count: u64 = 0;
    let mut sector: u32 = 0;
    if !ioctl_read(file, ioctls::BLOCK_COUNT, &mut count)
        || !ioctl_read(file, ioctls::SECTOR_SIZE, &mut sector)
    {
        return None;
    }
    Some((count * sector as u64, sector as u64))
}

#[cfg(not(any(target_os = "freebsd", target_os = "dragonfly", target_os = "macos")))]
fn query_size(_file: &File) -> Option<(u64, u64)> {
    None
}

/// Does `name` look like `<prefix><digits>` for a known whole-disk prefix
fn is_whole_disk_name(name: &str) -> bool {
    ioctls::DISK_PREFIXES.iter().any(|prefix| {
        name.strip_prefix(prefix)
            .map(|rest| {
                // NetBSD/OpenBSD raw whole-disk nodes end in the `d`/`c` slice
                let rest = rest.trim_end_matches(['c', 'd']);
                !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
            })
            .unwrap_or(false)
    })
}

pub struct GenericUnix;

impl HostBackend for GenericUnix {
    const DISK_DEVS_ARE_CHAR: bool = true;
    const FD_STAT_IS_FUNCTIONAL: bool = true;

    fn fd_size_os(file: &File, name: &str) -> Result<Option<(u64, u32)>> {
        let Some((size, sector_size)) = query_size(file) else {
            return Ok(None);
        };
        let log_secsize = sector_size_log2(sector_size).ok_or_else(|| HostdiskError::Size {
            name: name.to_string(),
            reason: "sector size is not a power of two",
        })?;
        if size & ((1u64 << log_secsize) - 1) != 0 {
            return Err(HostdiskError::Size {
                name: name.to_string(),
                reason: "device size is not a multiple of the sector size",
            });
        }
        debug!("{}: {} bytes, {}-byte sectors", name, size, sector_size);
        Ok(Some((size, log_secsize)))
    }

    fn find_partition_start_os(_dev: &Path) -> Option<u64> {
        None
    }

    fn configure_device_driver(_file: &File) {}

    fn flush_buffer_cache(_file: &File) {}

    fn flush_initial_buffer(_os_dev: &Path) {}

    fn is_floppy_rdev(_rdev: u64) -> bool {
        false
    }

    fn enumerate_disks() -> Vec<String> {
        let entries = match fs::read_dir("/dev") {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| is_whole_disk_name(n))
            .collect();
        names.sort();
        names.into_iter().map(|n| format!("/dev/{}", n)).collect()
    }

    fn parent_disk_os(_dev: &Path) -> Option<String> {
        None
    }
}
