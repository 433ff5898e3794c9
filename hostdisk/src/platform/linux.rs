//! Linux backend: block ioctls and sysfs

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::{sector_size_log2, HostBackend};
use crate::error::{HostdiskError, Result};

const fn io(ty: u64, nr: u64) -> u64 {
    (ty << 8) | nr
}

const fn ior(ty: u64, nr: u64, size: usize) -> u64 {
    (2 << 30) | ((size as u64) << 16) | (ty << 8) | nr
}

const BLKFLSBUF: u64 = io(0x12, 97);
const BLKSSZGET: u64 = io(0x12, 104);
const BLKGETSIZE64: u64 = ior(0x12, 114, core::mem::size_of::<usize>());
const HDIO_GETGEO: u64 = 0x0301;

const FLOPPY_MAJOR: u32 = 2;

#[repr(C)]
#[derive(Default)]
struct HdGeometry {
    heads: u8,
    sectors: u8,
    cylinders: u16,
    start: libc::c_ulong,
}

/// Split a Linux `dev_t` into major and minor numbers
pub fn dev_numbers(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major as u32, minor as u32)
}

/// `/sys/dev/block/M:m/<entry>`
pub fn sysfs_dev_path(major: u32, minor: u32, entry: &str) -> PathBuf {
    let mut path = PathBuf::from(format!("/sys/dev/block/{}:{}", major, minor));
    if !entry.is_empty() {
        path.push(entry);
    }
    path
}

/// Read a sysfs attribute holding one decimal number
pub fn read_sysfs_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Device numbers of a block special file
pub fn block_dev_numbers(dev: &Path) -> Option<(u32, u32)> {
    let meta = fs::metadata(dev).ok()?;
    if !meta.file_type().is_block_device() {
        return None;
    }
    Some(dev_numbers(meta.rdev()))
}

fn ioctl_read<T>(file: &File, request: u64, out: &mut T) -> bool {
    // SAFETY: `out` is a live, properly sized buffer for this request.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, out as *mut T) };
    ret == 0
}

fn geometry_start(dev: &Path) -> Option<u64> {
    let file = OpenOptions::new().read(true).open(dev).ok()?;
    let mut geo = HdGeometry::default();
    if !ioctl_read(&file, HDIO_GETGEO, &mut geo) {
        debug!("HDIO_GETGEO failed on {}", dev.display());
        return None;
    }
    Some(geo.start as u64)
}

pub struct Linux;

impl HostBackend for Linux {
    const DISK_DEVS_ARE_CHAR: bool = false;
    const FD_STAT_IS_FUNCTIONAL: bool = true;

    fn fd_size_os(file: &File, name: &str) -> Result<Option<(u64, u32)>> {
        let mut size: u64 = 0;
        if !ioctl_read(file, BLKGETSIZE64, &mut size) {
            return Ok(None);
        }

        let mut sector_size: libc::c_int = 0;
        if !ioctl_read(file, BLKSSZGET, &mut sector_size) {
            sector_size = 512;
        }

        let log_secsize = sector_size_log2(sector_size as u64).ok_or_else(|| {
            HostdiskError::Size {
                name: name.to_string(),
                reason: "sector size is not a power of two",
            }
        })?;
        if size & ((1u64 << log_secsize) - 1) != 0 {
            return Err(HostdiskError::Size {
                name: name.to_string(),
                reason: "device size is not a multiple of the sector size",
            });
        }

        debug!(
            "{}: {} bytes, {}-byte sectors",
            name,
            size,
            1u64 << log_secsize
        );
        Ok(Some((size, log_secsize)))
    }

    fn find_partition_start_os(dev: &Path) -> Option<u64> {
        let (major, minor) = block_dev_numbers(dev)?;
        if let Some(start) = read_sysfs_u64(&sysfs_dev_path(major, minor, "start")) {
            return Some(start);
        }
        // Whole disks have no `start` attribute; the geometry ioctl reports 0.
        geometry_start(dev)
    }

    fn configure_device_driver(_file: &File) {}

    fn flush_buffer_cache(file: &File) {
        let is_block = file
            .metadata()
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);
        if !is_block {
            return;
        }
        // SAFETY: BLKFLSBUF takes no argument.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKFLSBUF as _, 0) };
        if ret != 0 {
            debug!("BLKFLSBUF failed: {}", std::io::Error::last_os_error());
        }
    }

    fn flush_initial_buffer(os_dev: &Path) {
        let meta = match fs::metadata(os_dev) {
            Ok(m) => m,
            Err(_) => return,
        };
        if !meta.file_type().is_block_device() {
            return;
        }
        match OpenOptions::new().read(true).open(os_dev) {
            Ok(file) => Self::flush_buffer_cache(&file),
            Err(e) => warn!("cannot flush {}: {}", os_dev.display(), e),
        }
    }

    fn is_floppy_rdev(rdev: u64) -> bool {
        dev_numbers(rdev).0 == FLOPPY_MAJOR
    }

    fn enumerate_disks() -> Vec<String> {
        let entries = match fs::read_dir("/sys/block") {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            // ram disks are never boot targets
            .filter(|n| !n.starts_with("ram"))
            .collect();
        names.sort();

        names
            .into_iter()
            .map(|n| format!("/dev/{}", n.replace('!', "/")))
            .filter(|p| Path::new(p).exists())
            .collect()
    }

    fn parent_disk_os(dev: &Path) -> Option<String> {
        let (major, minor) = block_dev_numbers(dev)?;
        let sys = sysfs_dev_path(major, minor, "");
        // Partitions carry a `partition` attribute; their parent dir is the disk.
        if !sys.join("partition").exists() {
            return None;
        }
        let resolved = fs::canonicalize(&sys).ok()?;
        let parent = resolved.parent()?.file_name()?.to_string_lossy().into_owned();
        Some(format!("/dev/{}", parent.replace('!', "/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers() {
        assert_eq!(BLKFLSBUF, 0x1261);
        assert_eq!(BLKSSZGET, 0x1268);
        if core::mem::size_of::<usize>() == 8 {
            assert_eq!(BLKGETSIZE64, 0x8008_1272);
        }
    }

    #[test]
    fn test_dev_numbers() {
        // 8:1 (sda1) old-style encoding
        assert_eq!(dev_numbers(0x0801), (8, 1));
        // 259:3 (nvme partition)
        let rdev = (259u64 << 8 & 0xfff00) | 3;
        assert_eq!(dev_numbers(rdev), (259, 3));
        // minor above 255
        let rdev = (8u64 << 8) | (0x12 << 12 << 8) | 0x34;
        assert_eq!(dev_numbers(rdev).1, 0x1234);
    }

    #[test]
    fn test_sysfs_path() {
        assert_eq!(
            sysfs_dev_path(8, 2, "start"),
            PathBuf::from("/sys/dev/block/8:2/start")
        );
    }

    #[test]
    fn test_regular_file_has_no_partition_start() {
        assert_eq!(Linux::find_partition_start_os(Path::new("Cargo.toml")), None);
        assert!(Linux::parent_disk_os(Path::new("Cargo.toml")).is_none());
    }

    #[test]
    fn test_floppy_major() {
        assert!(Linux::is_floppy_rdev(0x0200));
        assert!(!Linux::is_floppy_rdev(0x0800));
    }
}
