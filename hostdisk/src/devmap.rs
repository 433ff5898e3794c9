//! Drive names and the device map
//!
//! Translates between OS device paths (`/dev/sda`, `/tmp/disk.img`) and the
//! bootloader's drive names (`hd0`, `hd0,gpt2`). Drives come from two
//! places:
//!
//! - an optional `device.map` file, one `(drive) path` entry per line;
//! - auto-discovery of the host's whole disks, named `hd0`, `hd1`, ... in
//!   enumeration order, skipping indices the file already uses.
//!
//! Auto-discovered names are computed on every query and never written back
//! into the loaded map. Anything else that exists on the host can still be
//! addressed as `hostdisk/<path>`.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::disk::HostDisk;
use crate::embed;
use crate::error::{HostdiskError, Result};
use crate::ldm;
use crate::partmap::{self, Scheme};
use crate::partname;
use crate::partstart::{self, PartitionFinder};
use crate::platform::{HostBackend, Platform};

/// Prefix of drive names that are plain host paths
pub const HOSTDISK_PREFIX: &str = "hostdisk/";

/// Source of whole-disk paths for auto-discovery
pub trait DiskEnumerator {
    /// Whole-disk paths, in the order drive numbers are handed out
    fn disks(&self) -> Vec<String>;
}

/// The running host's disks
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDisks;

impl DiskEnumerator for SystemDisks {
    fn disks(&self) -> Vec<String> {
        Platform::enumerate_disks()
    }
}

impl DiskEnumerator for Vec<String> {
    fn disks(&self) -> Vec<String> {
        self.clone()
    }
}

/// One `(drive) path` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub drive: String,
    pub device: String,
}

fn canonical(path: &str) -> String {
    fs::canonicalize(path)
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| path.to_string())
}

fn hd_index(drive: &str) -> Option<u32> {
    drive.strip_prefix("hd")?.parse().ok()
}

/// Parse `device.map` text. Existence of the devices is not checked here.
pub fn parse_device_map(text: &str, file: &str) -> Result<Vec<MapEntry>> {
    let mut entries: Vec<MapEntry> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let bad = |reason| HostdiskError::DeviceMap {
            file: file.to_string(),
            line,
            reason,
        };

        let s = raw.trim_start();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }

        let s = s.strip_prefix('(').ok_or_else(|| bad("No open parenthesis found"))?;
        let (drive, rest) = s
            .split_once(')')
            .ok_or_else(|| bad("No close parenthesis found"))?;
        let device = rest.trim();
        if device.is_empty() {
            return Err(bad("No filename found"));
        }

        if entries.iter().any(|e| e.drive == drive) {
            return Err(HostdiskError::DuplicateDrive {
                drive: drive.to_string(),
                file: file.to_string(),
            });
        }
        entries.push(MapEntry {
            drive: drive.to_string(),
            device: device.to_string(),
        });
    }
    Ok(entries)
}

/// Loaded mapping context; see the module docs
pub struct DeviceMap {
    entries: Vec<MapEntry>,
    enumerator: Box<dyn DiskEnumerator>,
    finder: Rc<RefCell<PartitionFinder>>,
}

impl DeviceMap {
    /// Load `device_map` (if given) and discover the host's disks
    pub fn init(device_map: Option<&Path>) -> Result<Self> {
        Self::init_with(device_map, Box::new(SystemDisks))
    }

    pub fn init_with(
        device_map: Option<&Path>,
        enumerator: Box<dyn DiskEnumerator>,
    ) -> Result<Self> {
        let entries = match device_map {
            Some(path) => Self::load(path)?,
            None => Vec::new(),
        };
        for entry in &entries {
            embed::flush_initial_buffer(&entry.device);
        }
        Ok(Self {
            entries,
            enumerator,
            finder: Rc::new(RefCell::new(PartitionFinder::new())),
        })
    }

    fn load(path: &Path) -> Result<Vec<MapEntry>> {
        let file = path.display().to_string();
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no device map at {}", file);
                return Ok(Vec::new());
            }
            Err(source) => return Err(HostdiskError::Open { path: file, source }),
        };

        let mut entries = Vec::new();
        for entry in parse_device_map(&text, &file)? {
            if !Path::new(&entry.device).exists() {
                warn!(
                    "cannot stat `{}', skipping drive ({})",
                    entry.device, entry.drive
                );
                continue;
            }
            let device = canonical(&entry.device);
            info!("device map: ({}) -> {}", entry.drive, device);
            entries.push(MapEntry {
                drive: entry.drive,
                device,
            });
        }
        Ok(entries)
    }

    /// Release the context
    pub fn fini(self) {
        debug!("device map released ({} entries)", self.entries.len());
    }

    /// Explicit entries, in file order
    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    /// Auto-discovered drives, recomputed from the enumerator
    pub fn discovered(&self) -> Vec<MapEntry> {
        let used: HashSet<u32> = self.entries.iter().filter_map(|e| hd_index(&e.drive)).collect();
        let mut next = 0;
        let mut out = Vec::new();

        for disk in self.enumerator.disks() {
            let device = canonical(&disk);
            if self.entries.iter().any(|e| e.device == device)
                || out.iter().any(|e: &MapEntry| e.device == device)
            {
                continue;
            }
            while used.contains(&next) {
                next += 1;
            }
            out.push(MapEntry {
                drive: format!("hd{}", next),
                device,
            });
            next += 1;
        }
        out
    }

    /// Drive name of a whole disk
    pub fn os_dev_to_grub_drive(&self, os_disk: &str) -> Option<String> {
        let device = canonical(os_disk);
        if let Some(e) = self.entries.iter().find(|e| e.device == device) {
            return Some(e.drive.clone());
        }
        if let Some(e) = self.discovered().into_iter().find(|e| e.device == device) {
            return Some(e.drive);
        }
        if Path::new(&device).exists() {
            return Some(format!("{}{}", HOSTDISK_PREFIX, device));
        }
        None
    }

    /// OS path behind a whole-drive name
    pub fn drive_to_os_dev(&self, drive: &str) -> Option<String> {
        if let Some(e) = self.entries.iter().find(|e| e.drive == drive) {
            return Some(e.device.clone());
        }
        if let Some(e) = self.discovered().into_iter().find(|e| e.drive == drive) {
            return Some(e.device);
        }
        drive
            .strip_prefix(HOSTDISK_PREFIX)
            .filter(|p| Path::new(p).exists())
            .map(str::to_string)
    }

    /// Drive name for an OS path; partitions get `drive,<scheme><n>`
    pub fn get_grub_dev(&self, os_dev: &str) -> Option<String> {
        let os_dev = canonical(os_dev);
        let os_disk = canonical(&partname::get_os_disk(&os_dev));
        let drive = self.os_dev_to_grub_drive(&os_disk)?;
        if os_disk == os_dev {
            return Some(drive);
        }

        let Some(offset) = partstart::find_partition_start(&os_dev) else {
            debug!("no offset for {}; using whole drive {}", os_dev, drive);
            return Some(drive);
        };
        self.partition_grub_dev(&drive, offset.start)
    }

    /// Name of the partition of `drive` starting at 512-byte sector `start`
    pub fn partition_grub_dev(&self, drive: &str, start: u64) -> Option<String> {
        let mut disk = match self.open_disk(drive) {
            Ok(d) => d,
            Err(e) => {
                debug!("cannot open {}: {}", drive, e);
                return None;
            }
        };

        if ldm::is_ldm(&mut disk) {
            return match ldm::get_ldm(&mut disk, start) {
                Ok(name) => Some(name),
                Err(e) => {
                    debug!("sector {} on LDM disk {}: {}", start, drive, e);
                    None
                }
            };
        }

        let map = partmap::scan(&mut disk).ok()?;
        let part = map.find_by_start(start)?;
        Some(format!("{},{}", drive, part.name()))
    }

    /// OS path of the whole device behind `disk`
    pub fn get_osdev<'d>(&self, disk: &'d HostDisk) -> &'d str {
        disk.os_dev()
    }

    /// Whether a drive name or an absolute OS path refers to something
    /// that exists. Relative names are drive names only.
    pub fn is_present(&self, name: &str) -> bool {
        let drive = name.split(',').next().unwrap_or(name);
        if let Some(path) = self.drive_to_os_dev(drive) {
            return fs::metadata(path).is_ok();
        }
        Path::new(name).is_absolute() && fs::metadata(name).is_ok()
    }

    pub fn is_floppy(&self, disk: &HostDisk) -> bool {
        if disk.name().starts_with("fd") {
            return true;
        }
        disk.rdev().map(Platform::is_floppy_rdev).unwrap_or(false)
    }

    /// Drive name as written in the device map, for disks that came from it
    pub fn get_compatibility_hint(&self, disk: &HostDisk) -> Option<String> {
        if !disk.is_device_map() {
            return None;
        }
        disk.name().split(',').next().map(str::to_string)
    }

    /// Open `hd0`, `hd0,gpt1`, `hd0,msdos5` or `hostdisk/<path>`
    pub fn open_disk(&self, name: &str) -> Result<HostDisk> {
        let (drive, part_name) = match name.split_once(',') {
            Some((d, p)) => (d, Some(p)),
            None => (name, None),
        };
        let os_dev = self
            .drive_to_os_dev(drive)
            .ok_or_else(|| HostdiskError::UnknownDevice(drive.to_string()))?;
        let device_map = self.entries.iter().any(|e| e.drive == drive);

        let mut disk = HostDisk::open_with(
            drive.to_string(),
            &os_dev,
            device_map,
            Rc::clone(&self.finder),
        )?;

        let Some(part_name) = part_name else {
            return Ok(disk);
        };

        let digits_at = part_name
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| HostdiskError::BadPartitionName(name.to_string()))?;
        let (scheme_name, number) = part_name.split_at(digits_at);
        let number: u32 = number
            .parse()
            .map_err(|_| HostdiskError::BadPartitionName(name.to_string()))?;
        let scheme = match scheme_name {
            "" => None,
            s => Some(
                Scheme::from_name(s)
                    .ok_or_else(|| HostdiskError::BadPartitionName(name.to_string()))?,
            ),
        };

        let map = partmap::scan(&mut disk)?;
        let part = map
            .get(number)
            .filter(|p| scheme.map_or(true, |s| p.scheme() == s))
            .copied()
            .ok_or_else(|| HostdiskError::PartitionNotFound(name.to_string()))?;

        let full = format!("{},{}", drive, part.name());
        Ok(disk.with_partition(part, full))
    }

    /// Drop cached partition-node lookups
    pub fn forget_partitions(&self) {
        self.finder.borrow_mut().clear();
    }
}
