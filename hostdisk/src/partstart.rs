//! Partition offset resolution
//!
//! Where does a partition node start inside its raw disk? In order:
//!
//! 1. device-mapper nodes: the linear table walk ([`crate::devmapper`]);
//! 2. the platform fast path (sysfs `start`, `HDIO_GETGEO`);
//! 3. a scan of the parent disk's partition table, when the partition
//!    number can be read off the node name.
//!
//! Results are always 512-byte sectors. `None` means no method could
//! answer, never "starts at sector 0".

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info, warn};

use crate::blockio;
use crate::devmapper::{self, DmTableSource, SystemDmSource};
use crate::disk::HostDisk;
use crate::fd::{Fd, OpenFlags, SECTOR_BITS};
use crate::partmap;
use crate::partname;
use crate::platform::{HostBackend, Platform};

/// Give up probing partition nodes after this many consecutive gaps
const MAX_MISSING_NODES: u32 = 10;
const MAX_PARTITION_NODES: u32 = 10000;

/// Resolved start of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOffset {
    /// 512-byte sectors from the start of the containing device
    pub start: u64,
    /// log2 of the partition node's native sector size
    pub log_secsize: u32,
}

/// Platform fast path only
pub fn find_partition_start_os(dev: &str) -> Option<u64> {
    Platform::find_partition_start_os(Path::new(dev))
}

fn native_log_secsize(dev: &str) -> u32 {
    Fd::open(dev, OpenFlags::RDONLY)
        .and_then(|fd| fd.get_size(dev))
        .map(|(_, log)| log)
        .unwrap_or(SECTOR_BITS)
}

/// Full resolution against the running system
pub fn find_partition_start(dev: &str) -> Option<PartitionOffset> {
    find_partition_start_with(&SystemDmSource, dev)
}

/// Full resolution with an explicit device-mapper source
pub fn find_partition_start_with(dm: &dyn DmTableSource, dev: &str) -> Option<PartitionOffset> {
    let is_dm = dm
        .device_numbers(dev)
        .map(|(maj, min)| dm.is_dm(maj, min))
        .unwrap_or(false);

    if is_dm {
        return match devmapper::get_dm_node_linear_info_with(dm, dev) {
            Ok(linear) => {
                info!(
                    "{} maps to {}:{} at sector {}",
                    dev, linear.major, linear.minor, linear.start
                );
                Some(PartitionOffset {
                    start: linear.start,
                    log_secsize: native_log_secsize(dev),
                })
            }
            Err(e) => {
                debug!("no linear offset for {}: {}", dev, e);
                None
            }
        };
    }

    if let Some(start) = find_partition_start_os(dev) {
        return Some(PartitionOffset {
            start,
            log_secsize: native_log_secsize(dev),
        });
    }

    scan_parent(dev)
}

/// Generic fallback: read the parent disk's table
fn scan_parent(dev: &str) -> Option<PartitionOffset> {
    let (disk, number) = partname::split_partition_node(dev)?;
    let offset = scan_partition_start(&disk, number)?;
    debug!("{} is partition {} of {} at {}", dev, number, disk, offset.start);
    Some(offset)
}

/// Start of partition `number` according to the table on `disk`.
///
/// Entries reaching past the end of the disk are not trusted.
pub fn scan_partition_start(disk: &str, number: u32) -> Option<PartitionOffset> {
    let mut io = HostDisk::open_path(disk).ok()?;
    let log_secsize = io.log_secsize();
    let total = blockio::total_sectors(&mut io).ok()?;

    let map = match partmap::scan(&mut io) {
        Ok(m) => m,
        Err(e) => {
            debug!("cannot scan {}: {}", disk, e);
            return None;
        }
    };
    let part = map.get(number)?;
    if part.end() > total {
        warn!(
            "{} of {} ends at {}, past the disk end {}",
            part.name(),
            disk,
            part.end(),
            total
        );
        return None;
    }
    Some(PartitionOffset {
        start: part.start,
        log_secsize,
    })
}

/// Partition-node lookup with a per-context cache
#[derive(Debug, Default)]
pub struct PartitionFinder {
    cache: HashMap<(String, u64), String>,
}

impl PartitionFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite whole-disk path `dev` to the partition node that starts at
    /// `sector`. Leaves `dev` untouched and returns false when none does.
    pub fn find_partition(&mut self, dev: &mut String, sector: u64) -> bool {
        self.find_partition_by(dev, sector, |node| {
            find_partition_start(node).map(|offset| offset.start)
        })
    }

    /// [`find_partition`](Self::find_partition) with the start of each
    /// candidate node taken from `start_of`
    pub fn find_partition_by<F>(
        &mut self,
        dev: &mut String,
        sector: u64,
        mut start_of: F,
    ) -> bool
    where
        F: FnMut(&str) -> Option<u64>,
    {
        let key = (dev.clone(), sector);
        if let Some(node) = self.cache.get(&key) {
            *dev = node.clone();
            return true;
        }

        let mut missing = 0;
        for number in 1..MAX_PARTITION_NODES {
            let node = partname::partition_node_name(dev, number);
            if !Path::new(&node).exists() {
                missing += 1;
                if missing >= MAX_MISSING_NODES {
                    break;
                }
                continue;
            }
            missing = 0;

            match start_of(&node) {
                Some(start) if start == sector => {
                    debug!("{} at sector {} is {}", dev, sector, node);
                    self.cache.insert(key, node.clone());
                    *dev = node;
                    return true;
                }
                _ => {}
            }
        }
        false
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}
