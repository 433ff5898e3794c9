//! Partition device naming
//!
//! Host OSes name partition nodes after their disk in a handful of ways.
//! These rules cover the ones we meet in practice:
//!
//! | disk                           | partition 3                      |
//! |--------------------------------|----------------------------------|
//! | `/dev/sda`, `/dev/vdb`         | `/dev/sda3`, `/dev/vdb3`         |
//! | `/dev/nvme0n1`, `/dev/mmcblk0` | `/dev/nvme0n1p3`, `/dev/mmcblk0p3` |
//! | `/dev/disk/by-id/ata-X`        | `/dev/disk/by-id/ata-X-part3`    |
//! | `/dev/ide/.../disc` (devfs)    | `/dev/ide/.../part3`             |
//! | `/dev/ada0`, `/dev/disk0` (BSD, macOS) | `/dev/ada0s3`, `/dev/disk0s3` |
//!
//! When the kernel can tell us the parent disk directly (sysfs), that
//! answer wins; see [`get_os_disk`].

use std::path::Path;

use crate::platform::{is_disk_node, HostBackend, Platform};

/// Disk name prefixes whose partitions take a bare number
const BARE_NUMBER_PREFIXES: [&str; 5] = ["sd", "hd", "vd", "xvd", "ubd"];

fn split_trailing_digits(s: &str) -> (&str, &str) {
    let idx = s
        .bytes()
        .rposition(|b| !b.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    s.split_at(idx)
}

/// Node name for partition `number` of whole disk `disk`
pub fn partition_node_name(disk: &str, number: u32) -> String {
    if let Some(prefix) = disk.strip_suffix("/disc") {
        return format!("{}/part{}", prefix, number);
    }
    if disk.contains("/by-id/") || disk.contains("/by-path/") {
        return format!("{}-part{}", disk, number);
    }
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        return format!("{}p{}", disk, number);
    }
    format!("{}{}", disk, number)
}

/// Split a partition node into whole disk and partition number, by name only
pub fn split_partition(dev: &str) -> Option<(String, u32)> {
    if let Some((base, n)) = dev.rsplit_once("/part") {
        if let Ok(n) = n.parse() {
            return Some((format!("{}/disc", base), n));
        }
    }
    if let Some((base, n)) = dev.rsplit_once("-part") {
        if let Ok(n) = n.parse() {
            if !base.is_empty() {
                return Some((base.to_string(), n));
            }
        }
    }

    let (head, digits) = split_trailing_digits(dev);
    let number: u32 = digits.parse().ok().filter(|&n| n > 0)?;

    // nvme0n1p2, mmcblk0p1, ada0p2, disk0s1
    if let Some(disk) = head.strip_suffix('p').or_else(|| head.strip_suffix('s')) {
        if disk.ends_with(|c: char| c.is_ascii_digit()) {
            return Some((disk.to_string(), number));
        }
    }

    // sda1, vdb2, xvda3
    let leaf = head.rsplit('/').next().unwrap_or(head);
    let letters_only = !leaf.is_empty() && leaf.bytes().all(|b| b.is_ascii_lowercase());
    if letters_only && BARE_NUMBER_PREFIXES.iter().any(|p| leaf.starts_with(p)) {
        return Some((head.to_string(), number));
    }

    None
}

/// Whether the naming rules may be applied to `os_dev`.
///
/// Only disk special files follow the OS conventions. An existing regular
/// file such as an image called `sdb1` is always its own disk. A path that
/// cannot be stat'ed leaves the name as the only evidence.
fn names_partition_node(os_dev: &str) -> bool {
    match std::fs::metadata(os_dev) {
        Ok(meta) => is_disk_node(&meta.file_type()),
        Err(_) => true,
    }
}

/// [`split_partition`], restricted to disk special files
pub fn split_partition_node(os_dev: &str) -> Option<(String, u32)> {
    if !names_partition_node(os_dev) {
        return None;
    }
    split_partition(os_dev)
}

/// Whole disk containing `os_dev`; `os_dev` itself if it already is one
pub fn get_os_disk(os_dev: &str) -> String {
    if let Some(disk) = Platform::parent_disk_os(Path::new(os_dev)) {
        return disk;
    }
    match split_partition_node(os_dev) {
        Some((disk, _)) => disk,
        None => os_dev.to_string(),
    }
}

/// Partition number of `os_dev` inside its disk, when the name tells
pub fn partition_number(os_dev: &str) -> Option<u32> {
    split_partition_node(os_dev).map(|(_, n)| n)
}
