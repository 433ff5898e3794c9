//! Device-mapper linear target resolution
//!
//! Follows a stack of dm nodes down to the first real device, summing the
//! offsets of each `linear` target on the way. Anything that is not a
//! single whole-device linear mapping stops the walk with an error; we
//! never guess an offset for striped, mirrored or multi-segment tables.
//!
//! LVM logical volumes, multipath maps and DMRAID sets are bootloader
//! devices in their own right. At the top of the walk they are rejected;
//! further down the walk simply stops at them.

use thiserror::Error;

use log::debug;

/// dm UUID prefixes of volumes the bootloader addresses directly
const OPAQUE_UUID_PREFIXES: [&str; 3] = ["LVM-", "mpath-", "DMRAID-"];

/// Upper bound on stacked dm layers
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum DmError {
    #[error("`{0}' is not a device-mapper node")]
    NotMapped(String),

    #[error("cannot read device-mapper table of {node}: {reason}")]
    Table { node: String, reason: String },

    #[error("device-mapper node {node} has {count} segments")]
    MultipleSegments { node: String, count: usize },

    #[error("device-mapper node {node} uses target `{target}', not linear")]
    NotLinear { node: String, target: String },

    #[error("linear target of {node} does not cover the whole device")]
    Partial { node: String },

    #[error("malformed device-mapper table line for {node}: `{line}'")]
    Malformed { node: String, line: String },

    #[error("{node} is a {kind} volume")]
    Opaque { node: String, kind: &'static str },

    #[error("device-mapper stack under {0} is too deep")]
    TooDeep(String),
}

/// Underlying device and offset of a linear dm node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmLinearInfo {
    pub major: u32,
    pub minor: u32,
    /// Offset into the underlying device, 512-byte sectors
    pub start: u64,
}

/// Where dm metadata comes from
pub trait DmTableSource {
    /// Device numbers of a block device path
    fn device_numbers(&self, dev: &str) -> Option<(u32, u32)>;

    fn is_dm(&self, major: u32, minor: u32) -> bool;

    /// dm UUID, `None` when unset
    fn uuid(&self, major: u32, minor: u32) -> Option<String>;

    /// Device size in 512-byte sectors, when known
    fn size(&self, major: u32, minor: u32) -> Option<u64>;

    /// Table text as printed by `dmsetup table`
    fn table(&self, major: u32, minor: u32) -> Result<String, DmError>;
}

fn node_name(major: u32, minor: u32) -> String {
    format!("{}:{}", major, minor)
}

fn opaque_kind(uuid: &str) -> Option<&'static str> {
    OPAQUE_UUID_PREFIXES
        .iter()
        .find(|p| uuid.starts_with(*p))
        .map(|p| match *p {
            "LVM-" => "LVM",
            "mpath-" => "multipath",
            _ => "DMRAID",
        })
}

/// Parse `start length linear maj:min offset` out of a one-segment table
fn parse_linear(node: &str, table: &str, size: Option<u64>) -> Result<(u32, u32, u64), DmError> {
    let lines: Vec<&str> = table.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() != 1 {
        return Err(DmError::MultipleSegments {
            node: node.to_string(),
            count: lines.len(),
        });
    }

    let line = lines[0];
    let malformed = || DmError::Malformed {
        node: node.to_string(),
        line: line.to_string(),
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(malformed());
    }

    let target = fields[2];
    if target != "linear" {
        return Err(DmError::NotLinear {
            node: node.to_string(),
            target: target.to_string(),
        });
    }
    if fields.len() != 5 {
        return Err(malformed());
    }

    let seg_start: u64 = fields[0].parse().map_err(|_| malformed())?;
    let seg_len: u64 = fields[1].parse().map_err(|_| malformed())?;
    if seg_start != 0 || size.map(|s| s != seg_len).unwrap_or(false) {
        return Err(DmError::Partial {
            node: node.to_string(),
        });
    }

    let (maj, min) = fields[3].split_once(':').ok_or_else(malformed)?;
    let maj = maj.parse().map_err(|_| malformed())?;
    let min = min.parse().map_err(|_| malformed())?;
    let offset = fields[4].parse().map_err(|_| malformed())?;
    Ok((maj, min, offset))
}

/// Resolve a dm node through `source`
pub fn get_dm_node_linear_info_with(
    source: &dyn DmTableSource,
    dev: &str,
) -> Result<DmLinearInfo, DmError> {
    let (mut major, mut minor) = source
        .device_numbers(dev)
        .ok_or_else(|| DmError::NotMapped(dev.to_string()))?;
    if !source.is_dm(major, minor) {
        return Err(DmError::NotMapped(dev.to_string()));
    }

    let mut start = 0u64;
    for depth in 0..MAX_DEPTH {
        if depth > 0 && !source.is_dm(major, minor) {
            break;
        }

        let node = node_name(major, minor);
        if let Some(kind) = source.uuid(major, minor).as_deref().and_then(opaque_kind) {
            if depth == 0 {
                return Err(DmError::Opaque { node, kind });
            }
            debug!("stopping dm walk at {} volume {}", kind, node);
            return Ok(DmLinearInfo {
                major,
                minor,
                start,
            });
        }

        let table = source.table(major, minor)?;
        let (next_major, next_minor, offset) =
            parse_linear(&node, &table, source.size(major, minor))?;
        debug!("{} -> {}:{} + {}", node, next_major, next_minor, offset);

        start += offset;
        major = next_major;
        minor = next_minor;

        if depth + 1 == MAX_DEPTH {
            return Err(DmError::TooDeep(dev.to_string()));
        }
    }

    Ok(DmLinearInfo {
        major,
        minor,
        start,
    })
}

/// Resolve a dm node using the running system's sysfs and `dmsetup`
pub fn get_dm_node_linear_info(dev: &str) -> Result<DmLinearInfo, DmError> {
    get_dm_node_linear_info_with(&SystemDmSource, dev)
}

/// Whether `dev` is a device-mapper node on this system
pub fn device_is_mapped(dev: &str) -> bool {
    let source = SystemDmSource;
    source
        .device_numbers(dev)
        .map(|(maj, min)| source.is_dm(maj, min))
        .unwrap_or(false)
}

/// dm metadata of the running system
pub struct SystemDmSource;

#[cfg(target_os = "linux")]
impl DmTableSource for SystemDmSource {
    fn device_numbers(&self, dev: &str) -> Option<(u32, u32)> {
        crate::platform::linux::block_dev_numbers(std::path::Path::new(dev))
    }

    fn is_dm(&self, major: u32, minor: u32) -> bool {
        crate::platform::linux::sysfs_dev_path(major, minor, "dm").is_dir()
    }

    fn uuid(&self, major: u32, minor: u32) -> Option<String> {
        let path = crate::platform::linux::sysfs_dev_path(major, minor, "dm/uuid");
        let uuid = std::fs::read_to_string(path).ok()?;
        let uuid = uuid.trim();
        (!uuid.is_empty()).then(|| uuid.to_string())
    }

    fn size(&self, major: u32, minor: u32) -> Option<u64> {
        crate::platform::linux::read_sysfs_u64(&crate::platform::linux::sysfs_dev_path(
            major, minor, "size",
        ))
    }

    fn table(&self, major: u32, minor: u32) -> Result<String, DmError> {
        let node = node_name(major, minor);
        let output = std::process::Command::new("dmsetup")
            .args(["table", "-j", &major.to_string(), "-m", &minor.to_string()])
            .output()
            .map_err(|e| DmError::Table {
                node: node.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(DmError::Table {
                node,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(not(target_os = "linux"))]
impl DmTableSource for SystemDmSource {
    fn device_numbers(&self, _dev: &str) -> Option<(u32, u32)> {
        None
    }

    fn is_dm(&self, _major: u32, _minor: u32) -> bool {
        false
    }

    fn uuid(&self, _major: u32, _minor: u32) -> Option<String> {
        None
    }

    fn size(&self, _major: u32, _minor: u32) -> Option<u64> {
        None
    }

    fn table(&self, major: u32, minor: u32) -> Result<String, DmError> {
        Err(DmError::NotMapped(node_name(major, minor)))
    }
}
