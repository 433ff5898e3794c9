//! Logical Disk Manager (Windows dynamic disk) metadata
//!
//! An LDM disk carries a `PRIVHEAD` label and a VBLK database describing
//! disks, volumes, components and partitions. We only read it, to answer
//! three questions: is this disk LDM-managed, which volume owns the
//! partition starting at a given sector, and where can boot code go.
//!
//! Label locations:
//!
//! ```text
//! MSDOS disk with a type 0x42 partition:  sector 6, then the last sector
//! GPT disk:                               last sector of the LDM metadata
//!                                         partition
//! ```
//!
//! All label fields are big-endian. VBLKs are 128 bytes, four per sector,
//! starting 0x12 sectors into the config area. Inside a VBLK most fields
//! are variable length: a length byte followed by that many bytes.

use core::fmt;

use gpt_disk_io::BlockIo;
use log::{debug, info};
use thiserror::Error;
use uguid::Guid;

use crate::blockio::{read_bytes, read_sector, total_sectors};
use crate::embed::EmbedType;
use crate::partmap::{self, PartKind, GPT_LDM_METADATA, MSDOS_LDM};

pub const LDM_LABEL_MAGIC: &[u8; 8] = b"PRIVHEAD";
const LDM_VBLK_MAGIC: &[u8; 4] = b"VBLK";
const LDM_LABEL_SECTOR: u64 = 6;

/// First VBLK sector inside the config area
const VBLK_AREA_OFFSET: u64 = 0x12;
const VBLK_SIZE: usize = 128;
const VBLK_DYNAMIC: usize = 0x18;
/// Refuse config areas larger than this many sectors
const MAX_CONFIG_SECTORS: u64 = 0x10000;

const STATUS_CONSISTENT: u16 = 0;
const STATUS_STILL_ACTIVE: u16 = 1;

const ENTRY_COMPONENT: u8 = 0x32;
const ENTRY_PARTITION: u8 = 0x33;
const ENTRY_DISK: u8 = 0x34;
const ENTRY_VOLUME: u8 = 0x51;

const COMPONENT_STRIPE: u8 = 1;
const COMPONENT_SPANNED: u8 = 2;
const COMPONENT_RAID5: u8 = 3;

/// Component flag: stripe size and column count follow
const FLAG_STRIPED: u8 = 0x10;
/// Partition flag: column index follows
const FLAG_INDEXED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum LdmError {
    #[error("cannot read LDM metadata: {0}")]
    Io(String),

    #[error("disk is not LDM-managed")]
    NotLdm,

    #[error("unsupported LDM version {major}.{minor}")]
    BadVersion { major: u16, minor: u16 },

    #[error("LDM config area at sector {start} (+{size}) lies outside the disk")]
    ConfigOutOfRange { start: u64, size: u64 },

    #[error("malformed LDM {record} record in sector {sector}: {reason}")]
    BadRecord {
        record: &'static str,
        sector: u64,
        reason: &'static str,
    },

    #[error("no LDM volume starts at sector {0}")]
    NoVolumeAt(u64),

    #[error("LDM currently supports only PC-BIOS embedding")]
    UnsupportedEmbed,

    #[error("your LDM Embedding Partition is too small; embedding won't be possible")]
    EmbedTooSmall,

    #[error("this LDM has no Embedding Partition; embedding won't be possible")]
    NoEmbedding,
}

fn io_err<E: fmt::Display>(e: E) -> LdmError {
    LdmError::Io(e.to_string())
}

fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

fn be64(b: &[u8], off: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[off..off + 8]);
    u64::from_be_bytes(v)
}

fn cstr(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

/// The `PRIVHEAD` label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdmLabel {
    pub ver_major: u16,
    pub ver_minor: u16,
    pub disk_guid: String,
    pub host_guid: String,
    pub group_guid: String,
    pub group_name: String,
    /// Data area start, 512-byte sectors
    pub pv_start: u64,
    pub pv_size: u64,
    pub config_start: u64,
    pub config_size: u64,
}

impl LdmLabel {
    pub fn parse(sector: &[u8; 512]) -> Option<Self> {
        if &sector[..8] != LDM_LABEL_MAGIC {
            return None;
        }
        Some(Self {
            ver_major: be16(sector, 0x0C),
            ver_minor: be16(sector, 0x0E),
            disk_guid: cstr(&sector[0x30..0x70]),
            host_guid: cstr(&sector[0x70..0xB0]),
            group_guid: cstr(&sector[0xB0..0xF0]),
            group_name: cstr(&sector[0xF0..0x110]),
            pv_start: be64(sector, 0x11B),
            pv_size: be64(sector, 0x123),
            config_start: be64(sector, 0x12B),
            config_size: be64(sector, 0x133),
        })
    }

    pub fn version_supported(&self) -> bool {
        self.ver_major == 2 && (11..=12).contains(&self.ver_minor)
    }

    pub fn group(&self) -> Option<Guid> {
        self.group_guid.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdmDisk {
    pub id: Vec<u8>,
    pub name: String,
    /// ASCII GUID (older databases) or 16 raw bytes
    pub guid: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdmVolume {
    pub id: Vec<u8>,
    pub name: String,
    /// `ldm/<group guid>/<name>`
    pub fullname: String,
    /// Size in 512-byte sectors
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentLayout {
    Striped { stripe_size: u64, columns: u64 },
    Spanned,
    Raid5 { stripe_size: u64, columns: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdmComponent {
    pub id: Vec<u8>,
    pub name: String,
    pub layout: ComponentLayout,
    pub volume_id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdmPartition {
    pub id: Vec<u8>,
    pub name: String,
    /// Start inside the data area, 512-byte sectors
    pub start: u64,
    pub volume_offset: u64,
    pub size: u64,
    pub component_id: Vec<u8>,
    pub disk_id: Vec<u8>,
    pub index: Option<u64>,
}

/// Parsed LDM database of one disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdmDescriptor {
    pub label: LdmLabel,
    pub disks: Vec<LdmDisk>,
    pub volumes: Vec<LdmVolume>,
    pub components: Vec<LdmComponent>,
    pub partitions: Vec<LdmPartition>,
}

/// A volume made of exactly one extent on this disk
#[derive(Debug, Clone, Copy)]
pub struct SimpleVolume<'a> {
    pub volume: &'a LdmVolume,
    pub component: &'a LdmComponent,
    pub partition: &'a LdmPartition,
}

impl SimpleVolume<'_> {
    /// Absolute start on the disk, 512-byte sectors
    pub fn disk_start(&self, label: &LdmLabel) -> u64 {
        label.pv_start + self.partition.start
    }
}

fn guid_text(raw: &[u8]) -> Option<Guid> {
    if raw.len() == 16 {
        let h = |r: &[u8]| r.iter().map(|b| format!("{:02x}", b)).collect::<String>();
        let text = format!(
            "{}-{}-{}-{}-{}",
            h(&raw[0..4]),
            h(&raw[4..6]),
            h(&raw[6..8]),
            h(&raw[8..10]),
            h(&raw[10..16])
        );
        return text.parse().ok();
    }
    core::str::from_utf8(raw).ok()?.trim_end_matches('\0').parse().ok()
}

impl LdmDescriptor {
    /// The disk record describing the disk the label was read from
    pub fn this_disk(&self) -> Option<&LdmDisk> {
        let want: Guid = self.label.disk_guid.parse().ok()?;
        self.disks
            .iter()
            .find(|d| guid_text(&d.guid) == Some(want))
    }

    fn components_of<'a>(
        &'a self,
        volume: &'a LdmVolume,
    ) -> impl Iterator<Item = &'a LdmComponent> {
        self.components.iter().filter(move |c| c.volume_id == volume.id)
    }

    fn partitions_of<'a>(
        &'a self,
        component: &'a LdmComponent,
    ) -> impl Iterator<Item = &'a LdmPartition> {
        self.partitions
            .iter()
            .filter(move |p| p.component_id == component.id)
    }

    /// Volumes backed by a single full-size extent on this disk
    pub fn simple_volumes(&self) -> Vec<SimpleVolume<'_>> {
        let Some(disk) = self.this_disk() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for volume in &self.volumes {
            let comps: Vec<_> = self.components_of(volume).collect();
            let [component] = comps[..] else {
                continue;
            };
            let single = match component.layout {
                ComponentLayout::Spanned => true,
                ComponentLayout::Striped { columns, .. } => columns == 1,
                ComponentLayout::Raid5 { .. } => false,
            };
            if !single {
                continue;
            }
            let parts: Vec<_> = self.partitions_of(component).collect();
            let [partition] = parts[..] else {
                continue;
            };
            if partition.disk_id != disk.id
                || partition.volume_offset != 0
                || partition.size != volume.size
            {
                continue;
            }
            out.push(SimpleVolume {
                volume,
                component,
                partition,
            });
        }
        out
    }
}

impl LdmDescriptor {
    /// Unallocated runs `(start, len)` of the data area, absolute sectors.
    ///
    /// Anything not provably free is left out: the config area, and every
    /// partition extent on this disk. Without a disk record for this disk
    /// there is nothing to offer.
    pub fn free_ranges(&self, total_sectors: u64) -> Vec<(u64, u64)> {
        let Some(disk) = self.this_disk() else {
            return Vec::new();
        };
        let label = &self.label;
        let area_start = label.pv_start;
        let area_end = label.pv_start.saturating_add(label.pv_size).min(total_sectors);

        let mut used: Vec<(u64, u64)> = self
            .partitions
            .iter()
            .filter(|p| p.disk_id == disk.id)
            .map(|p| {
                let start = label.pv_start.saturating_add(p.start);
                (start, start.saturating_add(p.size))
            })
            .collect();
        used.push((
            label.config_start,
            label.config_start.saturating_add(label.config_size),
        ));
        used.sort_unstable();

        let mut free = Vec::new();
        let mut cursor = area_start;
        for (start, end) in used {
            if start > cursor && cursor < area_end {
                let stop = start.min(area_end);
                free.push((cursor, stop - cursor));
            }
            cursor = cursor.max(end);
        }
        if cursor < area_end {
            free.push((cursor, area_end - cursor));
        }
        free
    }
}

/// Variable-length field reader over one VBLK's dynamic area
struct VblkCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    record: &'static str,
    sector: u64,
}

impl<'a> VblkCursor<'a> {
    fn new(buf: &'a [u8], record: &'static str, sector: u64) -> Self {
        Self {
            buf,
            pos: 0,
            record,
            sector,
        }
    }

    fn bad(&self, reason: &'static str) -> LdmError {
        LdmError::BadRecord {
            record: self.record,
            sector: self.sector,
            reason,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LdmError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| self.bad("field runs past the end of the record"))?;
        let buf: &'a [u8] = self.buf;
        let out = &buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), LdmError> {
        self.take(n).map(|_| ())
    }

    fn byte(&mut self) -> Result<u8, LdmError> {
        Ok(self.take(1)?[0])
    }

    fn var(&mut self) -> Result<&'a [u8], LdmError> {
        let len = self.byte()? as usize;
        self.take(len)
    }

    fn var_int(&mut self) -> Result<u64, LdmError> {
        let raw = self.var()?;
        if raw.len() > 8 {
            return Err(self.bad("integer field wider than 64 bits"));
        }
        Ok(raw.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }

    fn var_str(&mut self) -> Result<String, LdmError> {
        Ok(String::from_utf8_lossy(self.var()?).into_owned())
    }

    fn be_u64(&mut self) -> Result<u64, LdmError> {
        Ok(be64(self.take(8)?, 0))
    }
}

fn parse_disk(c: &mut VblkCursor<'_>) -> Result<LdmDisk, LdmError> {
    let id = c.var()?.to_vec();
    let name = c.var_str()?;
    let guid = c.var()?.to_vec();
    Ok(LdmDisk { id, name, guid })
}

fn parse_volume(c: &mut VblkCursor<'_>, group_guid: &str) -> Result<LdmVolume, LdmError> {
    let id = c.var()?.to_vec();
    let name = c.var_str()?;
    c.var()?; // volume type
    c.var()?; // flags
    // state, type, unknown, volume number, zeros, flags
    c.skip(14 + 1 + 1 + 1 + 3 + 1)?;
    c.var()?; // number of children
    c.skip(8 + 8)?; // log commit id, id2
    let size = c.var_int()?;
    Ok(LdmVolume {
        fullname: format!("ldm/{}/{}", group_guid, name),
        id,
        name,
        size,
    })
}

fn parse_component(c: &mut VblkCursor<'_>, flags: u8) -> Result<LdmComponent, LdmError> {
    let id = c.var()?.to_vec();
    let name = c.var_str()?;
    c.var()?; // state
    let kind = c.byte()?;
    c.skip(4)?;
    c.var()?; // number of children
    c.skip(8 + 8)?;
    let volume_id = c.var()?.to_vec();

    let layout = match kind {
        COMPONENT_SPANNED => ComponentLayout::Spanned,
        COMPONENT_STRIPE | COMPONENT_RAID5 => {
            if flags & FLAG_STRIPED == 0 {
                return Err(c.bad("striped component without stripe geometry"));
            }
            c.skip(1)?;
            let stripe_size = c.var_int()?;
            let columns = c.var_int()?;
            if kind == COMPONENT_STRIPE {
                ComponentLayout::Striped {
                    stripe_size,
                    columns,
                }
            } else {
                ComponentLayout::Raid5 {
                    stripe_size,
                    columns,
                }
            }
        }
        _ => return Err(c.bad("unknown component type")),
    };

    Ok(LdmComponent {
        id,
        name,
        layout,
        volume_id,
    })
}

fn parse_partition(c: &mut VblkCursor<'_>, flags: u8) -> Result<LdmPartition, LdmError> {
    let id = c.var()?.to_vec();
    let name = c.var_str()?;
    c.skip(4 + 8)?; // zeros, log commit id
    let start = c.be_u64()?;
    let volume_offset = c.be_u64()?;
    let size = c.var_int()?;
    let component_id = c.var()?.to_vec();
    let disk_id = c.var()?.to_vec();
    let index = if flags & FLAG_INDEXED != 0 {
        Some(c.var_int()?)
    } else {
        None
    };
    Ok(LdmPartition {
        id,
        name,
        start,
        volume_offset,
        size,
        component_id,
        disk_id,
        index,
    })
}

/// Sectors that may hold the label, in probing order
fn label_candidates<B: BlockIo>(disk: &mut B) -> Vec<u64> {
    let map = match partmap::scan(disk) {
        Ok(m) => m,
        Err(e) => {
            debug!("LDM probe: {}", e);
            return Vec::new();
        }
    };

    let mut sectors = Vec::new();
    if map.find_kind(PartKind::Msdos(MSDOS_LDM)).is_some() {
        sectors.push(LDM_LABEL_SECTOR);
        if let Ok(total) = total_sectors(disk) {
            if total > 0 {
                sectors.push(total - 1);
            }
        }
    }
    if let Some(meta) = map.find_kind(PartKind::Gpt(GPT_LDM_METADATA)) {
        if meta.len > 0 {
            sectors.push(meta.end() - 1);
        }
    }
    sectors
}

/// Whether the disk carries an LDM label (magic match only)
pub fn is_ldm<B: BlockIo>(disk: &mut B) -> bool {
    let mut buf = [0u8; 512];
    for sector in label_candidates(disk) {
        if read_sector(disk, sector, &mut buf).is_err() {
            return false;
        }
        if &buf[..8] == LDM_LABEL_MAGIC {
            return true;
        }
    }
    false
}

fn read_label<B: BlockIo>(disk: &mut B) -> Result<LdmLabel, LdmError> {
    let mut buf = [0u8; 512];
    let mut version = None;
    for sector in label_candidates(disk) {
        read_sector(disk, sector, &mut buf).map_err(io_err)?;
        let Some(label) = LdmLabel::parse(&buf) else {
            continue;
        };
        if label.version_supported() {
            debug!("LDM label at sector {}", sector);
            return Ok(label);
        }
        version = Some((label.ver_major, label.ver_minor));
    }
    match version {
        Some((major, minor)) => Err(LdmError::BadVersion { major, minor }),
        None => Err(LdmError::NotLdm),
    }
}

/// Locate the label and parse the whole VBLK database
pub fn read_descriptor<B: BlockIo>(disk: &mut B) -> Result<LdmDescriptor, LdmError> {
    let label = read_label(disk)?;

    let total = total_sectors(disk).map_err(io_err)?;
    let area_start = label.config_start.saturating_add(VBLK_AREA_OFFSET);
    let area_end = label.config_start.saturating_add(label.config_size);
    if label.config_size > MAX_CONFIG_SECTORS || area_end > total || area_start > area_end {
        return Err(LdmError::ConfigOutOfRange {
            start: label.config_start,
            size: label.config_size,
        });
    }

    let mut area = vec![0u8; ((area_end - area_start) * 512) as usize];
    read_bytes(disk, area_start * 512, &mut area).map_err(io_err)?;

    let mut desc = LdmDescriptor {
        label,
        disks: Vec::new(),
        volumes: Vec::new(),
        components: Vec::new(),
        partitions: Vec::new(),
    };

    for (i, vblk) in area.chunks_exact(VBLK_SIZE).enumerate() {
        if &vblk[..4] != LDM_VBLK_MAGIC {
            continue;
        }
        let status = be16(vblk, 0x10);
        if status != STATUS_CONSISTENT && status != STATUS_STILL_ACTIVE {
            continue;
        }
        let flags = vblk[0x12];
        let kind = vblk[0x13];
        let sector = area_start + (i * VBLK_SIZE / 512) as u64;
        let dynamic = &vblk[VBLK_DYNAMIC..];

        match kind {
            ENTRY_DISK => {
                let mut c = VblkCursor::new(dynamic, "disk", sector);
                desc.disks.push(parse_disk(&mut c)?);
            }
            ENTRY_VOLUME => {
                let mut c = VblkCursor::new(dynamic, "volume", sector);
                let vol = parse_volume(&mut c, &desc.label.group_guid)?;
                desc.volumes.push(vol);
            }
            ENTRY_COMPONENT => {
                let mut c = VblkCursor::new(dynamic, "component", sector);
                desc.components.push(parse_component(&mut c, flags)?);
            }
            ENTRY_PARTITION => {
                let mut c = VblkCursor::new(dynamic, "partition", sector);
                desc.partitions.push(parse_partition(&mut c, flags)?);
            }
            _ => {}
        }
    }

    info!(
        "LDM group {} ({}): {} disks, {} volumes, {} partitions",
        desc.label.group_name,
        desc.label.group_guid,
        desc.disks.len(),
        desc.volumes.len(),
        desc.partitions.len()
    );
    Ok(desc)
}

/// Name of the LDM volume whose only extent starts at disk sector `start`
pub fn get_ldm<B: BlockIo>(disk: &mut B, start: u64) -> Result<String, LdmError> {
    let desc = read_descriptor(disk)?;
    desc.simple_volumes()
        .into_iter()
        .find(|v| v.disk_start(&desc.label) == start)
        .map(|v| v.volume.fullname.clone())
        .ok_or(LdmError::NoVolumeAt(start))
}

/// Free sectors of the LDM data area usable for boot code.
///
/// Takes the first unallocated run of at least `nsectors`, so no volume
/// extent on this disk is ever handed out. Returns at most `max_nsectors`
/// absolute sectors.
pub fn ldm_embed<B: BlockIo>(
    disk: &mut B,
    nsectors: u32,
    max_nsectors: u32,
    embed_type: EmbedType,
) -> Result<Vec<u64>, LdmError> {
    if embed_type != EmbedType::PcBios {
        return Err(LdmError::UnsupportedEmbed);
    }

    let desc = read_descriptor(disk)?;
    let total = total_sectors(disk).map_err(io_err)?;
    let free = desc.free_ranges(total);
    if free.is_empty() {
        return Err(LdmError::NoEmbedding);
    }

    let Some(&(first, len)) = free.iter().find(|&&(_, len)| len >= nsectors as u64) else {
        return Err(LdmError::EmbedTooSmall);
    };
    let count = len.min(max_nsectors as u64);
    debug!(
        "LDM embedding in free run at {} ({} of {} sectors)",
        first, count, len
    );
    Ok((first..first + count).collect())
}
