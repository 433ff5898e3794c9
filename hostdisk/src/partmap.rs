// Partition map scanning (MSDOS and GPT)
//
// Read-only view of a disk's partition table, used to name partitions
// (`hd0,gpt2`), to resolve offsets when the OS cannot, to locate LDM
// metadata and to find embedding room. Numbering follows the bootloader:
// MSDOS primaries keep their slot number (1-4), logical partitions count
// from 5 along the EBR chain, GPT entries are numbered by array index + 1.

use core::fmt;

use gpt_disk_io::{BlockIo, Disk};
use gpt_disk_types::{guid, GptPartitionType};
use log::debug;
use thiserror::Error;

use crate::blockio::{read_sector, BorrowedIo};

/// MBR partition type of an extended partition
const EXTENDED_TYPES: [u8; 3] = [0x05, 0x0F, 0x85];
/// Protective MBR entry of a GPT disk
pub const GPT_PROTECTIVE: u8 = 0xEE;
/// Windows dynamic disk (LDM) MBR type
pub const MSDOS_LDM: u8 = 0x42;

/// Hard limit on logical partitions followed along an EBR chain
const MAX_LOGICAL: u32 = 256;

pub const GPT_BIOS_BOOT: GptPartitionType =
    GptPartitionType(guid!("21686148-6449-6e6f-744e-656564454649"));
pub const GPT_LDM_METADATA: GptPartitionType =
    GptPartitionType(guid!("5808c8aa-7e8f-42e0-85d2-e1e90434cfb3"));
pub const GPT_LDM_DATA: GptPartitionType =
    GptPartitionType(guid!("af9b60a0-1431-4f62-bc68-3311714a69ad"));

#[derive(Debug, Error)]
pub enum PartmapError {
    #[error("cannot read partition table: {0}")]
    Io(String),

    #[error("extended partition chain is corrupt at sector {0}")]
    BadExtended(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Msdos,
    Gpt,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Msdos => f.write_str("msdos"),
            Scheme::Gpt => f.write_str("gpt"),
        }
    }
}

impl Scheme {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "msdos" => Some(Scheme::Msdos),
            "gpt" => Some(Scheme::Gpt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Msdos(u8),
    Gpt(GptPartitionType),
}

/// One partition, in 512-byte sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPartition {
    pub number: u32,
    pub kind: PartKind,
    pub start: u64,
    pub len: u64,
}

impl HostPartition {
    pub fn scheme(&self) -> Scheme {
        match self.kind {
            PartKind::Msdos(_) => Scheme::Msdos,
            PartKind::Gpt(_) => Scheme::Gpt,
        }
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// `msdos5`, `gpt2`
    pub fn name(&self) -> String {
        format!("{}{}", self.scheme(), self.number)
    }
}

/// Scanned partition table of one disk
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    pub scheme: Option<Scheme>,
    /// Start of the MSDOS extended container, if any
    pub extended: Option<u64>,
    partitions: Vec<HostPartition>,
}

impl PartitionMap {
    pub fn iter(&self) -> impl Iterator<Item = &HostPartition> {
        self.partitions.iter()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, number: u32) -> Option<&HostPartition> {
        self.partitions.iter().find(|p| p.number == number)
    }

    pub fn find_by_start(&self, start: u64) -> Option<&HostPartition> {
        self.partitions.iter().find(|p| p.start == start)
    }

    pub fn find_kind(&self, kind: PartKind) -> Option<&HostPartition> {
        self.partitions.iter().find(|p| p.kind == kind)
    }

    /// Lowest sector claimed by any partition or the extended container
    pub fn first_start(&self) -> Option<u64> {
        self.partitions
            .iter()
            .map(|p| p.start)
            .chain(self.extended)
            .min()
    }
}

fn io_err<E: fmt::Display>(e: E) -> PartmapError {
    PartmapError::Io(e.to_string())
}

struct MbrEntry {
    kind: u8,
    start: u32,
    len: u32,
}

fn mbr_entries(sector: &[u8; 512]) -> Option<[MbrEntry; 4]> {
    if sector[510] != 0x55 || sector[511] != 0xAA {
        return None;
    }
    Some(core::array::from_fn(|i| {
        let e = &sector[446 + i * 16..446 + (i + 1) * 16];
        MbrEntry {
            kind: e[4],
            start: u32::from_le_bytes([e[8], e[9], e[10], e[11]]),
            len: u32::from_le_bytes([e[12], e[13], e[14], e[15]]),
        }
    }))
}

/// Scan `io` for an MSDOS or GPT partition table.
///
/// A disk with no recognisable table gives an empty map with `scheme: None`.
/// MBR and EBR fields count native blocks; the map is always in 512-byte
/// sectors.
pub fn scan<B: BlockIo>(io: &mut B) -> Result<PartitionMap, PartmapError> {
    let per_block = (io.block_size().to_u64() / 512).max(1);
    let mut mbr = [0u8; 512];
    read_sector(io, 0, &mut mbr).map_err(io_err)?;

    let Some(entries) = mbr_entries(&mbr) else {
        debug!("no MBR signature");
        return Ok(PartitionMap::default());
    };

    if entries.iter().any(|e| e.kind == GPT_PROTECTIVE) {
        if let Some(map) = scan_gpt(io)? {
            return Ok(map);
        }
        debug!("protective MBR without a readable GPT");
        return Ok(PartitionMap::default());
    }

    let mut map = PartitionMap {
        scheme: Some(Scheme::Msdos),
        extended: None,
        partitions: Vec::new(),
    };
    let mut extended = None;

    for (i, e) in entries.iter().enumerate() {
        if e.kind == 0 || e.len == 0 {
            continue;
        }
        if EXTENDED_TYPES.contains(&e.kind) {
            if extended.is_none() {
                extended = Some(e.start as u64);
            }
            continue;
        }
        map.partitions.push(HostPartition {
            number: i as u32 + 1,
            kind: PartKind::Msdos(e.kind),
            start: e.start as u64 * per_block,
            len: e.len as u64 * per_block,
        });
    }

    if let Some(ext_start) = extended {
        map.extended = Some(ext_start * per_block);
        scan_logical(io, ext_start, per_block, &mut map.partitions)?;
    }

    Ok(map)
}

/// Follow the EBR chain; `ext_start` and EBR links are in native blocks
fn scan_logical<B: BlockIo>(
    io: &mut B,
    ext_start: u64,
    per_block: u64,
    out: &mut Vec<HostPartition>,
) -> Result<(), PartmapError> {
    let mut ebr_block = ext_start;
    let mut number = 5;
    let mut buf = [0u8; 512];

    for _ in 0..MAX_LOGICAL {
        let ebr_sector = ebr_block * per_block;
        read_sector(io, ebr_sector, &mut buf).map_err(io_err)?;
        let entries = mbr_entries(&buf).ok_or(PartmapError::BadExtended(ebr_sector))?;

        let part = &entries[0];
        if part.kind != 0 && part.len != 0 {
            out.push(HostPartition {
                number,
                kind: PartKind::Msdos(part.kind),
                start: (ebr_block + part.start as u64) * per_block,
                len: part.len as u64 * per_block,
            });
            number += 1;
        }

        let link = &entries[1];
        if !EXTENDED_TYPES.contains(&link.kind) || link.start == 0 {
            return Ok(());
        }
        let next = ext_start + link.start as u64;
        if next <= ebr_block {
            return Err(PartmapError::BadExtended(next * per_block));
        }
        ebr_block = next;
    }

    Err(PartmapError::BadExtended(ebr_block * per_block))
}

/// GPT entries, `Ok(None)` when the header is missing or unusable
fn scan_gpt<B: BlockIo>(io: &mut B) -> Result<Option<PartitionMap>, PartmapError> {
    let block_size = io.block_size();
    let per_block = block_size.to_u64() / 512;

    let mut disk = match Disk::new(BorrowedIo(io)) {
        Ok(d) => d,
        Err(_) => return Ok(None),
    };

    let mut header_buf = vec![0u8; block_size.to_u64() as usize];
    let header = match disk.read_primary_gpt_header(&mut header_buf) {
        Ok(h) => h,
        Err(_) => return Ok(None),
    };
    if !header.is_signature_valid() {
        return Ok(None);
    }

    let layout = match header.get_partition_entry_array_layout() {
        Ok(l) => l,
        Err(_) => return Ok(None),
    };

    let mut entry_buf = vec![0u8; block_size.to_u64() as usize];
    let iter = disk
        .gpt_partition_entry_array_iter(layout, &mut entry_buf)
        .map_err(io_err)?;

    let mut partitions = Vec::new();
    for (index, entry) in iter.enumerate() {
        let entry = entry.map_err(io_err)?;
        if !entry.is_used() {
            continue;
        }
        let first = entry.starting_lba.to_u64();
        let last = entry.ending_lba.to_u64();
        if last < first {
            continue;
        }
        // Copy out of the packed entry before use.
        let type_guid = entry.partition_type_guid;
        partitions.push(HostPartition {
            number: index as u32 + 1,
            kind: PartKind::Gpt(type_guid),
            start: first * per_block,
            len: (last - first + 1) * per_block,
        });
    }

    Ok(Some(PartitionMap {
        scheme: Some(Scheme::Gpt),
        extended: None,
        partitions,
    }))
}
