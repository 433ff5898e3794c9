//! Cryptodisk bridge
//!
//! The installer runs on a system where encrypted volumes are already
//! unlocked by the OS. A "cheat mount" records that the cleartext of
//! `source` is readable at `cheat` (for example `/dev/mapper/luks-...`),
//! so nothing here ever touches key material. Scanners only identify the
//! on-disk format and pull out the volume UUID.

use std::io::Write;

use log::info;
use thiserror::Error;
use uguid::Guid;

use crate::blockio::read_bytes;
use crate::disk::HostDisk;
use crate::error::Result;

/// Bytes handed to scanners; covers every supported header
const HEADER_PROBE_SIZE: usize = 4096;

pub const LUKS_MAGIC: &[u8; 6] = b"LUKS\xba\xbe";
const LUKS_UUID_OFFSET: usize = 168;
const LUKS_UUID_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("cannot read encryption header of `{dev}': {reason}")]
    Io { dev: String, reason: String },

    #[error("`{0}' is not a cheat-mounted encrypted volume")]
    NotMounted(String),

    #[error("`{dev}' is already cheat-mounted at `{existing}'")]
    CheatConflict { dev: String, existing: String },
}

/// What a scanner learned from a volume header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedVolume {
    /// Format tag (`luks`, `luks2`)
    pub modname: &'static str,
    /// UUID without dashes, lowercase
    pub uuid: String,
}

/// Recognises one encrypted volume format
pub trait CryptoScanner {
    fn scan(&self, header: &[u8]) -> Option<ScannedVolume>;
}

/// LUKS1 and LUKS2 headers
#[derive(Debug, Default, Clone, Copy)]
pub struct LuksScanner;

impl CryptoScanner for LuksScanner {
    fn scan(&self, header: &[u8]) -> Option<ScannedVolume> {
        if header.len() < LUKS_UUID_OFFSET + LUKS_UUID_LEN || &header[..6] != LUKS_MAGIC {
            return None;
        }
        let modname = match u16::from_be_bytes([header[6], header[7]]) {
            1 => "luks",
            2 => "luks2",
            _ => return None,
        };

        let raw = &header[LUKS_UUID_OFFSET..LUKS_UUID_OFFSET + LUKS_UUID_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let text = core::str::from_utf8(&raw[..end]).ok()?;
        let guid: Guid = text.parse().ok()?;
        let uuid = guid.to_string().replace('-', "").to_ascii_lowercase();
        Some(ScannedVolume { modname, uuid })
    }
}

/// One cheat-mounted volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoVolume {
    pub source: String,
    pub cheat: String,
    pub modname: &'static str,
    pub uuid: String,
}

impl CryptoVolume {
    /// Open the cleartext side
    pub fn open_cleartext(&self) -> Result<HostDisk> {
        HostDisk::open_path(&self.cheat)
    }
}

/// Registry of cheat-mounted volumes
pub struct Cryptodisk {
    scanners: Vec<Box<dyn CryptoScanner>>,
    mounted: Vec<CryptoVolume>,
}

impl Default for Cryptodisk {
    fn default() -> Self {
        Self::new()
    }
}

impl Cryptodisk {
    pub fn new() -> Self {
        Self::with_scanners(vec![Box::new(LuksScanner)])
    }

    pub fn with_scanners(scanners: Vec<Box<dyn CryptoScanner>>) -> Self {
        Self {
            scanners,
            mounted: Vec::new(),
        }
    }

    /// Register the cleartext of `source` as available at `cheat`.
    ///
    /// Mounting the same source twice returns the existing entry. A source
    /// no scanner recognises is not an error; it yields `None`.
    pub fn cheat_mount(&mut self, source: &str, cheat: &str) -> Result<Option<&CryptoVolume>> {
        if let Some(idx) = self.mounted.iter().position(|v| v.source == source) {
            if self.mounted[idx].cheat != cheat {
                return Err(CryptoError::CheatConflict {
                    dev: source.to_string(),
                    existing: self.mounted[idx].cheat.clone(),
                }
                .into());
            }
            return Ok(Some(&self.mounted[idx]));
        }

        let mut disk = HostDisk::open_path(source)?;
        let total = disk.total_sectors() << disk.log_secsize();
        let mut header = vec![0u8; HEADER_PROBE_SIZE.min(total as usize)];
        read_bytes(&mut disk, 0, &mut header).map_err(|e| CryptoError::Io {
            dev: source.to_string(),
            reason: e.to_string(),
        })?;
        disk.close()?;

        let Some(found) = self.scanners.iter().find_map(|s| s.scan(&header)) else {
            return Ok(None);
        };

        info!("cheatmounted {} ({}) at {}", source, found.modname, cheat);
        self.mounted.push(CryptoVolume {
            source: source.to_string(),
            cheat: cheat.to_string(),
            modname: found.modname,
            uuid: found.uuid,
        });
        Ok(self.mounted.last())
    }

    pub fn get_by_source(&self, source: &str) -> Option<&CryptoVolume> {
        self.mounted.iter().find(|v| v.source == source)
    }

    /// Volume for a disk opened on either side of the mount
    pub fn get_by_disk(&self, disk: &HostDisk) -> Option<&CryptoVolume> {
        let dev = disk.os_dev();
        self.mounted
            .iter()
            .find(|v| v.source == dev || v.cheat == dev)
    }

    /// Write the UUID of the volume behind `disk`, space-terminated
    pub fn print_uuid<W: Write>(&self, disk: &HostDisk, out: &mut W) -> Result<()> {
        let vol = self
            .get_by_disk(disk)
            .ok_or_else(|| CryptoError::NotMounted(disk.os_dev().to_string()))?;
        write!(out, "{} ", vol.uuid).map_err(|e| CryptoError::Io {
            dev: disk.os_dev().to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    pub fn mounted(&self) -> &[CryptoVolume] {
        &self.mounted
    }
}
