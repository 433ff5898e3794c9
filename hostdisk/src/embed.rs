// Boot-code embedding
//
// Finds room for core boot code outside any filesystem and writes it there.
// Candidates, in order: the unallocated LDM data area of a dynamic disk, the GPT
// BIOS boot partition, the MSDOS gap between the MBR and the first partition.
// Sector lists are absolute 512-byte sectors of the whole disk.

use std::path::Path;

use gpt_disk_io::BlockIo;
use log::{debug, info};
use thiserror::Error;

use crate::blockio::write_bytes;
use crate::error::Result;
use crate::fd::SECTOR_SIZE;
use crate::ldm;
use crate::partmap::{self, PartKind, Scheme, GPT_BIOS_BOOT};
use crate::platform::{HostBackend, Platform};

/// Target firmware of the embedded code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedType {
    PcBios,
    Ieee1275,
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("currently supports only PC-BIOS embedding")]
    Unsupported,

    #[error("this GPT partition label contains no BIOS Boot Partition; embedding won't be possible")]
    NoBiosBoot,

    #[error("your BIOS Boot Partition is too small; embedding won't be possible")]
    BiosBootTooSmall,

    #[error("This msdos-style partition label has no post-MBR gap; embedding won't be possible")]
    NoGap,

    #[error("your embedding area is unusually small.  core.img won't fit in it.")]
    TooSmall,

    #[error("unable to identify a partition label; embedding won't be possible")]
    NoPartmap,

    #[error("boot code needs {needed} sectors but only {available} are reserved")]
    CodeTooLarge { needed: usize, available: usize },

    #[error("embedding failed: {0}")]
    Io(String),
}

fn io_err<E: core::fmt::Display>(e: E) -> EmbedError {
    EmbedError::Io(e.to_string())
}

fn span(start: u64, len: u64, max_nsectors: u32) -> Vec<u64> {
    let count = len.min(max_nsectors as u64);
    (start..start + count).collect()
}

/// Sectors available for `nsectors` (at least) to `max_nsectors` of boot code.
pub fn embed_sectors<B: BlockIo>(
    disk: &mut B,
    nsectors: u32,
    max_nsectors: u32,
    embed_type: EmbedType,
) -> Result<Vec<u64>> {
    if ldm::is_ldm(disk) {
        info!("embedding into free LDM data area");
        return Ok(ldm::ldm_embed(disk, nsectors, max_nsectors, embed_type)?);
    }

    if embed_type != EmbedType::PcBios {
        return Err(EmbedError::Unsupported.into());
    }

    let map = partmap::scan(disk)?;
    match map.scheme {
        Some(Scheme::Gpt) => {
            let part = map
                .find_kind(PartKind::Gpt(GPT_BIOS_BOOT))
                .ok_or(EmbedError::NoBiosBoot)?;
            if part.len < nsectors as u64 {
                return Err(EmbedError::BiosBootTooSmall.into());
            }
            debug!("BIOS boot partition {} at {}", part.number, part.start);
            Ok(span(part.start, part.len, max_nsectors))
        }
        Some(Scheme::Msdos) => {
            // Empty table: everything after the MBR is free.
            let end = match map.first_start() {
                Some(start) => start,
                None => {
                    let bytes = disk.block_size().to_u64();
                    disk.num_blocks().map_err(io_err)? * bytes / SECTOR_SIZE as u64
                }
            };
            if end <= 1 {
                return Err(EmbedError::NoGap.into());
            }
            let gap = end - 1;
            if gap < nsectors as u64 {
                return Err(EmbedError::TooSmall.into());
            }
            debug!("post-MBR gap of {} sectors", gap);
            Ok(span(1, gap, max_nsectors))
        }
        None => Err(EmbedError::NoPartmap.into()),
    }
}

/// Write `code` over `sectors` in order, then flush the disk
pub fn embed_boot_code<B: BlockIo>(disk: &mut B, sectors: &[u64], code: &[u8]) -> Result<()> {
    let needed = code.len().div_ceil(SECTOR_SIZE);
    if needed > sectors.len() {
        return Err(EmbedError::CodeTooLarge {
            needed,
            available: sectors.len(),
        }
        .into());
    }

    for (chunk, &sector) in code.chunks(SECTOR_SIZE).zip(sectors) {
        write_bytes(disk, sector * SECTOR_SIZE as u64, chunk).map_err(io_err)?;
    }
    disk.flush().map_err(io_err)?;
    info!("embedded {} bytes in {} sectors", code.len(), needed);
    Ok(())
}

/// Drop the OS buffer cache of a block device that is not open yet
pub fn flush_initial_buffer(os_dev: &str) {
    Platform::flush_initial_buffer(Path::new(os_dev));
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpt_disk_types::{BlockSize, Lba};

    struct Mem(Vec<u8>);

    impl BlockIo for Mem {
        type Error = std::io::Error;

        fn block_size(&self) -> BlockSize {
            BlockSize::BS_512
        }
        fn num_blocks(&mut self) -> core::result::Result<u64, Self::Error> {
            Ok(self.0.len() as u64 / 512)
        }
        fn read_blocks(
            &mut self,
            lba: Lba,
            dst: &mut [u8],
        ) -> core::result::Result<(), Self::Error> {
            let off = lba.0 as usize * 512;
            dst.copy_from_slice(&self.0[off..off + dst.len()]);
            Ok(())
        }
        fn write_blocks(&mut self, lba: Lba, src: &[u8]) -> core::result::Result<(), Self::Error> {
            let off = lba.0 as usize * 512;
            self.0[off..off + src.len()].copy_from_slice(src);
            Ok(())
        }
        fn flush(&mut self) -> core::result::Result<(), Self::Error> {
            Ok(())
        }
    }

    fn msdos_disk(first_start: u32) -> Mem {
        let mut data = vec![0u8; 4096 * 512];
        let e = &mut data[446..462];
        e[4] = 0x83;
        e[8..12].copy_from_slice(&first_start.to_le_bytes());
        e[12..16].copy_from_slice(&100u32.to_le_bytes());
        data[510] = 0x55;
        data[511] = 0xAA;
        Mem(data)
    }

    #[test]
    fn test_msdos_gap() {
        let mut disk = msdos_disk(2048);
        let sectors = embed_sectors(&mut disk, 64, 1024, EmbedType::PcBios).unwrap();
        assert_eq!(sectors.len(), 1024);
        assert_eq!(sectors[0], 1);
        assert_eq!(*sectors.last().unwrap(), 1024);
    }

    #[test]
    fn test_msdos_gap_too_small() {
        let mut disk = msdos_disk(63);
        let err = embed_sectors(&mut disk, 64, 1024, EmbedType::PcBios).unwrap_err();
        assert!(err.to_string().contains("unusually small"));

        let mut disk = msdos_disk(1);
        let err = embed_sectors(&mut disk, 64, 1024, EmbedType::PcBios).unwrap_err();
        assert!(err.to_string().contains("no post-MBR gap"));
    }

    #[test]
    fn test_unsupported_type() {
        let mut disk = msdos_disk(2048);
        let err = embed_sectors(&mut disk, 1, 1, EmbedType::Ieee1275).unwrap_err();
        assert_eq!(err.to_string(), "currently supports only PC-BIOS embedding");
    }

    #[test]
    fn test_no_label() {
        let mut disk = Mem(vec![0u8; 64 * 512]);
        let err = embed_sectors(&mut disk, 1, 1, EmbedType::PcBios).unwrap_err();
        assert!(matches!(
            err,
            crate::error::HostdiskError::Embed(EmbedError::NoPartmap)
        ));
    }

    #[test]
    fn test_boot_code_written_in_order() {
        let mut disk = msdos_disk(2048);
        let code: Vec<u8> = (0..1100).map(|i| (i % 251) as u8).collect();
        embed_boot_code(&mut disk, &[10, 3, 7], &code).unwrap();
        assert_eq!(&disk.0[10 * 512..11 * 512], &code[..512]);
        assert_eq!(&disk.0[3 * 512..4 * 512], &code[512..1024]);
        assert_eq!(&disk.0[7 * 512..7 * 512 + 76], &code[1024..]);

        let err = embed_boot_code(&mut disk, &[1], &code).unwrap_err();
        assert!(matches!(
            err,
            crate::error::HostdiskError::Embed(EmbedError::CodeTooLarge { needed: 3, available: 1 })
        ));
    }
}
