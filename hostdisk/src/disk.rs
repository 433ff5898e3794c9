//! Host-backed disks
//!
//! `HostDisk` is the abstract disk object the rest of MorpheusX sees: a
//! `gpt_disk_io::BlockIo` whose blocks live on a host device node or image
//! file. It owns exactly one [`HostdiskData`] binding, which tracks the
//! handle currently open on the device and the mode it was opened in.
//!
//! Handles are opened lazily per transfer and reused while the path and
//! access mode stay the same. Switching away from a writable handle syncs
//! it first. On Linux, transfers inside a partition are redirected to the
//! partition's own node, because the kernel keeps separate buffer caches
//! for a disk and its partitions.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::cell::RefCell;
use std::rc::Rc;

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};
use log::{debug, warn};

use crate::error::{HostdiskError, Result};
use crate::fd::{AccessMode, Fd, OpenFlags, SECTOR_BITS};
use crate::partmap::HostPartition;
use crate::partstart::PartitionFinder;
use crate::platform::is_disk_node;

/// Host side of one abstract disk
#[derive(Debug)]
pub struct HostdiskData {
    /// Path of the node the handle is open on (a partition node after
    /// redirection), empty before the first transfer
    pub dev: String,
    /// `None` until something was opened
    pub access_mode: Option<AccessMode>,
    pub fd: Fd,
    /// Whole device node rather than a partition node or regular file
    pub is_disk: bool,
    /// Came from an explicit device-map entry
    pub device_map: bool,
}

impl HostdiskData {
    fn new(device_map: bool) -> Self {
        Self {
            dev: String::new(),
            access_mode: None,
            fd: Fd::INVALID,
            is_disk: false,
            device_map,
        }
    }
}

/// A disk (or one partition of it) backed by a host device
#[derive(Debug)]
pub struct HostDisk {
    name: String,
    disk_dev: String,
    data: HostdiskData,
    node_is_disk: bool,
    total_sectors: u64,
    log_secsize: u32,
    block_size: BlockSize,
    partition: Option<HostPartition>,
    finder: Rc<RefCell<PartitionFinder>>,
}

impl HostDisk {
    /// Bind an OS path that has no drive name
    pub fn open_path(os_dev: &str) -> Result<Self> {
        Self::open_with(
            format!("hostdisk/{}", os_dev),
            os_dev,
            false,
            Rc::new(RefCell::new(PartitionFinder::new())),
        )
    }

    pub(crate) fn open_with(
        name: String,
        os_dev: &str,
        device_map: bool,
        finder: Rc<RefCell<PartitionFinder>>,
    ) -> Result<Self> {
        let fd = Fd::open(os_dev, OpenFlags::RDONLY)?;
        let (size, log_secsize) = fd.get_size(os_dev)?;
        let node_is_disk = fd
            .file()
            .and_then(|f| f.metadata().ok())
            .map(|m| is_disk_node(&m.file_type()))
            .unwrap_or(false);
        fd.close();

        let block_size = BlockSize::new(1 << log_secsize)
            .filter(|_| log_secsize >= SECTOR_BITS)
            .ok_or_else(|| HostdiskError::Size {
                name: os_dev.to_string(),
                reason: "unsupported sector size",
            })?;

        debug!(
            "{} -> {}: {} sectors of {} bytes",
            name,
            os_dev,
            size >> log_secsize,
            1u64 << log_secsize
        );

        Ok(Self {
            name,
            disk_dev: os_dev.to_string(),
            data: HostdiskData::new(device_map),
            node_is_disk,
            total_sectors: size >> log_secsize,
            log_secsize,
            block_size,
            partition: None,
            finder,
        })
    }

    /// Restrict the disk to one partition of it; addresses become relative
    pub fn with_partition(mut self, partition: HostPartition, name: String) -> Self {
        self.partition = Some(partition);
        self.name = name;
        self
    }

    /// Drive name (`hd0`, `hd0,gpt2`, `hostdisk//tmp/disk.img`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS path of the whole device
    pub fn os_dev(&self) -> &str {
        &self.disk_dev
    }

    pub fn data(&self) -> &HostdiskData {
        &self.data
    }

    pub fn is_device_map(&self) -> bool {
        self.data.device_map
    }

    /// Native sectors of the whole device
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn log_secsize(&self) -> u32 {
        self.log_secsize
    }

    pub fn partition(&self) -> Option<&HostPartition> {
        self.partition.as_ref()
    }

    fn to_512(&self, native: u64) -> u64 {
        native << (self.log_secsize - SECTOR_BITS)
    }

    fn from_512(&self, sectors: u64) -> u64 {
        sectors >> (self.log_secsize - SECTOR_BITS)
    }

    /// Make sure a handle in `mode` is open and positioned at native sector
    /// `sector` of the whole device.
    ///
    /// Returns how many sectors may be transferred before the caller must
    /// come back (`None` for no limit).
    pub fn open_device(&mut self, sector: u64, mode: AccessMode) -> Result<Option<u64>> {
        let mut dev = self.disk_dev.clone();
        let mut max = None;
        let mut is_partition = false;
        let part_start = self.partition.map(|p| self.from_512(p.start));

        if let (Some(part), Some(start)) = (self.partition, part_start) {
            if cfg!(target_os = "linux") && dev.starts_with("/dev/") {
                if sector >= start {
                    let mut finder = self.finder.borrow_mut();
                    is_partition = finder.find_partition(&mut dev, part.start);
                } else {
                    max = Some(start - sector);
                }
            }
        }

        let reusable = self.data.fd.is_valid()
            && self.data.dev == dev
            && self.data.access_mode == Some(mode);

        if !reusable {
            self.release_fd()?;

            let mut flags = OpenFlags::new(mode);
            if mode.is_writable() {
                flags = flags.with_sync();
            }

            let fd = match Fd::open(&dev, flags) {
                Ok(fd) => fd,
                Err(e) if is_partition => {
                    warn!("{}; using whole disk {}", e, self.disk_dev);
                    is_partition = false;
                    dev = self.disk_dev.clone();
                    Fd::open(&dev, flags)?
                }
                Err(e) => return Err(e),
            };

            self.data.dev = dev;
            self.data.access_mode = Some(mode);
            self.data.fd = fd;
            self.data.is_disk = self.node_is_disk && !is_partition;
        }

        let rel = match (is_partition, part_start) {
            (true, Some(start)) => sector - start,
            _ => sector,
        };
        let target = self.to_512(rel);
        self.data.fd.seek(&self.data.dev, target)?;
        Ok(max)
    }

    /// Refuse transfers that are not whole native sectors of the device
    fn check_transfer(&self, sector: u64, bytes: usize) -> Result<()> {
        let count = (bytes >> self.log_secsize) as u64;
        if bytes % (1usize << self.log_secsize) != 0
            || sector.saturating_add(count) > self.total_sectors
        {
            return Err(HostdiskError::OutOfRange {
                name: self.name.clone(),
                sector: sector.saturating_add(count),
                limit: self.total_sectors,
            });
        }
        Ok(())
    }

    /// Read native sectors starting at absolute `sector` of the device
    pub fn read_sectors(&mut self, mut sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_transfer(sector, buf.len())?;
        let shift = self.log_secsize;
        let mut done = 0;

        #[cfg(feature = "trace-io")]
        debug!("{}: read {} bytes at {}", self.name, buf.len(), sector);

        while done < buf.len() {
            let remaining = ((buf.len() - done) >> shift) as u64;
            let mut count = remaining;
            if let Some(max) = self.open_device(sector, AccessMode::ReadOnly)? {
                count = count.min(max);
            }
            // Linux remaps whatever is read together with the MBR; keep it alone.
            if cfg!(target_os = "linux") && sector == 0 {
                count = count.min(1);
            }

            let bytes = (count << shift) as usize;
            let chunk = &mut buf[done..done + bytes];
            let got = self.data.fd.read(chunk).map_err(|source| HostdiskError::Read {
                name: self.data.dev.clone(),
                source,
            })?;
            if got != bytes {
                return Err(HostdiskError::Read {
                    name: self.data.dev.clone(),
                    source: io::Error::from(io::ErrorKind::UnexpectedEof),
                });
            }

            done += bytes;
            sector += count;
        }
        Ok(())
    }

    /// Write native sectors starting at absolute `sector` of the device
    pub fn write_sectors(&mut self, mut sector: u64, buf: &[u8]) -> Result<()> {
        self.check_transfer(sector, buf.len())?;
        let shift = self.log_secsize;
        let mut done = 0;

        #[cfg(feature = "trace-io")]
        debug!("{}: write {} bytes at {}", self.name, buf.len(), sector);

        while done < buf.len() {
            let remaining = ((buf.len() - done) >> shift) as u64;
            let mut count = remaining;
            if let Some(max) = self.open_device(sector, AccessMode::WriteOnly)? {
                count = count.min(max);
            }

            let bytes = (count << shift) as usize;
            let written = self
                .data
                .fd
                .write(&buf[done..done + bytes])
                .map_err(|source| HostdiskError::Write {
                    name: self.data.dev.clone(),
                    source,
                })?;
            if written != bytes {
                return Err(HostdiskError::Write {
                    name: self.data.dev.clone(),
                    source: io::Error::from(io::ErrorKind::WriteZero),
                });
            }

            done += bytes;
            sector += count;
        }
        Ok(())
    }

    /// Sync the open handle, dropping the kernel buffer cache of whole
    /// disks. Nothing open means nothing to do.
    pub fn flush(&mut self) -> Result<()> {
        if !self.data.fd.is_valid() {
            return Ok(());
        }
        self.data.fd.sync().map_err(|source| HostdiskError::Write {
            name: self.data.dev.clone(),
            source,
        })?;
        if self.data.is_disk {
            self.data.fd.flush_buffer_cache();
        }
        Ok(())
    }

    fn release_fd(&mut self) -> Result<()> {
        if !self.data.fd.is_valid() {
            return Ok(());
        }
        let result = match self.data.access_mode {
            Some(mode) if mode.is_writable() => self.flush(),
            _ => Ok(()),
        };
        core::mem::replace(&mut self.data.fd, Fd::INVALID).close();
        self.data.access_mode = None;
        result
    }

    /// Flush (if written to) and release the binding
    pub fn close(mut self) -> Result<()> {
        self.release_fd()
    }

    /// Device number of the whole-device node
    pub fn rdev(&self) -> Option<u64> {
        std::fs::metadata(&self.disk_dev).ok().map(|m| m.rdev())
    }

    fn window(&self) -> (u64, u64) {
        match &self.partition {
            Some(p) => (self.from_512(p.start), self.from_512(p.len)),
            None => (0, self.total_sectors),
        }
    }

    fn check_range(&self, lba: u64, bytes: usize) -> Result<u64> {
        let (base, len) = self.window();
        let count = (bytes >> self.log_secsize) as u64;
        if bytes % (1usize << self.log_secsize) != 0 || lba.saturating_add(count) > len {
            return Err(HostdiskError::OutOfRange {
                name: self.name.clone(),
                sector: lba + count,
                limit: len,
            });
        }
        Ok(base + lba)
    }
}

impl Drop for HostDisk {
    fn drop(&mut self) {
        if let Err(e) = self.release_fd() {
            warn!("closing {}: {}", self.name, e);
        }
    }
}

impl BlockIo for HostDisk {
    type Error = HostdiskError;

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn num_blocks(&mut self) -> core::result::Result<u64, Self::Error> {
        Ok(self.window().1)
    }

    fn read_blocks(
        &mut self,
        start_lba: Lba,
        dst: &mut [u8],
    ) -> core::result::Result<(), Self::Error> {
        let sector = self.check_range(start_lba.0, dst.len())?;
        self.read_sectors(sector, dst)
    }

    fn write_blocks(
        &mut self,
        start_lba: Lba,
        src: &[u8],
    ) -> core::result::Result<(), Self::Error> {
        let sector = self.check_range(start_lba.0, src.len())?;
        self.write_sectors(sector, src)
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        HostDisk::flush(self)
    }
}
