//! Common test utilities and mock block devices

pub mod builder;
#[allow(unused_imports)]
pub use builder::{gpt_disk, luks_header, msdos_disk, LdmBuilder};

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};
use std::io;
use std::path::{Path, PathBuf};

/// In-memory block device for testing
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    pub data: Vec<u8>,
    pub block_size: usize,
}

impl MemoryBlockDevice {
    /// Zeroed device of `sectors` 512-byte sectors
    pub fn new(sectors: usize) -> Self {
        Self::from_data(vec![0u8; sectors * 512])
    }

    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            data,
            block_size: 512,
        }
    }

    /// Same bytes, presented with a larger native block size
    #[allow(dead_code)]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    #[allow(dead_code)]
    pub fn sector(&self, n: u64) -> &[u8] {
        let off = n as usize * 512;
        &self.data[off..off + 512]
    }
}

impl BlockIo for MemoryBlockDevice {
    type Error = io::Error;

    fn block_size(&self) -> BlockSize {
        BlockSize::new(self.block_size as u32).expect("valid block size")
    }

    fn num_blocks(&mut self) -> Result<u64, Self::Error> {
        Ok((self.data.len() / self.block_size) as u64)
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<(), Self::Error> {
        let offset = start_lba.0 as usize * self.block_size;
        if offset + dst.len() > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read beyond end of device",
            ));
        }
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> Result<(), Self::Error> {
        let offset = start_lba.0 as usize * self.block_size;
        if offset + src.len() > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write beyond end of device",
            ));
        }
        self.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Scratch file in the temp dir, removed on drop
#[allow(dead_code)]
pub struct TempFile {
    pub path: PathBuf,
}

#[allow(dead_code)]
impl TempFile {
    /// `name` must be unique per test; the pid keeps parallel runs apart
    pub fn new(name: &str, contents: &[u8]) -> Self {
        let dir = std::env::temp_dir().join(format!("hostdisk-tests-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join(name);
        std::fs::write(&path, contents).expect("write temp file");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_str(&self) -> &str {
        self.path.to_str().expect("utf-8 temp path")
    }

    /// Canonical form, as the device map stores it
    pub fn canonical(&self) -> String {
        std::fs::canonicalize(&self.path)
            .expect("canonicalize")
            .to_str()
            .expect("utf-8 temp path")
            .to_string()
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
