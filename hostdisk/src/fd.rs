//! Raw device handles
//!
//! `Fd` is the smallest unit of host disk access: an open device node (or
//! image file) addressed in 512-byte sectors. It is either valid or the
//! `Fd::INVALID` sentinel, never anything in between.
//!
//! The last error produced by this module is kept per thread and can be
//! fetched with [`strerror`], for callers that only want a message.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::debug;

use crate::error::{HostdiskError, Result};
use crate::platform::{is_disk_node, HostBackend, Platform};

/// Sector unit used at every public boundary of this crate
pub const SECTOR_BITS: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_BITS;

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

fn record(err: HostdiskError) -> HostdiskError {
    let text = match err.os_error() {
        Some(os) => os.to_string(),
        None => err.to_string(),
    };
    LAST_ERROR.with(|e| *e.borrow_mut() = text);
    err
}

/// Text of the last handle-layer error on this thread
pub fn strerror() -> String {
    LAST_ERROR.with(|e| e.borrow().clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub access: AccessMode,
    pub sync: bool,
}

impl OpenFlags {
    pub const RDONLY: Self = Self::new(AccessMode::ReadOnly);
    pub const WRONLY: Self = Self::new(AccessMode::WriteOnly);
    pub const RDWR: Self = Self::new(AccessMode::ReadWrite);

    pub const fn new(access: AccessMode) -> Self {
        Self {
            access,
            sync: false,
        }
    }

    pub const fn with_sync(mut self) -> Self {
        self.sync = true;
        self
    }
}

/// Open device handle
#[derive(Debug)]
pub struct Fd {
    file: Option<File>,
}

impl Fd {
    pub const INVALID: Fd = Fd { file: None };

    /// Open `path`. A failure never yields a handle; the message is also
    /// available through [`strerror`].
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Fd> {
        let path = path.as_ref();
        let mut custom = libc::O_CLOEXEC;
        if flags.sync {
            custom |= libc::O_SYNC;
        }

        let file = OpenOptions::new()
            .read(flags.access != AccessMode::WriteOnly)
            .write(flags.access.is_writable())
            .custom_flags(custom)
            .open(path)
            .map_err(|source| {
                record(HostdiskError::Open {
                    path: path.display().to_string(),
                    source,
                })
            })?;

        Platform::configure_device_driver(&file);
        debug!("opened {} ({:?})", path.display(), flags.access);
        Ok(Fd { file: Some(file) })
    }

    pub fn is_valid(&self) -> bool {
        self.file.is_some()
    }

    pub(crate) fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    fn file_mut(&mut self, name: &str) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| record(HostdiskError::NotOpen(name.to_string())))
    }

    /// Position the handle at 512-byte sector `sector`
    pub fn seek(&mut self, name: &str, sector: u64) -> Result<()> {
        let (size, _) = self.get_size(name)?;
        let limit = size >> SECTOR_BITS;
        let offset = sector.checked_shl(SECTOR_BITS).filter(|_| sector <= limit);
        let offset = offset.ok_or_else(|| {
            record(HostdiskError::OutOfRange {
                name: name.to_string(),
                sector,
                limit,
            })
        })?;

        let file = self.file_mut(name)?;
        file.seek(SeekFrom::Start(offset)).map_err(|source| {
            record(HostdiskError::Seek {
                name: name.to_string(),
                source,
            })
        })?;
        Ok(())
    }

    /// Read until `buf` is full or the device ends; returns the byte count
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let mut done = 0;
        while done < buf.len() {
            match file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(remember_io(e)),
            }
        }
        Ok(done)
    }

    /// Write all of `buf` unless the device refuses more; returns the byte count
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let mut done = 0;
        while done < buf.len() {
            match file.write(&buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(remember_io(e)),
            }
        }
        Ok(done)
    }

    /// `fsync` the handle; a no-op on the invalid handle
    pub fn sync(&self) -> io::Result<()> {
        match &self.file {
            Some(f) => f.sync_all().map_err(remember_io),
            None => Ok(()),
        }
    }

    /// Drop the OS buffer cache of the device behind the handle
    pub fn flush_buffer_cache(&self) {
        if let Some(f) = &self.file {
            Platform::flush_buffer_cache(f);
        }
    }

    pub fn close(mut self) {
        self.file.take();
    }

    /// Device size in bytes and log2 of its native sector size
    pub fn get_size(&self, name: &str) -> Result<(u64, u32)> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| record(HostdiskError::NotOpen(name.to_string())))?;
        get_fd_size(file, name)
    }

    pub fn configure_device_driver(&self) {
        if let Some(f) = &self.file {
            Platform::configure_device_driver(f);
        }
    }
}

fn remember_io(e: io::Error) -> io::Error {
    LAST_ERROR.with(|l| *l.borrow_mut() = e.to_string());
    e
}

/// Size query shared by `Fd` and anything else holding an open file
pub fn get_fd_size(file: &File, name: &str) -> Result<(u64, u32)> {
    let meta = file.metadata().map_err(|source| {
        record(HostdiskError::Stat {
            path: name.to_string(),
            source,
        })
    })?;

    if Platform::FD_STAT_IS_FUNCTIONAL && is_disk_node(&meta.file_type()) {
        if let Some(size) = Platform::fd_size_os(file, name).map_err(record)? {
            return Ok(size);
        }
    }
    Ok((meta.len(), SECTOR_BITS))
}
