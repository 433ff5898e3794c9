//! Host disk error types
//!
//! One crate-level error, `HostdiskError`, with the per-module errors
//! (device-mapper, LDM, partition map, cryptodisk, embedding) folded in.
//! Follows the same pattern as `GptError` / `IsoError` in morpheus-core:
//! every variant says what failed and on which device.
//!
//! Resolution failures ("no partition offset on this platform", "not an LDM
//! disk") are *not* errors; those APIs return `Option`/`bool` instead.

use std::io;

use thiserror::Error;

use crate::cryptodisk::CryptoError;
use crate::devmapper::DmError;
use crate::embed::EmbedError;
use crate::ldm::LdmError;
use crate::partmap::PartmapError;

/// Result type for host disk operations
pub type Result<T> = core::result::Result<T, HostdiskError>;

/// Errors that can occur while talking to host block devices
#[derive(Debug, Error)]
pub enum HostdiskError {
    /// Device node could not be opened
    #[error("cannot open `{path}': {source}")]
    Open { path: String, source: io::Error },

    /// `stat`/`fstat` failed
    #[error("cannot stat `{path}': {source}")]
    Stat { path: String, source: io::Error },

    /// Positioning the handle failed
    #[error("cannot seek `{name}': {source}")]
    Seek { name: String, source: io::Error },

    /// Target sector lies beyond the end of the device
    #[error("attempt to seek outside of `{name}' (sector {sector} >= {limit})")]
    OutOfRange { name: String, sector: u64, limit: u64 },

    /// Read failed or came back short
    #[error("cannot read `{name}': {source}")]
    Read { name: String, source: io::Error },

    /// Write failed or came back short
    #[error("cannot write to `{name}': {source}")]
    Write { name: String, source: io::Error },

    /// Device size could not be determined
    #[error("cannot get size of `{name}': {reason}")]
    Size { name: String, reason: &'static str },

    /// No device map entry or discovery result for the drive
    #[error("no mapping exists for `{0}'")]
    UnknownDevice(String),

    /// Malformed device map line
    #[error("{file}:{line}: {reason}")]
    DeviceMap {
        file: String,
        line: usize,
        reason: &'static str,
    },

    /// Same drive listed twice in the device map
    #[error("the drive {drive} is defined multiple times in the device map {file}")]
    DuplicateDrive { drive: String, file: String },

    /// Drive name with an unparsable partition suffix (`hd0,foo`)
    #[error("invalid partition name `{0}'")]
    BadPartitionName(String),

    /// Partition named by the drive does not exist on the disk
    #[error("no such partition `{0}'")]
    PartitionNotFound(String),

    /// Handle used after close
    #[error("device `{0}' is not open")]
    NotOpen(String),

    #[error(transparent)]
    DeviceMapper(#[from] DmError),

    #[error(transparent)]
    Ldm(#[from] LdmError),

    #[error(transparent)]
    Partmap(#[from] PartmapError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Embed(#[from] EmbedError),
}

impl HostdiskError {
    /// Underlying OS error, when the failure came from a system call
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            Self::Open { source, .. }
            | Self::Stat { source, .. }
            | Self::Seek { source, .. }
            | Self::Read { source, .. }
            | Self::Write { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether this error means "the device simply is not there"
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::UnknownDevice(_) | Self::PartitionNotFound(_) => true,
            _ => self
                .os_error()
                .map(|e| e.kind() == io::ErrorKind::NotFound)
                .unwrap_or(false),
        }
    }
}
