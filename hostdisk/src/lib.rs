//! Morpheus Host Disk Layer
//!
//! Host-side disk access for the MorpheusX installer: raw device I/O,
//! drive naming, partition offsets, device-mapper and LDM introspection,
//! and boot-code embedding. Runs on the build/install host (std), not in
//! firmware.
//!
//! # Architecture
//!
//! Leaves first:
//! 1. **Handle layer** ([`fd`]) - open/seek/read/write/sync/close and size
//!    queries on device nodes and image files
//! 2. **Device map** ([`devmap`]) - OS path <-> drive name (`hd0,gpt2`)
//! 3. **Offset resolver** ([`partstart`], [`partname`]) - where a partition
//!    node starts inside its disk
//! 4. **Device-mapper** ([`devmapper`]) - linear target resolution
//! 5. **LDM** ([`ldm`]) - Windows dynamic disk metadata
//! 6. **Cryptodisk bridge** ([`cryptodisk`]) - already-unlocked volumes
//! 7. **Embedding** ([`embed`]) - room for boot code, write and flush
//!
//! [`disk::HostDisk`] ties the handle layer to `gpt_disk_io::BlockIo`, so
//! every parser here runs over real devices and in-memory test disks alike.
//!
//! # Usage
//!
//! ```ignore
//! use morpheus_hostdisk::{DeviceMap, embed};
//!
//! let map = DeviceMap::init(Some(Path::new("/boot/grub/device.map")))?;
//! let drive = map.get_grub_dev("/dev/sda2");        // Some("hd0,gpt2")
//! let mut disk = map.open_disk("hd0")?;
//! let sectors = embed::embed_sectors(&mut disk, 64, 1024, EmbedType::PcBios)?;
//! embed::embed_boot_code(&mut disk, &sectors, &core_img)?;
//! map.fini();
//! ```
//!
//! All sector numbers crossing module boundaries are 512-byte sectors.

#[cfg(not(unix))]
compile_error!("morpheus-hostdisk supports Unix hosts only");

pub mod blockio;
pub mod cryptodisk;
pub mod devmap;
pub mod devmapper;
pub mod disk;
pub mod embed;
pub mod error;
pub mod fd;
pub mod ldm;
pub mod logger;
pub mod partmap;
pub mod partname;
pub mod partstart;
pub mod platform;

pub use cryptodisk::{CryptoScanner, Cryptodisk, LuksScanner};
pub use devmap::{DeviceMap, DiskEnumerator};
pub use devmapper::{get_dm_node_linear_info, DmLinearInfo};
pub use disk::{HostDisk, HostdiskData};
pub use embed::{embed_boot_code, embed_sectors, flush_initial_buffer, EmbedType};
pub use error::{HostdiskError, Result};
pub use fd::{strerror, AccessMode, Fd, OpenFlags};
pub use ldm::{get_ldm, is_ldm, ldm_embed};
pub use partmap::{HostPartition, PartitionMap, Scheme};
pub use partname::get_os_disk;
pub use partstart::{
    find_partition_start, find_partition_start_os, PartitionFinder, PartitionOffset,
};
