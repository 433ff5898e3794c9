//! Disk image builders: MBR, GPT, LDM and LUKS

#![allow(dead_code)]

use crate::common::MemoryBlockDevice;
use gpt_disk_io::Disk;
use gpt_disk_types::{
    guid, BlockSize, GptHeader, GptPartitionEntryArray, GptPartitionType, LbaLe, U32Le,
};
use morpheus_hostdisk::blockio::BorrowedIo;

/// MSDOS label with primary entries `(slot, type, start, len)`
pub fn msdos_disk(sectors: usize, entries: &[(usize, u8, u32, u32)]) -> MemoryBlockDevice {
    let mut dev = MemoryBlockDevice::new(sectors);
    write_mbr(&mut dev.data[..512], entries);
    dev
}

fn write_mbr(sector: &mut [u8], entries: &[(usize, u8, u32, u32)]) {
    for &(slot, kind, start, len) in entries {
        let e = &mut sector[446 + slot * 16..446 + (slot + 1) * 16];
        e[4] = kind;
        e[8..12].copy_from_slice(&start.to_le_bytes());
        e[12..16].copy_from_slice(&len.to_le_bytes());
    }
    sector[510] = 0x55;
    sector[511] = 0xAA;
}

/// Write an EBR at absolute sector `at`
pub fn write_ebr(dev: &mut MemoryBlockDevice, at: u64, part: (u8, u32, u32), next: Option<u32>) {
    let off = at as usize * 512;
    let mut entries = vec![(0, part.0, part.1, part.2)];
    if let Some(next) = next {
        entries.push((1, 0x05, next, 1));
    }
    write_mbr(&mut dev.data[off..off + 512], &entries);
}

/// GPT label with partitions `(type, first_lba, last_lba)`
pub fn gpt_disk(sectors: u64, parts: &[(GptPartitionType, u64, u64)]) -> MemoryBlockDevice {
    let mut dev = MemoryBlockDevice::new(sectors as usize);
    {
        let mut disk = Disk::new(BorrowedIo(&mut dev)).expect("disk");

        let mut header = GptHeader {
            my_lba: LbaLe::from_u64(1),
            alternate_lba: LbaLe::from_u64(sectors - 1),
            first_usable_lba: LbaLe::from_u64(34),
            last_usable_lba: LbaLe::from_u64(sectors - 34),
            disk_guid: guid!("57a7b3c1-0f2e-4d9a-8b6c-1e2d3c4b5a69"),
            partition_entry_lba: LbaLe::from_u64(2),
            number_of_partition_entries: U32Le::from_u32(128),
            ..Default::default()
        };

        disk.write_protective_mbr(&mut [0u8; 512]).expect("mbr");

        let layout = header
            .get_partition_entry_array_layout()
            .expect("layout");
        let mut entry_buf = vec![0u8; 128 * 128];
        let mut entries =
            GptPartitionEntryArray::new(layout, BlockSize::BS_512, &mut entry_buf).expect("array");

        for (i, &(kind, first, last)) in parts.iter().enumerate() {
            let entry = entries
                .get_partition_entry_mut(i.try_into().unwrap())
                .expect("slot");
            entry.partition_type_guid = kind;
            entry.unique_partition_guid = guid!("0c3b2a19-8f7e-4d6c-9b5a-493827160504");
            entry.starting_lba = LbaLe::from_u64(first);
            entry.ending_lba = LbaLe::from_u64(last);
        }

        header.partition_entry_array_crc32 = entries.calculate_crc32();
        header.update_header_crc32();
        disk.write_primary_gpt_header(&header, &mut [0u8; 512])
            .expect("header");
        disk.write_gpt_partition_entry_array(&entries)
            .expect("entries");
    }
    dev
}

/// LUKS header sector(s) carrying `uuid`
pub fn luks_header(version: u16, uuid: &str) -> Vec<u8> {
    let mut h = vec![0u8; 4096];
    h[..6].copy_from_slice(b"LUKS\xba\xbe");
    h[6..8].copy_from_slice(&version.to_be_bytes());
    h[168..168 + uuid.len()].copy_from_slice(uuid.as_bytes());
    h
}

fn var(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

fn var_int(out: &mut Vec<u8>, v: u64) {
    let be = v.to_be_bytes();
    let skip = be.iter().take_while(|&&b| b == 0).count().min(7);
    var(out, &be[skip..]);
}

pub const LDM_DISK_GUID: &str = "0f1d2c3b-4a59-6877-8695-a4b3c2d1e0f9";
pub const LDM_GROUP_GUID: &str = "11111111-2222-3333-4444-555555555555";

/// Windows dynamic disk on an MSDOS `0x42` partition, one simple volume
pub struct LdmBuilder {
    pub sectors: u64,
    pub pv_start: u64,
    pub config_start: u64,
    pub volume_name: String,
    /// Start inside the data area
    pub volume_start: u64,
    pub volume_size: u64,
    pub version: (u16, u16),
}

impl LdmBuilder {
    pub fn new() -> Self {
        Self {
            sectors: 4096,
            pv_start: 63,
            config_start: 3000,
            volume_name: "Volume1".into(),
            volume_start: 100,
            volume_size: 1024,
            version: (2, 12),
        }
    }

    /// Absolute start of the volume on the disk
    pub fn volume_disk_start(&self) -> u64 {
        self.pv_start + self.volume_start
    }

    pub fn volume_fullname(&self) -> String {
        format!("ldm/{}/{}", LDM_GROUP_GUID, self.volume_name)
    }

    fn vblk(kind: u8, flags: u8, seq: u32, dynamic: &[u8]) -> [u8; 128] {
        let mut b = [0u8; 128];
        b[..4].copy_from_slice(b"VBLK");
        b[4..8].copy_from_slice(&seq.to_be_bytes());
        b[0x0C..0x0E].copy_from_slice(&0u16.to_be_bytes());
        b[0x0E..0x10].copy_from_slice(&1u16.to_be_bytes());
        b[0x10..0x12].copy_from_slice(&0u16.to_be_bytes());
        b[0x12] = flags;
        b[0x13] = kind;
        b[0x18..0x18 + dynamic.len()].copy_from_slice(dynamic);
        b
    }

    fn records(&self) -> Vec<[u8; 128]> {
        let mut disk = Vec::new();
        var(&mut disk, &[0x01]);
        var(&mut disk, b"Disk1");
        var(&mut disk, LDM_DISK_GUID.as_bytes());

        let mut volume = Vec::new();
        var(&mut volume, &[0x02]);
        var(&mut volume, self.volume_name.as_bytes());
        var(&mut volume, b"gen");
        var(&mut volume, &[]);
        volume.extend_from_slice(&[0; 21]);
        var(&mut volume, &[1]);
        volume.extend_from_slice(&[0; 16]);
        var_int(&mut volume, self.volume_size);

        let mut component = Vec::new();
        var(&mut component, &[0x03]);
        var(&mut component, b"Volume1-01");
        var(&mut component, b"ACTIVE");
        component.push(2); // spanned
        component.extend_from_slice(&[0; 4]);
        var(&mut component, &[1]);
        component.extend_from_slice(&[0; 16]);
        var(&mut component, &[0x02]);

        let mut partition = Vec::new();
        var(&mut partition, &[0x04]);
        var(&mut partition, b"Disk1-01");
        partition.extend_from_slice(&[0; 12]);
        partition.extend_from_slice(&self.volume_start.to_be_bytes());
        partition.extend_from_slice(&0u64.to_be_bytes());
        var_int(&mut partition, self.volume_size);
        var(&mut partition, &[0x03]);
        var(&mut partition, &[0x01]);

        vec![
            Self::vblk(0x34, 0, 1, &disk),
            Self::vblk(0x51, 0, 2, &volume),
            Self::vblk(0x32, 0, 3, &component),
            Self::vblk(0x33, 0, 4, &partition),
        ]
    }

    pub fn label(&self) -> [u8; 512] {
        let mut s = [0u8; 512];
        s[..8].copy_from_slice(b"PRIVHEAD");
        s[0x0C..0x0E].copy_from_slice(&self.version.0.to_be_bytes());
        s[0x0E..0x10].copy_from_slice(&self.version.1.to_be_bytes());
        s[0x30..0x30 + 36].copy_from_slice(LDM_DISK_GUID.as_bytes());
        s[0xB0..0xB0 + 36].copy_from_slice(LDM_GROUP_GUID.as_bytes());
        s[0xF0..0xF7].copy_from_slice(b"WIN-Dg0");
        s[0x11B..0x123].copy_from_slice(&self.pv_start.to_be_bytes());
        s[0x123..0x12B].copy_from_slice(&(self.config_start - self.pv_start).to_be_bytes());
        s[0x12B..0x133].copy_from_slice(&self.config_start.to_be_bytes());
        s[0x133..0x13B].copy_from_slice(&(self.sectors - self.config_start).to_be_bytes());
        s
    }

    pub fn build(&self) -> MemoryBlockDevice {
        let mut dev = msdos_disk(
            self.sectors as usize,
            &[(0, 0x42, 63, (self.sectors - 63) as u32)],
        );
        dev.data[6 * 512..7 * 512].copy_from_slice(&self.label());

        let area = (self.config_start as usize + 0x12) * 512;
        for (i, rec) in self.records().iter().enumerate() {
            let off = area + i * 128;
            dev.data[off..off + 128].copy_from_slice(rec);
        }
        dev
    }
}
