// Helpers over gpt_disk_io's BlockIo
//
// Everything on-disk in this crate (partition maps, LDM, LUKS headers) is
// addressed in 512-byte sectors, while the device underneath may use 2K or
// 4K blocks. `read_bytes` / `write_bytes` bridge the two.

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};

/// Lends a `&mut` device to APIs that take a `BlockIo` by value
/// (`gpt_disk_io::Disk::new`) without giving it up.
pub struct BorrowedIo<'a, B: BlockIo>(pub &'a mut B);

impl<B: BlockIo> BlockIo for BorrowedIo<'_, B> {
    type Error = B::Error;

    fn block_size(&self) -> BlockSize {
        self.0.block_size()
    }

    fn num_blocks(&mut self) -> Result<u64, Self::Error> {
        self.0.num_blocks()
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<(), Self::Error> {
        self.0.read_blocks(start_lba, dst)
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> Result<(), Self::Error> {
        self.0.write_blocks(start_lba, src)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush()
    }
}

fn block_bytes<B: BlockIo>(io: &B) -> u64 {
    io.block_size().to_u64()
}

/// Block-aligned window covering `[offset, offset + len)`
fn window(offset: u64, len: usize, bs: u64) -> (u64, usize, usize) {
    let first = offset / bs;
    let head = (offset % bs) as usize;
    let span = head + len;
    let blocks = (span as u64).div_ceil(bs) as usize;
    (first, head, blocks * bs as usize)
}

/// Read `buf.len()` bytes starting at byte `offset`
pub fn read_bytes<B: BlockIo>(io: &mut B, offset: u64, buf: &mut [u8]) -> Result<(), B::Error> {
    if buf.is_empty() {
        return Ok(());
    }
    let bs = block_bytes(io);
    let (first, head, total) = window(offset, buf.len(), bs);
    if head == 0 && total == buf.len() {
        return io.read_blocks(Lba(first), buf);
    }
    let mut tmp = vec![0u8; total];
    io.read_blocks(Lba(first), &mut tmp)?;
    buf.copy_from_slice(&tmp[head..head + buf.len()]);
    Ok(())
}

/// Write `data` at byte `offset`, read-modify-write on partial blocks
pub fn write_bytes<B: BlockIo>(io: &mut B, offset: u64, data: &[u8]) -> Result<(), B::Error> {
    if data.is_empty() {
        return Ok(());
    }
    let bs = block_bytes(io);
    let (first, head, total) = window(offset, data.len(), bs);
    if head == 0 && total == data.len() {
        return io.write_blocks(Lba(first), data);
    }
    let mut tmp = vec![0u8; total];
    io.read_blocks(Lba(first), &mut tmp)?;
    tmp[head..head + data.len()].copy_from_slice(data);
    io.write_blocks(Lba(first), &tmp)
}

/// Read 512-byte sector `sector`
pub fn read_sector<B: BlockIo>(
    io: &mut B,
    sector: u64,
    buf: &mut [u8; 512],
) -> Result<(), B::Error> {
    read_bytes(io, sector << 9, buf)
}

/// Device size in 512-byte sectors
pub fn total_sectors<B: BlockIo>(io: &mut B) -> Result<u64, B::Error> {
    let bs = block_bytes(io);
    Ok(io.num_blocks()? * bs / 512)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct Mem {
        data: Vec<u8>,
        bs: u32,
    }

    impl BlockIo for Mem {
        type Error = io::Error;

        fn block_size(&self) -> BlockSize {
            BlockSize::new(self.bs).unwrap()
        }

        fn num_blocks(&mut self) -> Result<u64, Self::Error> {
            Ok(self.data.len() as u64 / self.bs as u64)
        }

        fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<(), Self::Error> {
            assert_eq!(dst.len() % self.bs as usize, 0);
            let off = start_lba.0 as usize * self.bs as usize;
            dst.copy_from_slice(&self.data[off..off + dst.len()]);
            Ok(())
        }

        fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> Result<(), Self::Error> {
            assert_eq!(src.len() % self.bs as usize, 0);
            let off = start_lba.0 as usize * self.bs as usize;
            self.data[off..off + src.len()].copy_from_slice(src);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[test]
    fn test_unaligned_read_on_4k_device() {
        let mut mem = Mem {
            data: (0..16384u32).map(|i| (i % 251) as u8).collect(),
            bs: 4096,
        };
        let mut buf = [0u8; 512];
        read_sector(&mut mem, 9, &mut buf).unwrap();
        assert_eq!(buf[0], ((9 * 512) % 251) as u8);
        assert_eq!(total_sectors(&mut mem).unwrap(), 32);
    }

    #[test]
    fn test_partial_write_preserves_neighbours() {
        let mut mem = Mem {
            data: vec![0x11; 8192],
            bs: 4096,
        };
        write_bytes(&mut mem, 4090, &[0xEE; 12]).unwrap();
        assert_eq!(mem.data[4089], 0x11);
        assert!(mem.data[4090..4102].iter().all(|&b| b == 0xEE));
        assert_eq!(mem.data[4102], 0x11);
    }

    #[test]
    fn test_borrowed_io_forwards() {
        let mut mem = Mem {
            data: vec![0; 2048],
            bs: 512,
        };
        let mut borrowed = BorrowedIo(&mut mem);
        assert_eq!(borrowed.num_blocks().unwrap(), 4);
        borrowed.write_blocks(Lba(1), &[7; 512]).unwrap();
        assert_eq!(mem.data[512], 7);
    }
}
