//! The free-block bitmap allocator (spec §3.3, §4.2).
//!
//! One bit per allocatable block, MSB-first within each byte; `1` means
//! free. A "next free cursor" and a sticky "pool empty" flag are kept in
//! RAM and mirror the teacher's `bitmap_search`/`bitmap_set` helpers, but
//! addressed against this filesystem's block granularity rather than ext2's
//! inode/data bitmaps.

use log::warn;

use block_device::{BlockDevice, WriteHint};

use crate::error::{rd, wr, FsError, Result};
use crate::geometry::Superblock;

pub struct BlockAllocator {
    bitmap: Vec<u8>,
    num_blocks: u32,
    block_size_pages: u32,
    first_data_page: u32,
    cursor: u32,
    pool_empty: bool,
}

fn bit_is_set(bitmap: &[u8], bit: u32) -> bool {
    let byte = bitmap[(bit / 8) as usize];
    let mask = 1u8 << (7 - (bit % 8));
    byte & mask != 0
}

fn set_bit(bitmap: &mut [u8], bit: u32) {
    let mask = 1u8 << (7 - (bit % 8));
    bitmap[(bit / 8) as usize] |= mask;
}

fn clear_bit(bitmap: &mut [u8], bit: u32) {
    let mask = !(1u8 << (7 - (bit % 8)));
    bitmap[(bit / 8) as usize] &= mask;
}

impl BlockAllocator {
    /// Build a freshly-formatted bitmap with `in_use_blocks` cleared (0) and
    /// every other usable block set (1). `in_use_blocks` is the exact set of
    /// blocks consumed by format-time writes — see DESIGN.md for how this
    /// resolves spec §9's "4 vs 5 bits" open question.
    pub fn new_formatted(sb: &Superblock, in_use_blocks: &[u32]) -> Self {
        let num_blocks = sb.num_blocks();
        let bitmap_bits = sb.state_section_size as usize * sb.page_size() * 8;
        let mut bitmap = vec![0xFFu8; bitmap_bits / 8];
        for bit in num_blocks..bitmap_bits as u32 {
            clear_bit(&mut bitmap, bit);
        }
        for &b in in_use_blocks {
            clear_bit(&mut bitmap, b);
        }
        let mut allocator = Self {
            bitmap,
            num_blocks,
            block_size_pages: sb.block_size_pages() as u32,
            first_data_page: sb.first_data_page(),
            cursor: 0,
            pool_empty: false,
        };
        allocator.advance_cursor_to_next_free();
        allocator
    }

    pub fn load<D: BlockDevice>(dev: &mut D, sb: &Superblock) -> Result<Self> {
        let mut bitmap = vec![0u8; sb.state_section_size as usize * sb.page_size()];
        let page_size = sb.page_size();
        for (i, chunk) in bitmap.chunks_mut(page_size).enumerate() {
            dev.read(1 + i as u32, 0, chunk).map_err(rd)?;
        }
        let mut allocator = Self {
            bitmap,
            num_blocks: sb.num_blocks(),
            block_size_pages: sb.block_size_pages() as u32,
            first_data_page: sb.first_data_page(),
            cursor: 0,
            pool_empty: false,
        };
        allocator.advance_cursor_to_next_free();
        Ok(allocator)
    }

    pub fn persist<D: BlockDevice>(&self, dev: &mut D, sb: &Superblock) -> Result<()> {
        let page_size = sb.page_size();
        for (i, chunk) in self.bitmap.chunks(page_size).enumerate() {
            dev.write(1 + i as u32, 0, chunk, WriteHint::Normal)
                .map_err(wr)?;
        }
        Ok(())
    }

    fn advance_cursor_to_next_free(&mut self) {
        let mut i = self.cursor;
        while i < self.num_blocks {
            if bit_is_set(&self.bitmap, i) {
                self.cursor = i;
                return;
            }
            i += 1;
        }
        self.pool_empty = true;
    }

    pub fn reserve<D: BlockDevice>(&mut self, dev: &mut D, sb: &Superblock) -> Result<u32> {
        if self.pool_empty {
            warn!("block pool exhausted, reserve() rejected");
            return Err(FsError::DeviceFull);
        }
        let bit = self.cursor;
        clear_bit(&mut self.bitmap, bit);
        self.cursor += 1;
        self.advance_cursor_to_next_free();
        self.persist(dev, sb)?;
        Ok(bit * self.block_size_pages + self.first_data_page)
    }

    pub fn release<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        sb: &Superblock,
        block_addr: u32,
    ) -> Result<()> {
        let bit = (block_addr - self.first_data_page) / self.block_size_pages;
        set_bit(&mut self.bitmap, bit);
        if bit < self.cursor {
            self.cursor = bit;
        }
        self.pool_empty = false;
        self.persist(dev, sb)
    }

    /// Overwrite every page of the block with zeroes, so empty index slots
    /// stay distinguishable from valid addresses (spec §4.2).
    pub fn erase_block<D: BlockDevice>(&self, dev: &mut D, block_addr: u32) -> Result<()> {
        let page_size = dev.page_size();
        let zeros = vec![0u8; page_size];
        for p in 0..self.block_size_pages {
            dev.write(block_addr + p, 0, &zeros, block_device::WriteHint::Dirty)
                .map_err(wr)?;
        }
        Ok(())
    }

    pub fn pool_empty(&self) -> bool {
        self.pool_empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::EmbeddedDirEntry;
    use block_device::MemoryBlockDevice;

    fn test_sb() -> Superblock {
        Superblock {
            num_pages: 1000,
            page_size_exp: 9,
            block_size_exp: 3,
            address_size_exp: 1,
            hash_size: 4,
            metadata_entry_size: 32,
            max_file_name_size: 12,
            state_section_size: 1,
            hash_dir: EmbeddedDirEntry::default(),
            meta_dir: EmbeddedDirEntry::default(),
        }
    }

    #[test]
    fn reserve_then_release_is_idempotent_and_pulls_cursor_back() {
        let sb = test_sb();
        let mut dev = MemoryBlockDevice::new(sb.num_pages, sb.page_size());
        let mut alloc = BlockAllocator::new_formatted(&sb, &[0, 1, 2, 3]);
        let a = alloc.reserve(&mut dev, &sb).unwrap();
        let b = alloc.reserve(&mut dev, &sb).unwrap();
        assert!(b > a);
        alloc.release(&mut dev, &sb, a).unwrap();
        // releasing twice must be a no-op success, not an error
        alloc.release(&mut dev, &sb, a).unwrap();
        let c = alloc.reserve(&mut dev, &sb).unwrap();
        assert_eq!(c, a, "released block should be handed out again first");
    }

    #[test]
    fn pool_empty_is_sticky_until_release() {
        let sb = Superblock {
            num_pages: 100,
            ..test_sb()
        };
        let mut dev = MemoryBlockDevice::new(sb.num_pages, sb.page_size());
        let in_use: Vec<u32> = (0..sb.num_blocks()).collect();
        let mut alloc = BlockAllocator::new_formatted(&sb, &in_use);
        assert!(alloc.pool_empty());
        assert!(matches!(alloc.reserve(&mut dev, &sb), Err(FsError::DeviceFull)));
        alloc.release(&mut dev, &sb, sb.first_data_page()).unwrap();
        assert!(!alloc.pool_empty());
        alloc.reserve(&mut dev, &sb).unwrap();
    }

    #[test]
    fn first_free_block_matches_spec_scenario_a() {
        // page_size=512, block_size=8 => 4 system blocks at bits 0..4 in
        // use, first free data block is bit 4 -> block index 5 (spec §9).
        let sb = Superblock {
            num_pages: 1000,
            ..test_sb()
        };
        let mut dev = MemoryBlockDevice::new(sb.num_pages, sb.page_size());
        let mut alloc = BlockAllocator::new_formatted(&sb, &[0, 1, 2, 3]);
        let addr = alloc.reserve(&mut dev, &sb).unwrap();
        let expected = 4 * sb.block_size_pages() as u32 + sb.first_data_page();
        assert_eq!(addr, expected);
    }
}
