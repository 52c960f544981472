//! Per-file two-level index tree address mapping (spec §4.3).
//!
//! These are pure functions of the geometry and a logical file page address;
//! they know nothing about the device or the allocator. `Fs` walks the tree
//! by combining these with its own block I/O.

use crate::error::{FsError, Result};
use crate::geometry::Superblock;

/// Addresses held per root/child index page: `page_size / address_size`.
fn addrs_per_page(sb: &Superblock) -> u64 {
    (sb.page_size() / sb.address_size()) as u64
}

/// Where, within an index block, the address for `slot` (0-based, counting
/// addresses across the whole block) lives.
fn slot_location(sb: &Superblock, slot: u64) -> (usize, usize) {
    let per_page = addrs_per_page(sb);
    let page_in_block = (slot / per_page) as usize;
    let byte_in_page = ((slot % per_page) as usize) * sb.address_size();
    (page_in_block, byte_in_page)
}

/// The page-address threshold above which a child index slot no longer
/// fits a degenerate (root-is-child) tree.
pub fn needs_promotion(sb: &Superblock, eof_page: u64) -> bool {
    eof_page >= sb.degenerate_capacity_pages()
}

/// Resolved position of the address for logical file page `p`.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    /// `None` for a degenerate tree (the root block doubles as the child
    /// block); `Some((page, byte))` for a promoted tree.
    pub root_slot: Option<(usize, usize)>,
    /// Where, inside the child block (or the root-as-child block), the
    /// data-block address lives.
    pub child_slot: (usize, usize),
    /// Page offset of `p` within its data block.
    pub data_block_offset: u64,
}

/// Compute the tree location for file page `p`. `promoted` reflects the
/// file's current tree shape (spec §3.4): pass `false` until the file's EOF
/// has crossed `needs_promotion`'s threshold, `true` after.
pub fn locate(sb: &Superblock, p: u64, promoted: bool) -> Result<Location> {
    let addrs_per_block = sb.addrs_per_block() as u64;
    let block_size_pages = sb.block_size_pages() as u64;
    let data_block_offset = p % block_size_pages;

    if !promoted {
        let block_in_child = p / block_size_pages;
        if block_in_child >= addrs_per_block {
            return Err(FsError::FileFull);
        }
        let child_slot = slot_location(sb, block_in_child);
        return Ok(Location {
            root_slot: None,
            child_slot,
            data_block_offset,
        });
    }

    let child_idx = p / (block_size_pages * addrs_per_block);
    let (root_page, root_byte) = slot_location(sb, child_idx);
    if root_page >= sb.block_size_pages() {
        return Err(FsError::FileFull);
    }
    let block_in_child = (p / block_size_pages) % addrs_per_block;
    let child_slot = slot_location(sb, block_in_child);
    Ok(Location {
        root_slot: Some((root_page, root_byte)),
        child_slot,
        data_block_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::EmbeddedDirEntry;

    fn test_sb() -> Superblock {
        Superblock {
            num_pages: 1_000_000,
            page_size_exp: 9,  // 512
            block_size_exp: 3, // 8 pages/block
            address_size_exp: 1, // 2 bytes
            hash_size: 4,
            metadata_entry_size: 32,
            max_file_name_size: 12,
            state_section_size: 1,
            hash_dir: EmbeddedDirEntry::default(),
            meta_dir: EmbeddedDirEntry::default(),
        }
    }

    #[test]
    fn degenerate_first_page_maps_to_slot_zero() {
        let sb = test_sb();
        let loc = locate(&sb, 0, false).unwrap();
        assert!(loc.root_slot.is_none());
        assert_eq!(loc.child_slot, (0, 0));
        assert_eq!(loc.data_block_offset, 0);
    }

    #[test]
    fn promotion_threshold_matches_scenario_d() {
        let sb = test_sb();
        assert_eq!(sb.degenerate_capacity_pages(), 16384);
        assert!(!needs_promotion(&sb, 16383));
        assert!(needs_promotion(&sb, 16384));
    }

    #[test]
    fn promoted_tree_resolves_second_child() {
        let sb = test_sb();
        // addrs_per_block = 512*8/2 = 2048, degenerate capacity = 2048*8=16384
        let p = 16384; // first page of the second child block
        let loc = locate(&sb, p, true).unwrap();
        assert_eq!(loc.root_slot, Some((0, 2))); // child_idx=1, addr_size=2
        assert_eq!(loc.child_slot, (0, 0));
        assert_eq!(loc.data_block_offset, 0);
    }

    #[test]
    fn file_full_when_root_overflows() {
        let sb = test_sb();
        let addrs_per_block = sb.addrs_per_block() as u64;
        let block_size_pages = sb.block_size_pages() as u64;
        // child_idx must stay below addrs_per_block (root has one page per
        // addrs_per_page(sb) children, and block_size_pages pages total).
        let max_child_idx = sb.block_size_pages() as u64 * addrs_per_page(&sb);
        let overflowing_p = max_child_idx * block_size_pages * addrs_per_block;
        assert!(matches!(
            locate(&sb, overflowing_p, true),
            Err(FsError::FileFull)
        ));
    }
}
