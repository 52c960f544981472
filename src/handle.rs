//! Open-file state and the Fresh → Mutating → Consistent size state machine
//! (spec §4.6).

/// Sentinel `directory_page` meaning "this handle's entry is one of the two
/// embedded system directory entries in the superblock, not a slot in the
/// metadata-entries file".
pub const DIRECTORY_SENTINEL: u32 = 0xFFFF_FFFF;

/// Which embedded superblock slot a system-file handle's directory entry
/// lives in, for handles with `directory_slot == DIRECTORY_SENTINEL`
/// (spec §3.6, §4.5 "directly to the superblock").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemSlot {
    Hash,
    Meta,
}

/// Tracks whether `eof_page`/`eof_byte` on this handle are known to match
/// what's durable in the directory entry.
///
/// - `Fresh`: just opened; the cached EOF came straight from the directory
///   and is trustworthy.
/// - `Mutating`: at least one write has extended EOF since the last flush;
///   the directory entry is stale until the next `flush`/`close`.
/// - `Consistent`: EOF has just been written back to the directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeState {
    Fresh,
    Mutating,
    Consistent,
}

impl SizeState {
    pub fn is_consistent(self) -> bool {
        matches!(self, SizeState::Consistent)
    }
}

/// An open file. One of these is also kept internally, process-wide, for
/// each of the two system files (hash-entries, metadata-entries).
#[derive(Debug, Clone)]
pub struct FileHandle {
    /// Device address of the tree's root index block. Equal to
    /// `child_index_block` until the tree is promoted past the degenerate
    /// threshold (spec §3.4).
    pub root_index_block: u32,
    /// Whether the tree has been promoted to two levels.
    pub promoted: bool,

    /// Device address of the child index block last walked to, and which
    /// child-slot (`child_idx`) it corresponds to — `None` until the first
    /// walk. Avoids re-reading the root block on every sequential page
    /// access.
    pub child_index_block: u32,
    pub cached_child_idx: Option<u64>,

    /// Device address of the data block last walked to, and which
    /// block-in-child slot it corresponds to.
    pub data_block: u32,
    pub cached_block_in_child: Option<u64>,

    /// Slot index of this file's entry in the metadata-entries file, or
    /// `DIRECTORY_SENTINEL` for the two embedded system file entries (whose
    /// entries live in the superblock instead).
    pub directory_slot: u32,

    /// `Some` only for the two process-wide system file handles; tells
    /// `Fs::flush`/`persist_root_index_block` to write into the superblock's
    /// embedded directory entry rather than a metadata-entries slot.
    pub system: Option<SystemSlot>,

    pub eof_page: u32,
    pub eof_byte: u16,
    pub size_state: SizeState,
}

impl FileHandle {
    pub fn new(root_index_block: u32, eof_page: u32, eof_byte: u16, directory_slot: u32) -> Self {
        Self {
            root_index_block,
            promoted: false,
            child_index_block: root_index_block,
            cached_child_idx: None,
            data_block: 0,
            cached_block_in_child: None,
            directory_slot,
            system: None,
            eof_page,
            eof_byte,
            size_state: SizeState::Fresh,
        }
    }

    pub fn new_system(root_index_block: u32, eof_page: u32, eof_byte: u16, system: SystemSlot) -> Self {
        let mut h = Self::new(root_index_block, eof_page, eof_byte, DIRECTORY_SENTINEL);
        h.system = Some(system);
        h
    }

    pub fn is_file_size_consistent(&self) -> bool {
        self.size_state.is_consistent()
    }

    pub fn mark_mutating(&mut self) {
        self.size_state = SizeState::Mutating;
    }

    pub fn mark_consistent(&mut self) {
        self.size_state = SizeState::Consistent;
    }

    /// The file's current length in pages, rounding up for a partial last
    /// page (spec §4.5: `eof_byte > 0` means the page at `eof_page` holds
    /// live data too).
    pub fn page_count(&self) -> u32 {
        if self.eof_byte == 0 {
            self.eof_page
        } else {
            self.eof_page + 1
        }
    }
}
