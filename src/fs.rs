//! The top-level filesystem object: format, mount, and the per-file
//! operations (open/read/write/flush/close/remove) built on top of the
//! allocator, index tree and directory modules (spec §6.3).

use log::{debug, info, warn};

use block_device::{BlockDevice, WriteHint};

use crate::alloc::BlockAllocator;
use crate::directory::{self, MetadataRecord, HASH_TOMBSTONE, STATUS_DELETED, STATUS_IN_USE};
use crate::error::{er, rd, wr, FsError, Result};
use crate::geometry::{exponent_of_power_of_two, EmbeddedDirEntry, Superblock};
use crate::handle::{FileHandle, SystemSlot, DIRECTORY_SENTINEL};
use crate::hash::{djb2a, fold_to_slot_width};
use crate::index::{self, Location};

const ADDR_EMPTY: u32 = 0;
const ADDR_TOMBSTONE: u32 = 1;

/// Parameters a caller picks at format time; everything else is derived.
#[derive(Debug, Clone)]
pub struct FormatParams {
    pub block_size_pages: usize,
    pub address_size: usize,
    pub hash_size: u8,
    pub max_file_name_size: u16,
    pub metadata_entry_size: Option<u16>,
    /// Pre-erase the whole device before writing the layout (spec §4.1).
    /// A device that fails this step surfaces `FsError::Erase`.
    pub erase_first: bool,
}

pub struct Fs<D: BlockDevice> {
    device: D,
    sb: Superblock,
    allocator: BlockAllocator,
    hash_handle: FileHandle,
    meta_handle: FileHandle,
}

enum LookupOp {
    Find,
    Remove,
}

struct FoundEntry {
    slot: u32,
    record: MetadataRecord,
}

impl<D: BlockDevice> Fs<D> {
    // ---- format / mount -------------------------------------------------

    pub fn format(mut device: D, params: FormatParams) -> Result<Self> {
        let page_size = device.page_size();
        let num_pages = device.num_pages();
        let page_size_exp =
            exponent_of_power_of_two(page_size).expect("device page size must be a power of two");
        let block_size_exp = exponent_of_power_of_two(params.block_size_pages)
            .expect("block_size_pages must be a power of two");
        let address_size_exp = exponent_of_power_of_two(params.address_size)
            .expect("address_size must be a power of two");
        let metadata_entry_size = params
            .metadata_entry_size
            .unwrap_or_else(|| Superblock::metadata_size_floor(params.max_file_name_size));

        let state_section_size = Self::fit_state_section(
            num_pages,
            page_size,
            params.block_size_pages as u32,
            params.address_size as u32,
        );

        let mut sb = Superblock {
            num_pages,
            page_size_exp,
            block_size_exp,
            address_size_exp,
            hash_size: params.hash_size,
            metadata_entry_size,
            max_file_name_size: params.max_file_name_size,
            state_section_size,
            hash_dir: EmbeddedDirEntry::default(),
            meta_dir: EmbeddedDirEntry::default(),
        };

        if params.erase_first {
            let erased = vec![0xFFu8; page_size];
            for p in 0..num_pages {
                device.write(p, 0, &erased, WriteHint::Dirty).map_err(er)?;
            }
        }

        // Zero the info page and the whole state section before anything
        // else touches them.
        let zeros = vec![0u8; page_size];
        for p in 0..=sb.state_section_size {
            device.write(p, 0, &zeros, WriteHint::Dirty).map_err(er)?;
        }

        let block_size_pages = sb.block_size_pages() as u32;
        let first = sb.first_data_page();
        let hash_root = first;
        let hash_data = first + block_size_pages;
        let meta_root = first + 2 * block_size_pages;
        let meta_data = first + 3 * block_size_pages;

        // The four format-time blocks are cleared in the allocator up
        // front; see DESIGN.md for why this is 4 bits, not 5.
        let mut allocator = BlockAllocator::new_formatted(&sb, &[0, 1, 2, 3]);
        for addr in [hash_root, hash_data, meta_root, meta_data] {
            allocator.erase_block(&mut device, addr)?;
        }

        // Wire each system file's root slot 0 to its pre-allocated data
        // block so the first append finds an existing slot, not an empty
        // one (spec §9).
        Self::write_addr_field_raw(&mut device, &sb, hash_root, 0, 0, hash_data)?;
        Self::write_addr_field_raw(&mut device, &sb, meta_root, 0, 0, meta_data)?;

        sb.hash_dir = EmbeddedDirEntry {
            eof_page: 0,
            eof_byte: 0,
            root_index_block: hash_root,
        };
        sb.meta_dir = EmbeddedDirEntry {
            eof_page: 0,
            eof_byte: 0,
            root_index_block: meta_root,
        };
        sb.write_to(&mut device)?;
        allocator.persist(&mut device, &sb)?;

        info!(
            "formatted device: {num_pages} pages of {page_size} bytes, block_size={}, {} data blocks",
            sb.block_size_pages(),
            sb.num_blocks()
        );

        let hash_handle = FileHandle::new_system(hash_root, 0, 0, SystemSlot::Hash);
        let meta_handle = FileHandle::new_system(meta_root, 0, 0, SystemSlot::Meta);

        Ok(Self {
            device,
            sb,
            allocator,
            hash_handle,
            meta_handle,
        })
    }

    /// Grow the state section (in pages) until its bitmap has enough bits
    /// for every block that would remain after it. Converges in a handful
    /// of iterations since growing the section only ever shrinks the block
    /// count by a little.
    fn fit_state_section(num_pages: u32, page_size: usize, block_size_pages: u32, _addr: u32) -> u32 {
        let mut state_section_size = 1u32;
        loop {
            let first_data_page = 1 + state_section_size;
            let data_pages = num_pages.saturating_sub(first_data_page);
            let num_blocks = data_pages / block_size_pages;
            let required_bits = num_blocks.max(1);
            let required_bytes = required_bits.div_ceil(8);
            let required_pages = (required_bytes as usize).div_ceil(page_size) as u32;
            if required_pages <= state_section_size {
                return state_section_size;
            }
            state_section_size = required_pages;
        }
    }

    pub fn mount(mut device: D) -> Result<Self> {
        let sb = Superblock::read_from(&mut device)?;
        let allocator = BlockAllocator::load(&mut device, &sb)?;
        let mut hash_handle = FileHandle::new_system(
            sb.hash_dir.root_index_block,
            sb.hash_dir.eof_page,
            sb.hash_dir.eof_byte,
            SystemSlot::Hash,
        );
        let mut meta_handle = FileHandle::new_system(
            sb.meta_dir.root_index_block,
            sb.meta_dir.eof_page,
            sb.meta_dir.eof_byte,
            SystemSlot::Meta,
        );
        hash_handle.promoted = index::needs_promotion(&sb, hash_handle.eof_page as u64);
        meta_handle.promoted = index::needs_promotion(&sb, meta_handle.eof_page as u64);
        debug!(
            "mounted device: {} pages, hash eof={}/{}, meta eof={}/{}",
            sb.num_pages, sb.hash_dir.eof_page, sb.hash_dir.eof_byte, sb.meta_dir.eof_page, sb.meta_dir.eof_byte
        );
        Ok(Self {
            device,
            sb,
            allocator,
            hash_handle,
            meta_handle,
        })
    }

    // ---- raw address-field I/O ------------------------------------------

    fn addr_field_width(&self) -> usize {
        self.sb.address_size()
    }

    fn read_addr_field(&mut self, block_addr: u32, page_in_block: usize, byte_in_block: usize) -> Result<u32> {
        let mut buf = vec![0u8; self.addr_field_width()];
        self.device
            .read(block_addr + page_in_block as u32, byte_in_block, &mut buf)
            .map_err(rd)?;
        Ok(Self::decode_addr(&buf))
    }

    fn write_addr_field(
        &mut self,
        block_addr: u32,
        page_in_block: usize,
        byte_in_block: usize,
        value: u32,
        hint: WriteHint,
    ) -> Result<()> {
        Self::write_addr_field_with(&mut self.device, &self.sb, block_addr, page_in_block, byte_in_block, value, hint)
    }

    fn write_addr_field_raw(
        device: &mut D,
        sb: &Superblock,
        block_addr: u32,
        page_in_block: usize,
        byte_in_block: usize,
        value: u32,
    ) -> Result<()> {
        Self::write_addr_field_with(device, sb, block_addr, page_in_block, byte_in_block, value, WriteHint::Dirty)
    }

    fn write_addr_field_with(
        device: &mut D,
        sb: &Superblock,
        block_addr: u32,
        page_in_block: usize,
        byte_in_block: usize,
        value: u32,
        hint: WriteHint,
    ) -> Result<()> {
        let width = sb.address_size();
        let bytes = Self::encode_addr(value, width);
        device
            .write(block_addr + page_in_block as u32, byte_in_block, &bytes, hint)
            .map_err(wr)
    }

    fn encode_addr(value: u32, width: usize) -> Vec<u8> {
        match width {
            2 => (value as u16).to_le_bytes().to_vec(),
            4 => value.to_le_bytes().to_vec(),
            other => panic!("unsupported address_size {other}"),
        }
    }

    fn decode_addr(buf: &[u8]) -> u32 {
        match buf.len() {
            2 => u16::from_le_bytes(buf[0..2].try_into().unwrap()) as u32,
            4 => u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            other => panic!("unsupported address_size {other}"),
        }
    }

    // ---- index tree walk --------------------------------------------------

    /// Turn a promoted tree's root slot into a concrete child block address,
    /// reserving a fresh child block on write if the slot is still empty.
    fn resolve_child_block(&mut self, handle: &mut FileHandle, loc: &Location, for_write: bool) -> Result<(u32, bool)> {
        let Some((root_page, root_byte)) = loc.root_slot else {
            return Ok((handle.root_index_block, false));
        };
        let child_idx_cached = handle.cached_child_idx == Some(Self::slot_index(&self.sb, root_page, root_byte));
        if child_idx_cached {
            return Ok((handle.child_index_block, false));
        }
        let existing = self.read_addr_field(handle.root_index_block, root_page, root_byte)?;
        if existing != ADDR_EMPTY && existing != ADDR_TOMBSTONE {
            handle.child_index_block = existing;
            handle.cached_child_idx = Some(Self::slot_index(&self.sb, root_page, root_byte));
            return Ok((existing, false));
        }
        if !for_write {
            return Err(FsError::UnreleasedBlock);
        }
        let fresh = self.allocator.reserve(&mut self.device, &self.sb)?;
        self.allocator.erase_block(&mut self.device, fresh)?;
        self.write_addr_field(handle.root_index_block, root_page, root_byte, fresh, WriteHint::Normal)?;
        handle.child_index_block = fresh;
        handle.cached_child_idx = Some(Self::slot_index(&self.sb, root_page, root_byte));
        Ok((fresh, true))
    }

    fn slot_index(sb: &Superblock, page_in_block: usize, byte_in_block: usize) -> u64 {
        let per_page = (sb.page_size() / sb.address_size()) as u64;
        page_in_block as u64 * per_page + (byte_in_block / sb.address_size()) as u64
    }

    /// Resolve page `p` of `handle` to a device data-block address. On the
    /// write path, allocates and links fresh child/data blocks as needed.
    fn walk(&mut self, handle: &mut FileHandle, p: u64, for_write: bool) -> Result<(u32, bool)> {
        if for_write && !handle.promoted && index::needs_promotion(&self.sb, p) {
            self.promote_tree(handle)?;
        }
        let loc = index::locate(&self.sb, p, handle.promoted)?;
        let (child_block, _child_fresh) = self.resolve_child_block(handle, &loc, for_write)?;

        let block_slot = Self::slot_index(&self.sb, loc.child_slot.0, loc.child_slot.1);
        if handle.cached_block_in_child == Some(block_slot) && handle.data_block != 0 {
            return Ok((handle.data_block, false));
        }
        let existing = self.read_addr_field(child_block, loc.child_slot.0, loc.child_slot.1)?;
        if existing != ADDR_EMPTY && existing != ADDR_TOMBSTONE {
            handle.data_block = existing;
            handle.cached_block_in_child = Some(block_slot);
            return Ok((existing, false));
        }
        if !for_write {
            return Err(FsError::UnreleasedBlock);
        }
        let fresh = self.allocator.reserve(&mut self.device, &self.sb)?;
        self.write_addr_field(child_block, loc.child_slot.0, loc.child_slot.1, fresh, WriteHint::Normal)?;
        handle.data_block = fresh;
        handle.cached_block_in_child = Some(block_slot);
        Ok((fresh, true))
    }

    fn promote_tree(&mut self, handle: &mut FileHandle) -> Result<()> {
        let new_root = self.allocator.reserve(&mut self.device, &self.sb)?;
        self.allocator.erase_block(&mut self.device, new_root)?;
        self.write_addr_field(new_root, 0, 0, handle.root_index_block, WriteHint::Normal)?;
        handle.child_index_block = handle.root_index_block;
        handle.cached_child_idx = Some(0);
        handle.root_index_block = new_root;
        handle.promoted = true;
        self.persist_root_index_block(handle)
    }

    /// Persist the two system files' EOF/root fields from their in-RAM
    /// handles into the superblock and force durability. The hash-entries
    /// and metadata-entries files are always "open" (there is no explicit
    /// open/close for them), so whenever one of them grows — a new
    /// directory slot appended, a slot tombstoned — this is the system-file
    /// analogue of spec §4.5's per-file `flush`, called at the points the
    /// spec itself says `open`/`remove` flush.
    fn sync_system_dirs(&mut self) -> Result<()> {
        self.sb.hash_dir = EmbeddedDirEntry {
            eof_page: self.hash_handle.eof_page,
            eof_byte: self.hash_handle.eof_byte,
            root_index_block: self.hash_handle.root_index_block,
        };
        self.sb.meta_dir = EmbeddedDirEntry {
            eof_page: self.meta_handle.eof_page,
            eof_byte: self.meta_handle.eof_byte,
            root_index_block: self.meta_handle.root_index_block,
        };
        self.sb.write_to(&mut self.device)?;
        self.hash_handle.mark_consistent();
        self.meta_handle.mark_consistent();
        self.device.flush().map_err(wr)
    }

    fn persist_root_index_block(&mut self, handle: &FileHandle) -> Result<()> {
        match handle.system {
            Some(SystemSlot::Hash) => {
                self.sb.hash_dir.root_index_block = handle.root_index_block;
                self.sb.write_to(&mut self.device)
            }
            Some(SystemSlot::Meta) => {
                self.sb.meta_dir.root_index_block = handle.root_index_block;
                self.sb.write_to(&mut self.device)
            }
            None => {
                let byte_offset = handle.directory_slot as u64 * self.sb.metadata_entry_size as u64 + 7;
                let bytes = handle.root_index_block.to_le_bytes();
                self.write_meta_bytes_raw(byte_offset, &bytes)
            }
        }
    }

    // ---- generic multi-page byte access (used by directory scanning) ----

    fn read_logical_bytes(&mut self, handle: &mut FileHandle, byte_offset: u64, buf: &mut [u8]) -> Result<()> {
        let page_size = self.sb.page_size() as u64;
        let mut remaining = buf.len();
        let mut done = 0usize;
        let mut off = byte_offset;
        while remaining > 0 {
            let page = off / page_size;
            let in_page = (off % page_size) as usize;
            let chunk = remaining.min(page_size as usize - in_page);
            let (block, _) = self.walk(handle, page, false)?;
            let data_page = block + (page % self.sb.block_size_pages() as u64) as u32;
            self.device
                .read(data_page, in_page, &mut buf[done..done + chunk])
                .map_err(rd)?;
            done += chunk;
            remaining -= chunk;
            off += chunk as u64;
        }
        Ok(())
    }

    fn write_logical_bytes(&mut self, handle: &mut FileHandle, byte_offset: u64, buf: &[u8]) -> Result<()> {
        let page_size = self.sb.page_size() as u64;
        let mut remaining = buf.len();
        let mut done = 0usize;
        let mut off = byte_offset;
        while remaining > 0 {
            let page = off / page_size;
            let in_page = (off % page_size) as usize;
            let chunk = remaining.min(page_size as usize - in_page);
            let (block, fresh) = self.walk(handle, page, true)?;
            let data_page = block + (page % self.sb.block_size_pages() as u64) as u32;
            let hint = if fresh { WriteHint::Dirty } else { WriteHint::Normal };
            self.device
                .write(data_page, in_page, &buf[done..done + chunk], hint)
                .map_err(wr)?;
            let end_byte = off + chunk as u64;
            let end_page = end_byte / page_size;
            let end_in_page = (end_byte % page_size) as u16;
            if end_page as u32 > handle.eof_page || (end_page as u32 == handle.eof_page && end_in_page > handle.eof_byte) {
                handle.eof_page = end_page as u32;
                handle.eof_byte = end_in_page;
                handle.mark_mutating();
            }
            done += chunk;
            remaining -= chunk;
            off += chunk as u64;
        }
        Ok(())
    }

    fn write_meta_bytes_raw(&mut self, byte_offset: u64, buf: &[u8]) -> Result<()> {
        let mut meta_handle = self.meta_handle.clone();
        self.write_logical_bytes(&mut meta_handle, byte_offset, buf)?;
        self.meta_handle = meta_handle;
        Ok(())
    }

    // ---- directory ---------------------------------------------------------

    fn encoded_name(&self, name: &[u8]) -> Result<Vec<u8>> {
        if name.len() > self.sb.max_file_name_size as usize {
            return Err(FsError::FileNameTooLong);
        }
        Ok(name.to_vec())
    }

    fn hash_slot_count(&self) -> u64 {
        let total_bytes =
            self.hash_handle.eof_page as u64 * self.sb.page_size() as u64 + self.hash_handle.eof_byte as u64;
        total_bytes / self.sb.hash_size as u64
    }

    /// Name resolution (spec §4.4). Scans the hash file in parallel with the
    /// metadata file, remembering the first tombstoned slot seen so `open`
    /// can reuse it instead of always appending at EOF.
    fn lookup(&mut self, name: &[u8], op: LookupOp) -> Result<(Option<FoundEntry>, Option<u32>)> {
        let name = self.encoded_name(name)?;
        let target = fold_to_slot_width(djb2a(&name), self.sb.hash_size);
        let hash_size = self.sb.hash_size as u64;
        let entry_size = self.sb.metadata_entry_size as u64;
        let max_name = self.sb.max_file_name_size;
        let slots = self.hash_slot_count();
        let mut first_tombstone: Option<u32> = None;

        for slot in 0..slots {
            let mut hash_buf = vec![0u8; self.sb.hash_size as usize];
            let mut hash_handle = self.hash_handle.clone();
            self.read_logical_bytes(&mut hash_handle, slot * hash_size, &mut hash_buf)?;
            self.hash_handle = hash_handle;
            let stored_hash = directory::decode_hash_slot(&hash_buf, self.sb.hash_size);
            if stored_hash == HASH_TOMBSTONE {
                if first_tombstone.is_none() {
                    first_tombstone = Some(slot as u32);
                }
                continue;
            }
            if stored_hash != target {
                continue;
            }
            let mut rec_buf = vec![0u8; entry_size as usize];
            let mut meta_handle = self.meta_handle.clone();
            self.read_logical_bytes(&mut meta_handle, slot * entry_size, &mut rec_buf)?;
            self.meta_handle = meta_handle;
            let record = MetadataRecord::decode(&rec_buf, max_name);
            if record.status != STATUS_IN_USE || !directory::names_match(&record.name, &name) {
                continue;
            }
            if let LookupOp::Remove = op {
                self.tombstone_slot(slot as u32, &record)?;
            }
            return Ok((
                Some(FoundEntry {
                    slot: slot as u32,
                    record,
                }),
                first_tombstone,
            ));
        }
        Ok((None, first_tombstone))
    }

    fn tombstone_slot(&mut self, slot: u32, _record: &MetadataRecord) -> Result<()> {
        let hash_size = self.sb.hash_size as u64;
        let entry_size = self.sb.metadata_entry_size as u64;
        let tomb_hash = directory::encode_hash_slot(HASH_TOMBSTONE, self.sb.hash_size);
        self.write_meta_bytes_raw(slot as u64 * entry_size, &[STATUS_DELETED])?;
        let mut hash_handle = self.hash_handle.clone();
        self.write_logical_bytes(&mut hash_handle, slot as u64 * hash_size, &tomb_hash)?;
        self.hash_handle = hash_handle;
        Ok(())
    }

    /// Create a brand-new file's directory entry (spec §4.5 "On `NewFile`").
    /// Zeroes the status first, reserves the root/child block and the first
    /// data block, then writes the name and finally flips status to in-use
    /// so a crash mid-create never leaves a half-written entry looking live.
    fn append_entry(&mut self, name: &[u8], slot: u32) -> Result<(u32, MetadataRecord)> {
        let name = self.encoded_name(name)?;
        let hash = fold_to_slot_width(djb2a(&name), self.sb.hash_size);
        let entry_size = self.sb.metadata_entry_size as u64;
        let max_name = self.sb.max_file_name_size;

        let empty = MetadataRecord {
            status: 0,
            eof_page: 0,
            eof_byte: 0,
            root_index_block: ADDR_EMPTY,
            name: name.clone(),
        };
        let rec_bytes = empty.encode(self.sb.metadata_entry_size, max_name);
        let mut meta_handle = self.meta_handle.clone();
        self.write_logical_bytes(&mut meta_handle, slot as u64 * entry_size, &rec_bytes)?;
        self.meta_handle = meta_handle;

        let root = self.allocator.reserve(&mut self.device, &self.sb)?;
        self.allocator.erase_block(&mut self.device, root)?;
        let data = self.allocator.reserve(&mut self.device, &self.sb)?;
        self.write_addr_field(root, 0, 0, data, WriteHint::Normal)?;

        let root_bytes = root.to_le_bytes();
        let mut meta_handle = self.meta_handle.clone();
        self.write_logical_bytes(&mut meta_handle, slot as u64 * entry_size + 7, &root_bytes)?;
        self.meta_handle = meta_handle;

        let status_byte = [STATUS_IN_USE];
        let mut meta_handle = self.meta_handle.clone();
        self.write_logical_bytes(&mut meta_handle, slot as u64 * entry_size, &status_byte)?;
        self.meta_handle = meta_handle;

        let hash_bytes = directory::encode_hash_slot(hash, self.sb.hash_size);
        let mut hash_handle = self.hash_handle.clone();
        self.write_logical_bytes(&mut hash_handle, slot as u64 * self.sb.hash_size as u64, &hash_bytes)?;
        self.hash_handle = hash_handle;

        let record = MetadataRecord {
            status: STATUS_IN_USE,
            eof_page: 0,
            eof_byte: 0,
            root_index_block: root,
            name,
        };
        Ok((slot, record))
    }

    // ---- public file API (spec §6.3) ---------------------------------------

    pub fn exists(&mut self, name: &[u8]) -> Result<bool> {
        Ok(self.lookup(name, LookupOp::Find)?.0.is_some())
    }

    pub fn open(&mut self, name: &[u8]) -> Result<FileHandle> {
        let (found, first_tombstone) = self.lookup(name, LookupOp::Find)?;
        let (slot, record) = match found {
            Some(f) => (f.slot, f.record),
            None => {
                let target_slot = first_tombstone.unwrap_or_else(|| self.hash_slot_count() as u32);
                if first_tombstone.is_some() {
                    debug!("reusing tombstoned directory slot {target_slot}");
                }
                let created = self.append_entry(name, target_slot)?;
                // spec §4.5 "On NewFile: ... Flushes" — the hash/metadata
                // system files may have just grown past their last
                // persisted EOF, so the superblock's embedded directory
                // entries for them need to follow.
                self.sync_system_dirs()?;
                created
            }
        };
        let mut handle = FileHandle::new(record.root_index_block, record.eof_page, record.eof_byte, slot);
        handle.promoted = index::needs_promotion(&self.sb, handle.eof_page as u64);
        Ok(handle)
    }

    pub fn remove(&mut self, name: &[u8]) -> Result<()> {
        let found = match self.lookup(name, LookupOp::Find)?.0 {
            Some(f) => f,
            None => return Err(FsError::FileNotFound),
        };
        let mut handle = FileHandle::new(
            found.record.root_index_block,
            found.record.eof_page,
            found.record.eof_byte,
            found.slot,
        );
        handle.promoted = index::needs_promotion(&self.sb, handle.eof_page as u64);
        self.release_all_blocks(&mut handle)?;
        self.lookup(name, LookupOp::Remove)?;
        // spec §4.5 `remove`: "... Flush." The hash slot and the metadata
        // status byte were just written; no directory EOF changed, but the
        // bitmap and those bytes still need to reach the device.
        self.device.flush().map_err(wr)
    }

    /// Release every block an in-use file's index tree references, in order:
    /// data blocks, then child blocks, then the root if promoted (spec
    /// §4.5 `remove`).
    fn release_all_blocks(&mut self, handle: &mut FileHandle) -> Result<()> {
        let addrs_per_page = (self.sb.page_size() / self.sb.address_size()) as u64;
        if !handle.promoted {
            let num_data_blocks = self.sb.addrs_per_block() as u64;
            for slot in 0..num_data_blocks {
                let page_in_block = (slot / addrs_per_page) as usize;
                let byte_in_block = ((slot % addrs_per_page) as usize) * self.sb.address_size();
                let addr = self.read_addr_field(handle.root_index_block, page_in_block, byte_in_block)?;
                if addr != ADDR_EMPTY && addr != ADDR_TOMBSTONE {
                    self.allocator.release(&mut self.device, &self.sb, addr)?;
                }
            }
            self.allocator
                .release(&mut self.device, &self.sb, handle.root_index_block)?;
            return Ok(());
        }

        let children_per_root = addrs_per_page * self.sb.block_size_pages() as u64;
        let num_data_blocks = self.sb.addrs_per_block() as u64;
        for c in 0..children_per_root {
            let page_in_root = (c / addrs_per_page) as usize;
            let byte_in_root = ((c % addrs_per_page) as usize) * self.sb.address_size();
            let child = self.read_addr_field(handle.root_index_block, page_in_root, byte_in_root)?;
            if child == ADDR_EMPTY || child == ADDR_TOMBSTONE {
                continue;
            }
            for slot in 0..num_data_blocks {
                let page_in_block = (slot / addrs_per_page) as usize;
                let byte_in_block = ((slot % addrs_per_page) as usize) * self.sb.address_size();
                let addr = self.read_addr_field(child, page_in_block, byte_in_block)?;
                if addr != ADDR_EMPTY && addr != ADDR_TOMBSTONE {
                    self.allocator.release(&mut self.device, &self.sb, addr)?;
                }
            }
            self.allocator.release(&mut self.device, &self.sb, child)?;
        }
        self.allocator
            .release(&mut self.device, &self.sb, handle.root_index_block)?;
        Ok(())
    }

    pub fn read(&mut self, handle: &mut FileHandle, page: u32, buf: &mut [u8], off: usize) -> Result<()> {
        if off + buf.len() > self.sb.page_size() {
            return Err(FsError::Eof);
        }
        if page > handle.eof_page || (page == handle.eof_page && off + buf.len() > handle.eof_byte as usize) {
            return Err(FsError::Eof);
        }
        let (block, _) = self.walk(handle, page as u64, false)?;
        let data_page = block + page % self.sb.block_size_pages() as u32;
        self.device.read(data_page, off, buf).map_err(rd)
    }

    pub fn write(&mut self, handle: &mut FileHandle, page: u32, data: &[u8], off: usize) -> Result<()> {
        if off + data.len() > self.sb.page_size() {
            return Err(FsError::WritePastEnd);
        }
        if page > handle.eof_page || (page == handle.eof_page && off > handle.eof_byte as usize) {
            return Err(FsError::WritePastEnd);
        }
        let byte_offset = page as u64 * self.sb.page_size() as u64 + off as u64;
        self.write_logical_bytes(handle, byte_offset, data)
    }

    pub fn flush(&mut self, handle: &mut FileHandle) -> Result<()> {
        self.device.flush().map_err(wr)?;
        if !handle.is_file_size_consistent() {
            match handle.system {
                Some(SystemSlot::Hash) => {
                    self.sb.hash_dir.eof_page = handle.eof_page;
                    self.sb.hash_dir.eof_byte = handle.eof_byte;
                    self.sb.hash_dir.root_index_block = handle.root_index_block;
                    self.sb.write_to(&mut self.device)?;
                }
                Some(SystemSlot::Meta) => {
                    self.sb.meta_dir.eof_page = handle.eof_page;
                    self.sb.meta_dir.eof_byte = handle.eof_byte;
                    self.sb.meta_dir.root_index_block = handle.root_index_block;
                    self.sb.write_to(&mut self.device)?;
                }
                None => {
                    if handle.directory_slot == DIRECTORY_SENTINEL {
                        return Err(FsError::FileNotFound);
                    }
                    let entry_size = self.sb.metadata_entry_size as u64;
                    let base = handle.directory_slot as u64 * entry_size;
                    let mut eof_bytes = [0u8; 6];
                    eof_bytes[0..4].copy_from_slice(&handle.eof_page.to_le_bytes());
                    eof_bytes[4..6].copy_from_slice(&handle.eof_byte.to_le_bytes());
                    self.write_meta_bytes_raw(base + 1, &eof_bytes)?;
                    let root_bytes = handle.root_index_block.to_le_bytes();
                    self.write_meta_bytes_raw(base + 7, &root_bytes)?;
                }
            }
            handle.mark_consistent();
        }
        Ok(())
    }

    pub fn close(&mut self, handle: &mut FileHandle) -> Result<()> {
        self.flush(handle)
    }

    pub fn release_block(&mut self, handle: &mut FileHandle, page: u32) -> Result<()> {
        let loc = index::locate(&self.sb, page as u64, handle.promoted)?;
        let (child_block, _) = self.resolve_child_block(handle, &loc, false)?;
        let addr = self.read_addr_field(child_block, loc.child_slot.0, loc.child_slot.1)?;
        if addr == ADDR_EMPTY || addr == ADDR_TOMBSTONE {
            return Err(FsError::UnreleasedBlock);
        }
        self.allocator.release(&mut self.device, &self.sb, addr)?;
        self.write_addr_field(child_block, loc.child_slot.0, loc.child_slot.1, ADDR_TOMBSTONE, WriteHint::Normal)?;
        if handle.data_block == addr {
            handle.data_block = 0;
            handle.cached_block_in_child = None;
        }

        // spec §4.3: "If the child block becomes entirely tombstoned/empty,
        // the child is itself released and tombstoned in the root." Only
        // applies to a promoted tree — a degenerate tree's root IS the
        // child, and releasing it here would delete the file's only index
        // block out from under an open handle.
        if let Some((root_page, root_byte)) = loc.root_slot {
            if self.child_block_is_empty(child_block)? {
                self.allocator.release(&mut self.device, &self.sb, child_block)?;
                self.write_addr_field(handle.root_index_block, root_page, root_byte, ADDR_TOMBSTONE, WriteHint::Normal)?;
                if handle.child_index_block == child_block {
                    handle.child_index_block = 0;
                    handle.cached_child_idx = None;
                }
            }
        }
        Ok(())
    }

    /// Whether every data-block slot in `child_block` is empty or
    /// tombstoned, i.e. the child index block holds no live data blocks.
    fn child_block_is_empty(&mut self, child_block: u32) -> Result<bool> {
        let addrs_per_page = (self.sb.page_size() / self.sb.address_size()) as u64;
        let num_data_blocks = self.sb.addrs_per_block() as u64;
        for slot in 0..num_data_blocks {
            let page_in_block = (slot / addrs_per_page) as usize;
            let byte_in_block = ((slot % addrs_per_page) as usize) * self.sb.address_size();
            let addr = self.read_addr_field(child_block, page_in_block, byte_in_block)?;
            if addr != ADDR_EMPTY && addr != ADDR_TOMBSTONE {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Reclaim the underlying device, e.g. to simulate a power-cycle by
    /// handing the same device back into `mount` without a real remount.
    pub fn into_device(self) -> D {
        self.device
    }

    /// List every in-use file name. Not part of the core spec (there is no
    /// on-disk free list of names, just the hash/metadata slot arrays), but
    /// a thin scan over the metadata file is enough for the CLI's `ls`.
    pub fn list(&mut self) -> Result<Vec<Vec<u8>>> {
        let entry_size = self.sb.metadata_entry_size as u64;
        let max_name = self.sb.max_file_name_size;
        let slots = self.hash_slot_count();
        let mut names = Vec::new();
        for slot in 0..slots {
            let mut rec_buf = vec![0u8; entry_size as usize];
            let mut meta_handle = self.meta_handle.clone();
            self.read_logical_bytes(&mut meta_handle, slot * entry_size, &mut rec_buf)?;
            self.meta_handle = meta_handle;
            let record = MetadataRecord::decode(&rec_buf, max_name);
            if record.status == STATUS_IN_USE {
                names.push(record.name);
            }
        }
        Ok(names)
    }
}
