//! Directory record layout: the hash-entries and metadata-entries "system
//! files" are plain flat files addressed through the same index tree as any
//! other file (spec §3.4, §4.4). This module only knows how to encode and
//! decode their slots; `Fs` does the actual file I/O and slot scanning.

/// Metadata record status byte.
pub const STATUS_DELETED: u8 = 1;
pub const STATUS_IN_USE: u8 = 2;

/// A hash-entries slot holding this value means "deleted" — djb2a's 0→1
/// fold (see `hash.rs`) guarantees no live name ever hashes to 0, so the
/// value doubles as an unambiguous tombstone with no separate bit needed.
pub const HASH_TOMBSTONE: u32 = 0;

pub fn encode_hash_slot(hash: u32, hash_size: u8) -> Vec<u8> {
    match hash_size {
        2 => (hash as u16).to_le_bytes().to_vec(),
        4 => hash.to_le_bytes().to_vec(),
        other => panic!("unsupported hash_size {other}"),
    }
}

pub fn decode_hash_slot(buf: &[u8], hash_size: u8) -> u32 {
    match hash_size {
        2 => u16::from_le_bytes(buf[0..2].try_into().unwrap()) as u32,
        4 => u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        other => panic!("unsupported hash_size {other}"),
    }
}

/// One slot of the metadata-entries file: `status(1) + eof_page(4) +
/// eof_byte(2) + root_index_block(4) + name(max_file_name_size, zero
/// padded)`, the whole thing padded out to the configured
/// `metadata_entry_size` (spec §3.2's `metadata_size_floor` is the minimum
/// that fits this layout with zero slack).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub status: u8,
    pub eof_page: u32,
    pub eof_byte: u16,
    pub root_index_block: u32,
    pub name: Vec<u8>,
}

impl MetadataRecord {
    pub fn encode(&self, entry_size: u16, max_file_name_size: u16) -> Vec<u8> {
        let mut buf = vec![0u8; entry_size as usize];
        buf[0] = self.status;
        buf[1..5].copy_from_slice(&self.eof_page.to_le_bytes());
        buf[5..7].copy_from_slice(&self.eof_byte.to_le_bytes());
        buf[7..11].copy_from_slice(&self.root_index_block.to_le_bytes());
        let name_field = &mut buf[11..11 + max_file_name_size as usize];
        name_field[..self.name.len()].copy_from_slice(&self.name);
        buf
    }

    pub fn decode(buf: &[u8], max_file_name_size: u16) -> Self {
        let status = buf[0];
        let eof_page = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        let eof_byte = u16::from_le_bytes(buf[5..7].try_into().unwrap());
        let root_index_block = u32::from_le_bytes(buf[7..11].try_into().unwrap());
        let name_field = &buf[11..11 + max_file_name_size as usize];
        let len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_field.len());
        Self {
            status,
            eof_page,
            eof_byte,
            root_index_block,
            name: name_field[..len].to_vec(),
        }
    }
}

pub fn names_match(stored: &[u8], query: &[u8]) -> bool {
    stored == query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips() {
        let rec = MetadataRecord {
            status: STATUS_IN_USE,
            eof_page: 7,
            eof_byte: 100,
            root_index_block: 42,
            name: b"hello.txt".to_vec(),
        };
        let bytes = rec.encode(32, 12);
        let back = MetadataRecord::decode(&bytes, 12);
        assert_eq!(back, rec);
    }

    #[test]
    fn hash_slot_round_trips_both_widths() {
        for (hash_size, h) in [(2u8, 12345u32), (4u8, 3_000_000_000u32)] {
            let bytes = encode_hash_slot(h, hash_size);
            assert_eq!(decode_hash_slot(&bytes, hash_size), h);
        }
    }

    #[test]
    fn deleted_slot_uses_reserved_hash_tombstone() {
        assert_eq!(HASH_TOMBSTONE, 0);
        // djb2a + folding never produce 0, so this can't collide with a real hash.
        assert_ne!(crate::hash::djb2a(b"anything"), HASH_TOMBSTONE);
    }
}
