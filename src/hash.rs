//! The djb2a name hash used by the directory (spec §4.4 step 1).

/// djb2, xor variant: `hash = hash*33 ^ byte`, seeded at 5381.
///
/// The hash value `0` is reserved as the directory's deletion tombstone, so
/// any name that would hash to `0` is folded to `1` instead.
pub fn djb2a(name: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in name {
        hash = (hash.wrapping_shl(5).wrapping_add(hash)) ^ (b as u32);
    }
    if hash == 0 {
        1
    } else {
        hash
    }
}

/// Fold a hash down to the on-disk slot width. 2-byte slots additionally
/// reduce modulo the largest prime below 2^16 (spec §4.4 step 1), 4-byte
/// slots are stored as-is.
pub fn fold_to_slot_width(hash: u32, hash_size: u8) -> u32 {
    match hash_size {
        2 => {
            let folded = hash % 65521;
            if folded == 0 {
                1
            } else {
                folded
            }
        }
        4 => hash,
        other => panic!("unsupported hash_size {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_from_spec_scenario_b() {
        // "playwright" and "snush" both hash to 195669366 per spec §8 scenario B.
        assert_eq!(djb2a(b"playwright"), 195669366);
        assert_eq!(djb2a(b"snush"), 195669366);
    }

    #[test]
    fn never_produces_zero() {
        // djb2a(b"") == 5381 normally, but any input landing on 0 must fold to 1.
        // Brute-force a handful of short inputs and assert the tombstone value
        // never escapes as a real hash.
        for i in 0u32..10_000 {
            let bytes = i.to_le_bytes();
            assert_ne!(djb2a(&bytes), 0);
        }
    }

    #[test]
    fn fold_never_zero_for_2_byte_slots() {
        for raw in [0u32, 65521, 65521 * 2, 1, u32::MAX] {
            assert_ne!(fold_to_slot_width(raw.max(1), 2), 0);
        }
    }
}
