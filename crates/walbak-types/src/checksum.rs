//! Salted 32-bit checksum used by the wlog pack and wdiff record formats.
//!
//! The sum is additive over little-endian 4-byte words with the tail
//! zero-padded; the finish step is two's-complement negation. The salt is the
//! per-volume log salt, so checksums from different volumes never match by
//! accident.

/// Accumulate `data` into a running checksum. Start from the salt.
pub fn checksum_partial(data: &[u8], mut csum: u32) -> u32 {
    let mut chunks = data.chunks_exact(4);
    for w in &mut chunks {
        csum = csum.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let mut pad = [0u8; 4];
        pad[..rest.len()].copy_from_slice(rest);
        csum = csum.wrapping_add(u32::from_le_bytes(pad));
    }
    csum
}

pub fn checksum_finish(csum: u32) -> u32 {
    (!csum).wrapping_add(1)
}

/// Checksum of one byte slice under a salt.
pub fn calc_checksum(data: &[u8], salt: u32) -> u32 {
    checksum_finish(checksum_partial(data, salt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_matches_whole() {
        let data: Vec<u8> = (0..=255).collect();
        let whole = calc_checksum(&data, 0xdead_beef);
        let split = checksum_finish(checksum_partial(
            &data[100..],
            checksum_partial(&data[..100], 0xdead_beef),
        ));
        assert_eq!(whole, split);
    }

    #[test]
    fn salt_changes_result() {
        let data = b"some payload bytes";
        assert_ne!(calc_checksum(data, 0), calc_checksum(data, 1));
    }

    #[test]
    fn tail_is_zero_padded() {
        // 5 bytes: one full word plus one padded byte.
        let a = calc_checksum(&[1, 2, 3, 4, 5], 0);
        let b = calc_checksum(&[1, 2, 3, 4, 5, 0, 0, 0], 0);
        assert_eq!(a, b);
    }
}
