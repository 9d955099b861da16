//! Payload (un)masking (RFC 6455 Section 5.3).

/// XOR `buf` in place with the four-byte masking key.
///
/// Masking is its own inverse, so the same call masks and unmasks. Bytes are
/// processed eight at a time with the key widened to a `u64`.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let wide = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ wide;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Chunks are multiples of the key length, so the tail restarts at key[0].
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(buf: &mut [u8], mask: [u8; 4]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
    }

    #[test]
    fn test_matches_bytewise_masking() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        for len in [0usize, 1, 3, 7, 8, 9, 16, 31] {
            let original: Vec<u8> = (0..len as u8).collect();
            let mut fast = original.clone();
            let mut slow = original.clone();
            apply_mask(&mut fast, mask);
            naive(&mut slow, mask);
            assert_eq!(fast, slow, "length {}", len);
        }
    }

    #[test]
    fn test_rfc_example() {
        // RFC 6455 Section 5.7: masked "Hello"
        let mut payload = [0x7f, 0x9f, 0x4d, 0x51, 0x58];
        apply_mask(&mut payload, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(&payload, b"Hello");
    }
}
