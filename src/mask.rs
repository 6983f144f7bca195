//! Payload masking.
//!
//! Client-to-server frames carry a 4-byte key; the payload is XORed with
//! the key repeated. Applying the same key twice restores the original
//! bytes, so one routine serves for both masking and unmasking.
//!
//! Masking always starts at the first payload byte, so the key phase at
//! any index is simply `index % 4`. That lets the hot loop work on 8-byte
//! blocks with the key doubled into a `u64`: every block boundary is a
//! multiple of 8, which keeps the doubled key in phase without any
//! rotation or alignment bookkeeping.

/// Mask or unmask `buf` in place with `key`.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let mut doubled = [0u8; 8];
    doubled[..4].copy_from_slice(&key);
    doubled[4..].copy_from_slice(&key);
    let key_block = u64::from_ne_bytes(doubled);

    let mut blocks = buf.chunks_exact_mut(8);
    for block in blocks.by_ref() {
        let word = u64::from_ne_bytes(block.try_into().expect("8-byte chunk")) ^ key_block;
        block.copy_from_slice(&word.to_ne_bytes());
    }

    // At most 7 bytes remain; their offset is a multiple of 8, so the key
    // phase restarts at zero.
    for (i, byte) in blocks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
