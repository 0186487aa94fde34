// XOR masking of frame payloads (RFC 6455, Section 5.3).

/// Masks or unmasks `buf` in place with the 4-byte `mask` key.
///
/// Masking is its own inverse, so the same call serves the encoder and the decoder.
/// Eight bytes are handled per step; the key repeats every four, so the tail always
/// starts at key offset zero.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let [a, b, c, d] = mask;
    let key = u64::from_ne_bytes([a, b, c, d, a, b, c, d]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u64::from_ne_bytes(word) ^ key).to_ne_bytes());
    }
    mask_bytes(chunks.into_remainder(), mask);
}

#[inline]
fn mask_bytes(buf: &mut [u8], mask: [u8; 4]) {
    for (byte, key) in buf.iter_mut().zip(mask.iter().cycle()) {
        *byte ^= key;
    }
}
