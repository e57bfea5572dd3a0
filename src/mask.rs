//! XOR payload masking (RFC 6455 §5.3).
//!
//! Masking XORs every payload byte with `key[i % 4]`. XOR is its own
//! inverse, so the same routine masks and unmasks. The implementation is
//! picked once per process: an AVX2 path handling 32 bytes per step when the
//! CPU supports it, otherwise a scalar path that widens the key to a `u64`
//! and handles 8 bytes per step. Both produce byte-identical output.

use std::sync::OnceLock;

type MaskFn = fn(&mut [u8], [u8; 4]);

static MASK_IMPL: OnceLock<MaskFn> = OnceLock::new();

/// Apply the 4-byte XOR mask to `data` in place.
///
/// `apply_mask(apply_mask(data, key), key)` restores the original bytes.
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    let f = *MASK_IMPL.get_or_init(probe);
    f(data, key)
}

fn probe() -> MaskFn {
    #[cfg(target_arch = "x86_64")]
    if std::arch::is_x86_feature_detected!("avx2") {
        return apply_mask_avx2_dispatch;
    }
    apply_mask_scalar
}

/// Scalar path: XOR 8 bytes at a time against the key repeated into a
/// 64-bit word, then finish the tail byte-wise. The tail starts at a
/// multiple of 8, so its key phase is still aligned.
pub(crate) fn apply_mask_scalar(data: &mut [u8], key: [u8; 4]) {
    let [a, b, c, d] = key;
    let wide = u64::from_ne_bytes([a, b, c, d, a, b, c, d]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word: [u8; 8] = match (&*chunk).try_into() {
            Ok(word) => word,
            Err(_) => unreachable!(),
        };
        let masked = u64::from_ne_bytes(word) ^ wide;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[cfg(target_arch = "x86_64")]
fn apply_mask_avx2_dispatch(data: &mut [u8], key: [u8; 4]) {
    // Only installed after the avx2 probe succeeded.
    unsafe { apply_mask_avx2(data, key) }
}

/// AVX2 path: XOR 32 bytes per step. The remainder falls through to the
/// scalar path at an offset that is a multiple of 32, keeping the key phase.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn apply_mask_avx2(data: &mut [u8], key: [u8; 4]) {
    use std::arch::x86_64::{
        _mm256_loadu_si256, _mm256_set1_epi32, _mm256_storeu_si256, _mm256_xor_si256,
    };

    let wide = _mm256_set1_epi32(i32::from_ne_bytes(key));
    let mut i = 0;
    while i + 32 <= data.len() {
        let p = data.as_mut_ptr().add(i).cast();
        let v = _mm256_loadu_si256(p);
        _mm256_storeu_si256(p, _mm256_xor_si256(v, wide));
        i += 32;
    }
    apply_mask_scalar(&mut data[i..], key);
}
