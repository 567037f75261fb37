//! Key hashing.
//!
//! Every hash in the engine is xxh3-64 over the raw key bytes, so the fused
//! and interpreted paths agree bit-for-bit with host-side code (the
//! aggregation merger re-hashes rows the primitives hashed earlier).

use xxhash_rust::xxh3::xxh3_64;

/// Hash `len` bytes at `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for reads of `len` bytes.
#[inline]
pub unsafe fn hash_bytes(ptr: *const u8, len: usize) -> u64 {
    xxh3_64(std::slice::from_raw_parts(ptr, len))
}

/// Hash a 4-byte key.
///
/// # Safety
///
/// `ptr` must be valid for reads of 4 bytes.
#[inline]
pub unsafe fn hash4(ptr: *const u8) -> u64 {
    hash_bytes(ptr, 4)
}

/// Hash an 8-byte key.
///
/// # Safety
///
/// `ptr` must be valid for reads of 8 bytes.
#[inline]
pub unsafe fn hash8(ptr: *const u8) -> u64 {
    hash_bytes(ptr, 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_agree_with_generic_hash() {
        let k: u64 = 0xDEAD_BEEF_1234_5678;
        let bytes = k.to_le_bytes();
        unsafe {
            assert_eq!(hash8(bytes.as_ptr()), hash_bytes(bytes.as_ptr(), 8));
            assert_eq!(hash4(bytes.as_ptr()), hash_bytes(bytes.as_ptr(), 4));
        }
    }

    #[test]
    fn distinct_keys_rarely_collide() {
        let a = unsafe { hash8(1_u64.to_le_bytes().as_ptr()) };
        let b = unsafe { hash8(2_u64.to_le_bytes().as_ptr()) };
        assert_ne!(a, b);
    }
}
