//! Key comparators for the hash-table family.
//!
//! A comparator fixes how a packed key is hashed and compared.  Simple keys
//! are a fixed number of `memcmp`-able bytes.  Complex keys start with a
//! number of 8-byte indirection slots — each a pointer to NUL-terminated
//! string data — optionally followed by simple bytes.

use crate::hash::hash_bytes;
use xxhash_rust::xxh3::Xxh3;

/// Behaviour shared by all key comparators.
///
/// # Safety
///
/// All methods dereference raw key pointers; callers must pass pointers to
/// at least `key_size()` valid bytes laid out as the comparator expects.
pub unsafe trait KeyComparator: Send + Sync {
    unsafe fn eq(&self, k1: *const u8, k2: *const u8) -> bool;
    unsafe fn hash(&self, k: *const u8) -> u64;
    fn key_size(&self) -> usize;
}

/// Fixed-length keys compared byte-wise.
#[derive(Debug, Clone, Copy)]
pub struct SimpleKeyComparator {
    key_size: usize,
}

impl SimpleKeyComparator {
    pub fn new(key_size: usize) -> SimpleKeyComparator {
        SimpleKeyComparator { key_size }
    }
}

unsafe impl KeyComparator for SimpleKeyComparator {
    unsafe fn eq(&self, k1: *const u8, k2: *const u8) -> bool {
        std::slice::from_raw_parts(k1, self.key_size)
            == std::slice::from_raw_parts(k2, self.key_size)
    }

    unsafe fn hash(&self, k: *const u8) -> u64 {
        hash_bytes(k, self.key_size)
    }

    fn key_size(&self) -> usize {
        self.key_size
    }
}

/// Keys with leading string-pointer slots.
#[derive(Debug, Clone, Copy)]
pub struct ComplexKeyComparator {
    /// Leading 8-byte pointer slots.
    complex_slots: usize,
    /// Trailing memcmp-able bytes.
    simple_size: usize,
}

impl ComplexKeyComparator {
    pub fn new(complex_slots: usize, simple_size: usize) -> ComplexKeyComparator {
        ComplexKeyComparator {
            complex_slots,
            simple_size,
        }
    }

    unsafe fn slot_str<'a>(k: *const u8, slot: usize) -> &'a [u8] {
        let ptr = k.add(slot * 8).cast::<*const u8>().read_unaligned();
        let mut len = 0;
        while *ptr.add(len) != 0 {
            len += 1;
        }
        std::slice::from_raw_parts(ptr, len)
    }
}

unsafe impl KeyComparator for ComplexKeyComparator {
    unsafe fn eq(&self, k1: *const u8, k2: *const u8) -> bool {
        for slot in 0..self.complex_slots {
            if Self::slot_str(k1, slot) != Self::slot_str(k2, slot) {
                return false;
            }
        }
        if self.simple_size == 0 {
            return true;
        }
        let off = self.complex_slots * 8;
        std::slice::from_raw_parts(k1.add(off), self.simple_size)
            == std::slice::from_raw_parts(k2.add(off), self.simple_size)
    }

    unsafe fn hash(&self, k: *const u8) -> u64 {
        // Hash the pointed-to string bytes, not the pointers, so equal keys
        // in different arenas hash alike.
        let mut hasher = Xxh3::new();
        for slot in 0..self.complex_slots {
            let s = Self::slot_str(k, slot);
            hasher.update(s);
            // Separator so ("ab","c") never aliases ("a","bc").
            hasher.update(&[0]);
        }
        if self.simple_size > 0 {
            let off = self.complex_slots * 8;
            hasher.update(std::slice::from_raw_parts(k.add(off), self.simple_size));
        }
        hasher.digest()
    }

    fn key_size(&self) -> usize {
        self.complex_slots * 8 + self.simple_size
    }
}
