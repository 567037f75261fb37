//! Multi-threaded fixed-capacity hash table for join builds.
//!
//! The tag array is atomic: an inserter claims a slot by CAS-ing the 0 tag
//! to `fill | fingerprint` and then writes the slot data non-atomically.
//! The build phase and the probe phase are separated by a pipeline barrier,
//! so probers never race slot writes; the release CAS / acquire load pair
//! makes the data visible once the tag is.
//!
//! The table never resizes — the runtime task that allocates it sizes it to
//! twice the materialized row count, rounded up to a power of two.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::comparators::KeyComparator;

const FILL_BIT: u8 = 0x80;

fn fingerprint(hash: u64) -> u8 {
    ((hash >> 57) as u8) & 0x7F
}

pub struct AtomicHashTable<C: KeyComparator> {
    comp: C,
    tags: Box<[AtomicU8]>,
    data: Box<[UnsafeCell<u8>]>,
    num_slots: u64,
    mod_mask: u64,
    total_slot_size: usize,
    /// Byte offset of the outer-join "seen" marker within a slot, when the
    /// table was built with markers.
    marker_offset: Option<usize>,
}

unsafe impl<C: KeyComparator> Send for AtomicHashTable<C> {}
unsafe impl<C: KeyComparator> Sync for AtomicHashTable<C> {}

impl<C: KeyComparator> std::fmt::Debug for AtomicHashTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicHashTable")
            .field("num_slots", &self.num_slots)
            .field("mod_mask", &self.mod_mask)
            .field("total_slot_size", &self.total_slot_size)
            .field("marker_offset", &self.marker_offset)
            .finish()
    }
}

impl<C: KeyComparator> AtomicHashTable<C> {
    /// Allocate with a fixed slot count (rounded up to a power of two).
    pub fn new(comp: C, payload_size: usize, min_slots: u64) -> AtomicHashTable<C> {
        Self::build(comp, payload_size, min_slots, false)
    }

    /// Variant with a one-byte "seen" marker per slot, used to enumerate
    /// unmatched build rows after a left outer probe.
    pub fn with_match_markers(
        comp: C,
        payload_size: usize,
        min_slots: u64,
    ) -> AtomicHashTable<C> {
        Self::build(comp, payload_size, min_slots, true)
    }

    fn build(comp: C, payload_size: usize, min_slots: u64, markers: bool) -> AtomicHashTable<C> {
        let num_slots = min_slots.max(16).next_power_of_two();
        let marker_offset = markers.then_some(comp.key_size() + payload_size);
        let total_slot_size = comp.key_size() + payload_size + usize::from(markers);
        let mut tags = Vec::with_capacity(num_slots as usize);
        tags.resize_with(num_slots as usize, || AtomicU8::new(0));
        let mut data = Vec::with_capacity(num_slots as usize * total_slot_size);
        data.resize_with(num_slots as usize * total_slot_size, || UnsafeCell::new(0));
        AtomicHashTable {
            comp,
            tags: tags.into_boxed_slice(),
            data: data.into_boxed_slice(),
            num_slots,
            mod_mask: num_slots - 1,
            total_slot_size,
            marker_offset,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.num_slots
    }

    pub fn slot_size(&self) -> usize {
        self.total_slot_size
    }

    pub fn key_size(&self) -> usize {
        self.comp.key_size()
    }

    fn slot_ptr(&self, idx: u64) -> *mut u8 {
        self.data[idx as usize * self.total_slot_size].get()
    }

    /// Hash a key and prefetch the tag and slot cache lines it maps to.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` valid bytes.
    pub unsafe fn compute_hash_and_prefetch(&self, key: *const u8) -> u64 {
        let hash = self.comp.hash(key);
        self.slot_prefetch(hash);
        hash
    }

    /// Prefetch the probe location for an already-computed hash.
    pub fn slot_prefetch(&self, hash: u64) {
        let idx = hash & self.mod_mask;
        prefetch(self.tags.as_ptr().wrapping_add(idx as usize).cast());
        prefetch(self.slot_ptr(idx).cast_const());
    }

    /// Claim a slot for `tuple` (key followed by payload) and copy the
    /// whole tuple into it.  Keys are assumed distinct (primary-key build);
    /// returns null if the table is full.
    ///
    /// # Safety
    ///
    /// `tuple` must point to `key_size() + payload` valid bytes.
    pub unsafe fn insert_tuple(&self, tuple: *const u8) -> *mut u8 {
        self.insert_tuple_with_hash(tuple, self.comp.hash(tuple))
    }

    /// [`AtomicHashTable::insert_tuple`] with a precomputed hash; the
    /// batched build phase hashes and prefetches a block of tuples before
    /// inserting any of them.
    ///
    /// # Safety
    ///
    /// `tuple` must point to `key_size() + payload` valid bytes and `hash`
    /// must be this table's hash of its key.
    pub unsafe fn insert_tuple_with_hash(&self, tuple: *const u8, hash: u64) -> *mut u8 {
        let want = FILL_BIT | fingerprint(hash);
        let mut idx = hash & self.mod_mask;
        for _ in 0..self.num_slots {
            if self.tags[idx as usize]
                .compare_exchange(0, want, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let slot = self.slot_ptr(idx);
                let copy_len = self
                    .marker_offset
                    .unwrap_or(self.total_slot_size)
                    .min(self.total_slot_size);
                std::ptr::copy_nonoverlapping(tuple, slot, copy_len);
                return slot;
            }
            idx = (idx + 1) & self.mod_mask;
        }
        std::ptr::null_mut()
    }

    /// Find `key` with a precomputed hash, or null.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` valid bytes.
    pub unsafe fn lookup_with_hash(&self, key: *const u8, hash: u64) -> *mut u8 {
        let want = FILL_BIT | fingerprint(hash);
        let mut idx = hash & self.mod_mask;
        loop {
            let tag = self.tags[idx as usize].load(Ordering::Acquire);
            if tag == 0 {
                return std::ptr::null_mut();
            }
            if tag == want && self.comp.eq(self.slot_ptr(idx).cast_const(), key) {
                return self.slot_ptr(idx);
            }
            idx = (idx + 1) & self.mod_mask;
        }
    }

    /// Find `key`, hashing it first.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` valid bytes.
    pub unsafe fn lookup(&self, key: *const u8) -> *mut u8 {
        self.lookup_with_hash(key, self.comp.hash(key))
    }

    /// Find `key` and disable the slot it occupies: the fingerprint bits
    /// are XOR-inverted while the fill bit stays set, so the probe chain
    /// survives but no further lookup matches the key.  Returns null if the
    /// key is absent or its slot was already disabled.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` valid bytes.
    pub unsafe fn lookup_with_hash_disable(&self, key: *const u8, hash: u64) -> *mut u8 {
        let want = FILL_BIT | fingerprint(hash);
        let disabled = FILL_BIT | (fingerprint(hash) ^ 0x7F);
        let mut idx = hash & self.mod_mask;
        loop {
            let tag = self.tags[idx as usize].load(Ordering::Acquire);
            if tag == 0 {
                return std::ptr::null_mut();
            }
            if tag == want
                && self.comp.eq(self.slot_ptr(idx).cast_const(), key)
                && self.tags[idx as usize]
                    .compare_exchange(want, disabled, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                // CAS winner serves this row; concurrent losers keep
                // probing and fall off the chain at the next empty tag.
                return self.slot_ptr(idx);
            }
            idx = (idx + 1) & self.mod_mask;
        }
    }

    /// Outer-join lookup: on the first served match the slot's marker byte
    /// is CAS-set so the post-probe iteration can enumerate unmatched rows.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` valid bytes; the table must have
    /// been built with match markers.
    pub unsafe fn lookup_outer(&self, key: *const u8, hash: u64) -> *mut u8 {
        let slot = self.lookup_with_hash(key, hash);
        if slot.is_null() {
            return slot;
        }
        if let Some(off) = self.marker_offset {
            let marker = &*slot.add(off).cast::<AtomicU8>();
            let _ = marker.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
        }
        slot
    }

    /// Advance `idx` to the next filled slot below `end`.
    pub fn it_advance(&self, idx: &mut u64, end: u64) -> *mut u8 {
        let end = end.min(self.num_slots);
        while *idx < end {
            let cur = *idx;
            *idx += 1;
            if self.tags[cur as usize].load(Ordering::Acquire) != 0 {
                return self.slot_ptr(cur);
            }
        }
        std::ptr::null_mut()
    }

    /// Advance to the next filled slot whose marker byte is still clear.
    pub fn it_advance_unmarked(&self, idx: &mut u64, end: u64) -> *mut u8 {
        let Some(off) = self.marker_offset else {
            return std::ptr::null_mut();
        };
        loop {
            let slot = self.it_advance(idx, end);
            if slot.is_null() {
                return slot;
            }
            let marked = unsafe { (*slot.add(off).cast::<AtomicU8>()).load(Ordering::Acquire) };
            if marked == 0 {
                return slot;
            }
        }
    }

    /// Tag byte at a slot index; test support for the tag invariant.
    pub fn tag_at(&self, idx: u64) -> u8 {
        self.tags[idx as usize].load(Ordering::Acquire)
    }
}

#[inline]
fn prefetch(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch(ptr.cast(), _MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparators::SimpleKeyComparator;

    fn tuple(key: u64, payload: u64) -> [u8; 16] {
        let mut t = [0_u8; 16];
        t[..8].copy_from_slice(&key.to_le_bytes());
        t[8..].copy_from_slice(&payload.to_le_bytes());
        t
    }

    fn table(min_slots: u64) -> AtomicHashTable<SimpleKeyComparator> {
        AtomicHashTable::new(SimpleKeyComparator::new(8), 8, min_slots)
    }

    #[test]
    fn parallel_build_then_probe() {
        let ht = table(4096);
        std::thread::scope(|scope| {
            for t in 0..4_u64 {
                let ht = &ht;
                scope.spawn(move || {
                    for k in (500 * t)..(500 * (t + 1)) {
                        unsafe {
                            assert!(!ht.insert_tuple(tuple(k, 3 * k).as_ptr()).is_null());
                        }
                    }
                });
            }
        });
        for k in 0_u64..2000 {
            unsafe {
                let slot = ht.lookup(k.to_le_bytes().as_ptr());
                assert!(!slot.is_null(), "key {k} missing");
                assert_eq!(slot.add(8).cast::<u64>().read_unaligned(), 3 * k);
            }
        }
        unsafe {
            assert!(ht.lookup(99_999_u64.to_le_bytes().as_ptr()).is_null());
        }
    }

    #[test]
    fn disable_removes_exactly_one_key() {
        let ht = table(64);
        for k in 0_u64..10 {
            unsafe {
                ht.insert_tuple(tuple(k, k).as_ptr());
            }
        }
        let key = 4_u64.to_le_bytes();
        unsafe {
            let hash = ht.compute_hash_and_prefetch(key.as_ptr());
            assert!(!ht.lookup_with_hash_disable(key.as_ptr(), hash).is_null());
            // Second lookup of the disabled key misses.
            assert!(ht.lookup_with_hash(key.as_ptr(), hash).is_null());
            assert!(ht.lookup_with_hash_disable(key.as_ptr(), hash).is_null());
            // Every other key is unaffected.
            for k in (0_u64..10).filter(|k| *k != 4) {
                assert!(!ht.lookup(k.to_le_bytes().as_ptr()).is_null());
            }
        }
    }

    #[test]
    fn fill_bit_survives_disable() {
        let ht = table(64);
        unsafe {
            ht.insert_tuple(tuple(1, 0).as_ptr());
            let hash = ht.comp.hash(1_u64.to_le_bytes().as_ptr());
            ht.lookup_with_hash_disable(1_u64.to_le_bytes().as_ptr(), hash);
        }
        let filled = (0..ht.capacity()).filter(|i| ht.tag_at(*i) != 0).count();
        assert_eq!(filled, 1);
        let tag = (0..ht.capacity())
            .map(|i| ht.tag_at(i))
            .find(|t| *t != 0)
            .unwrap();
        assert_ne!(tag & FILL_BIT, 0);
    }

    #[test]
    fn outer_markers_track_served_matches() {
        let ht = AtomicHashTable::with_match_markers(SimpleKeyComparator::new(8), 8, 64);
        for k in 0_u64..4 {
            unsafe {
                ht.insert_tuple(tuple(k, k).as_ptr());
            }
        }
        unsafe {
            let key = 2_u64.to_le_bytes();
            let hash = ht.comp.hash(key.as_ptr());
            assert!(!ht.lookup_outer(key.as_ptr(), hash).is_null());
        }
        let mut idx = 0;
        let mut unmarked = 0;
        while !ht.it_advance_unmarked(&mut idx, ht.capacity()).is_null() {
            unmarked += 1;
        }
        assert_eq!(unmarked, 3);
    }

    #[test]
    fn iterator_covers_all_slots() {
        let ht = table(64);
        for k in 0_u64..20 {
            unsafe {
                ht.insert_tuple(tuple(k, 0).as_ptr());
            }
        }
        let mut idx = 0;
        let mut count = 0;
        while !ht.it_advance(&mut idx, ht.capacity()).is_null() {
            count += 1;
        }
        assert_eq!(count, 20);
    }
}
