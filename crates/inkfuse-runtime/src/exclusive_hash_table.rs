//! Single-threaded linear-probing hash table.
//!
//! Owned by exactly one worker (thread-local pre-aggregation).  Slots store
//! the packed key followed by the payload.  A parallel 1-byte tag array
//! carries a fill bit (0x80) and the top 7 bits of the hash as fingerprint;
//! probing compares tags before touching slot data.
//!
//! The table doubles once half full.  When the resize fires underneath a
//! vectorized primitive, the installed restart flag is raised so the
//! interpreter replays the primitive on the same morsel; `lookup_or_insert`
//! is idempotent, so the replay converges.

use crate::comparators::KeyComparator;
use crate::memory::MemoryRegion;

const FILL_BIT: u8 = 0x80;

fn fingerprint(hash: u64) -> u8 {
    ((hash >> 57) as u8) & 0x7F
}

pub struct ExclusiveHashTable<C: KeyComparator> {
    comp: C,
    tags: Vec<u8>,
    data: Vec<u8>,
    num_slots: u64,
    mod_mask: u64,
    total_slot_size: usize,
    entries: u64,
}

impl<C: KeyComparator> std::fmt::Debug for ExclusiveHashTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveHashTable")
            .field("num_slots", &self.num_slots)
            .field("mod_mask", &self.mod_mask)
            .field("total_slot_size", &self.total_slot_size)
            .field("entries", &self.entries)
            .finish()
    }
}

impl<C: KeyComparator> ExclusiveHashTable<C> {
    /// Create a table with room for `initial_capacity` slots (rounded up to
    /// a power of two, minimum 16) holding `key + payload_size` bytes each.
    pub fn new(comp: C, payload_size: usize, initial_capacity: u64) -> ExclusiveHashTable<C> {
        let num_slots = initial_capacity.max(16).next_power_of_two();
        let total_slot_size = comp.key_size() + payload_size;
        ExclusiveHashTable {
            comp,
            tags: vec![0; num_slots as usize],
            data: vec![0; num_slots as usize * total_slot_size],
            num_slots,
            mod_mask: num_slots - 1,
            total_slot_size,
            entries: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.num_slots
    }

    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn slot_size(&self) -> usize {
        self.total_slot_size
    }

    pub fn key_size(&self) -> usize {
        self.comp.key_size()
    }

    fn slot_ptr(&self, idx: u64) -> *const u8 {
        unsafe { self.data.as_ptr().add(idx as usize * self.total_slot_size) }
    }

    fn slot_ptr_mut(&mut self, idx: u64) -> *mut u8 {
        unsafe {
            self.data
                .as_mut_ptr()
                .add(idx as usize * self.total_slot_size)
        }
    }

    /// Find `key`, or null.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` valid bytes.
    pub unsafe fn lookup(&self, key: *const u8) -> *mut u8 {
        let hash = self.comp.hash(key);
        let want = FILL_BIT | fingerprint(hash);
        let mut idx = hash & self.mod_mask;
        loop {
            let tag = self.tags[idx as usize];
            if tag == 0 {
                return std::ptr::null_mut();
            }
            if tag == want && self.comp.eq(self.slot_ptr(idx), key) {
                return self.slot_ptr(idx).cast_mut();
            }
            idx = (idx + 1) & self.mod_mask;
        }
    }

    /// Find `key`, inserting an empty slot for it if absent.  Returns the
    /// slot pointer and whether it was freshly inserted.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` valid bytes.
    pub unsafe fn lookup_or_insert(&mut self, key: *const u8) -> (*mut u8, bool) {
        let existing = self.lookup(key);
        if !existing.is_null() {
            return (existing, false);
        }
        (self.insert(key), true)
    }

    /// Insert `key`, which must not be present.  Payload bytes start zeroed.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` valid bytes and not already be in
    /// the table.
    pub unsafe fn insert(&mut self, key: *const u8) -> *mut u8 {
        // Load factor cap is 50%.
        if 2 * (self.entries + 1) > self.num_slots {
            self.resize();
        }
        let hash = self.comp.hash(key);
        let want = FILL_BIT | fingerprint(hash);
        let mut idx = hash & self.mod_mask;
        while self.tags[idx as usize] != 0 {
            idx = (idx + 1) & self.mod_mask;
        }
        self.tags[idx as usize] = want;
        let slot = self.slot_ptr_mut(idx);
        std::ptr::copy_nonoverlapping(key, slot, self.comp.key_size());
        self.entries += 1;
        slot
    }

    /// Double the table and rehash every filled slot.  Raises the installed
    /// restart flag so an in-flight vectorized primitive gets replayed.
    fn resize(&mut self) {
        let old_slots = self.num_slots;
        self.num_slots *= 2;
        self.mod_mask = self.num_slots - 1;
        let old_tags = std::mem::replace(&mut self.tags, vec![0; self.num_slots as usize]);
        let old_data = std::mem::replace(
            &mut self.data,
            vec![0; self.num_slots as usize * self.total_slot_size],
        );
        tracing::debug!(from = old_slots, to = self.num_slots, "hash table resize");
        for idx in 0..old_slots {
            if old_tags[idx as usize] == 0 {
                continue;
            }
            let src = unsafe { old_data.as_ptr().add(idx as usize * self.total_slot_size) };
            let hash = unsafe { self.comp.hash(src) };
            let mut new_idx = hash & self.mod_mask;
            while self.tags[new_idx as usize] != 0 {
                new_idx = (new_idx + 1) & self.mod_mask;
            }
            self.tags[new_idx as usize] = FILL_BIT | fingerprint(hash);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src,
                    self.data
                        .as_mut_ptr()
                        .add(new_idx as usize * self.total_slot_size),
                    self.total_slot_size,
                );
            }
        }
        MemoryRegion::flag_installed_restart();
    }

    /// Advance `idx` to the next filled slot below `end`; returns the slot
    /// pointer or null when the range is exhausted.  `idx` ends up one past
    /// the returned slot.
    pub fn it_advance(&self, idx: &mut u64, end: u64) -> *mut u8 {
        let end = end.min(self.num_slots);
        while *idx < end {
            let cur = *idx;
            *idx += 1;
            if self.tags[cur as usize] != 0 {
                return self.slot_ptr(cur).cast_mut();
            }
        }
        std::ptr::null_mut()
    }

    /// Iterate all filled slots (host-side, for the aggregation merger).
    pub fn iter_slots(&self) -> impl Iterator<Item = *const u8> + '_ {
        (0..self.num_slots)
            .filter(|idx| self.tags[*idx as usize] != 0)
            .map(|idx| self.slot_ptr(idx))
    }

    /// Tag byte for a slot index; test support for the tag invariant.
    pub fn tag_at(&self, idx: u64) -> u8 {
        self.tags[idx as usize]
    }

    /// Re-hash a stored key; used by the merger to partition rows.
    ///
    /// # Safety
    ///
    /// `slot` must point at a stored slot of this table.
    pub unsafe fn hash_stored(&self, slot: *const u8) -> u64 {
        self.comp.hash(slot)
    }
}
