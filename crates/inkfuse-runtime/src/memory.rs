//! Per-thread slab arena and the thread-local install mechanism.
//!
//! A pipeline gives every worker thread one [`MemoryRegion`].  Before a
//! primitive or generated function runs, the runner installs the thread's
//! region into a thread-local slot so `inkfuse_malloc` can route allocations
//! to it; the [`RegionGuard`] restores the previous slot on every exit path.
//!
//! The region also carries the restart flag: a primitive that mutates shared
//! structure beyond its own scope (a hash-table resize mid-batch) raises the
//! flag, and the interpreter replays the primitive on the same morsel.

use std::cell::Cell;

/// Slab granularity: 4 KB expressed in 8-byte words.
const SLAB_WORDS: usize = 512;

thread_local! {
    static INSTALLED: Cell<*mut MemoryRegion> = const { Cell::new(std::ptr::null_mut()) };
}

/// Bump-pointer slab arena.  All allocations are 8-byte aligned; the whole
/// region is freed at once when it is dropped or reset at pipeline end.
#[derive(Debug, Default)]
pub struct MemoryRegion {
    slabs: Vec<Box<[u64]>>,
    /// Requests larger than a slab; never bump-allocated from.
    large: Vec<Box<[u64]>>,
    /// Word offset into the last slab.
    offset_words: usize,
    /// Raised by primitives that mutated structure beyond their own scope.
    restart_flag: bool,
}

impl MemoryRegion {
    pub fn new() -> MemoryRegion {
        MemoryRegion::default()
    }

    /// Allocate `size` bytes, 8-byte aligned.  Oversized requests get a
    /// dedicated slab.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let words = size.div_ceil(8);
        if words > SLAB_WORDS {
            let mut slab = vec![0_u64; words].into_boxed_slice();
            let ptr = slab.as_mut_ptr().cast();
            self.large.push(slab);
            return ptr;
        }
        if self.slabs.is_empty() || self.offset_words + words > SLAB_WORDS {
            self.slabs.push(vec![0_u64; SLAB_WORDS].into_boxed_slice());
            self.offset_words = 0;
        }
        let slab = self.slabs.last_mut().expect("slab just ensured");
        let ptr = unsafe { slab.as_mut_ptr().add(self.offset_words) };
        self.offset_words += words;
        ptr.cast()
    }

    /// Total bytes currently backed by slabs.
    pub fn allocated_bytes(&self) -> usize {
        self.slabs
            .iter()
            .chain(self.large.iter())
            .map(|s| s.len() * 8)
            .sum()
    }

    /// Drop all slabs and clear the restart flag.
    pub fn reset(&mut self) {
        self.slabs.clear();
        self.large.clear();
        self.offset_words = 0;
        self.restart_flag = false;
    }

    pub fn restart_flag(&self) -> bool {
        self.restart_flag
    }

    pub fn set_restart_flag(&mut self, value: bool) {
        self.restart_flag = value;
    }

    /// Install this region for the current thread; the returned guard
    /// restores the previous installation when dropped.
    pub fn install(region: &mut MemoryRegion) -> RegionGuard {
        let prev = INSTALLED.with(|slot| slot.replace(std::ptr::from_mut(region)));
        RegionGuard { prev }
    }

    /// Allocate from the currently-installed region.  Returns null if no
    /// region is installed; generated code only runs under a guard.
    pub fn installed_alloc(size: usize) -> *mut u8 {
        INSTALLED.with(|slot| {
            let ptr = slot.get();
            if ptr.is_null() {
                std::ptr::null_mut()
            } else {
                unsafe { (*ptr).alloc(size) }
            }
        })
    }

    /// Raise the restart flag on the installed region, if any.  Called from
    /// runtime structures that resized underneath a vectorized primitive.
    pub fn flag_installed_restart() {
        INSTALLED.with(|slot| {
            let ptr = slot.get();
            if !ptr.is_null() {
                unsafe { (*ptr).restart_flag = true };
            }
        });
    }

    /// Read and clear the restart flag of the installed region.
    pub fn take_installed_restart() -> bool {
        INSTALLED.with(|slot| {
            let ptr = slot.get();
            if ptr.is_null() {
                false
            } else {
                unsafe {
                    let was = (*ptr).restart_flag;
                    (*ptr).restart_flag = false;
                    was
                }
            }
        })
    }
}

/// Scoped installation of a [`MemoryRegion`]; restores the previous slot on
/// drop so nested primitive calls compose.
pub struct RegionGuard {
    prev: *mut MemoryRegion,
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        INSTALLED.with(|slot| slot.set(self.prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_distinct() {
        let mut region = MemoryRegion::new();
        let a = region.alloc(3);
        let b = region.alloc(24);
        assert_eq!(a as usize % 8, 0);
        assert_eq!(b as usize % 8, 0);
        assert_ne!(a, b);
        // 3 rounds up to one word.
        assert_eq!(b as usize - a as usize, 8);
    }

    #[test]
    fn oversized_requests_get_their_own_slab() {
        let mut region = MemoryRegion::new();
        let small = region.alloc(8);
        let big = region.alloc(64 * 1024);
        assert!(!big.is_null());
        // The bump slab keeps working after the oversized allocation.
        let next = region.alloc(8);
        assert_eq!(next as usize - small as usize, 8);
    }

    #[test]
    fn reset_drops_everything() {
        let mut region = MemoryRegion::new();
        let _ = region.alloc(100);
        region.set_restart_flag(true);
        region.reset();
        assert_eq!(region.allocated_bytes(), 0);
        assert!(!region.restart_flag());
    }

    #[test]
    fn install_guard_restores_previous() {
        let mut outer = MemoryRegion::new();
        let mut inner = MemoryRegion::new();
        {
            let _outer_guard = MemoryRegion::install(&mut outer);
            assert!(!MemoryRegion::installed_alloc(8).is_null());
            {
                let _inner_guard = MemoryRegion::install(&mut inner);
                MemoryRegion::flag_installed_restart();
            }
            // Back to outer; its flag is untouched.
            assert!(!MemoryRegion::take_installed_restart());
        }
        assert!(MemoryRegion::installed_alloc(8).is_null());
        assert!(inner.restart_flag());
    }
}
