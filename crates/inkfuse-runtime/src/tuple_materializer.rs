//! Thread-local row materialization for join builds.
//!
//! Each worker owns a materializer and appends fixed-size tuples into 16 KB
//! chunks.  After the build pipeline finishes, a [`ReadHandle`] serves the
//! finalized chunks to any number of consuming workers through an atomic
//! cursor, giving the multi-threaded hash-table insert phase morsels for
//! free.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One page worth of tuples.
pub const CHUNK_BYTES: usize = 16 * 1024;

/// A finalized slab of materialized tuples.
#[derive(Debug)]
pub struct MatChunk {
    /// 8-byte aligned backing storage.
    data: Box<[u64]>,
    used_bytes: usize,
}

impl MatChunk {
    fn new() -> MatChunk {
        MatChunk {
            data: vec![0_u64; CHUNK_BYTES / 8].into_boxed_slice(),
            used_bytes: 0,
        }
    }

    pub fn base(&self) -> *const u8 {
        self.data.as_ptr().cast()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }
}

/// Append-only row buffer with fixed tuple size.
#[derive(Debug)]
pub struct TupleMaterializer {
    tuple_size: usize,
    chunks: VecDeque<MatChunk>,
    num_tuples: usize,
}

impl TupleMaterializer {
    /// Create a materializer for `tuple_size`-byte rows.  Tuples must fit a
    /// chunk.
    pub fn new(tuple_size: usize) -> TupleMaterializer {
        assert!(
            tuple_size > 0 && tuple_size <= CHUNK_BYTES,
            "tuple size {tuple_size} outside (0, {CHUNK_BYTES}]"
        );
        let mut chunks = VecDeque::new();
        chunks.push_back(MatChunk::new());
        TupleMaterializer {
            tuple_size,
            chunks,
            num_tuples: 0,
        }
    }

    /// Reserve the next row slot and return its pointer.  The caller packs
    /// the tuple into it before the next call.
    pub fn materialize(&mut self) -> *mut u8 {
        if self
            .chunks
            .back()
            .is_none_or(|c| c.used_bytes + self.tuple_size > CHUNK_BYTES)
        {
            self.chunks.push_back(MatChunk::new());
        }
        let chunk = self.chunks.back_mut().expect("chunk just ensured");
        let ptr = unsafe { chunk.data.as_mut_ptr().cast::<u8>().add(chunk.used_bytes) };
        chunk.used_bytes += self.tuple_size;
        self.num_tuples += 1;
        ptr
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn num_tuples(&self) -> usize {
        self.num_tuples
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Open a handle that serves chunks to parallel readers.  Chunks are
    /// immutable once a handle exists.
    pub fn read_handle(&self) -> ReadHandle<'_> {
        ReadHandle {
            mat: self,
            offset: AtomicUsize::new(0),
        }
    }
}

/// Thread-safe chunk dispenser over a finalized materializer.
#[derive(Debug)]
pub struct ReadHandle<'a> {
    mat: &'a TupleMaterializer,
    offset: AtomicUsize,
}

impl<'a> ReadHandle<'a> {
    /// Claim the next unread chunk, or `None` when all chunks were taken.
    pub fn pull_chunk(&self) -> Option<&'a MatChunk> {
        let idx = self.offset.fetch_add(1, Ordering::Relaxed);
        self.mat.chunks.get(idx)
    }

    pub fn tuple_size(&self) -> usize {
        self.mat.tuple_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn chunk_overflow_appends_new_chunk() {
        let mut mat = TupleMaterializer::new(8);
        let per_chunk = CHUNK_BYTES / 8;
        for i in 0..=per_chunk {
            unsafe {
                mat.materialize().cast::<u64>().write(i as u64);
            }
        }
        assert_eq!(mat.num_chunks(), 2);
        assert_eq!(mat.num_tuples(), per_chunk + 1);
    }

    #[test]
    fn parallel_readers_partition_the_chunks() {
        let mut mat = TupleMaterializer::new(8);
        let total = 200_000_usize;
        for i in 0..total {
            unsafe {
                mat.materialize().cast::<u64>().write(i as u64);
            }
        }
        assert!(mat.num_chunks() >= total * 8 / CHUNK_BYTES);

        let handle = mat.read_handle();
        let seen: Mutex<HashSet<u64>> = Mutex::new(HashSet::new());
        let rows = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    let mut local = HashSet::new();
                    let mut local_rows = 0;
                    while let Some(chunk) = handle.pull_chunk() {
                        let n = chunk.used_bytes() / 8;
                        for i in 0..n {
                            let v = unsafe { chunk.base().cast::<u64>().add(i).read() };
                            local.insert(v);
                        }
                        local_rows += n;
                    }
                    rows.fetch_add(local_rows, Ordering::Relaxed);
                    seen.lock().unwrap().extend(local);
                });
            }
        });
        assert_eq!(rows.load(Ordering::Relaxed), total);
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), total);
        assert!(seen.contains(&0) && seen.contains(&(total as u64 - 1)));
    }
}
