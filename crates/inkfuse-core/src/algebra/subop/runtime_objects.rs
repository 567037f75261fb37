//! Shared runtime objects referenced by suboperators.
//!
//! A suboperator survives repiping by sharing these objects through `Arc`:
//! the decayed pipeline, its repiped fragments, and the fused whole-pipeline
//! clone all see the same cursor, table, or materializer.  Objects whose
//! size depends on the worker count are deferred: `prepare(num_threads)`
//! runs once before the owning pipeline starts, `access(thread_id)` hands
//! the typed pointer to the runners.

use std::os::raw::c_void;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Type;
use inkfuse_runtime::{
    AtomicHashTable, ComplexKeyComparator, ExclusiveHashTable, SimpleKeyComparator,
    TupleMaterializer,
};
use inkfuse_storage::Relation;
use parking_lot::Mutex;

use super::GranuleKind;

/// Initial capacity of thread-local pre-aggregation tables.
const PRE_AGG_INITIAL_CAPACITY: u64 = 64;
/// Tuples per hash-and-prefetch batch during the parallel join build.
const BUILD_BATCH: usize = 256;

// ── Scan support ───────────────────────────────────────────────────────────

/// Shared `[start, end)` row cursor advanced by atomic fetch-add.
#[derive(Debug)]
pub struct ScanCursor {
    pos: AtomicU64,
    total: u64,
}

impl ScanCursor {
    pub fn new(total: u64) -> ScanCursor {
        ScanCursor {
            pos: AtomicU64::new(0),
            total,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Claim up to `size` rows; `None` once the input is exhausted.
    pub fn pick(&self, size: u64) -> Option<(u64, u64)> {
        let start = self.pos.fetch_add(size, Ordering::Relaxed);
        if start >= self.total {
            return None;
        }
        Some((start, (start + size).min(self.total)))
    }
}

/// One scanned column: base pointer, element width, value type.  Keeps the
/// relation alive through the `Arc`.
#[derive(Debug, Clone)]
pub struct ColumnSlice {
    _rel: Arc<Relation>,
    base: *const u8,
    elem: usize,
    ty: Type,
}

unsafe impl Send for ColumnSlice {}
unsafe impl Sync for ColumnSlice {}

impl ColumnSlice {
    pub fn new(rel: Arc<Relation>, column: &str) -> Result<ColumnSlice> {
        let col = rel.column(column)?;
        let (base, elem, ty) = (col.data_ptr(), col.elem_size(), col.value_type());
        Ok(ColumnSlice {
            _rel: rel,
            base,
            elem,
            ty,
        })
    }

    pub fn base(&self) -> *const u8 {
        self.base
    }

    pub fn elem_size(&self) -> usize {
        self.elem
    }

    pub fn value_type(&self) -> &Type {
        &self.ty
    }
}

/// Total collected by counting sinks across threads.
#[derive(Debug, Default)]
pub struct CountCollector {
    total: AtomicU64,
}

impl CountCollector {
    pub fn new() -> CountCollector {
        CountCollector::default()
    }

    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

// ── Key specification ──────────────────────────────────────────────────────

/// Which comparator family a packed key uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// `size` memcmp-able bytes.
    Simple { size: usize },
    /// `slots` leading string-pointer slots plus `simple` trailing bytes.
    Complex { slots: usize, simple: usize },
}

impl KeySpec {
    pub fn key_size(&self) -> usize {
        match self {
            KeySpec::Simple { size } => *size,
            KeySpec::Complex { slots, simple } => slots * 8 + simple,
        }
    }

    /// Identifier infix selecting the runtime function family.
    pub fn tag(&self) -> &'static str {
        match self {
            KeySpec::Simple { .. } => "sk",
            KeySpec::Complex { .. } => "ck",
        }
    }
}

// ── Deferred object plumbing ───────────────────────────────────────────────

/// Runtime object a [`super::RuntimeFunctionSubop`] calls through.
#[derive(Debug, Clone)]
pub enum RuntimeObject {
    None,
    /// Shared atomic join table, built by the inter-pipeline runtime task.
    JoinTable(Arc<JoinBuildState>),
    /// Thread-local pre-aggregation tables.
    AggTables(Arc<AggregationState>),
    /// Thread-local tuple materializers.
    Materializers(Arc<MaterializerSet>),
}

impl RuntimeObject {
    /// Construct per-thread instances once the worker count is known.
    pub fn prepare(&self, num_threads: usize) {
        match self {
            RuntimeObject::None | RuntimeObject::JoinTable(_) => {}
            RuntimeObject::AggTables(state) => state.prepare(num_threads),
            RuntimeObject::Materializers(mats) => mats.prepare(num_threads),
        }
    }

    /// Typed pointer for one worker.
    pub fn access(&self, thread_id: usize) -> Result<*mut c_void> {
        match self {
            RuntimeObject::None => Ok(std::ptr::null_mut()),
            RuntimeObject::JoinTable(state) => state.table_ptr(),
            RuntimeObject::AggTables(state) => state.access(thread_id),
            RuntimeObject::Materializers(mats) => mats.access(thread_id),
        }
    }
}

// ── Tuple materializer set ─────────────────────────────────────────────────

/// A flattened chunk of materialized tuples, served to build workers.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSlice {
    pub base: *const u8,
    pub rows: usize,
}

unsafe impl Send for ChunkSlice {}
unsafe impl Sync for ChunkSlice {}

/// One tuple materializer per worker thread.
#[derive(Debug)]
pub struct MaterializerSet {
    tuple_size: usize,
    mats: Mutex<Vec<Box<TupleMaterializer>>>,
}

unsafe impl Send for MaterializerSet {}
unsafe impl Sync for MaterializerSet {}

impl MaterializerSet {
    pub fn new(tuple_size: usize) -> MaterializerSet {
        MaterializerSet {
            tuple_size,
            mats: Mutex::new(Vec::new()),
        }
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn prepare(&self, num_threads: usize) {
        let mut mats = self.mats.lock();
        while mats.len() < num_threads {
            mats.push(Box::new(TupleMaterializer::new(self.tuple_size)));
        }
    }

    pub fn access(&self, thread_id: usize) -> Result<*mut c_void> {
        let mut mats = self.mats.lock();
        let mat = mats.get_mut(thread_id).ok_or_else(|| {
            InkFuseError::internal(format!("materializer set has no thread {thread_id}"))
        })?;
        Ok(std::ptr::from_mut(mat.as_mut()).cast())
    }

    pub fn total_tuples(&self) -> usize {
        self.mats.lock().iter().map(|m| m.num_tuples()).sum()
    }

    /// Flatten all finalized chunks into slices for the parallel build.
    pub fn chunk_slices(&self) -> Vec<ChunkSlice> {
        let mats = self.mats.lock();
        let mut slices = Vec::new();
        for mat in mats.iter() {
            let handle = mat.read_handle();
            while let Some(chunk) = handle.pull_chunk() {
                slices.push(ChunkSlice {
                    base: chunk.base(),
                    rows: chunk.used_bytes() / self.tuple_size,
                });
            }
        }
        slices
    }
}

// ── Join build state ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum JoinTable {
    Sk(AtomicHashTable<SimpleKeyComparator>),
    Ck(AtomicHashTable<ComplexKeyComparator>),
}

impl JoinTable {
    fn as_void_ptr(&self) -> *mut c_void {
        match self {
            JoinTable::Sk(t) => std::ptr::from_ref(t).cast_mut().cast(),
            JoinTable::Ck(t) => std::ptr::from_ref(t).cast_mut().cast(),
        }
    }

    unsafe fn insert_batch(&self, slice: ChunkSlice, tuple_size: usize) {
        let mut hashes = [0_u64; BUILD_BATCH];
        let mut done = 0;
        while done < slice.rows {
            let batch = BUILD_BATCH.min(slice.rows - done);
            for i in 0..batch {
                let tuple = slice.base.add((done + i) * tuple_size);
                hashes[i] = match self {
                    JoinTable::Sk(t) => t.compute_hash_and_prefetch(tuple),
                    JoinTable::Ck(t) => t.compute_hash_and_prefetch(tuple),
                };
            }
            for i in 0..batch {
                let tuple = slice.base.add((done + i) * tuple_size);
                match self {
                    JoinTable::Sk(t) => t.insert_tuple_with_hash(tuple, hashes[i]),
                    JoinTable::Ck(t) => t.insert_tuple_with_hash(tuple, hashes[i]),
                };
            }
            done += batch;
        }
    }
}

/// Everything the PK-join build phase shares between its pipelines: the
/// thread-local materializers feeding it and the atomic table the runtime
/// task constructs once the build row count is known.
#[derive(Debug)]
pub struct JoinBuildState {
    key_spec: KeySpec,
    payload_size: usize,
    mats: Arc<MaterializerSet>,
    table: OnceLock<JoinTable>,
}

impl JoinBuildState {
    pub fn new(key_spec: KeySpec, payload_size: usize, mats: Arc<MaterializerSet>) -> Self {
        JoinBuildState {
            key_spec,
            payload_size,
            mats,
            table: OnceLock::new(),
        }
    }

    pub fn key_spec(&self) -> KeySpec {
        self.key_spec
    }

    /// Runtime task: allocate the table at `2 ×` the materialized row count
    /// (rounded up to a power of two) and insert in parallel, prefetching
    /// in batches of 256 tuples.
    pub fn build_table(&self, num_threads: usize) -> Result<()> {
        let total = self.mats.total_tuples() as u64;
        let slots = (2 * total).max(16).next_power_of_two();
        let table = match self.key_spec {
            KeySpec::Simple { size } => JoinTable::Sk(AtomicHashTable::new(
                SimpleKeyComparator::new(size),
                self.payload_size,
                slots,
            )),
            KeySpec::Complex { slots: cs, simple } => JoinTable::Ck(AtomicHashTable::new(
                ComplexKeyComparator::new(cs, simple),
                self.payload_size,
                slots,
            )),
        };
        let slices = self.mats.chunk_slices();
        let cursor = AtomicUsize::new(0);
        let tuple_size = self.mats.tuple_size();
        std::thread::scope(|scope| {
            for _ in 0..num_threads.max(1) {
                scope.spawn(|| loop {
                    let idx = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(slice) = slices.get(idx) else {
                        break;
                    };
                    unsafe {
                        table.insert_batch(*slice, tuple_size);
                    }
                });
            }
        });
        tracing::debug!(rows = total, slots, "join table built");
        self.table
            .set(table)
            .map_err(|_| InkFuseError::internal("join table built twice"))
    }

    pub fn table_ptr(&self) -> Result<*mut c_void> {
        self.table
            .get()
            .map(JoinTable::as_void_ptr)
            .ok_or_else(|| InkFuseError::internal("join table accessed before its runtime task"))
    }
}

// ── Aggregation state ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AggTable {
    Sk(ExclusiveHashTable<SimpleKeyComparator>),
    Ck(ExclusiveHashTable<ComplexKeyComparator>),
}

impl AggTable {
    fn new(spec: KeySpec, payload_size: usize, capacity: u64) -> AggTable {
        match spec {
            KeySpec::Simple { size } => AggTable::Sk(ExclusiveHashTable::new(
                SimpleKeyComparator::new(size),
                payload_size,
                capacity,
            )),
            KeySpec::Complex { slots, simple } => AggTable::Ck(ExclusiveHashTable::new(
                ComplexKeyComparator::new(slots, simple),
                payload_size,
                capacity,
            )),
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            AggTable::Sk(t) => t.len(),
            AggTable::Ck(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u64 {
        match self {
            AggTable::Sk(t) => t.capacity(),
            AggTable::Ck(t) => t.capacity(),
        }
    }

    fn as_void_ptr(&mut self) -> *mut c_void {
        match self {
            AggTable::Sk(t) => std::ptr::from_mut(t).cast(),
            AggTable::Ck(t) => std::ptr::from_mut(t).cast(),
        }
    }

    fn iter_slots(&self) -> Box<dyn Iterator<Item = *const u8> + '_> {
        match self {
            AggTable::Sk(t) => Box::new(t.iter_slots()),
            AggTable::Ck(t) => Box::new(t.iter_slots()),
        }
    }

    unsafe fn hash_stored(&self, slot: *const u8) -> u64 {
        match self {
            AggTable::Sk(t) => t.hash_stored(slot),
            AggTable::Ck(t) => t.hash_stored(slot),
        }
    }

    unsafe fn lookup_or_insert(&mut self, key: *const u8) -> (*mut u8, bool) {
        match self {
            AggTable::Sk(t) => t.lookup_or_insert(key),
            AggTable::Ck(t) => t.lookup_or_insert(key),
        }
    }
}

/// Shared state of one aggregation: thread-local pre-aggregation tables and
/// the hash-partitioned post-merge tables the read pipeline iterates.
#[derive(Debug)]
pub struct AggregationState {
    key_spec: KeySpec,
    payload_size: usize,
    /// Granule kinds and their absolute slot offsets, for merging.
    granules: Vec<(GranuleKind, u64)>,
    pre: Mutex<Vec<Box<AggTable>>>,
    merged: Mutex<Vec<Box<AggTable>>>,
}

impl AggregationState {
    pub fn new(
        key_spec: KeySpec,
        payload_size: usize,
        granules: Vec<(GranuleKind, u64)>,
    ) -> AggregationState {
        AggregationState {
            key_spec,
            payload_size,
            granules,
            pre: Mutex::new(Vec::new()),
            merged: Mutex::new(Vec::new()),
        }
    }

    pub fn key_spec(&self) -> KeySpec {
        self.key_spec
    }

    pub fn prepare(&self, num_threads: usize) {
        let mut pre = self.pre.lock();
        while pre.len() < num_threads {
            pre.push(Box::new(AggTable::new(
                self.key_spec,
                self.payload_size,
                PRE_AGG_INITIAL_CAPACITY,
            )));
        }
    }

    pub fn access(&self, thread_id: usize) -> Result<*mut c_void> {
        let mut pre = self.pre.lock();
        let table = pre.get_mut(thread_id).ok_or_else(|| {
            InkFuseError::internal(format!("aggregation state has no thread {thread_id}"))
        })?;
        Ok(table.as_void_ptr())
    }

    /// Runtime task between build and read pipelines: worker `t` re-hashes
    /// every pre-merge row and claims those with `hash % N == t` into
    /// post-merge table `t`, combining granules of groups seen by several
    /// workers.  Merge tables are pre-sized; a resize is fatal.
    pub fn merge(&self, num_threads: usize) -> Result<()> {
        let pre = std::mem::take(&mut *self.pre.lock());
        let mut merged = self.merged.lock();
        if num_threads <= 1 || pre.len() <= 1 {
            *merged = pre.into_iter().filter(|t| !t.is_empty()).collect();
            return Ok(());
        }
        let total: u64 = pre.iter().map(|t| t.len()).sum();
        let capacity = (2 * total).max(16).next_power_of_two();
        let n = num_threads as u64;
        let pre_ref = &pre;
        let results: Vec<Result<Box<AggTable>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..num_threads)
                .map(|t| {
                    scope.spawn(move || {
                        let mut local = Box::new(AggTable::new(
                            self.key_spec,
                            self.payload_size,
                            capacity,
                        ));
                        for table in pre_ref.iter() {
                            for slot in table.iter_slots() {
                                let hash = unsafe { table.hash_stored(slot) };
                                if hash % n != t as u64 {
                                    continue;
                                }
                                let before = local.capacity();
                                let (dst, inserted) = unsafe { local.lookup_or_insert(slot) };
                                if local.capacity() != before {
                                    return Err(InkFuseError::ResizeDuringMerge);
                                }
                                let key_size = self.key_spec.key_size();
                                unsafe {
                                    if inserted {
                                        std::ptr::copy_nonoverlapping(
                                            slot.add(key_size),
                                            dst.add(key_size),
                                            self.payload_size,
                                        );
                                    } else {
                                        self.combine_granules(dst, slot);
                                    }
                                }
                            }
                        }
                        Ok(local)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("merge worker panicked"))
                .collect()
        });
        let mut out = Vec::new();
        for result in results {
            let table = result?;
            if !table.is_empty() {
                out.push(table);
            }
        }
        tracing::debug!(groups = total, partitions = out.len(), "aggregation merged");
        *merged = out;
        Ok(())
    }

    /// Add `src`'s granules into `dst`, dispatched by granule kind.
    unsafe fn combine_granules(&self, dst: *mut u8, src: *const u8) {
        for (kind, offset) in &self.granules {
            let off = *offset as usize;
            match kind {
                GranuleKind::Count | GranuleKind::SumI8 => {
                    let d = dst.add(off).cast::<i64>();
                    d.write_unaligned(d.read_unaligned() + src.add(off).cast::<i64>().read_unaligned());
                }
                GranuleKind::SumI4 => {
                    let d = dst.add(off).cast::<i32>();
                    d.write_unaligned(d.read_unaligned() + src.add(off).cast::<i32>().read_unaligned());
                }
                GranuleKind::SumF8 => {
                    let d = dst.add(off).cast::<f64>();
                    d.write_unaligned(d.read_unaligned() + src.add(off).cast::<f64>().read_unaligned());
                }
            }
        }
    }

    /// Snapshot of the post-merge tables for the read pipeline.
    pub fn merged_snapshot(&self) -> Vec<TableSlice> {
        let mut merged = self.merged.lock();
        merged
            .iter_mut()
            .map(|t| TableSlice {
                table: t.as_void_ptr(),
                slots: t.capacity(),
            })
            .collect()
    }

    pub fn merged_group_count(&self) -> u64 {
        self.merged.lock().iter().map(|t| t.len()).sum()
    }
}

/// Raw view of one iterable hash table.
#[derive(Debug, Clone, Copy)]
pub struct TableSlice {
    pub table: *mut c_void,
    pub slots: u64,
}

unsafe impl Send for TableSlice {}
unsafe impl Sync for TableSlice {}

/// The table list a [`super::HashTableSource`] iterates.
#[derive(Debug)]
pub struct HashTableSet {
    state: Arc<AggregationState>,
}

impl HashTableSet {
    pub fn new(state: Arc<AggregationState>) -> HashTableSet {
        HashTableSet { state }
    }

    pub fn comparator_tag(&self) -> &'static str {
        self.state.key_spec().tag()
    }

    pub fn snapshot(&self) -> Vec<TableSlice> {
        self.state.merged_snapshot()
    }
}
