//! Morsel picking and per-thread state binding.
//!
//! Every generated function receives `void** global_state` with one state
//! pointer per suboperator in its pipeline's topological order.  A
//! [`PipelineBinding`] owns those state structs for one worker and one
//! pipeline (the full decayed pipeline for the fuser, a repiped unit for
//! the interpreter) and refreshes the volatile fields before every
//! invocation: morsel bounds for drivers, column pointers for fuse-chunk
//! sources and sinks, the staged row count for chunk-driven loops.
//!
//! Morsels themselves are claimed host-side so that every runner — fused,
//! interpreted, or both racing in hybrid mode — serves the same shared
//! cursor.

use std::os::raw::c_void;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use inkfuse_error::{InkFuseError, Result};

use crate::algebra::iu::IuId;
use crate::algebra::pipeline::Pipeline;
use crate::algebra::subop::runtime_objects::{CountCollector, ScanCursor, TableSlice};
use crate::algebra::subop::state::{
    AggReaderState, AggregatorState, CountingSinkState, FuseChunkSinkState,
    FuseChunkSourceDriverState, FuseChunkSourceIuProviderState, HashTableSourceState,
    KeyPackingState, RuntimeExprState, RuntimeFnState, StateBox, TScanDriverState,
    TScanIuProviderState,
};
use crate::algebra::subop::SubopKind;
use crate::exec::fuse_chunk::FuseChunk;

/// One unit of work claimed by a worker.
#[derive(Debug, Clone, Copy)]
pub enum Morsel {
    /// Absolute row range of a table scan.
    Rows { start: u64, end: u64 },
    /// Slot range within one hash table.
    Slots {
        table: *mut c_void,
        start: u64,
        end: u64,
    },
}

/// Shared morsel source of one pipeline, used by all runners and threads.
#[derive(Debug)]
pub enum MorselPicker {
    Scan(Arc<ScanCursor>),
    Slots(SlotPicker),
}

impl MorselPicker {
    /// Derive the picker from the pipeline's source suboperator.
    pub fn for_pipeline(pipe: &Pipeline) -> Result<MorselPicker> {
        let source = pipe
            .subops()
            .iter()
            .find(|op| op.is_source())
            .ok_or_else(|| InkFuseError::internal("pipeline has no source"))?;
        match &source.kind {
            SubopKind::TScanDriver(driver) => Ok(MorselPicker::Scan(Arc::clone(&driver.cursor))),
            SubopKind::HashTableSource(src) => Ok(MorselPicker::Slots(SlotPicker::new(
                src.tables.snapshot(),
                Arc::clone(&src.cursor),
                pipe.morsel_size(),
            ))),
            other => Err(InkFuseError::internal(format!(
                "suboperator {other:?} cannot drive a pipeline"
            ))),
        }
    }

    pub fn pick(&self, size: u64) -> Option<Morsel> {
        match self {
            MorselPicker::Scan(cursor) => cursor
                .pick(size)
                .map(|(start, end)| Morsel::Rows { start, end }),
            MorselPicker::Slots(picker) => picker.pick(),
        }
    }
}

/// Slot-range picker over the flattened list of merged hash tables.
///
/// Each table's slot space is rounded up to a multiple of the morsel size
/// in a padded global index space, so a single atomic fetch-add never hands
/// out a range spanning two tables; picks landing in the padding tail are
/// simply retried.
#[derive(Debug)]
pub struct SlotPicker {
    slices: Vec<TableSlice>,
    /// Padded global start of each slice.
    starts: Vec<u64>,
    total: u64,
    stride: u64,
    cursor: Arc<AtomicU64>,
}

impl SlotPicker {
    pub fn new(slices: Vec<TableSlice>, cursor: Arc<AtomicU64>, stride: u64) -> SlotPicker {
        let mut starts = Vec::with_capacity(slices.len());
        let mut total = 0_u64;
        for slice in &slices {
            starts.push(total);
            total += slice.slots.div_ceil(stride) * stride;
        }
        SlotPicker {
            slices,
            starts,
            total,
            stride,
            cursor,
        }
    }

    pub fn pick(&self) -> Option<Morsel> {
        loop {
            let global = self
                .cursor
                .fetch_add(self.stride, std::sync::atomic::Ordering::Relaxed);
            if global >= self.total {
                return None;
            }
            let idx = self.starts.partition_point(|start| *start <= global) - 1;
            let local = global - self.starts[idx];
            let slice = &self.slices[idx];
            if local >= slice.slots {
                // Padding tail of this slice.
                continue;
            }
            return Some(Morsel::Slots {
                table: slice.table,
                start: local,
                end: (local + self.stride).min(slice.slots),
            });
        }
    }
}

/// Per-worker state structs of one pipeline, aligned with its topological
/// order.
#[derive(Debug)]
pub struct PipelineBinding {
    states: Vec<StateBox>,
    raw: Vec<*mut c_void>,
    /// State index of the morsel-driven source, if any.
    morsel_driver: Option<usize>,
    /// State index of the chunk-driven loop plus the IU pacing it.
    chunk_driver: Option<(usize, Option<IuId>)>,
    /// (state index, column IU) refreshed from the chunk before every call.
    source_cols: Vec<(usize, IuId)>,
    sink_cols: Vec<(usize, IuId)>,
    /// Scratch-pad columns whose row count mirrors the pace column.
    scratch_ius: Vec<IuId>,
    counting: Vec<(usize, Arc<CountCollector>)>,
    /// IUs written by this pipeline's sinks; cleared before a replay.
    outputs: Vec<IuId>,
}

impl PipelineBinding {
    /// Build the binding for `pipe`.  `original` is the decayed pipeline a
    /// repiped unit was cut from; it identifies scratch-pad columns, whose
    /// staged row counts are maintained host-side.
    pub fn new(
        pipe: &Pipeline,
        original: Option<&Pipeline>,
        thread_id: usize,
    ) -> Result<PipelineBinding> {
        let mut binding = PipelineBinding {
            states: Vec::with_capacity(pipe.subops().len()),
            raw: Vec::new(),
            morsel_driver: None,
            chunk_driver: None,
            source_cols: Vec::new(),
            sink_cols: Vec::new(),
            scratch_ius: Vec::new(),
            counting: Vec::new(),
            outputs: Vec::new(),
        };
        let mut pace: Option<IuId> = None;
        let mut fallback_pace: Option<IuId> = None;
        for (idx, op) in pipe.subops().iter().enumerate() {
            let state = match &op.kind {
                SubopKind::TScanDriver(_) => {
                    binding.morsel_driver = Some(idx);
                    StateBox::TScanDriver(Box::new(TScanDriverState { start: 0, end: 0 }))
                }
                SubopKind::HashTableSource(_) => {
                    binding.morsel_driver = Some(idx);
                    StateBox::HashTableSource(Box::new(HashTableSourceState {
                        table: std::ptr::null_mut(),
                        start: 0,
                        end: 0,
                    }))
                }
                SubopKind::TScanIuProvider(provider) => {
                    StateBox::TScanIuProvider(Box::new(TScanIuProviderState {
                        start: provider.column.base(),
                    }))
                }
                SubopKind::FuseChunkSourceDriver => {
                    binding.chunk_driver = Some((idx, None));
                    StateBox::FuseChunkSourceDriver(Box::new(FuseChunkSourceDriverState {
                        size: 0,
                    }))
                }
                SubopKind::FuseChunkSourceIuProvider => {
                    let iu = op.provided_ius[0];
                    binding.source_cols.push((idx, iu));
                    let from_scratch = match original {
                        Some(orig) => orig.producer_of(iu).is_some_and(|producer| {
                            matches!(orig.subop(producer).kind, SubopKind::ScratchPadIuProvider)
                        }),
                        None => false,
                    };
                    if from_scratch {
                        binding.scratch_ius.push(iu);
                    } else if pace.is_none() {
                        pace = Some(iu);
                    }
                    if fallback_pace.is_none() {
                        fallback_pace = Some(iu);
                    }
                    StateBox::FuseChunkSourceIuProvider(Box::new(
                        FuseChunkSourceIuProviderState {
                            start: std::ptr::null(),
                            stride: 0,
                        },
                    ))
                }
                SubopKind::FuseChunkSink => {
                    let iu = op.source_ius[0];
                    binding.sink_cols.push((idx, iu));
                    binding.outputs.push(iu);
                    StateBox::FuseChunkSink(Box::new(FuseChunkSinkState {
                        dest: std::ptr::null_mut(),
                        size_ptr: std::ptr::null_mut(),
                        stride: 0,
                    }))
                }
                SubopKind::CountingSink(sink) => {
                    binding.counting.push((idx, Arc::clone(&sink.collector)));
                    StateBox::CountingSink(Box::new(CountingSinkState { count: 0 }))
                }
                SubopKind::RuntimeExpression(rexpr) => {
                    let bytes = rexpr.value.to_le_bytes();
                    let mut raw = [0_u8; 8];
                    raw[..bytes.len()].copy_from_slice(&bytes);
                    StateBox::RuntimeExpr(Box::new(RuntimeExprState {
                        value: u64::from_le_bytes(raw),
                    }))
                }
                SubopKind::KeyPacker(packing) | SubopKind::KeyUnpacker(packing) => {
                    StateBox::KeyPacking(Box::new(KeyPackingState {
                        offset: packing.offset,
                    }))
                }
                SubopKind::RuntimeFunction(fct) => StateBox::RuntimeFn(Box::new(RuntimeFnState {
                    object: fct.object.access(thread_id)?,
                })),
                SubopKind::Aggregator(agg) => StateBox::Aggregator(Box::new(AggregatorState {
                    offset: agg.offset,
                })),
                SubopKind::AggReader(reader) => StateBox::AggReader(Box::new(AggReaderState {
                    offset_a: reader.offset_a,
                    offset_b: reader.offset_b,
                })),
                SubopKind::Expression(_)
                | SubopKind::ColumnFilterScope
                | SubopKind::ColumnFilterLogic
                | SubopKind::ScratchPadIuProvider => StateBox::None,
            };
            binding.states.push(state);
        }
        if let Some((_, slot)) = &mut binding.chunk_driver {
            *slot = pace.or(fallback_pace);
        }
        binding.raw = binding
            .states
            .iter_mut()
            .map(StateBox::as_void_ptr)
            .collect();
        Ok(binding)
    }

    fn driver_state(&mut self, idx: usize) -> &mut StateBox {
        &mut self.states[idx]
    }

    /// Refresh all volatile state before an invocation over `morsel`.
    pub fn bind(&mut self, chunk: &mut FuseChunk, morsel: &Morsel) -> Result<()> {
        if let Some(idx) = self.morsel_driver {
            match (self.driver_state(idx), morsel) {
                (StateBox::TScanDriver(state), Morsel::Rows { start, end }) => {
                    state.start = *start;
                    state.end = *end;
                }
                (StateBox::HashTableSource(state), Morsel::Slots { table, start, end }) => {
                    state.table = *table;
                    state.start = *start;
                    state.end = *end;
                }
                _ => {
                    return Err(InkFuseError::internal(
                        "morsel kind does not match the pipeline source",
                    ));
                }
            }
        }
        for (idx, iu) in &self.source_cols {
            let column = chunk.column(*iu)?;
            let (data, stride) = (column.data(), column.stride() as u64);
            let StateBox::FuseChunkSourceIuProvider(state) = &mut self.states[*idx] else {
                return Err(InkFuseError::internal("source column state out of order"));
            };
            state.start = data;
            state.stride = stride;
        }
        for (idx, iu) in &self.sink_cols {
            let column = chunk.column_mut(*iu)?;
            let (data, stride) = (column.data(), column.stride() as u64);
            let size_ptr = column.size_ptr();
            let StateBox::FuseChunkSink(state) = &mut self.states[*idx] else {
                return Err(InkFuseError::internal("sink column state out of order"));
            };
            state.dest = data;
            state.size_ptr = size_ptr;
            state.stride = stride;
        }
        if let Some((idx, pace)) = self.chunk_driver {
            let size = match pace {
                Some(iu) => chunk.column(iu)?.size(),
                None => 0,
            };
            let StateBox::FuseChunkSourceDriver(state) = &mut self.states[idx] else {
                return Err(InkFuseError::internal("chunk driver state out of order"));
            };
            state.size = size;
            // Scratch-pad columns carry no producer-written rows; their row
            // count follows the loop driving the packers.
            for iu in &self.scratch_ius {
                chunk.column_mut(*iu)?.set_size(size);
            }
        }
        Ok(())
    }

    /// Clear the columns this pipeline appends to, before a first run or a
    /// restart replay.
    pub fn reset_outputs(&self, chunk: &mut FuseChunk) -> Result<()> {
        for iu in &self.outputs {
            chunk.column_mut(*iu)?.set_size(0);
        }
        Ok(())
    }

    /// The `void** global_state` array for the generated function.
    pub fn state_array(&mut self) -> *mut *mut c_void {
        self.raw.as_mut_ptr()
    }

    /// Flush terminal accumulators (counting sinks) once per worker.
    pub fn finish(&mut self) {
        for (idx, collector) in &self.counting {
            if let StateBox::CountingSink(state) = &mut self.states[*idx] {
                collector.add(state.count);
                state.count = 0;
            }
        }
    }
}
