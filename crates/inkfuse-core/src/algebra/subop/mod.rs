//! Suboperators: the atomic units of code generation and interpretation.
//!
//! A suboperator is plain data — consumed IUs, provided IUs, a tagged
//! [`SubopKind`] carrying discrete and runtime parameters — plus capability
//! accessors.  Code generation for each kind lives with the compilation
//! context; per-thread state layouts live in [`state`]; shared runtime
//! objects (cursors, hash tables, materializers) live in
//! [`runtime_objects`].
//!
//! Each kind derives a deterministic identifier string from its discrete
//! parameters; the identifier keys the pre-compiled fragment cache.

pub mod runtime_objects;
pub mod state;

use inkfuse_ir::{ArithOp, Type, Value};
use smallvec::SmallVec;

use crate::algebra::iu::{IuId, IuSpace};
use runtime_objects::{
    ColumnSlice, CountCollector, HashTableSet, MaterializerSet, RuntimeObject, ScanCursor,
};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Rows per morsel for plain pipelines.
pub const DEFAULT_MORSEL_SIZE: u64 = 8192;
/// Reduced morsel for pipelines crossing hash-and-prefetch primitives, so
/// prefetched lines are still in L1 when the lookup arrives.
pub const PREFETCH_MORSEL_SIZE: u64 = 256;

/// A node of the suboperator DAG.
#[derive(Debug, Clone)]
pub struct Suboperator {
    pub kind: SubopKind,
    /// IUs consumed, in deterministic order.
    pub source_ius: SmallVec<[IuId; 4]>,
    /// IUs produced.
    pub provided_ius: SmallVec<[IuId; 2]>,
    /// Subset of `source_ius` whose producer must be generated in the same
    /// function (loop counters, filter scopes).  Never separated by a
    /// fuse-chunk boundary.
    pub strong_source_ius: SmallVec<[IuId; 2]>,
}

impl Suboperator {
    pub fn new(
        kind: SubopKind,
        source_ius: impl IntoIterator<Item = IuId>,
        provided_ius: impl IntoIterator<Item = IuId>,
    ) -> Suboperator {
        Suboperator {
            kind,
            source_ius: source_ius.into_iter().collect(),
            provided_ius: provided_ius.into_iter().collect(),
            strong_source_ius: SmallVec::new(),
        }
    }

    pub fn with_strong(mut self, strong: impl IntoIterator<Item = IuId>) -> Suboperator {
        self.strong_source_ius = strong.into_iter().collect();
        self
    }

    /// Does this suboperator open the pipeline's driving loop?
    pub fn is_source(&self) -> bool {
        matches!(
            self.kind,
            SubopKind::TScanDriver(_)
                | SubopKind::FuseChunkSourceDriver
                | SubopKind::HashTableSource(_)
        )
    }

    /// Terminal node without provided IUs consumed downstream.
    pub fn is_sink(&self) -> bool {
        self.provided_ius.is_empty()
    }

    /// Morsel-size preference this suboperator imposes on its pipeline.
    pub fn morsel_preference(&self) -> u64 {
        match &self.kind {
            SubopKind::RuntimeFunction(f) if f.prefetching => PREFETCH_MORSEL_SIZE,
            _ => DEFAULT_MORSEL_SIZE,
        }
    }

    /// Deterministic identifier derived from the kind and its discrete
    /// parameters; keys the fragment cache.
    pub fn id(&self, ius: &IuSpace) -> String {
        let ty_of = |iu: &IuId| ius.ty(*iu).id();
        match &self.kind {
            SubopKind::TScanDriver(_) => "TScanDriver".to_string(),
            SubopKind::TScanIuProvider(_) => {
                format!("TScanIUProvider_{}", ty_of(&self.provided_ius[0]))
            }
            SubopKind::FuseChunkSourceDriver => "FuseChunkSourceDriver".to_string(),
            SubopKind::FuseChunkSourceIuProvider => {
                format!(
                    "FuseChunkSourceIUProvider_{}",
                    chunk_ty_id(&ius.ty(self.provided_ius[0]))
                )
            }
            SubopKind::FuseChunkSink => {
                format!("FuseChunkSink_{}", chunk_ty_id(&ius.ty(self.source_ius[0])))
            }
            SubopKind::CountingSink(_) => {
                format!("CountingSink_{}", ty_of(&self.source_ius[0]))
            }
            SubopKind::Expression(e) => match &e.op {
                // A repeated operand IU folds two fragment inputs into one,
                // which changes the fragment's state layout.
                ExprOpcode::Binary(op) => format!(
                    "ExpressionSubop_{}_{}_{}{}",
                    op.id(),
                    ty_of(&self.source_ius[0]),
                    ty_of(&self.source_ius[1]),
                    if self.source_ius[0] == self.source_ius[1] {
                        "_dup"
                    } else {
                        ""
                    }
                ),
                ExprOpcode::Cast(target) => format!(
                    "ExpressionSubop_Cast_{}_{}",
                    ty_of(&self.source_ius[0]),
                    target.id()
                ),
            },
            SubopKind::RuntimeExpression(e) => format!(
                "RuntimeExpressionSubop_{}_{}_{}{}",
                e.op.id(),
                ty_of(&self.source_ius[0]),
                e.value.ty().id(),
                if e.const_on_left { "_lconst" } else { "" }
            ),
            SubopKind::ColumnFilterScope => "ColumnFilterScope".to_string(),
            SubopKind::ColumnFilterLogic => {
                // source_ius = [scope pseudo, filtered value].
                format!("ColumnFilterLogic_{}", ty_of(&self.source_ius[1]))
            }
            SubopKind::ScratchPadIuProvider => {
                format!("ScratchPadIUProvider_{}", ty_of(&self.provided_ius[0]))
            }
            SubopKind::KeyPacker(_) => {
                // source_ius = [dest pointer, packed value].  The dest is
                // addressed by element pointer for scratch-pad byte arrays
                // and by loaded value for staged tuple pointers; the two
                // shapes are distinct fragments.
                format!(
                    "KeyPackerSubop_{}_{}",
                    chunk_ty_id(&ius.ty(self.source_ius[0])),
                    ty_of(&self.source_ius[1])
                )
            }
            SubopKind::KeyUnpacker(_) => {
                format!("KeyUnpackerSubop_{}", ty_of(&self.provided_ius[0]))
            }
            SubopKind::RuntimeFunction(f) => {
                // Non-pseudo sources become fragment inputs; their chunk
                // types are part of the discrete design space.
                let mut id = format!("RuntimeFunctionSubop_{}", f.fct_name);
                for iu in &self.source_ius {
                    if !ius.is_pseudo(*iu) {
                        id.push('_');
                        id.push_str(&chunk_ty_id(&ius.ty(*iu)));
                    }
                }
                id
            }
            SubopKind::Aggregator(a) => match self.source_ius.get(1) {
                Some(src) => format!("AggregatorSubop_{}_{}", a.granule.id(), ty_of(src)),
                None => format!("AggregatorSubop_{}", a.granule.id()),
            },
            SubopKind::AggReader(r) => format!("AggReaderSubop_{}", r.compute_id()),
            SubopKind::HashTableSource(s) => {
                format!("HashTableSource_{}", s.tables.comparator_tag())
            }
        }
    }

    /// Name of the `#[repr(C)]` state struct backing this suboperator, if
    /// it has runtime state.
    pub fn state_struct_name(&self) -> Option<&'static str> {
        match &self.kind {
            SubopKind::TScanDriver(_) => Some("TScanDriverState"),
            SubopKind::TScanIuProvider(_) => Some("TScanIuProviderState"),
            SubopKind::FuseChunkSourceDriver => Some("FuseChunkSourceDriverState"),
            SubopKind::FuseChunkSourceIuProvider => Some("FuseChunkSourceIuProviderState"),
            SubopKind::FuseChunkSink => Some("FuseChunkSinkState"),
            SubopKind::CountingSink(_) => Some("CountingSinkState"),
            SubopKind::RuntimeExpression(_) => Some("RuntimeExprState"),
            SubopKind::KeyPacker(_) | SubopKind::KeyUnpacker(_) => Some("KeyPackingState"),
            SubopKind::RuntimeFunction(_) => Some("RuntimeFnState"),
            SubopKind::Aggregator(_) => Some("AggregatorState"),
            SubopKind::AggReader(_) => Some("AggReaderState"),
            SubopKind::HashTableSource(_) => Some("HashTableSourceState"),
            SubopKind::Expression(_)
            | SubopKind::ColumnFilterScope
            | SubopKind::ColumnFilterLogic
            | SubopKind::ScratchPadIuProvider => None,
        }
    }
}

/// How the value of an IU is addressed inside a fuse-chunk column; byte
/// arrays are addressed by element pointer with a runtime stride, so their
/// fragment identifiers are width-independent.
fn chunk_ty_id(ty: &Type) -> String {
    match ty {
        Type::ByteArray(_) => "ByteArray".to_string(),
        other => other.id(),
    }
}

/// Concrete suboperator kinds.
#[derive(Debug, Clone)]
pub enum SubopKind {
    /// Loop source picking `[start, end)` row morsels from a relation.
    TScanDriver(TScanDriver),
    /// Reads `column_base[row_idx]` inside the scan loop.
    TScanIuProvider(TScanIuProvider),
    /// Loop source over a staged fuse chunk (repiped pipelines only).
    FuseChunkSourceDriver,
    /// Reads one IU column of the staged chunk.
    FuseChunkSourceIuProvider,
    /// Appends one IU to its fuse-chunk column.
    FuseChunkSink,
    /// Terminal row counter.
    CountingSink(CountingSink),
    /// Pure computation over IUs.
    Expression(ExpressionSubop),
    /// Computation with one constant operand held as a runtime parameter.
    RuntimeExpression(RuntimeExpressionSubop),
    /// Opens an `if` on a boolean IU; provides the scope pseudo-IU.
    ColumnFilterScope,
    /// Redefines one IU inside the filter scope.
    ColumnFilterLogic,
    /// Provides a local byte-array scratch pad for key packing.
    ScratchPadIuProvider,
    /// Writes one value into the compound key at a runtime offset.
    KeyPacker(KeyPackingSubop),
    /// Reads one value out of a packed row pointer at a runtime offset.
    KeyUnpacker(KeyPackingSubop),
    /// Calls a runtime C-ABI function on a state object.
    RuntimeFunction(RuntimeFunctionSubop),
    /// Updates one aggregate granule behind a payload pointer.
    Aggregator(AggregatorSubop),
    /// Computes an output value from granules behind a payload pointer.
    AggReader(AggReaderSubop),
    /// Loop source over the filled slots of hash tables.
    HashTableSource(HashTableSource),
}

// ── Kind payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TScanDriver {
    pub cursor: Arc<ScanCursor>,
}

#[derive(Debug, Clone)]
pub struct TScanIuProvider {
    pub column: ColumnSlice,
}

#[derive(Debug, Clone)]
pub struct CountingSink {
    pub collector: Arc<CountCollector>,
}

/// Opcode of a pure expression suboperator.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprOpcode {
    Binary(ArithOp),
    Cast(Type),
}

#[derive(Debug, Clone)]
pub struct ExpressionSubop {
    pub op: ExprOpcode,
}

#[derive(Debug, Clone)]
pub struct RuntimeExpressionSubop {
    pub op: ArithOp,
    /// The constant operand; baked into fused code, loaded from the state
    /// struct by fragments.
    pub value: Value,
    pub const_on_left: bool,
}

#[derive(Debug, Clone)]
pub struct KeyPackingSubop {
    /// Byte offset within the packed compound key.
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct RuntimeFunctionSubop {
    /// Runtime registry symbol to invoke.
    pub fct_name: &'static str,
    /// Call arguments drawn from `source_ius` (the rest are ordering-only).
    pub args: SmallVec<[IuId; 2]>,
    /// First call argument: the backing object installed per thread.
    pub object: RuntimeObject,
    /// Imposes the reduced prefetch morsel size on the pipeline.
    pub prefetching: bool,
}

/// The smallest reusable unit of aggregate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GranuleKind {
    /// 8-byte signed row count.
    Count,
    SumI4,
    SumI8,
    SumF8,
}

impl GranuleKind {
    pub fn id(self) -> &'static str {
        match self {
            GranuleKind::Count => "count",
            GranuleKind::SumI4 => "sum_i4",
            GranuleKind::SumI8 => "sum_i8",
            GranuleKind::SumF8 => "sum_f8",
        }
    }

    /// Bytes of state this granule occupies.
    pub fn size(self) -> usize {
        match self {
            GranuleKind::Count | GranuleKind::SumI8 => 8,
            GranuleKind::SumI4 => 4,
            GranuleKind::SumF8 => 8,
        }
    }

    /// Type of the stored accumulator.
    pub fn stored_type(self) -> Type {
        match self {
            GranuleKind::Count | GranuleKind::SumI8 => Type::SignedInt(8),
            GranuleKind::SumI4 => Type::SignedInt(4),
            GranuleKind::SumF8 => Type::Float(8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorSubop {
    pub granule: GranuleKind,
    /// Byte offset of the granule within the hash-table slot.
    pub offset: u64,
}

/// Output computation of an aggregation read pipeline.
#[derive(Debug, Clone)]
pub enum AggCompute {
    /// Read one granule (or the packed key part) verbatim.
    Unpack { ty: Type },
    /// `sum / count` as double.
    Avg { sum: GranuleKind },
}

#[derive(Debug, Clone)]
pub struct AggReaderSubop {
    pub compute: AggCompute,
    /// Offset of the primary granule.
    pub offset_a: u64,
    /// Offset of the count granule for averages; unused otherwise.
    pub offset_b: u64,
}

impl AggReaderSubop {
    pub fn compute_id(&self) -> String {
        match &self.compute {
            AggCompute::Unpack { ty } => format!("unpack_{}", ty.id()),
            AggCompute::Avg { sum } => format!("avg_{}", sum.id()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HashTableSource {
    pub tables: Arc<HashTableSet>,
    /// Shared slot cursor over the flattened table list.
    pub cursor: Arc<AtomicU64>,
}

/// Shared join/aggregation object access for the materializer set.
impl RuntimeFunctionSubop {
    pub fn materialize(
        mats: Arc<MaterializerSet>,
        pace_iu: IuId,
        out_ptr_iu: IuId,
    ) -> Suboperator {
        Suboperator::new(
            SubopKind::RuntimeFunction(RuntimeFunctionSubop {
                fct_name: "materialize_tuple",
                args: SmallVec::new(),
                object: RuntimeObject::Materializers(mats),
                prefetching: false,
            }),
            [pace_iu],
            [out_ptr_iu],
        )
    }
}

/// Result type of a binary computation: comparisons yield `Bool`,
/// arithmetic yields the wider numeric operand type.
pub fn binary_output_type(op: ArithOp, left: &Type, right: &Type) -> Type {
    if op.is_comparison() {
        return Type::Bool;
    }
    let rank = |ty: &Type| match ty {
        Type::Float(b) => 200 + i32::from(*b),
        Type::SignedInt(b) => 100 + i32::from(*b),
        Type::UnsignedInt(b) => 50 + i32::from(*b),
        Type::Date => 100 + 4,
        _ => 0,
    };
    if rank(left) >= rank(right) {
        left.clone()
    } else {
        right.clone()
    }
}
