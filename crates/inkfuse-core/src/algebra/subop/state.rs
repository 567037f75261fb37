//! Per-suboperator state structs.
//!
//! Runtime parameters of a suboperator live in a `#[repr(C)]` struct; the
//! generated function receives an array of per-suboperator state pointers
//! (`void** global_state`, topological order) and casts each entry to the
//! matching struct.  [`state_struct_def`] mirrors the Rust layout as an IR
//! struct declaration so the C side cannot drift from the definitions here.
//!
//! Runners own one state box per (thread, suboperator) and refresh the
//! volatile fields (morsel bounds, column pointers) before every
//! invocation.

use std::os::raw::c_void;

use inkfuse_ir::{StructDef, Type};

/// Morsel bounds for a table-scan driver, absolute row indices.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TScanDriverState {
    pub start: u64,
    pub end: u64,
}

/// Column base for an indexed IU provider.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TScanIuProviderState {
    pub start: *const u8,
}

/// Row count of the staged chunk a fuse-chunk source iterates.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FuseChunkSourceDriverState {
    pub size: u64,
}

/// Column base and row stride for a fuse-chunk IU provider.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FuseChunkSourceIuProviderState {
    pub start: *const u8,
    pub stride: u64,
}

/// Append target of a fuse-chunk sink: column base, its size slot, stride.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FuseChunkSinkState {
    pub dest: *mut u8,
    pub size_ptr: *mut u64,
    pub stride: u64,
}

/// Row counter of a counting sink.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CountingSinkState {
    pub count: u64,
}

/// Bit-stored constant operand of a runtime expression.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RuntimeExprState {
    pub value: u64,
}

/// Byte offset of a key packer/unpacker within the compound key.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KeyPackingState {
    pub offset: u64,
}

/// Target object (hash table, materializer) of a runtime-function call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RuntimeFnState {
    pub object: *mut c_void,
}

/// Granule offset of an aggregation update.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AggregatorState {
    pub offset: u64,
}

/// Granule offsets of an aggregation reader (`offset_b` backs the count
/// granule of an average).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AggReaderState {
    pub offset_a: u64,
    pub offset_b: u64,
}

/// Slot morsel of a hash-table source.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HashTableSourceState {
    pub table: *mut c_void,
    pub start: u64,
    pub end: u64,
}

/// Owned state of one suboperator for one thread.
#[derive(Debug)]
pub enum StateBox {
    /// Suboperator without runtime state; contributes a null pointer.
    None,
    TScanDriver(Box<TScanDriverState>),
    TScanIuProvider(Box<TScanIuProviderState>),
    FuseChunkSourceDriver(Box<FuseChunkSourceDriverState>),
    FuseChunkSourceIuProvider(Box<FuseChunkSourceIuProviderState>),
    FuseChunkSink(Box<FuseChunkSinkState>),
    CountingSink(Box<CountingSinkState>),
    RuntimeExpr(Box<RuntimeExprState>),
    KeyPacking(Box<KeyPackingState>),
    RuntimeFn(Box<RuntimeFnState>),
    Aggregator(Box<AggregatorState>),
    AggReader(Box<AggReaderState>),
    HashTableSource(Box<HashTableSourceState>),
}

impl StateBox {
    /// Raw pointer for the `global_state` array.
    pub fn as_void_ptr(&mut self) -> *mut c_void {
        match self {
            StateBox::None => std::ptr::null_mut(),
            StateBox::TScanDriver(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::TScanIuProvider(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::FuseChunkSourceDriver(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::FuseChunkSourceIuProvider(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::FuseChunkSink(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::CountingSink(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::RuntimeExpr(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::KeyPacking(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::RuntimeFn(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::Aggregator(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::AggReader(b) => std::ptr::from_mut(b.as_mut()).cast(),
            StateBox::HashTableSource(b) => std::ptr::from_mut(b.as_mut()).cast(),
        }
    }
}

/// IR struct declaration matching one of the `#[repr(C)]` structs above.
/// Returns `None` for stateless suboperators.
pub fn state_struct_def(name: &str) -> Option<StructDef> {
    let u64t = Type::UnsignedInt(8);
    let char_ptr = Type::char_ptr();
    let def = match name {
        "TScanDriverState" => StructDef::new(
            name,
            vec![("start".into(), u64t.clone()), ("end".into(), u64t)],
        ),
        "TScanIuProviderState" => StructDef::new(name, vec![("start".into(), char_ptr)]),
        "FuseChunkSourceDriverState" => StructDef::new(name, vec![("size".into(), u64t)]),
        "FuseChunkSourceIuProviderState" => StructDef::new(
            name,
            vec![("start".into(), char_ptr), ("stride".into(), u64t)],
        ),
        "FuseChunkSinkState" => StructDef::new(
            name,
            vec![
                ("dest".into(), char_ptr),
                ("size_ptr".into(), Type::ptr(u64t.clone())),
                ("stride".into(), u64t),
            ],
        ),
        "CountingSinkState" => StructDef::new(name, vec![("count".into(), u64t)]),
        "RuntimeExprState" => StructDef::new(name, vec![("value".into(), u64t)]),
        "KeyPackingState" => StructDef::new(name, vec![("offset".into(), u64t)]),
        "RuntimeFnState" => StructDef::new(name, vec![("object".into(), Type::void_ptr())]),
        "AggregatorState" => StructDef::new(name, vec![("offset".into(), u64t)]),
        "AggReaderState" => StructDef::new(
            name,
            vec![("offset_a".into(), u64t.clone()), ("offset_b".into(), u64t)],
        ),
        "HashTableSourceState" => StructDef::new(
            name,
            vec![
                ("table".into(), Type::void_ptr()),
                ("start".into(), u64t.clone()),
                ("end".into(), u64t),
            ],
        ),
        _ => return None,
    };
    Some(def)
}
