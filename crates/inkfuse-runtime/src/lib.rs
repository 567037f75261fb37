//! Query runtime shared between interpreted primitives and generated code.
//!
//! Everything in this crate is reachable twice: through safe Rust APIs used
//! by the execution engine, and through stable C-ABI symbols (`inkfuse_*`,
//! `ht_*`, `materialize_tuple`) that generated pipelines call after being
//! `dlopen`ed back into the process.  The C-ABI layer is the reason this
//! crate carries most of the workspace's `unsafe`.

pub mod abi;
pub mod atomic_hash_table;
pub mod comparators;
pub mod exclusive_hash_table;
pub mod hash;
pub mod memory;
pub mod registry;
pub mod tuple_materializer;

pub use atomic_hash_table::AtomicHashTable;
pub use comparators::{ComplexKeyComparator, KeyComparator, SimpleKeyComparator};
pub use exclusive_hash_table::ExclusiveHashTable;
pub use memory::{MemoryRegion, RegionGuard};
pub use registry::{runtime_functions, RuntimeFunction};
pub use tuple_materializer::{MatChunk, ReadHandle, TupleMaterializer};
