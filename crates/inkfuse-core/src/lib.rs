//! Core engine: suboperator DAG, relational operators, execution.
//!
//! A relational operator tree decays into a [`algebra::PipelineDag`] of
//! fine-grained suboperators.  Each pipeline in the DAG can then run as one
//! fused, JIT-compiled function, as a chain of pre-compiled vectorized
//! primitives over fuse chunks, or as a hybrid that races the two.

pub mod algebra;
pub mod exec;
pub mod interpreter;

pub use algebra::iu::{Iu, IuId, IuSpace};
pub use algebra::pipeline::{Pipeline, PipelineDag};
pub use exec::pipeline_executor::ExecutionMode;
pub use exec::query_executor::QueryExecutor;
