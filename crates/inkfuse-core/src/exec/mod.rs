//! The execution engine: fuse chunks, per-worker contexts, morsel-driven
//! runners, and the pipeline/query executors that arbitrate between fused
//! and interpreted execution.

pub mod binding;
pub mod execution_context;
pub mod fuse_chunk;
pub mod fused;
pub mod interpreted;
pub mod pipeline_executor;
pub mod printer;
pub mod query_executor;

pub use binding::{Morsel, MorselPicker, PipelineBinding};
pub use execution_context::WorkerContext;
pub use fuse_chunk::{Column, FuseChunk};
pub use fused::{FusedPipeline, FusedWorker};
pub use interpreted::{InterpretedPipeline, InterpretedWorker};
pub use pipeline_executor::{ExecutionMode, PipelineExecutor};
pub use printer::PrintGate;
pub use query_executor::QueryExecutor;
