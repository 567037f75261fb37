//! C backend.
//!
//! Lowers an IR [`inkfuse_ir::Program`] to C source, shells out to an
//! external C compiler to produce a shared object, and loads named symbols
//! back into the process.  Compilation runs under an [`InterruptableJob`] so
//! the hybrid executor can abandon a compile the interpreter has already
//! outrun.

pub mod compile;
pub mod interrupt;
pub mod lower;
pub mod scoped_writer;

pub use compile::{BackendConfig, CompiledArtifact, PipelineFn};
pub use interrupt::InterruptableJob;
pub use lower::lower_program;
pub use scoped_writer::ScopedWriter;
