//! Operator-fused execution.
//!
//! The fuser compiles the whole decayed pipeline into one generated
//! function and invokes it per morsel.  `prepare` runs under an
//! [`InterruptableJob`] so the hybrid executor can abandon a compile the
//! interpreter has already outrun.

use std::sync::Arc;
use std::time::Instant;

use inkfuse_backend_c::{BackendConfig, CompiledArtifact, InterruptableJob, PipelineFn};
use inkfuse_error::Result;
use inkfuse_runtime::MemoryRegion;

use crate::algebra::compilation::compile_pipeline;
use crate::algebra::pipeline::Pipeline;
use crate::exec::binding::{Morsel, PipelineBinding};
use crate::exec::execution_context::WorkerContext;

/// A pipeline compiled to native code, shared by all worker threads.
pub struct FusedPipeline {
    _artifact: Arc<CompiledArtifact>,
    fct: PipelineFn,
}

impl FusedPipeline {
    /// Emit IR for the whole pipeline, run the external compiler, resolve
    /// the `execute` symbol.  Cancellable through `job`; cancellation
    /// surfaces as [`inkfuse_error::InkFuseError::Interrupted`].
    pub fn prepare(
        pipe: &Pipeline,
        name: &str,
        config: &BackendConfig,
        job: &InterruptableJob,
    ) -> Result<FusedPipeline> {
        let started = Instant::now();
        let program = compile_pipeline(pipe, name, "execute", true)?;
        let artifact = Arc::new(CompiledArtifact::compile(&program, config, job)?);
        let fct = artifact.get_function("execute")?;
        tracing::debug!(
            pipeline = name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fused pipeline prepared"
        );
        Ok(FusedPipeline {
            _artifact: artifact,
            fct,
        })
    }
}

/// Per-worker invocation state of a fused pipeline.
pub struct FusedWorker {
    fct: PipelineFn,
    binding: PipelineBinding,
}

impl FusedWorker {
    pub fn new(fused: &FusedPipeline, pipe: &Pipeline, thread_id: usize) -> Result<FusedWorker> {
        Ok(FusedWorker {
            fct: fused.fct,
            binding: PipelineBinding::new(pipe, None, thread_id)?,
        })
    }

    /// Invoke the compiled function over one morsel.
    pub fn run_morsel(&mut self, ctx: &mut WorkerContext, morsel: &Morsel) -> Result<()> {
        ctx.chunk.reset();
        self.binding.bind(&mut ctx.chunk, morsel)?;
        {
            let _guard = MemoryRegion::install(&mut ctx.region);
            let _status = unsafe {
                (self.fct)(
                    self.binding.state_array(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
        }
        // Fused code consumes hash-table slots in the same row iteration
        // that produced them, so a mid-morsel resize needs no replay.
        let _ = ctx.take_restart();
        Ok(())
    }

    pub fn finish(&mut self) {
        self.binding.finish();
    }
}
