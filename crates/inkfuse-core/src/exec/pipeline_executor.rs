//! Morsel-driven pipeline execution.
//!
//! One [`PipelineExecutor`] runs one pipeline to completion with N worker
//! threads.  Workers claim morsels from a shared picker, run them through a
//! fused function, a chain of interpreted primitives, or — in hybrid mode —
//! the interpreter while a background thread compiles the fused function;
//! once the compile lands, the remaining morsels go to the fused runner,
//! and if the interpreter drains the input first the compile is
//! interrupted and its process group reaped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use inkfuse_backend_c::{BackendConfig, InterruptableJob};
use inkfuse_error::{InkFuseError, Result};

use crate::algebra::pipeline::Pipeline;
use crate::algebra::subop::SubopKind;
use crate::exec::binding::{Morsel, MorselPicker};
use crate::exec::execution_context::WorkerContext;
use crate::exec::fused::{FusedPipeline, FusedWorker};
use crate::exec::interpreted::{InterpretedPipeline, InterpretedWorker};
use crate::exec::printer::PrintGate;

/// How a pipeline is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One generated function per pipeline, compiled before the first
    /// morsel.
    Fused,
    /// Pre-compiled primitives over fuse chunks.
    Interpreted,
    /// Interpret immediately, race a background compile, switch when it
    /// lands.
    Hybrid,
    /// Relaxed operator fusion: interpretation units, compiled per query.
    Rof,
}

/// Runs one pipeline across worker threads.
pub struct PipelineExecutor<'p> {
    pipe: &'p Pipeline,
    mode: ExecutionMode,
    num_threads: usize,
    config: BackendConfig,
    name: String,
    /// Raised by the first failing worker; stops the other morsel loops.
    abort: AtomicBool,
}

impl<'p> PipelineExecutor<'p> {
    pub fn new(
        pipe: &'p Pipeline,
        mode: ExecutionMode,
        num_threads: usize,
        config: BackendConfig,
        name: String,
    ) -> PipelineExecutor<'p> {
        PipelineExecutor {
            pipe,
            mode,
            num_threads: num_threads.max(1),
            config,
            name,
            abort: AtomicBool::new(false),
        }
    }

    /// Run the pipeline to completion.
    pub fn run(&self) -> Result<()> {
        self.set_up_state();
        let picker = MorselPicker::for_pipeline(self.pipe)?;
        let gate = self.pipe.print().cloned().map(PrintGate::new);
        tracing::debug!(pipeline = self.name, mode = ?self.mode, threads = self.num_threads, "pipeline start");
        match self.mode {
            ExecutionMode::Fused => {
                let job = InterruptableJob::new()?;
                let fused = FusedPipeline::prepare(self.pipe, &self.name, &self.config, &job)?;
                self.run_workers(|thread_id, ctx| {
                    let mut worker = FusedWorker::new(&fused, self.pipe, thread_id)?;
                    self.drive(ctx, &picker, gate.as_ref(), |ctx, morsel| {
                        worker.run_morsel(ctx, morsel)
                    })?;
                    worker.finish();
                    Ok(())
                })
            }
            ExecutionMode::Interpreted => {
                let interpreted = InterpretedPipeline::from_cache(self.pipe)?;
                self.run_interpreted(&interpreted, &picker, gate.as_ref())
            }
            ExecutionMode::Rof => {
                let interpreted =
                    InterpretedPipeline::compiled_per_unit(self.pipe, &self.config, &self.name)?;
                self.run_interpreted(&interpreted, &picker, gate.as_ref())
            }
            ExecutionMode::Hybrid => self.run_hybrid(&picker, gate.as_ref()),
        }
    }

    /// Ask every suboperator to size its deferred per-thread state now that
    /// the worker count is known.
    fn set_up_state(&self) {
        for op in self.pipe.subops() {
            if let SubopKind::RuntimeFunction(fct) = &op.kind {
                fct.object.prepare(self.num_threads);
            }
        }
    }

    fn run_interpreted(
        &self,
        interpreted: &InterpretedPipeline,
        picker: &MorselPicker,
        gate: Option<&PrintGate>,
    ) -> Result<()> {
        self.run_workers(|thread_id, ctx| {
            let mut worker = InterpretedWorker::new(interpreted, self.pipe, thread_id)?;
            self.drive(ctx, picker, gate, |ctx, morsel| {
                worker.run_morsel(ctx, morsel)
            })?;
            worker.finish();
            Ok(())
        })
    }

    fn run_hybrid(&self, picker: &MorselPicker, gate: Option<&PrintGate>) -> Result<()> {
        let interpreted = InterpretedPipeline::from_cache(self.pipe)?;
        let compiled: OnceLock<FusedPipeline> = OnceLock::new();
        let job = InterruptableJob::new()?;

        std::thread::scope(|scope| -> Result<()> {
            let compile_handle = scope.spawn(|| {
                match FusedPipeline::prepare(self.pipe, &self.name, &self.config, &job) {
                    Ok(fused) => {
                        tracing::debug!(pipeline = self.name, "hybrid: compile won a slot");
                        let _ = compiled.set(fused);
                    }
                    Err(InkFuseError::Interrupted) => {
                        tracing::debug!(pipeline = self.name, "hybrid: compile cancelled");
                    }
                    Err(err) => {
                        tracing::warn!(
                            pipeline = self.name,
                            %err,
                            "hybrid: compile failed, staying interpreted"
                        );
                    }
                }
            });

            let result = self.run_workers(|thread_id, ctx| {
                let mut interp = InterpretedWorker::new(&interpreted, self.pipe, thread_id)?;
                let mut fused: Option<FusedWorker> = None;
                self.drive(ctx, picker, gate, |ctx, morsel| {
                    if fused.is_none() {
                        if let Some(pipeline) = compiled.get() {
                            fused = Some(FusedWorker::new(pipeline, self.pipe, thread_id)?);
                            tracing::debug!(thread_id, "hybrid: switching to fused execution");
                        }
                    }
                    match &mut fused {
                        Some(worker) => worker.run_morsel(ctx, morsel),
                        None => interp.run_morsel(ctx, morsel),
                    }
                })?;
                interp.finish();
                if let Some(mut worker) = fused {
                    worker.finish();
                }
                Ok(())
            });

            // The pipeline is drained (or failed); an unfinished compile is
            // now pointless.
            job.interrupt();
            compile_handle
                .join()
                .map_err(|_| InkFuseError::internal("hybrid compile thread panicked"))?;
            result
        })
    }

    /// Spawn one OS thread per worker and join their results.
    fn run_workers<F>(&self, body: F) -> Result<()>
    where
        F: Fn(usize, &mut WorkerContext) -> Result<()> + Sync,
    {
        std::thread::scope(|scope| -> Result<()> {
            let handles: Vec<_> = (0..self.num_threads)
                .map(|thread_id| {
                    let body = &body;
                    scope.spawn(move || -> Result<()> {
                        let mut ctx = WorkerContext::new(self.pipe, thread_id);
                        let result = body(thread_id, &mut ctx);
                        if result.is_err() {
                            self.abort.store(true, Ordering::Release);
                        }
                        result
                    })
                })
                .collect();
            let mut first_err = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => first_err = first_err.or(Some(err)),
                    Err(_) => {
                        first_err =
                            first_err.or(Some(InkFuseError::internal("worker thread panicked")));
                    }
                }
            }
            match first_err {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    /// The morsel loop of one worker.
    fn drive<F>(
        &self,
        ctx: &mut WorkerContext,
        picker: &MorselPicker,
        gate: Option<&PrintGate>,
        mut run: F,
    ) -> Result<()>
    where
        F: FnMut(&mut WorkerContext, &Morsel) -> Result<()>,
    {
        let morsel_size = self.pipe.morsel_size();
        loop {
            if self.abort.load(Ordering::Acquire) || gate.is_some_and(PrintGate::closed) {
                return Ok(());
            }
            let Some(morsel) = picker.pick(morsel_size) else {
                return Ok(());
            };
            run(ctx, &morsel)?;
            if let Some(gate) = gate {
                gate.flush(&ctx.chunk)?;
            }
        }
    }
}
