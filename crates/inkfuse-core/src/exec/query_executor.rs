//! Whole-query orchestration.
//!
//! Pipelines of a DAG execute in order; pipeline *k+1* starts only after
//! every worker finished pipeline *k* and the interposed runtime task — the
//! join-table build, the aggregation merge — completed.

use std::sync::atomic::{AtomicU64, Ordering};

use inkfuse_backend_c::BackendConfig;
use inkfuse_error::Result;

use crate::algebra::ops::RelAlgOp;
use crate::algebra::pipeline::PipelineDag;
use crate::exec::pipeline_executor::{ExecutionMode, PipelineExecutor};

static QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Runs a decayed query DAG.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    mode: ExecutionMode,
    num_threads: usize,
    config: BackendConfig,
    name: String,
}

impl QueryExecutor {
    pub fn new(mode: ExecutionMode, num_threads: usize) -> QueryExecutor {
        QueryExecutor::with_config(mode, num_threads, BackendConfig::default())
    }

    pub fn with_config(
        mode: ExecutionMode,
        num_threads: usize,
        config: BackendConfig,
    ) -> QueryExecutor {
        let id = QUERY_COUNTER.fetch_add(1, Ordering::Relaxed);
        QueryExecutor {
            mode,
            num_threads: num_threads.max(1),
            config,
            // Engine processes may share one artifact directory; the pid
            // keeps their generated sources apart.
            name: format!("q{}_{id}", std::process::id()),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Execute every pipeline of the DAG in order, running interposed
    /// runtime tasks in between.
    pub fn run(&self, dag: &PipelineDag) -> Result<()> {
        for (idx, pipe) in dag.pipelines().iter().enumerate() {
            PipelineExecutor::new(
                pipe,
                self.mode,
                self.num_threads,
                self.config.clone(),
                format!("{}_p{idx}", self.name),
            )
            .run()?;
            if let Some(task) = dag.task_after(idx) {
                tracing::debug!(query = self.name, pipeline = idx, "running runtime task");
                task.run(self.num_threads)?;
            }
        }
        Ok(())
    }

    /// Decay the operator tree into `dag` and run it.
    pub fn run_tree(&self, root: &RelAlgOp, dag: &mut PipelineDag) -> Result<()> {
        root.decay(dag)?;
        self.run(dag)
    }
}
