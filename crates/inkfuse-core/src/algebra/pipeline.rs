//! Pipelines, the pipeline DAG, and the repipe algorithm.
//!
//! A pipeline is a topologically-sorted vector of suboperators with indexed
//! producer relations.  `repipe` rewrites any subset of a pipeline into a
//! standalone executable pipeline by synthesizing fuse-chunk sources for
//! externally-produced IUs and fuse-chunk sinks for IUs consumed outside
//! the subset — the single mechanism that makes one DAG executable both as
//! a fused function (the full subset) and as a chain of vectorized
//! primitives (one subset per suboperator).

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use hashbrown::HashMap;
use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Type;

use crate::algebra::iu::{IuId, IuSpace};
use crate::algebra::subop::runtime_objects::{AggregationState, JoinBuildState};
use crate::algebra::subop::{SubopKind, Suboperator, DEFAULT_MORSEL_SIZE};

/// Receives rendered result rows from a print sink, one call per completed
/// morsel, serialized by the executor's mutex.
pub trait RowSink: Send + Sync {
    fn consume(&self, columns: &[String], rows: Vec<Vec<String>>);
}

/// Print attachment of a pipeline: which IUs to render, their display
/// names, an optional row limit that closes the pipeline early.
#[derive(Clone)]
pub struct PrintSpec {
    pub ius: Vec<IuId>,
    pub column_names: Vec<String>,
    pub row_limit: Option<u64>,
    pub sink: Arc<dyn RowSink>,
}

impl std::fmt::Debug for PrintSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrintSpec")
            .field("ius", &self.ius)
            .field("column_names", &self.column_names)
            .field("row_limit", &self.row_limit)
            .finish_non_exhaustive()
    }
}

/// One executable pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    ius: IuSpace,
    subops: Vec<Suboperator>,
    producers: HashMap<IuId, usize>,
    print: Option<PrintSpec>,
}

impl Pipeline {
    pub fn new(ius: IuSpace) -> Pipeline {
        Pipeline {
            ius,
            subops: Vec::new(),
            producers: HashMap::new(),
            print: None,
        }
    }

    pub fn ius(&self) -> &IuSpace {
        &self.ius
    }

    /// Append a suboperator in topological position; indexes its provided
    /// IUs.
    pub fn attach(&mut self, subop: Suboperator) -> usize {
        let idx = self.subops.len();
        for iu in &subop.provided_ius {
            self.producers.insert(*iu, idx);
        }
        self.subops.push(subop);
        idx
    }

    pub fn subops(&self) -> &[Suboperator] {
        &self.subops
    }

    pub fn subop(&self, idx: usize) -> &Suboperator {
        &self.subops[idx]
    }

    pub fn producer_of(&self, iu: IuId) -> Option<usize> {
        self.producers.get(&iu).copied()
    }

    /// Indices of suboperators consuming `iu`.
    pub fn consumers_of(&self, iu: IuId) -> Vec<usize> {
        self.subops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.source_ius.contains(&iu))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Morsel size respected by every suboperator in this pipeline.
    pub fn morsel_size(&self) -> u64 {
        self.subops
            .iter()
            .map(Suboperator::morsel_preference)
            .min()
            .unwrap_or(DEFAULT_MORSEL_SIZE)
    }

    pub fn set_print(&mut self, spec: PrintSpec) {
        self.print = Some(spec);
    }

    pub fn print(&self) -> Option<&PrintSpec> {
        self.print.as_ref()
    }

    /// All materializable IUs this pipeline touches; the execution context
    /// attaches one column per entry.
    pub fn materialized_ius(&self) -> Vec<IuId> {
        let mut seen = BTreeSet::new();
        for op in &self.subops {
            for iu in op.source_ius.iter().chain(op.provided_ius.iter()) {
                if !self.ius.is_pseudo(*iu) {
                    seen.insert(*iu);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Close `include` under strong links: the producer of every strong
    /// source IU joins the set.
    fn strong_closure(&self, include: &BTreeSet<usize>) -> Result<BTreeSet<usize>> {
        let mut closed = include.clone();
        let mut worklist: Vec<usize> = include.iter().copied().collect();
        while let Some(idx) = worklist.pop() {
            for strong in &self.subops[idx].strong_source_ius {
                let producer = self.producer_of(*strong).ok_or_else(|| {
                    InkFuseError::internal(format!(
                        "strong IU {strong:?} has no producer in pipeline"
                    ))
                })?;
                if closed.insert(producer) {
                    worklist.push(producer);
                }
            }
        }
        Ok(closed)
    }

    /// Rewrite the subset `include` (plus its strong closure) into a new
    /// executable pipeline.  `outputs` forces sinks for IUs consumed by
    /// nobody inside the original pipeline (query results).
    pub fn repipe(&self, include: &BTreeSet<usize>, outputs: &HashSet<IuId>) -> Result<Pipeline> {
        let include = self.strong_closure(include)?;
        let mut result = Pipeline::new(self.ius.clone());

        let produced_inside: HashSet<IuId> = include
            .iter()
            .flat_map(|idx| self.subops[*idx].provided_ius.iter().copied())
            .collect();
        let has_source = include.iter().any(|idx| self.subops[*idx].is_source());

        // External inputs, in topological discovery order.
        let mut externals: Vec<IuId> = Vec::new();
        for idx in &include {
            let op = &self.subops[*idx];
            for iu in &op.source_ius {
                if produced_inside.contains(iu) || externals.contains(iu) {
                    continue;
                }
                if self.ius.is_pseudo(*iu) {
                    if op.strong_source_ius.contains(iu) {
                        return Err(InkFuseError::internal(
                            "repipe would split a strong link",
                        ));
                    }
                    // Ordering-only edge; the unit sequence preserves it.
                    continue;
                }
                externals.push(*iu);
            }
        }

        if has_source && !externals.is_empty() {
            return Err(InkFuseError::internal(
                "repipe subset contains a source but still has external inputs",
            ));
        }

        // Fuse-chunk sources for everything produced outside.
        let mut counter = None;
        if !has_source {
            let counter_iu = self
                .ius
                .create_pseudo(Type::UnsignedInt(8), "fuse_chunk_row");
            result.attach(Suboperator::new(
                SubopKind::FuseChunkSourceDriver,
                [],
                [counter_iu],
            ));
            counter = Some(counter_iu);
            for iu in &externals {
                result.attach(
                    Suboperator::new(SubopKind::FuseChunkSourceIuProvider, [counter_iu], [*iu])
                        .with_strong([counter_iu]),
                );
            }
        }
        let _ = counter;

        // The subset itself, in original topological order, with
        // ordering-only pseudo inputs from outside dropped.
        for idx in &include {
            let op = &self.subops[*idx];
            let mut clone = op.clone();
            clone.source_ius = op
                .source_ius
                .iter()
                .copied()
                .filter(|iu| {
                    !self.ius.is_pseudo(*iu)
                        || produced_inside.contains(iu)
                        || op.strong_source_ius.contains(iu)
                })
                .collect();
            result.attach(clone);
        }

        // Fuse-chunk sinks for everything consumed outside or requested.
        for idx in &include {
            for iu in &self.subops[*idx].provided_ius {
                if self.ius.is_pseudo(*iu) {
                    continue;
                }
                let consumed_outside = self
                    .consumers_of(*iu)
                    .iter()
                    .any(|consumer| !include.contains(consumer));
                if consumed_outside || outputs.contains(iu) {
                    result.attach(Suboperator::new(SubopKind::FuseChunkSink, [*iu], []));
                }
            }
        }

        Ok(result)
    }
}

/// A task executed between two pipelines, once all workers finished the
/// earlier one.
#[derive(Debug, Clone)]
pub enum RuntimeTask {
    /// Size and fill the join hash table from materialized build rows.
    JoinBuild(Arc<JoinBuildState>),
    /// Reconcile thread-local aggregation tables.
    AggMerge(Arc<AggregationState>),
}

impl RuntimeTask {
    pub fn run(&self, num_threads: usize) -> Result<()> {
        match self {
            RuntimeTask::JoinBuild(state) => state.build_table(num_threads),
            RuntimeTask::AggMerge(state) => state.merge(num_threads),
        }
    }
}

/// An ordered sequence of pipelines with optional interposed runtime
/// tasks; the unit of query execution.
#[derive(Debug, Default)]
pub struct PipelineDag {
    ius: IuSpace,
    pipelines: Vec<Pipeline>,
    tasks_after: Vec<Option<RuntimeTask>>,
}

impl PipelineDag {
    pub fn new() -> PipelineDag {
        PipelineDag {
            ius: IuSpace::new(),
            pipelines: Vec::new(),
            tasks_after: Vec::new(),
        }
    }

    pub fn ius(&self) -> &IuSpace {
        &self.ius
    }

    /// Start a fresh pipeline; subsequent decay appends there.
    pub fn build_new_pipeline(&mut self) -> &mut Pipeline {
        self.pipelines.push(Pipeline::new(self.ius.clone()));
        self.tasks_after.push(None);
        self.pipelines.last_mut().expect("pipeline just pushed")
    }

    /// The pipeline currently being decayed into.
    pub fn current(&mut self) -> &mut Pipeline {
        if self.pipelines.is_empty() {
            self.build_new_pipeline();
        }
        self.pipelines.last_mut().expect("pipeline present")
    }

    /// Schedule a runtime task after the current pipeline.
    pub fn add_runtime_task(&mut self, task: RuntimeTask) {
        let idx = self.pipelines.len().saturating_sub(1);
        self.tasks_after[idx] = Some(task);
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn task_after(&self, idx: usize) -> Option<&RuntimeTask> {
        self.tasks_after.get(idx).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::subop::runtime_objects::{ColumnSlice, ScanCursor};
    use crate::algebra::subop::{ExprOpcode, ExpressionSubop, TScanDriver, TScanIuProvider};
    use inkfuse_ir::ArithOp;
    use inkfuse_storage::{BaseColumn, Relation};

    fn scan_pipeline() -> (PipelineDag, IuId, IuId) {
        let mut dag = PipelineDag::new();
        let ius = dag.ius().clone();
        let counter = ius.create_pseudo(Type::UnsignedInt(8), "row");
        let col = ius.create(Type::UnsignedInt(8), "c");
        let doubled = ius.create(Type::UnsignedInt(8), "c2");

        let mut rel = Relation::new("t");
        rel.attach_filled("c", BaseColumn::U8(vec![1, 2, 3])).unwrap();
        let rel = Arc::new(rel);

        let pipe = dag.build_new_pipeline();
        pipe.attach(Suboperator::new(
            SubopKind::TScanDriver(TScanDriver {
                cursor: Arc::new(ScanCursor::new(3)),
            }),
            [],
            [counter],
        ));
        pipe.attach(
            Suboperator::new(
                SubopKind::TScanIuProvider(TScanIuProvider {
                    column: ColumnSlice::new(rel, "c").unwrap(),
                }),
                [counter],
                [col],
            )
            .with_strong([counter]),
        );
        pipe.attach(Suboperator::new(
            SubopKind::Expression(ExpressionSubop {
                op: ExprOpcode::Binary(ArithOp::Add),
            }),
            [col, col],
            [doubled],
        ));
        pipe.attach(Suboperator::new(SubopKind::FuseChunkSink, [doubled], []));
        (dag, col, doubled)
    }

    #[test]
    fn repipe_of_everything_is_shape_preserving() {
        let (mut dag, _, _) = scan_pipeline();
        let pipe = dag.current().clone();
        let all: BTreeSet<usize> = (0..pipe.subops().len()).collect();
        let repiped = pipe.repipe(&all, &HashSet::new()).unwrap();
        // Contains a real source, so no fuse-chunk source is prepended.
        assert_eq!(repiped.subops().len(), pipe.subops().len());
        assert!(repiped.subops()[0].is_source());
    }

    #[test]
    fn repipe_of_an_interior_subop_synthesizes_boundaries() {
        let (mut dag, col, doubled) = scan_pipeline();
        let pipe = dag.current().clone();
        let repiped = pipe
            .repipe(&BTreeSet::from([2]), &HashSet::new())
            .unwrap();
        // FuseChunkSourceDriver, provider for `col`, the expression, and a
        // sink for `doubled` (consumed by the original sink outside).
        assert_eq!(repiped.subops().len(), 4);
        assert!(matches!(
            repiped.subops()[0].kind,
            SubopKind::FuseChunkSourceDriver
        ));
        assert!(matches!(
            repiped.subops()[1].kind,
            SubopKind::FuseChunkSourceIuProvider
        ));
        assert_eq!(repiped.subops()[1].provided_ius[0], col);
        assert!(matches!(repiped.subops()[2].kind, SubopKind::Expression(_)));
        assert!(matches!(repiped.subops()[3].kind, SubopKind::FuseChunkSink));
        assert_eq!(repiped.subops()[3].source_ius[0], doubled);
    }

    #[test]
    fn repipe_pulls_strong_producers_into_the_subset() {
        let (mut dag, _, _) = scan_pipeline();
        let pipe = dag.current().clone();
        // The provider is strong-linked to the scan driver; repiping just
        // the provider must pull the driver in and keep a real source.
        let repiped = pipe
            .repipe(&BTreeSet::from([1]), &HashSet::new())
            .unwrap();
        assert!(repiped.subops()[0].is_source());
        assert!(matches!(
            repiped.subops()[0].kind,
            SubopKind::TScanDriver(_)
        ));
    }

    #[test]
    fn explicit_outputs_get_sinks() {
        let (mut dag, _, doubled) = scan_pipeline();
        let pipe = dag.current().clone();
        let repiped = pipe
            .repipe(&BTreeSet::from([2]), &HashSet::from([doubled]))
            .unwrap();
        let sinks = repiped
            .subops()
            .iter()
            .filter(|op| matches!(op.kind, SubopKind::FuseChunkSink))
            .count();
        assert_eq!(sinks, 1);
    }

    #[test]
    fn morsel_size_defaults_to_full_chunks() {
        let (mut dag, _, _) = scan_pipeline();
        assert_eq!(dag.current().morsel_size(), DEFAULT_MORSEL_SIZE);
    }
}
