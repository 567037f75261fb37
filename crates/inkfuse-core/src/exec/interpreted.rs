//! Vectorized interpretation of a pipeline.
//!
//! The interpreter cuts a decayed pipeline into units — one per suboperator
//! doing real work, closed under strong links — and executes each unit as a
//! pre-compiled primitive over the worker's fuse chunk.  Drivers and filter
//! scopes join the units that strong-link them; scratch-pad providers and
//! the print sinks have no unit of their own because the staged columns
//! *are* their result.  Table-scan units take the zero-copy path: the
//! chunk column aliases the backing storage for the morsel instead of
//! copying it.
//!
//! After every primitive the runner inspects the worker's restart flag and
//! replays the primitive on the same morsel if a resize invalidated the
//! batch, clearing the unit's output columns first.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use inkfuse_backend_c::{BackendConfig, CompiledArtifact, InterruptableJob, PipelineFn};
use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Program;
use inkfuse_runtime::MemoryRegion;

use crate::algebra::compilation::compile_pipeline_into;
use crate::algebra::iu::IuId;
use crate::algebra::pipeline::Pipeline;
use crate::algebra::subop::runtime_objects::ColumnSlice;
use crate::algebra::subop::SubopKind;
use crate::exec::binding::{Morsel, PipelineBinding};
use crate::exec::execution_context::WorkerContext;
use crate::interpreter::FragmentCache;

/// One interpretation unit of a pipeline.
#[derive(Debug)]
pub enum Unit {
    /// Alias the scanned column into the chunk for the current morsel.
    ZeroCopyScan { iu: IuId, column: ColumnSlice },
    /// Invoke one compiled primitive over the staged chunk.
    Fragment { fct: PipelineFn, pipe: Pipeline },
}

/// A pipeline prepared for interpretation, shared by all worker threads.
pub struct InterpretedPipeline {
    units: Vec<Unit>,
    /// Keeps query-time compiled primitives loaded (relaxed-fusion mode).
    _artifact: Option<Arc<CompiledArtifact>>,
}

impl InterpretedPipeline {
    /// Resolve every unit against the process-wide fragment cache.
    pub fn from_cache(pipe: &Pipeline) -> Result<InterpretedPipeline> {
        let cache = FragmentCache::get()?;
        let mut units = Vec::new();
        for cut in unit_cuts(pipe)? {
            units.push(match cut {
                UnitCut::ZeroCopyScan { iu, column } => Unit::ZeroCopyScan { iu, column },
                UnitCut::Fragment { id, pipe } => Unit::Fragment {
                    fct: cache.fragment(&id)?,
                    pipe,
                },
            });
        }
        Ok(InterpretedPipeline {
            units,
            _artifact: None,
        })
    }

    /// Compile each unit at query time instead of using cached fragments.
    /// The relaxed-fusion point between one fused function and
    /// per-primitive interpretation: runtime parameters are baked, but the
    /// pipeline still runs unit by unit over the chunk.
    pub fn compiled_per_unit(
        pipe: &Pipeline,
        config: &BackendConfig,
        name: &str,
    ) -> Result<InterpretedPipeline> {
        enum Pending {
            ZeroCopy { iu: IuId, column: ColumnSlice },
            Fragment { fct_name: String, pipe: Pipeline },
        }
        let mut program = Program::new(name);
        let mut pending = Vec::new();
        for (idx, cut) in unit_cuts(pipe)?.into_iter().enumerate() {
            pending.push(match cut {
                UnitCut::ZeroCopyScan { iu, column } => Pending::ZeroCopy { iu, column },
                UnitCut::Fragment { pipe, .. } => {
                    let fct_name = format!("unit_{idx}");
                    compile_pipeline_into(&mut program, &pipe, &fct_name, true)?;
                    Pending::Fragment { fct_name, pipe }
                }
            });
        }
        let job = InterruptableJob::new()?;
        let artifact = Arc::new(CompiledArtifact::compile(&program, config, &job)?);
        let mut units = Vec::new();
        for entry in pending {
            units.push(match entry {
                Pending::ZeroCopy { iu, column } => Unit::ZeroCopyScan { iu, column },
                Pending::Fragment { fct_name, pipe } => Unit::Fragment {
                    fct: artifact.get_function(&fct_name)?,
                    pipe,
                },
            });
        }
        Ok(InterpretedPipeline {
            units,
            _artifact: Some(artifact),
        })
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }
}

/// A unit before fragment resolution.
#[derive(Debug)]
pub enum UnitCut {
    ZeroCopyScan { iu: IuId, column: ColumnSlice },
    Fragment { id: String, pipe: Pipeline },
}

/// Cut `pipe` into interpretation units, in topological order.
pub fn unit_cuts(pipe: &Pipeline) -> Result<Vec<UnitCut>> {
    let no_outputs = HashSet::new();
    let mut cuts = Vec::new();
    for (idx, op) in pipe.subops().iter().enumerate() {
        match &op.kind {
            // Drivers join the units that strong-link their counter.
            SubopKind::TScanDriver(_) | SubopKind::FuseChunkSourceDriver => {}
            // The filter's `if` is regenerated inside every logic unit.
            SubopKind::ColumnFilterScope => {}
            // The staged byte-array column is the scratch pad; packers
            // write through its element pointers.
            SubopKind::ScratchPadIuProvider => {}
            // Producer units already staged the printed columns.
            SubopKind::FuseChunkSink => {}
            SubopKind::TScanIuProvider(provider) => {
                cuts.push(UnitCut::ZeroCopyScan {
                    iu: op.provided_ius[0],
                    column: provider.column.clone(),
                });
            }
            _ => {
                let unit = pipe.repipe(&BTreeSet::from([idx]), &no_outputs)?;
                cuts.push(UnitCut::Fragment {
                    id: op.id(pipe.ius()),
                    pipe: unit,
                });
            }
        }
    }
    if cuts.is_empty() {
        return Err(InkFuseError::internal("pipeline has no interpretable unit"));
    }
    Ok(cuts)
}

/// Per-worker execution state of an interpreted pipeline.
pub struct InterpretedWorker<'p> {
    units: Vec<BoundUnit<'p>>,
}

enum BoundUnit<'p> {
    ZeroCopy {
        iu: IuId,
        column: &'p ColumnSlice,
    },
    Fragment {
        fct: PipelineFn,
        binding: PipelineBinding,
    },
}

impl<'p> InterpretedWorker<'p> {
    pub fn new(
        interpreted: &'p InterpretedPipeline,
        original: &Pipeline,
        thread_id: usize,
    ) -> Result<InterpretedWorker<'p>> {
        let mut units = Vec::with_capacity(interpreted.units().len());
        for unit in interpreted.units() {
            units.push(match unit {
                Unit::ZeroCopyScan { iu, column } => BoundUnit::ZeroCopy { iu: *iu, column },
                Unit::Fragment { fct, pipe } => BoundUnit::Fragment {
                    fct: *fct,
                    binding: PipelineBinding::new(pipe, Some(original), thread_id)?,
                },
            });
        }
        Ok(InterpretedWorker { units })
    }

    /// Run every unit over one morsel.
    pub fn run_morsel(&mut self, ctx: &mut WorkerContext, morsel: &Morsel) -> Result<()> {
        ctx.chunk.reset();
        for unit in &mut self.units {
            match unit {
                BoundUnit::ZeroCopy { iu, column } => {
                    let Morsel::Rows { start, end } = morsel else {
                        return Err(InkFuseError::internal(
                            "zero-copy scan driven by a non-row morsel",
                        ));
                    };
                    let base = unsafe {
                        column
                            .base()
                            .add(*start as usize * column.elem_size())
                            .cast_mut()
                    };
                    ctx.chunk.column_mut(*iu)?.alias(base, end - start);
                }
                BoundUnit::Fragment { fct, binding } => {
                    binding.bind(&mut ctx.chunk, morsel)?;
                    loop {
                        binding.reset_outputs(&mut ctx.chunk)?;
                        {
                            let _guard = MemoryRegion::install(&mut ctx.region);
                            // Bodies report "more input" unconditionally;
                            // exhaustion is the picker's verdict.
                            let _status = unsafe {
                                fct(
                                    binding.state_array(),
                                    std::ptr::null_mut(),
                                    std::ptr::null_mut(),
                                )
                            };
                        }
                        if !ctx.take_restart() {
                            break;
                        }
                        tracing::trace!("restart flag set; replaying primitive on the morsel");
                    }
                }
            }
        }
        Ok(())
    }

    /// Flush terminal accumulators once the worker is done.
    pub fn finish(&mut self) {
        for unit in &mut self.units {
            if let BoundUnit::Fragment { binding, .. } = unit {
                binding.finish();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::iu::IuSpace;
    use crate::algebra::pipeline::PipelineDag;
    use crate::algebra::subop::runtime_objects::ScanCursor;
    use crate::algebra::subop::{
        ExprOpcode, ExpressionSubop, SubopKind, Suboperator, TScanDriver, TScanIuProvider,
    };
    use inkfuse_ir::{ArithOp, Type};
    use inkfuse_storage::{BaseColumn, Relation};

    fn scan_expr_pipeline() -> PipelineDag {
        let mut dag = PipelineDag::new();
        let ius = dag.ius().clone();
        let counter = ius.create_pseudo(Type::UnsignedInt(8), "row");
        let a = ius.create(Type::UnsignedInt(8), "a");
        let b = ius.create(Type::UnsignedInt(8), "b");
        let sum = ius.create(Type::UnsignedInt(8), "sum");

        let mut rel = Relation::new("t");
        rel.attach_filled("a", BaseColumn::U8(vec![1, 2])).unwrap();
        rel.attach_filled("b", BaseColumn::U8(vec![3, 4])).unwrap();
        let rel = Arc::new(rel);

        let pipe = dag.build_new_pipeline();
        pipe.attach(Suboperator::new(
            SubopKind::TScanDriver(TScanDriver {
                cursor: Arc::new(ScanCursor::new(2)),
            }),
            [],
            [counter],
        ));
        for (name, iu) in [("a", a), ("b", b)] {
            pipe.attach(
                Suboperator::new(
                    SubopKind::TScanIuProvider(TScanIuProvider {
                        column: ColumnSlice::new(Arc::clone(&rel), name).unwrap(),
                    }),
                    [counter],
                    [iu],
                )
                .with_strong([counter]),
            );
        }
        pipe.attach(Suboperator::new(
            SubopKind::Expression(ExpressionSubop {
                op: ExprOpcode::Binary(ArithOp::Add),
            }),
            [a, b],
            [sum],
        ));
        pipe.attach(Suboperator::new(SubopKind::FuseChunkSink, [sum], []));
        dag
    }

    #[test]
    fn scan_units_are_zero_copy_and_sinks_fold_away() {
        let mut dag = scan_expr_pipeline();
        let pipe = dag.current().clone();
        let cuts = unit_cuts(&pipe).unwrap();
        // Two zero-copy scans plus the expression; the print-side sink has
        // no unit because the expression already stages its column.
        assert_eq!(cuts.len(), 3);
        assert!(matches!(cuts[0], UnitCut::ZeroCopyScan { .. }));
        assert!(matches!(cuts[1], UnitCut::ZeroCopyScan { .. }));
        let UnitCut::Fragment { id, pipe: unit } = &cuts[2] else {
            panic!("expression should interpret as a fragment");
        };
        assert_eq!(id, "ExpressionSubop_Add_UI8_UI8");
        // Chunk source, two providers, the expression, a sink for the
        // column the original sink consumes.
        assert_eq!(unit.subops().len(), 5);
    }

    #[test]
    fn filter_units_pull_their_scope() {
        let ius = IuSpace::new();
        let counter = ius.create_pseudo(Type::UnsignedInt(8), "row");
        let pred = ius.create(Type::Bool, "pred");
        let value = ius.create(Type::UnsignedInt(8), "v");
        let scope = ius.create_pseudo(Type::Void, "scope");
        let out = ius.create(Type::UnsignedInt(8), "out");
        let mut rel = Relation::new("t");
        rel.attach_filled("p", BaseColumn::U1(vec![1])).unwrap();
        rel.attach_filled("v", BaseColumn::U8(vec![5])).unwrap();
        let rel = Arc::new(rel);

        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::TScanDriver(TScanDriver {
                cursor: Arc::new(ScanCursor::new(1)),
            }),
            [],
            [counter],
        ));
        pipe.attach(
            Suboperator::new(
                SubopKind::TScanIuProvider(TScanIuProvider {
                    column: ColumnSlice::new(Arc::clone(&rel), "p").unwrap(),
                }),
                [counter],
                [pred],
            )
            .with_strong([counter]),
        );
        pipe.attach(
            Suboperator::new(
                SubopKind::TScanIuProvider(TScanIuProvider {
                    column: ColumnSlice::new(rel, "v").unwrap(),
                }),
                [counter],
                [value],
            )
            .with_strong([counter]),
        );
        pipe.attach(Suboperator::new(
            SubopKind::ColumnFilterScope,
            [pred],
            [scope],
        ));
        pipe.attach(
            Suboperator::new(SubopKind::ColumnFilterLogic, [scope, value], [out])
                .with_strong([scope]),
        );
        pipe.attach(Suboperator::new(SubopKind::FuseChunkSink, [out], []));

        let cuts = unit_cuts(&pipe).unwrap();
        let UnitCut::Fragment { id, pipe: unit } = &cuts[2] else {
            panic!("filter logic should interpret as a fragment");
        };
        assert_eq!(id, "ColumnFilterLogic_UI8");
        assert!(unit
            .subops()
            .iter()
            .any(|op| matches!(op.kind, SubopKind::ColumnFilterScope)));
    }
}
