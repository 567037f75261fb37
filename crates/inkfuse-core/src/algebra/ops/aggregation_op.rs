//! Group-by aggregation.
//!
//! The planner chooses the minimal set of state granules for the requested
//! aggregates (`count(*)`, `sum(x)` and `avg(x)` share one sum and one
//! count granule), lays the hash-table slot out as packed compound key
//! followed by contiguous granules, and decays into two pipelines: a build
//! pipeline ending in thread-local tables and a read pipeline iterating the
//! merged result.  Group-by keys always take the compound-key path, one
//! packer per key column, whatever the arity.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Type;

use crate::algebra::iu::{IuId, IuSpace};
use crate::algebra::pipeline::{PipelineDag, RuntimeTask};
use crate::algebra::subop::runtime_objects::{
    AggregationState, HashTableSet, KeySpec, RuntimeObject,
};
use crate::algebra::subop::{
    AggCompute, AggReaderSubop, AggregatorSubop, GranuleKind, HashTableSource, KeyPackingSubop,
    RuntimeFunctionSubop, SubopKind, Suboperator,
};
use smallvec::SmallVec;

use super::RelAlgOp;

/// Aggregate function requested by the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOpCode {
    Min,
    Max,
    Sum,
    Count,
    Avg,
    Median,
}

/// One requested aggregate.
#[derive(Debug, Clone)]
pub struct AggDescription {
    pub iu: IuId,
    pub op: AggOpCode,
    pub distinct: bool,
}

#[derive(Debug, Clone)]
struct PlannedGranule {
    kind: GranuleKind,
    /// Source IU for sums; `None` for the shared count granule.
    src: Option<IuId>,
    /// Absolute byte offset within the hash-table slot.
    offset: u64,
}

#[derive(Debug, Clone)]
struct PlannedOutput {
    /// Index into `granules` for the primary granule.
    granule: usize,
    /// Count granule index for averages.
    count_granule: Option<usize>,
    out_iu: IuId,
}

#[derive(Debug)]
pub struct AggregationOp {
    child: Box<RelAlgOp>,
    /// Packing order: string keys first, then fixed-width keys.
    key_offsets: Vec<(IuId, u64)>,
    key_spec: KeySpec,
    granules: Vec<PlannedGranule>,
    planned_outputs: Vec<PlannedOutput>,
    group_by_outputs: Vec<(IuId, IuId, u64)>,
    state: Arc<AggregationState>,
    output_ius: Vec<IuId>,
    #[allow(dead_code)]
    tag: String,
}

impl AggregationOp {
    pub fn new(
        ius: &IuSpace,
        child: Box<RelAlgOp>,
        tag: impl Into<String>,
        group_by: Vec<IuId>,
        aggregates: Vec<AggDescription>,
    ) -> Result<AggregationOp> {
        let tag = tag.into();
        if group_by.is_empty() {
            return Err(InkFuseError::unsupported(
                "aggregation without group-by keys",
            ));
        }

        // Compound key layout: string keys first (8-byte slots), then
        // memcmp-able fixed-width keys.
        let (string_keys, fixed_keys): (Vec<IuId>, Vec<IuId>) = group_by
            .iter()
            .partition(|iu| ius.ty(**iu) == Type::char_ptr());
        let mut key_offsets = Vec::new();
        let mut offset = 0_u64;
        for iu in &string_keys {
            key_offsets.push((*iu, offset));
            offset += 8;
        }
        let simple_start = offset;
        for iu in &fixed_keys {
            key_offsets.push((*iu, offset));
            offset += ius.ty(*iu).byte_size() as u64;
        }
        let key_spec = if string_keys.is_empty() {
            KeySpec::Simple {
                size: offset as usize,
            }
        } else {
            KeySpec::Complex {
                slots: string_keys.len(),
                simple: (offset - simple_start) as usize,
            }
        };
        let key_size = offset;

        // Granule planning with sharing.
        let mut granules: Vec<PlannedGranule> = Vec::new();
        let mut find_or_add = |kind: GranuleKind, src: Option<IuId>| -> usize {
            if let Some(pos) = granules
                .iter()
                .position(|g| g.kind == kind && g.src == src)
            {
                return pos;
            }
            granules.push(PlannedGranule {
                kind,
                src,
                offset: 0,
            });
            granules.len() - 1
        };
        let mut planned_outputs = Vec::new();
        let mut output_ius = Vec::new();
        let mut group_by_outputs = Vec::new();
        for (iu, off) in &key_offsets {
            let out = ius.create(ius.ty(*iu), format!("{tag}_key{}", off));
            group_by_outputs.push((*iu, out, *off));
            output_ius.push(out);
        }
        for desc in &aggregates {
            if desc.distinct {
                return Err(InkFuseError::unsupported("distinct aggregates"));
            }
            let src_ty = ius.ty(desc.iu);
            match desc.op {
                AggOpCode::Sum => {
                    let kind = sum_granule_for(&src_ty)?;
                    let granule = find_or_add(kind, Some(desc.iu));
                    let out = ius.create(kind.stored_type(), format!("{tag}_sum"));
                    planned_outputs.push(PlannedOutput {
                        granule,
                        count_granule: None,
                        out_iu: out,
                    });
                    output_ius.push(out);
                }
                AggOpCode::Count => {
                    let granule = find_or_add(GranuleKind::Count, None);
                    let out = ius.create(Type::SignedInt(8), format!("{tag}_count"));
                    planned_outputs.push(PlannedOutput {
                        granule,
                        count_granule: None,
                        out_iu: out,
                    });
                    output_ius.push(out);
                }
                AggOpCode::Avg => {
                    let kind = sum_granule_for(&src_ty)?;
                    let sum_granule = find_or_add(kind, Some(desc.iu));
                    let count_granule = find_or_add(GranuleKind::Count, None);
                    let out = ius.create(Type::Float(8), format!("{tag}_avg"));
                    planned_outputs.push(PlannedOutput {
                        granule: sum_granule,
                        count_granule: Some(count_granule),
                        out_iu: out,
                    });
                    output_ius.push(out);
                }
                AggOpCode::Min | AggOpCode::Max | AggOpCode::Median => {
                    return Err(InkFuseError::unsupported(format!(
                        "aggregate function {:?}",
                        desc.op
                    )));
                }
            }
        }

        // Assign granule offsets after the packed key.
        let mut granule_offset = key_size;
        for granule in &mut granules {
            granule.offset = granule_offset;
            granule_offset += granule.kind.size() as u64;
        }
        let payload_size = (granule_offset - key_size) as usize;

        let state = Arc::new(AggregationState::new(
            key_spec,
            payload_size,
            granules.iter().map(|g| (g.kind, g.offset)).collect(),
        ));

        Ok(AggregationOp {
            child,
            key_offsets,
            key_spec,
            granules,
            planned_outputs,
            group_by_outputs,
            state,
            output_ius,
            tag,
        })
    }

    /// Group-by key outputs first (string keys before fixed keys), then one
    /// output per aggregate in request order.
    pub fn output_ius(&self) -> &[IuId] {
        &self.output_ius
    }

    pub fn decay(&self, dag: &mut PipelineDag) -> Result<()> {
        self.child.decay(dag)?;
        let ius = dag.ius().clone();
        let key_size = self.key_spec.key_size();

        // Build pipeline: pack the key, find-or-create the group, update
        // granules.
        let key_iu = ius.create(Type::ByteArray(key_size as u16), format!("{}_key", self.tag));
        let pipe = dag.current();
        pipe.attach(Suboperator::new(
            SubopKind::ScratchPadIuProvider,
            [],
            [key_iu],
        ));
        let mut packed_pseudos = Vec::new();
        for (src, offset) in &self.key_offsets {
            let pseudo = ius.create_pseudo(Type::Void, "packed");
            pipe.attach(Suboperator::new(
                SubopKind::KeyPacker(KeyPackingSubop { offset: *offset }),
                [key_iu, *src],
                [pseudo],
            ));
            packed_pseudos.push(pseudo);
        }
        let lookup_fn = match self.key_spec {
            KeySpec::Simple { .. } => "ht_sk_lookup_or_insert",
            KeySpec::Complex { .. } => "ht_ck_lookup_or_insert",
        };
        let ptr_iu = ius.create(Type::char_ptr(), format!("{}_group", self.tag));
        let mut lookup_sources = vec![key_iu];
        lookup_sources.extend(packed_pseudos.iter().copied());
        pipe.attach(Suboperator::new(
            SubopKind::RuntimeFunction(RuntimeFunctionSubop {
                fct_name: lookup_fn,
                args: SmallVec::from_slice(&[key_iu]),
                object: RuntimeObject::AggTables(Arc::clone(&self.state)),
                prefetching: false,
            }),
            lookup_sources,
            [ptr_iu],
        ));
        for granule in &self.granules {
            let sources: SmallVec<[IuId; 4]> = match granule.src {
                Some(src) => SmallVec::from_slice(&[ptr_iu, src]),
                None => SmallVec::from_slice(&[ptr_iu]),
            };
            pipe.attach(Suboperator::new(
                SubopKind::Aggregator(AggregatorSubop {
                    granule: granule.kind,
                    offset: granule.offset,
                }),
                sources,
                [],
            ));
        }
        dag.add_runtime_task(RuntimeTask::AggMerge(Arc::clone(&self.state)));

        // Read pipeline: iterate merged groups, unpack keys, compute
        // outputs.
        dag.build_new_pipeline();
        let row_iu = ius.create(Type::char_ptr(), format!("{}_row", self.tag));
        let pipe = dag.current();
        pipe.attach(Suboperator::new(
            SubopKind::HashTableSource(HashTableSource {
                tables: Arc::new(HashTableSet::new(Arc::clone(&self.state))),
                cursor: Arc::new(AtomicU64::new(0)),
            }),
            [],
            [row_iu],
        ));
        for (_, out, offset) in &self.group_by_outputs {
            pipe.attach(Suboperator::new(
                SubopKind::KeyUnpacker(KeyPackingSubop { offset: *offset }),
                [row_iu],
                [*out],
            ));
        }
        for planned in &self.planned_outputs {
            let primary = &self.granules[planned.granule];
            let (compute, offset_b) = match planned.count_granule {
                Some(count_idx) => (
                    AggCompute::Avg { sum: primary.kind },
                    self.granules[count_idx].offset,
                ),
                None => (
                    AggCompute::Unpack {
                        ty: primary.kind.stored_type(),
                    },
                    0,
                ),
            };
            pipe.attach(Suboperator::new(
                SubopKind::AggReader(AggReaderSubop {
                    compute,
                    offset_a: primary.offset,
                    offset_b,
                }),
                [row_iu],
                [planned.out_iu],
            ));
        }
        Ok(())
    }
}

fn sum_granule_for(ty: &Type) -> Result<GranuleKind> {
    match ty {
        Type::SignedInt(4) => Ok(GranuleKind::SumI4),
        Type::SignedInt(8) | Type::UnsignedInt(4) | Type::UnsignedInt(8) => Ok(GranuleKind::SumI8),
        Type::SignedInt(1 | 2) | Type::UnsignedInt(1 | 2) => Ok(GranuleKind::SumI4),
        Type::Float(_) => Ok(GranuleKind::SumF8),
        other => Err(InkFuseError::unsupported(format!("sum over {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::ops::table_scan::TableScanOp;
    use inkfuse_storage::{BaseColumn, Relation};

    fn scan() -> (PipelineDag, RelAlgOp, Vec<IuId>) {
        let mut rel = Relation::new("t");
        rel.attach_filled("g", BaseColumn::U8(vec![1, 1, 2])).unwrap();
        rel.attach_filled("v", BaseColumn::I8(vec![10, 20, 30])).unwrap();
        let dag = PipelineDag::new();
        let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["g", "v"], "t").unwrap();
        let outs = scan.output_ius().to_vec();
        (dag, RelAlgOp::TableScan(scan), outs)
    }

    #[test]
    fn avg_shares_granules_with_sum_and_count() {
        let (dag, child, outs) = scan();
        let op = AggregationOp::new(
            dag.ius(),
            Box::new(child),
            "agg",
            vec![outs[0]],
            vec![
                AggDescription {
                    iu: outs[1],
                    op: AggOpCode::Sum,
                    distinct: false,
                },
                AggDescription {
                    iu: outs[1],
                    op: AggOpCode::Count,
                    distinct: false,
                },
                AggDescription {
                    iu: outs[1],
                    op: AggOpCode::Avg,
                    distinct: false,
                },
            ],
        )
        .unwrap();
        // One sum granule and one count granule serve all three outputs.
        assert_eq!(op.granules.len(), 2);
        // Key (8 bytes) + sum (8) + count (8).
        assert_eq!(op.granules[0].offset, 8);
        assert_eq!(op.granules[1].offset, 16);
        assert_eq!(op.output_ius().len(), 4);
    }

    #[test]
    fn distinct_aggregates_are_rejected() {
        let (dag, child, outs) = scan();
        let result = AggregationOp::new(
            dag.ius(),
            Box::new(child),
            "agg",
            vec![outs[0]],
            vec![AggDescription {
                iu: outs[1],
                op: AggOpCode::Sum,
                distinct: true,
            }],
        );
        assert!(matches!(result, Err(InkFuseError::Unsupported(_))));
    }

    #[test]
    fn median_is_rejected() {
        let (dag, child, outs) = scan();
        let result = AggregationOp::new(
            dag.ius(),
            Box::new(child),
            "agg",
            vec![outs[0]],
            vec![AggDescription {
                iu: outs[1],
                op: AggOpCode::Median,
                distinct: false,
            }],
        );
        assert!(matches!(result, Err(InkFuseError::Unsupported(_))));
    }

    #[test]
    fn decay_builds_two_pipelines_with_a_merge_task() {
        let (mut dag, child, outs) = scan();
        let op = AggregationOp::new(
            dag.ius(),
            Box::new(child),
            "agg",
            vec![outs[0]],
            vec![AggDescription {
                iu: outs[1],
                op: AggOpCode::Sum,
                distinct: false,
            }],
        )
        .unwrap();
        op.decay(&mut dag).unwrap();
        assert_eq!(dag.pipelines().len(), 2);
        assert!(matches!(
            dag.task_after(0),
            Some(RuntimeTask::AggMerge(_))
        ));
        // Read pipeline starts with a hash-table source.
        assert!(matches!(
            dag.pipelines()[1].subops()[0].kind,
            SubopKind::HashTableSource(_)
        ));
    }

    #[test]
    fn multi_column_group_by_takes_the_compound_key_path() {
        let mut rel = Relation::new("t");
        rel.attach_filled("a", BaseColumn::U8(vec![1])).unwrap();
        rel.attach_filled("b", BaseColumn::I4(vec![2])).unwrap();
        rel.attach_filled("v", BaseColumn::I8(vec![3])).unwrap();
        let dag = PipelineDag::new();
        let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["a", "b", "v"], "t").unwrap();
        let outs = scan.output_ius().to_vec();
        let op = AggregationOp::new(
            dag.ius(),
            Box::new(RelAlgOp::TableScan(scan)),
            "agg",
            vec![outs[0], outs[1]],
            vec![AggDescription {
                iu: outs[2],
                op: AggOpCode::Count,
                distinct: false,
            }],
        )
        .unwrap();
        assert_eq!(op.key_spec, KeySpec::Simple { size: 12 });
        assert_eq!(op.key_offsets[0].1, 0);
        assert_eq!(op.key_offsets[1].1, 8);
    }
}
