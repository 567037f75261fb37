//! Primary-key hash join.
//!
//! Build side: every tuple is packed into a thread-local tuple
//! materializer.  Between the pipelines a runtime task sizes an atomic hash
//! table to twice the materialized row count and fills it with N threads,
//! hash-and-prefetching in batches.  Probe side: pack the probe key,
//! hash+prefetch, lookup, filter null results, then unpack build columns.
//! The left-semi variant looks up with the disabling primitive, so each
//! build row matches at most once.

use std::sync::Arc;

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::{ArithOp, Type, Value};
use smallvec::SmallVec;

use crate::algebra::iu::{IuId, IuSpace};
use crate::algebra::pipeline::{PipelineDag, RuntimeTask};
use crate::algebra::subop::runtime_objects::{
    JoinBuildState, KeySpec, MaterializerSet, RuntimeObject,
};
use crate::algebra::subop::{
    KeyPackingSubop, RuntimeExpressionSubop, RuntimeFunctionSubop, SubopKind, Suboperator,
};

use super::RelAlgOp;

/// Supported join variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftSemi,
}

#[derive(Debug)]
pub struct JoinOp {
    left: Box<RelAlgOp>,
    right: Box<RelAlgOp>,
    join_type: JoinType,
    key_spec: KeySpec,
    /// Left keys with their packed offsets, strings first.
    left_key_layout: Vec<(IuId, u64)>,
    /// Right keys packed at the same offsets as their left partners.
    right_key_layout: Vec<(IuId, u64)>,
    /// Left payload columns after the keys.
    left_payload_layout: Vec<(IuId, u64)>,
    /// Unpacked left outputs: (tuple offset, output IU), in the caller's
    /// `keys_left + payload_left` order.  Empty for semi joins.
    left_outputs: Vec<(u64, IuId)>,
    /// Probe-side carried outputs (filter-redefined), in the caller's
    /// `keys_right + payload_right` order.
    right_carried: Vec<(IuId, IuId)>,
    mats: Arc<MaterializerSet>,
    build: Arc<JoinBuildState>,
    output_ius: Vec<IuId>,
    #[allow(dead_code)]
    tag: String,
}

impl JoinOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ius: &IuSpace,
        left: Box<RelAlgOp>,
        right: Box<RelAlgOp>,
        tag: impl Into<String>,
        keys_left: Vec<IuId>,
        payload_left: Vec<IuId>,
        keys_right: Vec<IuId>,
        payload_right: Vec<IuId>,
        join_type: JoinType,
        is_pk: bool,
    ) -> Result<JoinOp> {
        let tag = tag.into();
        if !is_pk {
            return Err(InkFuseError::unsupported("non-primary-key joins"));
        }
        if keys_left.len() != keys_right.len() || keys_left.is_empty() {
            return Err(InkFuseError::internal(
                "join key lists must be non-empty and of equal length",
            ));
        }
        for (l, r) in keys_left.iter().zip(keys_right.iter()) {
            if ius.ty(*l) != ius.ty(*r) {
                return Err(InkFuseError::unsupported(format!(
                    "join key type mismatch: {} vs {}",
                    ius.ty(*l),
                    ius.ty(*r)
                )));
            }
        }

        // Pack string keys first, keeping left/right offsets in lockstep.
        let (string_pairs, fixed_pairs): (Vec<(IuId, IuId)>, Vec<(IuId, IuId)>) = keys_left
            .iter()
            .copied()
            .zip(keys_right.iter().copied())
            .partition(|(l, _)| ius.ty(*l) == Type::char_ptr());
        let mut left_key_layout = Vec::new();
        let mut right_key_layout = Vec::new();
        let mut offset = 0_u64;
        for (l, r) in &string_pairs {
            left_key_layout.push((*l, offset));
            right_key_layout.push((*r, offset));
            offset += 8;
        }
        let simple_start = offset;
        for (l, r) in &fixed_pairs {
            left_key_layout.push((*l, offset));
            right_key_layout.push((*r, offset));
            offset += ius.ty(*l).byte_size() as u64;
        }
        let key_spec = if string_pairs.is_empty() {
            KeySpec::Simple {
                size: offset as usize,
            }
        } else {
            KeySpec::Complex {
                slots: string_pairs.len(),
                simple: (offset - simple_start) as usize,
            }
        };
        let key_size = offset;

        let mut left_payload_layout = Vec::new();
        for iu in &payload_left {
            left_payload_layout.push((*iu, offset));
            offset += ius.ty(*iu).byte_size() as u64;
        }
        let tuple_size = offset as usize;
        let payload_size = tuple_size - key_size as usize;

        // Outputs: unpacked left columns (inner only), then the carried
        // probe columns.
        let mut output_ius = Vec::new();
        let mut left_outputs = Vec::new();
        if join_type == JoinType::Inner {
            for iu in keys_left.iter().chain(payload_left.iter()) {
                let packed_offset = left_key_layout
                    .iter()
                    .chain(left_payload_layout.iter())
                    .find(|(packed, _)| packed == iu)
                    .map(|(_, off)| *off)
                    .ok_or_else(|| InkFuseError::internal("left column missing from layout"))?;
                let out = ius.create(ius.ty(*iu), format!("{tag}_build"));
                left_outputs.push((packed_offset, out));
                output_ius.push(out);
            }
        }
        let mut right_carried = Vec::new();
        for iu in keys_right.iter().chain(payload_right.iter()) {
            let out = ius.create(ius.ty(*iu), format!("{tag}_probe"));
            right_carried.push((*iu, out));
            output_ius.push(out);
        }

        let mats = Arc::new(MaterializerSet::new(tuple_size));
        let build = Arc::new(JoinBuildState::new(
            key_spec,
            payload_size,
            Arc::clone(&mats),
        ));
        Ok(JoinOp {
            left,
            right,
            join_type,
            key_spec,
            left_key_layout,
            right_key_layout,
            left_payload_layout,
            left_outputs,
            right_carried,
            mats,
            build,
            output_ius,
            tag,
        })
    }

    pub fn output_ius(&self) -> &[IuId] {
        &self.output_ius
    }

    pub fn decay(&self, dag: &mut PipelineDag) -> Result<()> {
        // Build pipeline: materialize packed tuples per thread.
        self.left.decay(dag)?;
        let ius = dag.ius().clone();
        let tuple_ptr = ius.create(Type::char_ptr(), format!("{}_tuple", self.tag));
        let pace = self.left_key_layout[0].0;
        let pipe = dag.current();
        pipe.attach(RuntimeFunctionSubop::materialize(
            Arc::clone(&self.mats),
            pace,
            tuple_ptr,
        ));
        for (src, offset) in self.left_key_layout.iter().chain(&self.left_payload_layout) {
            pipe.attach(Suboperator::new(
                SubopKind::KeyPacker(KeyPackingSubop { offset: *offset }),
                [tuple_ptr, *src],
                [],
            ));
        }
        dag.add_runtime_task(RuntimeTask::JoinBuild(Arc::clone(&self.build)));

        // Probe pipeline on top of the right child's decay.
        self.right.decay(dag)?;
        let key_size = self.key_spec.key_size();
        let probe_key = ius.create(
            Type::ByteArray(key_size as u16),
            format!("{}_probe_key", self.tag),
        );
        let pipe = dag.current();
        pipe.attach(Suboperator::new(
            SubopKind::ScratchPadIuProvider,
            [],
            [probe_key],
        ));
        let mut packed_pseudos = Vec::new();
        for (src, offset) in &self.right_key_layout {
            let pseudo = ius.create_pseudo(Type::Void, "packed");
            pipe.attach(Suboperator::new(
                SubopKind::KeyPacker(KeyPackingSubop { offset: *offset }),
                [probe_key, *src],
                [pseudo],
            ));
            packed_pseudos.push(pseudo);
        }

        let (hash_fn, lookup_fn) = match (self.key_spec, self.join_type) {
            (KeySpec::Simple { .. }, JoinType::Inner) => (
                "ht_at_sk_compute_hash_and_prefetch",
                "ht_at_sk_lookup_with_hash",
            ),
            (KeySpec::Simple { .. }, JoinType::LeftSemi) => (
                "ht_at_sk_compute_hash_and_prefetch",
                "ht_at_sk_lookup_with_hash_disable",
            ),
            (KeySpec::Complex { .. }, JoinType::Inner) => (
                "ht_at_ck_compute_hash_and_prefetch",
                "ht_at_ck_lookup_with_hash",
            ),
            (KeySpec::Complex { .. }, JoinType::LeftSemi) => (
                "ht_at_ck_compute_hash_and_prefetch",
                "ht_at_ck_lookup_with_hash_disable",
            ),
        };
        let hash_iu = ius.create(Type::UnsignedInt(8), format!("{}_hash", self.tag));
        let mut hash_sources = vec![probe_key];
        hash_sources.extend(packed_pseudos.iter().copied());
        pipe.attach(Suboperator::new(
            SubopKind::RuntimeFunction(RuntimeFunctionSubop {
                fct_name: hash_fn,
                args: SmallVec::from_slice(&[probe_key]),
                object: RuntimeObject::JoinTable(Arc::clone(&self.build)),
                prefetching: true,
            }),
            hash_sources,
            [hash_iu],
        ));
        let result_ptr = ius.create(Type::char_ptr(), format!("{}_slot", self.tag));
        pipe.attach(Suboperator::new(
            SubopKind::RuntimeFunction(RuntimeFunctionSubop {
                fct_name: lookup_fn,
                args: SmallVec::from_slice(&[probe_key, hash_iu]),
                object: RuntimeObject::JoinTable(Arc::clone(&self.build)),
                prefetching: true,
            }),
            [probe_key, hash_iu],
            [result_ptr],
        ));

        // Keep only matching rows.
        let matched = ius.create(Type::Bool, format!("{}_matched", self.tag));
        pipe.attach(Suboperator::new(
            SubopKind::RuntimeExpression(RuntimeExpressionSubop {
                op: ArithOp::Neq,
                value: Value::U8(0),
                const_on_left: false,
            }),
            [result_ptr],
            [matched],
        ));
        let scope = ius.create_pseudo(Type::Void, "join_scope");
        pipe.attach(Suboperator::new(
            SubopKind::ColumnFilterScope,
            [matched],
            [scope],
        ));
        let filtered_ptr = ius.create(Type::char_ptr(), format!("{}_slot_f", self.tag));
        if self.join_type == JoinType::Inner {
            pipe.attach(
                Suboperator::new(
                    SubopKind::ColumnFilterLogic,
                    [scope, result_ptr],
                    [filtered_ptr],
                )
                .with_strong([scope]),
            );
        }
        for (src, out) in &self.right_carried {
            pipe.attach(
                Suboperator::new(SubopKind::ColumnFilterLogic, [scope, *src], [*out])
                    .with_strong([scope]),
            );
        }
        // Unpack build-side columns out of the matched slot.
        for (offset, out) in &self.left_outputs {
            pipe.attach(Suboperator::new(
                SubopKind::KeyUnpacker(KeyPackingSubop { offset: *offset }),
                [filtered_ptr],
                [*out],
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::ops::table_scan::TableScanOp;
    use inkfuse_storage::{BaseColumn, Relation};

    fn scan(name: &str, dag: &PipelineDag) -> (RelAlgOp, Vec<IuId>) {
        let mut rel = Relation::new(name);
        rel.attach_filled("k", BaseColumn::U8(vec![1, 2])).unwrap();
        rel.attach_filled("p", BaseColumn::U8(vec![7, 9])).unwrap();
        let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["k", "p"], name).unwrap();
        let outs = scan.output_ius().to_vec();
        (RelAlgOp::TableScan(scan), outs)
    }

    fn make_join(join_type: JoinType) -> (PipelineDag, JoinOp) {
        let dag = PipelineDag::new();
        let (left, louts) = scan("l", &dag);
        let (right, routs) = scan("r", &dag);
        let op = JoinOp::new(
            dag.ius(),
            Box::new(left),
            Box::new(right),
            "j",
            vec![louts[0]],
            vec![louts[1]],
            vec![routs[0]],
            vec![routs[1]],
            join_type,
            true,
        )
        .unwrap();
        (dag, op)
    }

    #[test]
    fn inner_join_outputs_build_then_probe_columns() {
        let (mut dag, op) = make_join(JoinType::Inner);
        assert_eq!(op.output_ius().len(), 4);
        op.decay(&mut dag).unwrap();
        // Build pipeline, then probe pipeline.
        assert_eq!(dag.pipelines().len(), 2);
        assert!(matches!(
            dag.task_after(0),
            Some(RuntimeTask::JoinBuild(_))
        ));
        // Probe pipeline contains the prefetch + lookup pair and therefore
        // prefers small morsels.
        assert_eq!(
            dag.pipelines()[1].morsel_size(),
            crate::algebra::subop::PREFETCH_MORSEL_SIZE
        );
    }

    #[test]
    fn semi_join_carries_only_probe_columns() {
        let (mut dag, op) = make_join(JoinType::LeftSemi);
        assert_eq!(op.output_ius().len(), 2);
        op.decay(&mut dag).unwrap();
        let probe = &dag.pipelines()[1];
        // The disabling lookup is used.
        assert!(probe.subops().iter().any(|s| matches!(
            &s.kind,
            SubopKind::RuntimeFunction(f) if f.fct_name.ends_with("lookup_with_hash_disable")
        )));
        // No unpackers on the semi path.
        assert!(!probe
            .subops()
            .iter()
            .any(|s| matches!(s.kind, SubopKind::KeyUnpacker(_))));
    }

    #[test]
    fn non_pk_joins_are_unsupported() {
        let dag = PipelineDag::new();
        let (left, louts) = scan("l", &dag);
        let (right, routs) = scan("r", &dag);
        let result = JoinOp::new(
            dag.ius(),
            Box::new(left),
            Box::new(right),
            "j",
            vec![louts[0]],
            vec![],
            vec![routs[0]],
            vec![],
            JoinType::Inner,
            false,
        );
        assert!(matches!(result, Err(InkFuseError::Unsupported(_))));
    }

    #[test]
    fn string_keys_pick_the_complex_comparator() {
        let dag = PipelineDag::new();
        let mut l = Relation::new("l");
        let mut lk = inkfuse_storage::StringColumn::new();
        lk.push("alpha");
        l.attach_filled("k", BaseColumn::String(lk)).unwrap();
        let mut r = Relation::new("r");
        let mut rk = inkfuse_storage::StringColumn::new();
        rk.push("alpha");
        r.attach_filled("k", BaseColumn::String(rk)).unwrap();
        let lscan = TableScanOp::new(dag.ius(), Arc::new(l), &["k"], "l").unwrap();
        let rscan = TableScanOp::new(dag.ius(), Arc::new(r), &["k"], "r").unwrap();
        let lkey = lscan.output_ius()[0];
        let rkey = rscan.output_ius()[0];
        let op = JoinOp::new(
            dag.ius(),
            Box::new(RelAlgOp::TableScan(lscan)),
            Box::new(RelAlgOp::TableScan(rscan)),
            "j",
            vec![lkey],
            vec![],
            vec![rkey],
            vec![],
            JoinType::LeftSemi,
            true,
        )
        .unwrap();
        assert_eq!(op.key_spec, KeySpec::Complex { slots: 1, simple: 0 });
    }
}
