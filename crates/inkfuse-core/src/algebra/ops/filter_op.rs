//! Filter.

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Type;

use crate::algebra::iu::{IuId, IuSpace};
use crate::algebra::pipeline::PipelineDag;
use crate::algebra::subop::{SubopKind, Suboperator};

use super::RelAlgOp;

/// Filters rows on a boolean predicate IU.  Decays into one
/// `ColumnFilterScope` opening the `if` and one `ColumnFilterLogic` per
/// retained IU redefining it inside the scope.
#[derive(Debug)]
pub struct FilterOp {
    child: Box<RelAlgOp>,
    predicate: IuId,
    retained: Vec<IuId>,
    output_ius: Vec<IuId>,
    #[allow(dead_code)]
    tag: String,
}

impl FilterOp {
    pub fn new(
        ius: &IuSpace,
        child: Box<RelAlgOp>,
        tag: impl Into<String>,
        retained: Vec<IuId>,
        predicate: IuId,
    ) -> Result<FilterOp> {
        let tag = tag.into();
        if ius.ty(predicate) != Type::Bool {
            return Err(InkFuseError::internal(
                "filter predicate IU must be boolean",
            ));
        }
        let output_ius = retained
            .iter()
            .enumerate()
            .map(|(k, iu)| ius.create(ius.ty(*iu), format!("{tag}_f{k}")))
            .collect();
        Ok(FilterOp {
            child,
            predicate,
            retained,
            output_ius,
            tag,
        })
    }

    pub fn output_ius(&self) -> &[IuId] {
        &self.output_ius
    }

    pub fn decay(&self, dag: &mut PipelineDag) -> Result<()> {
        self.child.decay(dag)?;
        let scope_iu = dag.ius().create_pseudo(Type::Void, "filter_scope");
        let pipe = dag.current();
        pipe.attach(Suboperator::new(
            SubopKind::ColumnFilterScope,
            [self.predicate],
            [scope_iu],
        ));
        for (src, out) in self.retained.iter().zip(self.output_ius.iter()) {
            pipe.attach(
                Suboperator::new(SubopKind::ColumnFilterLogic, [scope_iu, *src], [*out])
                    .with_strong([scope_iu]),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::ops::table_scan::TableScanOp;
    use inkfuse_storage::{BaseColumn, Relation};
    use std::sync::Arc;

    #[test]
    fn one_logic_per_retained_iu() {
        let mut dag = PipelineDag::new();
        let mut rel = Relation::new("t");
        rel.attach_filled("a", BaseColumn::U8(vec![1])).unwrap();
        rel.attach_filled("b", BaseColumn::U8(vec![2])).unwrap();
        let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["a", "b"], "t").unwrap();
        let a = scan.output_ius()[0];
        let b = scan.output_ius()[1];
        let pred = dag.ius().create(Type::Bool, "pred");
        let filter = FilterOp::new(
            dag.ius(),
            Box::new(RelAlgOp::TableScan(scan)),
            "f",
            vec![a, b],
            pred,
        )
        .unwrap();
        assert_eq!(filter.output_ius().len(), 2);
        // decay fails later at compile time if pred is unproduced; the
        // graph construction itself is agnostic.
        filter.decay(&mut dag).unwrap();
        let logics = dag.pipelines()[0]
            .subops()
            .iter()
            .filter(|s| matches!(s.kind, SubopKind::ColumnFilterLogic))
            .count();
        assert_eq!(logics, 2);
    }

    #[test]
    fn non_boolean_predicates_are_rejected() {
        let dag = PipelineDag::new();
        let mut rel = Relation::new("t");
        rel.attach_filled("a", BaseColumn::U8(vec![1])).unwrap();
        let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["a"], "t").unwrap();
        let a = scan.output_ius()[0];
        let result = FilterOp::new(
            dag.ius(),
            Box::new(RelAlgOp::TableScan(scan)),
            "f",
            vec![a],
            a,
        );
        assert!(result.is_err());
    }
}
