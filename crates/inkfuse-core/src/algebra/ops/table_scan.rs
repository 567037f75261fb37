//! Table scan.

use std::sync::Arc;

use inkfuse_error::Result;
use inkfuse_ir::Type;
use inkfuse_storage::Relation;

use crate::algebra::iu::{IuId, IuSpace};
use crate::algebra::pipeline::PipelineDag;
use crate::algebra::subop::runtime_objects::{ColumnSlice, ScanCursor};
use crate::algebra::subop::{SubopKind, Suboperator, TScanDriver, TScanIuProvider};

/// Scans requested columns of one relation.  Decays into a new pipeline
/// with one loop driver and one indexed IU provider per column.
#[derive(Debug)]
pub struct TableScanOp {
    relation: Arc<Relation>,
    columns: Vec<(String, ColumnSlice)>,
    output_ius: Vec<IuId>,
    #[allow(dead_code)]
    tag: String,
}

impl TableScanOp {
    pub fn new(
        ius: &IuSpace,
        relation: Arc<Relation>,
        column_names: &[&str],
        tag: impl Into<String>,
    ) -> Result<TableScanOp> {
        let tag = tag.into();
        let mut columns = Vec::new();
        let mut output_ius = Vec::new();
        for name in column_names {
            let slice = ColumnSlice::new(Arc::clone(&relation), name)?;
            output_ius.push(ius.create(slice.value_type().clone(), format!("{tag}_{name}")));
            columns.push(((*name).to_string(), slice));
        }
        Ok(TableScanOp {
            relation,
            columns,
            output_ius,
            tag,
        })
    }

    pub fn output_ius(&self) -> &[IuId] {
        &self.output_ius
    }

    pub fn decay(&self, dag: &mut PipelineDag) -> Result<()> {
        let ius = dag.ius().clone();
        let counter = ius.create_pseudo(Type::UnsignedInt(8), "tscan_row");
        let cursor = Arc::new(ScanCursor::new(self.relation.num_rows() as u64));
        let pipe = dag.build_new_pipeline();
        pipe.attach(Suboperator::new(
            SubopKind::TScanDriver(TScanDriver { cursor }),
            [],
            [counter],
        ));
        for ((_, slice), out) in self.columns.iter().zip(self.output_ius.iter()) {
            pipe.attach(
                Suboperator::new(
                    SubopKind::TScanIuProvider(TScanIuProvider {
                        column: slice.clone(),
                    }),
                    [counter],
                    [*out],
                )
                .with_strong([counter]),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkfuse_storage::BaseColumn;

    #[test]
    fn decays_into_driver_and_providers() {
        let mut rel = Relation::new("t");
        rel.attach_filled("a", BaseColumn::U8(vec![1, 2])).unwrap();
        rel.attach_filled("b", BaseColumn::F8(vec![0.5, 1.5])).unwrap();
        let mut dag = PipelineDag::new();
        let scan =
            TableScanOp::new(dag.ius(), Arc::new(rel), &["a", "b"], "t").unwrap();
        scan.decay(&mut dag).unwrap();

        let pipe = &dag.pipelines()[0];
        assert_eq!(pipe.subops().len(), 3);
        assert!(pipe.subops()[0].is_source());
        assert_eq!(dag.ius().ty(scan.output_ius()[1]), Type::Float(8));
        // Providers are strong-linked to the driver's loop counter.
        assert_eq!(pipe.subops()[1].strong_source_ius.len(), 1);
    }
}
