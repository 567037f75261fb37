//! Result printing.
//!
//! Attaches one fuse-chunk sink per output IU and registers the pipeline's
//! print attachment; the executor flushes completed morsels to the row sink
//! under a mutex and closes the pipeline early once the optional row limit
//! is reached.

use std::sync::Arc;

use inkfuse_error::{InkFuseError, Result};

use crate::algebra::iu::IuId;
use crate::algebra::pipeline::{PipelineDag, PrintSpec, RowSink};
use crate::algebra::subop::{SubopKind, Suboperator};

use super::RelAlgOp;

#[derive(Debug)]
pub struct PrintOp {
    child: Box<RelAlgOp>,
    spec: PrintSpec,
    #[allow(dead_code)]
    tag: String,
}

impl PrintOp {
    pub fn new(
        child: Box<RelAlgOp>,
        output_ius: Vec<IuId>,
        column_names: Vec<String>,
        tag: impl Into<String>,
        row_limit: Option<u64>,
        sink: Arc<dyn RowSink>,
    ) -> Result<PrintOp> {
        if output_ius.len() != column_names.len() {
            return Err(InkFuseError::internal(
                "print needs one column name per output IU",
            ));
        }
        Ok(PrintOp {
            child,
            spec: PrintSpec {
                ius: output_ius,
                column_names,
                row_limit,
                sink,
            },
            tag: tag.into(),
        })
    }

    /// Print is terminal; it exposes nothing upward.
    pub fn output_ius(&self) -> &[IuId] {
        &[]
    }

    pub fn decay(&self, dag: &mut PipelineDag) -> Result<()> {
        self.child.decay(dag)?;
        let pipe = dag.current();
        for iu in &self.spec.ius {
            pipe.attach(Suboperator::new(SubopKind::FuseChunkSink, [*iu], []));
        }
        pipe.set_print(self.spec.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::ops::table_scan::TableScanOp;
    use inkfuse_storage::{BaseColumn, Relation};
    use parking_lot::Mutex;

    struct Collect(Mutex<Vec<Vec<String>>>);

    impl RowSink for Collect {
        fn consume(&self, _columns: &[String], rows: Vec<Vec<String>>) {
            self.0.lock().extend(rows);
        }
    }

    #[test]
    fn decay_attaches_one_sink_per_output() {
        let mut dag = PipelineDag::new();
        let mut rel = Relation::new("t");
        rel.attach_filled("a", BaseColumn::U8(vec![1])).unwrap();
        rel.attach_filled("b", BaseColumn::U8(vec![2])).unwrap();
        let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["a", "b"], "t").unwrap();
        let outs = scan.output_ius().to_vec();
        let print = PrintOp::new(
            Box::new(RelAlgOp::TableScan(scan)),
            outs,
            vec!["a".into(), "b".into()],
            "print",
            Some(10),
            Arc::new(Collect(Mutex::new(Vec::new()))),
        )
        .unwrap();
        print.decay(&mut dag).unwrap();
        let pipe = &dag.pipelines()[0];
        let sinks = pipe
            .subops()
            .iter()
            .filter(|s| matches!(s.kind, SubopKind::FuseChunkSink))
            .count();
        assert_eq!(sinks, 2);
        assert_eq!(pipe.print().unwrap().row_limit, Some(10));
    }

    #[test]
    fn name_arity_is_checked() {
        let dag = PipelineDag::new();
        let mut rel = Relation::new("t");
        rel.attach_filled("a", BaseColumn::U8(vec![1])).unwrap();
        let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["a"], "t").unwrap();
        let outs = scan.output_ius().to_vec();
        let result = PrintOp::new(
            Box::new(RelAlgOp::TableScan(scan)),
            outs,
            vec![],
            "print",
            None,
            Arc::new(Collect(Mutex::new(Vec::new()))),
        );
        assert!(result.is_err());
    }
}
