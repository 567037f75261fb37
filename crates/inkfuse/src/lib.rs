//! InkFuse: a relational query engine with a unified suboperator substrate.
//!
//! A relational operator tree decays into a DAG of fine-grained
//! suboperators with explicit IU edges.  The same DAG executes three ways:
//! fused into one JIT-compiled function per pipeline, interpreted as a
//! chain of pre-compiled vectorized primitives over columnar fuse chunks,
//! or hybrid — interpretation serves morsels immediately while the fused
//! function compiles in the background and takes over when it lands.
//!
//! ```no_run
//! use std::sync::Arc;
//! use inkfuse::{
//!     ExecutionMode, PipelineDag, PrettyPrinter, PrintOp, QueryExecutor, RelAlgOp, Relation,
//!     TableScanOp,
//! };
//!
//! # fn main() -> inkfuse::Result<()> {
//! let mut rel = Relation::new("t");
//! rel.attach_column("c", &inkfuse::Type::UnsignedInt(8))?;
//! rel.load_rows("1|\n2|\n3|\n")?;
//!
//! let mut dag = PipelineDag::new();
//! let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["c"], "t")?;
//! let outputs = scan.output_ius().to_vec();
//! let print = PrintOp::new(
//!     Box::new(RelAlgOp::TableScan(scan)),
//!     outputs,
//!     vec!["c".into()],
//!     "print",
//!     None,
//!     Arc::new(PrettyPrinter::stdout()),
//! )?;
//! QueryExecutor::new(ExecutionMode::Hybrid, 4)
//!     .run_tree(&RelAlgOp::Print(print), &mut dag)?;
//! # Ok(())
//! # }
//! ```

use std::io::Write;

use parking_lot::Mutex;

pub use inkfuse_backend_c::BackendConfig;
pub use inkfuse_core::algebra::ops::{
    AggDescription, AggOpCode, AggregationOp, ComputeOp, ExprNode, ExpressionOp, FilterOp,
    JoinOp, JoinType, PrintOp, RelAlgOp, TableScanOp,
};
pub use inkfuse_core::algebra::pipeline::{Pipeline, PipelineDag, RowSink};
pub use inkfuse_core::exec::{ExecutionMode, QueryExecutor};
pub use inkfuse_core::interpreter::FragmentCache;
pub use inkfuse_core::{Iu, IuId, IuSpace};
pub use inkfuse_error::{InkFuseError, Result};
pub use inkfuse_ir::{ArithOp, Type, Value};
pub use inkfuse_runtime::{
    AtomicHashTable, ComplexKeyComparator, ExclusiveHashTable, MemoryRegion, SimpleKeyComparator,
    TupleMaterializer,
};
pub use inkfuse_storage::{BaseColumn, Relation, StringColumn};

/// Collects result rows in memory; the sink used by tests and benchmarks.
#[derive(Debug, Default)]
pub struct CollectingSink {
    rows: Mutex<Vec<Vec<String>>>,
}

impl CollectingSink {
    pub fn new() -> CollectingSink {
        CollectingSink::default()
    }

    /// Drain everything collected so far.
    pub fn take(&self) -> Vec<Vec<String>> {
        std::mem::take(&mut self.rows.lock())
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl RowSink for CollectingSink {
    fn consume(&self, _columns: &[String], rows: Vec<Vec<String>>) {
        self.rows.lock().extend(rows);
    }
}

/// Writes `|`-separated rows to a stream, header first.  One mutex keeps
/// morsel output contiguous.
pub struct PrettyPrinter {
    out: Mutex<PrinterState>,
}

struct PrinterState {
    writer: Box<dyn Write + Send>,
    header_written: bool,
}

impl PrettyPrinter {
    pub fn new(writer: Box<dyn Write + Send>) -> PrettyPrinter {
        PrettyPrinter {
            out: Mutex::new(PrinterState {
                writer,
                header_written: false,
            }),
        }
    }

    pub fn stdout() -> PrettyPrinter {
        PrettyPrinter::new(Box::new(std::io::stdout()))
    }
}

impl RowSink for PrettyPrinter {
    fn consume(&self, columns: &[String], rows: Vec<Vec<String>>) {
        let mut state = self.out.lock();
        if !state.header_written {
            state.header_written = true;
            let _ = writeln!(state.writer, "{}", columns.join(" | "));
        }
        for row in rows {
            let _ = writeln!(state.writer, "{}", row.join(" | "));
        }
        let _ = state.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pretty_printer_writes_header_once() {
        #[derive(Clone, Default)]
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let buffer = Shared::default();
        let printer = PrettyPrinter::new(Box::new(buffer.clone()));
        let columns = vec!["a".to_string(), "b".to_string()];
        printer.consume(&columns, vec![vec!["1".into(), "2".into()]]);
        printer.consume(&columns, vec![vec!["3".into(), "4".into()]]);
        let text = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert_eq!(text, "a | b\n1 | 2\n3 | 4\n");
    }

    #[test]
    fn collecting_sink_drains() {
        let sink = CollectingSink::new();
        sink.consume(&["a".to_string()], vec![vec!["1".into()]]);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.take(), vec![vec!["1".to_string()]]);
        assert!(sink.is_empty());
    }
}
