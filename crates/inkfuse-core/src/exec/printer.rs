//! Result flushing for print pipelines.
//!
//! A [`PrintGate`] serializes completed morsels into the row sink under a
//! single mutex, so output for one morsel is contiguous; relative order
//! across morsels is completion order.  The optional row limit closes the
//! pipeline early: once it is reached, the pickers stop handing out
//! morsels.

use std::sync::atomic::{AtomicBool, Ordering};

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Type;
use parking_lot::Mutex;

use crate::algebra::pipeline::PrintSpec;
use crate::exec::fuse_chunk::{Column, FuseChunk};

/// Shared flush point of one print pipeline.
pub struct PrintGate {
    spec: PrintSpec,
    served: Mutex<u64>,
    closed: AtomicBool,
}

impl PrintGate {
    pub fn new(spec: PrintSpec) -> PrintGate {
        PrintGate {
            spec,
            served: Mutex::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The row limit was reached; no further morsels should be picked.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Render the staged print columns of one completed morsel and hand
    /// them to the sink.
    pub fn flush(&self, chunk: &FuseChunk) -> Result<()> {
        let mut rows = u64::MAX;
        for iu in &self.spec.ius {
            rows = rows.min(chunk.column(*iu)?.size());
        }
        if rows == u64::MAX || rows == 0 {
            return Ok(());
        }
        let mut served = self.served.lock();
        let take = match self.spec.row_limit {
            Some(limit) => rows.min(limit.saturating_sub(*served)),
            None => rows,
        };
        if take == 0 {
            self.closed.store(true, Ordering::Release);
            return Ok(());
        }
        let mut rendered = Vec::with_capacity(take as usize);
        for row in 0..take {
            let mut out = Vec::with_capacity(self.spec.ius.len());
            for iu in &self.spec.ius {
                out.push(render_value(chunk.column(*iu)?, row)?);
            }
            rendered.push(out);
        }
        *served += take;
        if self.spec.row_limit == Some(*served) {
            self.closed.store(true, Ordering::Release);
        }
        self.spec.sink.consume(&self.spec.column_names, rendered);
        Ok(())
    }
}

/// Render one staged value as display text.
pub fn render_value(column: &Column, row: u64) -> Result<String> {
    let ptr = column.row(row);
    unsafe {
        Ok(match column.value_type() {
            Type::SignedInt(1) => ptr.cast::<i8>().read().to_string(),
            Type::SignedInt(2) => ptr.cast::<i16>().read_unaligned().to_string(),
            Type::SignedInt(4) => ptr.cast::<i32>().read_unaligned().to_string(),
            Type::SignedInt(8) => ptr.cast::<i64>().read_unaligned().to_string(),
            Type::UnsignedInt(1) => ptr.cast::<u8>().read().to_string(),
            Type::UnsignedInt(2) => ptr.cast::<u16>().read_unaligned().to_string(),
            Type::UnsignedInt(4) => ptr.cast::<u32>().read_unaligned().to_string(),
            Type::UnsignedInt(8) => ptr.cast::<u64>().read_unaligned().to_string(),
            Type::Float(4) => ptr.cast::<f32>().read_unaligned().to_string(),
            Type::Float(8) => ptr.cast::<f64>().read_unaligned().to_string(),
            Type::Bool => (if ptr.read() != 0 { "true" } else { "false" }).to_string(),
            Type::Char => char::from(ptr.read()).to_string(),
            Type::Date => render_date(ptr.cast::<i32>().read_unaligned()),
            Type::Ptr(inner) if **inner == Type::Char => {
                let s = ptr.cast::<*const std::os::raw::c_char>().read_unaligned();
                if s.is_null() {
                    String::new()
                } else {
                    std::ffi::CStr::from_ptr(s).to_string_lossy().into_owned()
                }
            }
            other => {
                return Err(InkFuseError::internal(format!(
                    "cannot render values of type {other}"
                )));
            }
        })
    }
}

fn render_date(days: i32) -> String {
    let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch");
    match epoch.checked_add_signed(chrono::Duration::days(i64::from(days))) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => days.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::iu::IuSpace;
    use crate::algebra::pipeline::{Pipeline, RowSink};
    use crate::algebra::subop::{SubopKind, Suboperator};
    use std::sync::Arc;

    struct Collect(Mutex<Vec<Vec<String>>>);

    impl RowSink for Collect {
        fn consume(&self, _columns: &[String], rows: Vec<Vec<String>>) {
            self.0.lock().extend(rows);
        }
    }

    fn chunk_with(values: &[u64]) -> (FuseChunk, crate::algebra::iu::IuId) {
        let ius = IuSpace::new();
        let iu = ius.create(Type::UnsignedInt(8), "v");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(SubopKind::FuseChunkSink, [iu], []));
        let mut chunk = FuseChunk::for_pipeline(&pipe);
        {
            let col = chunk.column_mut(iu).unwrap();
            for (i, v) in values.iter().enumerate() {
                unsafe {
                    col.data().cast::<u64>().add(i).write(*v);
                }
            }
            col.set_size(values.len() as u64);
        }
        (chunk, iu)
    }

    #[test]
    fn row_limit_truncates_and_closes() {
        let (chunk, iu) = chunk_with(&[1, 2, 3, 4, 5]);
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        let gate = PrintGate::new(PrintSpec {
            ius: vec![iu],
            column_names: vec!["v".into()],
            row_limit: Some(3),
            sink: Arc::clone(&collect) as Arc<dyn RowSink>,
        });
        gate.flush(&chunk).unwrap();
        assert!(gate.closed());
        let rows = collect.0.lock();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], vec!["3".to_string()]);
    }

    #[test]
    fn dates_render_iso() {
        let ius = IuSpace::new();
        let iu = ius.create(Type::Date, "d");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(SubopKind::FuseChunkSink, [iu], []));
        let mut chunk = FuseChunk::for_pipeline(&pipe);
        {
            let col = chunk.column_mut(iu).unwrap();
            unsafe {
                col.data().cast::<i32>().write(31);
            }
            col.set_size(1);
        }
        assert_eq!(render_value(chunk.column(iu).unwrap(), 0).unwrap(), "1970-02-01");
    }
}
