//! Columnar batches staging values between interpreted primitives.
//!
//! A fuse chunk maps IU identity to a fixed-capacity column.  Every worker
//! thread owns one chunk per pipeline; interpreted primitives read their
//! inputs from columns and append outputs through raw pointers handed over
//! in the per-suboperator state structs.  The zero-copy scan path swaps a
//! column's data pointer to alias backing storage for one morsel instead of
//! copying.

use hashbrown::HashMap;
use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Type;

use crate::algebra::iu::IuId;
use crate::algebra::pipeline::Pipeline;
use crate::algebra::subop::DEFAULT_MORSEL_SIZE;

/// One typed column of a fuse chunk.
#[derive(Debug)]
pub struct Column {
    /// Owned 8-byte aligned backing storage.
    owned: Box<[u64]>,
    /// Active data pointer; usually into `owned`, aliased during zero-copy
    /// scans.
    ptr: *mut u8,
    stride: usize,
    size: u64,
    ty: Type,
}

impl Column {
    fn new(ty: Type, capacity: u64) -> Column {
        let stride = ty.byte_size().max(1);
        let words = (capacity as usize * stride).div_ceil(8);
        let mut owned = vec![0_u64; words].into_boxed_slice();
        let ptr = owned.as_mut_ptr().cast();
        Column {
            owned,
            ptr,
            stride,
            size: 0,
            ty,
        }
    }

    pub fn data(&self) -> *mut u8 {
        self.ptr
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Address of the row count, handed to fuse-chunk sinks so generated
    /// code can append.
    pub fn size_ptr(&mut self) -> *mut u64 {
        std::ptr::addr_of_mut!(self.size)
    }

    pub fn value_type(&self) -> &Type {
        &self.ty
    }

    /// Alias `rows` rows starting at `base` for the current morsel instead
    /// of copying them in.
    pub fn alias(&mut self, base: *mut u8, rows: u64) {
        self.ptr = base;
        self.size = rows;
    }

    /// Point back at the owned buffer and clear the row count.
    pub fn reset(&mut self) {
        self.ptr = self.owned.as_mut_ptr().cast();
        self.size = 0;
    }

    /// Raw value pointer of row `idx`.
    pub fn row(&self, idx: u64) -> *const u8 {
        debug_assert!(idx < self.size);
        unsafe { self.ptr.add(idx as usize * self.stride) }
    }
}

// Columns are moved into their owning worker thread and never shared.
unsafe impl Send for Column {}

/// Per-thread columnar batch keyed by IU identity; holds only non-void IUs.
#[derive(Debug)]
pub struct FuseChunk {
    capacity: u64,
    columns: HashMap<IuId, Column>,
}

impl FuseChunk {
    /// One column per materializable IU the pipeline touches.
    pub fn for_pipeline(pipe: &Pipeline) -> FuseChunk {
        let capacity = DEFAULT_MORSEL_SIZE;
        let mut columns = HashMap::new();
        for iu in pipe.materialized_ius() {
            columns.insert(iu, Column::new(pipe.ius().ty(iu), capacity));
        }
        FuseChunk { capacity, columns }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn column(&self, iu: IuId) -> Result<&Column> {
        self.columns
            .get(&iu)
            .ok_or_else(|| InkFuseError::internal(format!("fuse chunk has no column for {iu:?}")))
    }

    pub fn column_mut(&mut self, iu: IuId) -> Result<&mut Column> {
        self.columns
            .get_mut(&iu)
            .ok_or_else(|| InkFuseError::internal(format!("fuse chunk has no column for {iu:?}")))
    }

    /// Clear every column before a new morsel: sizes to zero, aliased
    /// pointers back to the owned buffers.
    pub fn reset(&mut self) {
        for column in self.columns.values_mut() {
            column.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::iu::IuSpace;
    use crate::algebra::subop::{SubopKind, Suboperator};

    #[test]
    fn chunks_hold_only_materializable_ius() {
        let ius = IuSpace::new();
        let counter = ius.create_pseudo(Type::UnsignedInt(8), "row");
        let col = ius.create(Type::UnsignedInt(8), "c");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(SubopKind::FuseChunkSourceDriver, [], [counter]));
        pipe.attach(
            Suboperator::new(SubopKind::FuseChunkSourceIuProvider, [counter], [col])
                .with_strong([counter]),
        );
        pipe.attach(Suboperator::new(SubopKind::FuseChunkSink, [col], []));
        let chunk = FuseChunk::for_pipeline(&pipe);
        assert!(chunk.column(col).is_ok());
        assert!(chunk.column(counter).is_err());
    }

    #[test]
    fn sinks_append_through_the_size_pointer() {
        let mut col = Column::new(Type::UnsignedInt(8), 16);
        unsafe {
            let size_ptr = col.size_ptr();
            for v in [7_u64, 9, 11] {
                col.data().cast::<u64>().add(*size_ptr as usize).write(v);
                *size_ptr += 1;
            }
        }
        assert_eq!(col.size(), 3);
        unsafe {
            assert_eq!(col.row(1).cast::<u64>().read(), 9);
        }
    }

    #[test]
    fn aliasing_swaps_and_reset_restores() {
        let mut col = Column::new(Type::UnsignedInt(8), 16);
        let owned_base = col.data();
        let mut backing = [1_u64, 2, 3, 4];
        col.alias(backing.as_mut_ptr().cast(), 4);
        assert_eq!(col.size(), 4);
        unsafe {
            assert_eq!(col.row(2).cast::<u64>().read(), 3);
        }
        col.reset();
        assert_eq!(col.data(), owned_base);
        assert_eq!(col.size(), 0);
    }

    #[test]
    fn byte_array_columns_use_the_array_stride() {
        let col = Column::new(Type::ByteArray(12), 8);
        assert_eq!(col.stride(), 12);
    }
}
