//! Typed storage columns.

use chrono::NaiveDate;
use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Type;
use inkfuse_runtime::MemoryRegion;

fn parse_err(ty: &str, token: &str) -> InkFuseError {
    InkFuseError::SchemaMismatch(format!("cannot parse `{token}` as {ty}"))
}

/// Variable-length string column: one `char*` per row pointing into an
/// owned arena, each string NUL-terminated.
#[derive(Debug, Default)]
pub struct StringColumn {
    ptrs: Vec<*const u8>,
    arena: MemoryRegion,
}

// Pointers target the column's own arena and the column is immutable while
// shared across scan threads.
unsafe impl Send for StringColumn {}
unsafe impl Sync for StringColumn {}

impl StringColumn {
    pub fn new() -> StringColumn {
        StringColumn::default()
    }

    /// Copy `token` into the arena with a trailing NUL and append its
    /// pointer.
    pub fn push(&mut self, token: &str) {
        let bytes = token.as_bytes();
        let dst = self.arena.alloc(bytes.len() + 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            *dst.add(bytes.len()) = 0;
        }
        self.ptrs.push(dst.cast_const());
    }

    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }

    /// Base of the per-row pointer array.
    pub fn ptr_base(&self) -> *const u8 {
        self.ptrs.as_ptr().cast()
    }

    /// Read back row `idx` as UTF-8 (test and print support).
    pub fn value(&self, idx: usize) -> &str {
        unsafe {
            let ptr = self.ptrs[idx];
            let mut len = 0;
            while *ptr.add(len) != 0 {
                len += 1;
            }
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(ptr, len))
        }
    }
}

/// A typed storage column of contiguous values.
#[derive(Debug)]
pub enum BaseColumn {
    I1(Vec<i8>),
    I2(Vec<i16>),
    I4(Vec<i32>),
    I8(Vec<i64>),
    U1(Vec<u8>),
    U2(Vec<u16>),
    U4(Vec<u32>),
    U8(Vec<u64>),
    F4(Vec<f32>),
    F8(Vec<f64>),
    Char(Vec<u8>),
    /// Days since 1970-01-01.
    Date(Vec<i32>),
    String(StringColumn),
}

impl BaseColumn {
    /// Create an empty column holding values of `ty`.
    pub fn with_type(ty: &Type) -> Result<BaseColumn> {
        Ok(match ty {
            Type::SignedInt(1) => BaseColumn::I1(Vec::new()),
            Type::SignedInt(2) => BaseColumn::I2(Vec::new()),
            Type::SignedInt(4) => BaseColumn::I4(Vec::new()),
            Type::SignedInt(8) => BaseColumn::I8(Vec::new()),
            Type::UnsignedInt(1) => BaseColumn::U1(Vec::new()),
            Type::UnsignedInt(2) => BaseColumn::U2(Vec::new()),
            Type::UnsignedInt(4) => BaseColumn::U4(Vec::new()),
            Type::UnsignedInt(8) => BaseColumn::U8(Vec::new()),
            Type::Float(4) => BaseColumn::F4(Vec::new()),
            Type::Float(8) => BaseColumn::F8(Vec::new()),
            Type::Char => BaseColumn::Char(Vec::new()),
            Type::Date => BaseColumn::Date(Vec::new()),
            Type::Ptr(inner) if **inner == Type::Char => BaseColumn::String(StringColumn::new()),
            other => {
                return Err(InkFuseError::unsupported(format!(
                    "no storage column for type {other}"
                )));
            }
        })
    }

    /// IR type of the values a scan reads from this column.  Strings scan
    /// as `char*`.
    pub fn value_type(&self) -> Type {
        match self {
            BaseColumn::I1(_) => Type::SignedInt(1),
            BaseColumn::I2(_) => Type::SignedInt(2),
            BaseColumn::I4(_) => Type::SignedInt(4),
            BaseColumn::I8(_) => Type::SignedInt(8),
            BaseColumn::U1(_) => Type::UnsignedInt(1),
            BaseColumn::U2(_) => Type::UnsignedInt(2),
            BaseColumn::U4(_) => Type::UnsignedInt(4),
            BaseColumn::U8(_) => Type::UnsignedInt(8),
            BaseColumn::F4(_) => Type::Float(4),
            BaseColumn::F8(_) => Type::Float(8),
            BaseColumn::Char(_) => Type::Char,
            BaseColumn::Date(_) => Type::Date,
            BaseColumn::String(_) => Type::char_ptr(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BaseColumn::I1(v) => v.len(),
            BaseColumn::I2(v) => v.len(),
            BaseColumn::I4(v) => v.len(),
            BaseColumn::I8(v) => v.len(),
            BaseColumn::U1(v) | BaseColumn::Char(v) => v.len(),
            BaseColumn::U2(v) => v.len(),
            BaseColumn::U4(v) => v.len(),
            BaseColumn::U8(v) => v.len(),
            BaseColumn::F4(v) => v.len(),
            BaseColumn::F8(v) => v.len(),
            BaseColumn::Date(v) => v.len(),
            BaseColumn::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base pointer for scans; for strings this is the pointer array, so
    /// scans see one 8-byte `char*` per row.
    pub fn data_ptr(&self) -> *const u8 {
        match self {
            BaseColumn::I1(v) => v.as_ptr().cast(),
            BaseColumn::I2(v) => v.as_ptr().cast(),
            BaseColumn::I4(v) => v.as_ptr().cast(),
            BaseColumn::I8(v) => v.as_ptr().cast(),
            BaseColumn::U1(v) | BaseColumn::Char(v) => v.as_ptr(),
            BaseColumn::U2(v) => v.as_ptr().cast(),
            BaseColumn::U4(v) => v.as_ptr().cast(),
            BaseColumn::U8(v) => v.as_ptr().cast(),
            BaseColumn::F4(v) => v.as_ptr().cast(),
            BaseColumn::F8(v) => v.as_ptr().cast(),
            BaseColumn::Date(v) => v.as_ptr().cast(),
            BaseColumn::String(v) => v.ptr_base(),
        }
    }

    /// Bytes per row as seen by a scan.
    pub fn elem_size(&self) -> usize {
        self.value_type().byte_size()
    }

    /// Parse one text token into the next row slot.
    pub fn load_value(&mut self, token: &str) -> Result<()> {
        match self {
            BaseColumn::I1(v) => v.push(token.parse().map_err(|_| parse_err("int8", token))?),
            BaseColumn::I2(v) => v.push(token.parse().map_err(|_| parse_err("int16", token))?),
            BaseColumn::I4(v) => v.push(token.parse().map_err(|_| parse_err("int32", token))?),
            BaseColumn::I8(v) => v.push(token.parse().map_err(|_| parse_err("int64", token))?),
            BaseColumn::U1(v) => v.push(token.parse().map_err(|_| parse_err("uint8", token))?),
            BaseColumn::U2(v) => v.push(token.parse().map_err(|_| parse_err("uint16", token))?),
            BaseColumn::U4(v) => v.push(token.parse().map_err(|_| parse_err("uint32", token))?),
            BaseColumn::U8(v) => v.push(token.parse().map_err(|_| parse_err("uint64", token))?),
            BaseColumn::F4(v) => v.push(token.parse().map_err(|_| parse_err("float", token))?),
            BaseColumn::F8(v) => v.push(token.parse().map_err(|_| parse_err("double", token))?),
            BaseColumn::Char(v) => {
                let byte = token
                    .as_bytes()
                    .first()
                    .ok_or_else(|| parse_err("char", token))?;
                v.push(*byte);
            }
            BaseColumn::Date(v) => {
                let date = NaiveDate::parse_from_str(token, "%Y-%m-%d")
                    .map_err(|_| parse_err("date", token))?;
                let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch");
                v.push(date.signed_duration_since(epoch).num_days() as i32);
            }
            BaseColumn::String(v) => v.push(token),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_parsing_covers_signs_and_floats() {
        let mut col = BaseColumn::with_type(&Type::SignedInt(4)).unwrap();
        col.load_value("-12").unwrap();
        col.load_value("34").unwrap();
        assert!(col.load_value("x12").is_err());
        let BaseColumn::I4(v) = &col else {
            panic!("wrong variant")
        };
        assert_eq!(v, &[-12, 34]);

        let mut f = BaseColumn::with_type(&Type::Float(8)).unwrap();
        f.load_value("2.5").unwrap();
        let BaseColumn::F8(v) = &f else {
            panic!("wrong variant")
        };
        assert_eq!(v[0], 2.5);
    }

    #[test]
    fn dates_are_days_since_epoch() {
        let mut col = BaseColumn::with_type(&Type::Date).unwrap();
        col.load_value("1970-01-01").unwrap();
        col.load_value("1970-02-01").unwrap();
        col.load_value("1969-12-31").unwrap();
        let BaseColumn::Date(v) = &col else {
            panic!("wrong variant")
        };
        assert_eq!(v, &[0, 31, -1]);
        assert!(col.load_value("1970-13-01").is_err());
    }

    #[test]
    fn strings_are_nul_terminated_arena_pointers() {
        let mut col = StringColumn::new();
        col.push("alpha");
        col.push("");
        col.push("beta");
        assert_eq!(col.len(), 3);
        assert_eq!(col.value(0), "alpha");
        assert_eq!(col.value(1), "");
        assert_eq!(col.value(2), "beta");
        // The pointer array serves as scan data: 8 bytes per row.
        let base = col.ptr_base().cast::<*const u8>();
        unsafe {
            assert_eq!(*(*base), b'a');
        }
    }

    #[test]
    fn char_column_takes_first_byte() {
        let mut col = BaseColumn::with_type(&Type::Char).unwrap();
        col.load_value("F").unwrap();
        col.load_value("Full").unwrap();
        let BaseColumn::Char(v) = &col else {
            panic!("wrong variant")
        };
        assert_eq!(v, &[b'F', b'F']);
        assert!(col.load_value("").is_err());
    }
}
