//! Typed constants.

use crate::types::Type;

/// A typed constant value embeddable in generated code.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I1(i8),
    I2(i16),
    I4(i32),
    I8(i64),
    U1(u8),
    U2(u16),
    U4(u32),
    U8(u64),
    F4(f32),
    F8(f64),
    Bool(bool),
    Char(u8),
    /// Days since 1970-01-01.
    Date(i32),
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Value::I1(_) => Type::SignedInt(1),
            Value::I2(_) => Type::SignedInt(2),
            Value::I4(_) => Type::SignedInt(4),
            Value::I8(_) => Type::SignedInt(8),
            Value::U1(_) => Type::UnsignedInt(1),
            Value::U2(_) => Type::UnsignedInt(2),
            Value::U4(_) => Type::UnsignedInt(4),
            Value::U8(_) => Type::UnsignedInt(8),
            Value::F4(_) => Type::Float(4),
            Value::F8(_) => Type::Float(8),
            Value::Bool(_) => Type::Bool,
            Value::Char(_) => Type::Char,
            Value::Date(_) => Type::Date,
        }
    }

    /// Render as a C literal with an explicit cast so the constant carries
    /// its type regardless of context.
    pub fn c_literal(&self) -> String {
        match self {
            Value::I1(v) => format!("(int8_t){v}"),
            Value::I2(v) => format!("(int16_t){v}"),
            Value::I4(v) => format!("(int32_t){v}"),
            Value::I8(v) => format!("(int64_t){v}LL"),
            Value::U1(v) => format!("(uint8_t){v}"),
            Value::U2(v) => format!("(uint16_t){v}"),
            Value::U4(v) => format!("(uint32_t){v}U"),
            Value::U8(v) => format!("(uint64_t){v}ULL"),
            Value::F4(v) => format!("(float){v:?}"),
            Value::F8(v) => format!("(double){v:?}"),
            Value::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            Value::Char(v) => format!("(char){v}"),
            Value::Date(v) => format!("(int32_t){v}"),
        }
    }

    /// Raw little-endian bytes of this value, as stored in columns and
    /// per-suboperator state structs.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Value::I1(v) => v.to_le_bytes().to_vec(),
            Value::I2(v) => v.to_le_bytes().to_vec(),
            Value::I4(v) => v.to_le_bytes().to_vec(),
            Value::I8(v) => v.to_le_bytes().to_vec(),
            Value::U1(v) => v.to_le_bytes().to_vec(),
            Value::U2(v) => v.to_le_bytes().to_vec(),
            Value::U4(v) => v.to_le_bytes().to_vec(),
            Value::U8(v) => v.to_le_bytes().to_vec(),
            Value::F4(v) => v.to_le_bytes().to_vec(),
            Value::F8(v) => v.to_le_bytes().to_vec(),
            Value::Bool(v) => vec![u8::from(*v)],
            Value::Char(v) => vec![*v],
            Value::Date(v) => v.to_le_bytes().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_rendering() {
        assert_eq!(Value::U8(503).c_literal(), "(uint64_t)503ULL");
        assert_eq!(Value::I4(-7).c_literal(), "(int32_t)-7");
        assert_eq!(Value::Bool(true).c_literal(), "1");
        assert_eq!(Value::F8(1.5).c_literal(), "(double)1.5");
    }

    #[test]
    fn value_types_round_trip() {
        assert_eq!(Value::Date(19000).ty(), Type::Date);
        assert_eq!(Value::U2(9).ty().byte_size(), 2);
        assert_eq!(Value::I8(-1).to_le_bytes().len(), 8);
    }
}
