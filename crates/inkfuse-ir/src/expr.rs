//! IR expressions.

use crate::types::Type;
use crate::values::Value;

/// Binary opcodes.
///
/// `StrEq` compares two NUL-terminated strings through the runtime;
/// `InList` exists for completeness of the opcode vocabulary but is
/// rewritten away before code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    StrEq,
    InList,
}

impl ArithOp {
    /// Does the op produce a boolean regardless of operand type?
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            ArithOp::Eq
                | ArithOp::Neq
                | ArithOp::Lt
                | ArithOp::Le
                | ArithOp::Gt
                | ArithOp::Ge
                | ArithOp::And
                | ArithOp::Or
                | ArithOp::StrEq
                | ArithOp::InList
        )
    }

    /// Stable identifier used in fragment names.
    pub fn id(self) -> &'static str {
        match self {
            ArithOp::Add => "Add",
            ArithOp::Sub => "Sub",
            ArithOp::Mul => "Mul",
            ArithOp::Div => "Div",
            ArithOp::Eq => "Eq",
            ArithOp::Neq => "Neq",
            ArithOp::Lt => "Lt",
            ArithOp::Le => "Le",
            ArithOp::Gt => "Gt",
            ArithOp::Ge => "Ge",
            ArithOp::And => "And",
            ArithOp::Or => "Or",
            ArithOp::StrEq => "StrEq",
            ArithOp::InList => "InList",
        }
    }
}

/// An IR expression.  Every expression knows its result type.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    VarRef {
        name: String,
        ty: Type,
    },
    Cast {
        target: Type,
        inner: Box<Expr>,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
        ty: Type,
    },
    /// `*inner`; `ty` is the pointee type.
    Deref {
        inner: Box<Expr>,
        ty: Type,
    },
    /// `&inner`.
    Ref {
        inner: Box<Expr>,
    },
    /// `inner->field` where `inner` is a pointer to a struct.
    StructAccess {
        inner: Box<Expr>,
        field: String,
        ty: Type,
    },
    InvokeFct {
        name: String,
        args: Vec<Expr>,
        ty: Type,
    },
}

impl Expr {
    pub fn cnst(v: Value) -> Expr {
        Expr::Const(v)
    }

    pub fn var(name: impl Into<String>, ty: Type) -> Expr {
        Expr::VarRef {
            name: name.into(),
            ty,
        }
    }

    pub fn cast(target: Type, inner: Expr) -> Expr {
        Expr::Cast {
            target,
            inner: Box::new(inner),
        }
    }

    /// Binary operation; comparisons produce `Bool`, arithmetic keeps the
    /// left operand's type (operands are pre-cast to a common type by the
    /// expression planner).
    pub fn arith(op: ArithOp, left: Expr, right: Expr) -> Expr {
        let ty = if op.is_comparison() {
            Type::Bool
        } else {
            left.ty()
        };
        Expr::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
            ty,
        }
    }

    /// Dereference; the operand must be a pointer.
    pub fn deref(inner: Expr) -> Expr {
        let ty = match inner.ty() {
            Type::Ptr(pointee) => *pointee,
            other => other,
        };
        Expr::Deref {
            inner: Box::new(inner),
            ty,
        }
    }

    pub fn addr_of(inner: Expr) -> Expr {
        Expr::Ref {
            inner: Box::new(inner),
        }
    }

    pub fn struct_access(inner: Expr, field: impl Into<String>, ty: Type) -> Expr {
        Expr::StructAccess {
            inner: Box::new(inner),
            field: field.into(),
            ty,
        }
    }

    pub fn invoke(name: impl Into<String>, args: Vec<Expr>, ty: Type) -> Expr {
        Expr::InvokeFct {
            name: name.into(),
            args,
            ty,
        }
    }

    /// Result type of this expression.
    pub fn ty(&self) -> Type {
        match self {
            Expr::Const(v) => v.ty(),
            Expr::VarRef { ty, .. }
            | Expr::Arith { ty, .. }
            | Expr::Deref { ty, .. }
            | Expr::StructAccess { ty, .. }
            | Expr::InvokeFct { ty, .. } => ty.clone(),
            Expr::Cast { target, .. } => target.clone(),
            Expr::Ref { inner } => Type::ptr(inner.ty()),
        }
    }

    /// `*(T*)(base + offset)` — the load shape used for column and packed
    /// key access all over the generated code.
    pub fn load_at(base: Expr, offset: Expr, elem: Type) -> Expr {
        let shifted = Expr::arith(ArithOp::Add, base, offset);
        Expr::deref(Expr::cast(Type::ptr(elem), shifted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_yields_bool() {
        let e = Expr::arith(
            ArithOp::Eq,
            Expr::var("a", Type::UnsignedInt(8)),
            Expr::var("b", Type::UnsignedInt(8)),
        );
        assert_eq!(e.ty(), Type::Bool);
    }

    #[test]
    fn deref_peels_pointer() {
        let p = Expr::var("p", Type::ptr(Type::SignedInt(4)));
        assert_eq!(Expr::deref(p).ty(), Type::SignedInt(4));
    }

    #[test]
    fn load_at_has_element_type() {
        let e = Expr::load_at(
            Expr::var("base", Type::char_ptr()),
            Expr::cnst(Value::U8(16)),
            Type::Float(8),
        );
        assert_eq!(e.ty(), Type::Float(8));
    }
}
