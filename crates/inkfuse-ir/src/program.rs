//! Program container and function builder.

use inkfuse_error::{InkFuseError, Result};

use crate::expr::Expr;
use crate::stmt::{Block, Stmt};
use crate::types::Type;

/// A named struct declaration mirrored between the runtime and generated
/// code.  Field order is the C layout order.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl StructDef {
    pub fn new(name: impl Into<String>, fields: Vec<(String, Type)>) -> StructDef {
        StructDef {
            name: name.into(),
            fields,
        }
    }

    /// Type of a field, if present.
    pub fn field_type(&self, field: &str) -> Option<&Type> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, ty)| ty)
    }
}

/// A complete function: fixed argument list, return type, body.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub args: Vec<(String, Type)>,
    pub ret: Type,
    pub body: Block,
}

/// A compilation unit handed to a backend.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub name: String,
    pub structs: Vec<StructDef>,
    pub functions: Vec<Function>,
    /// Standalone programs do not pull in the runtime declarations.
    pub standalone: bool,
}

impl Program {
    pub fn new(name: impl Into<String>) -> Program {
        Program {
            name: name.into(),
            structs: Vec::new(),
            functions: Vec::new(),
            standalone: false,
        }
    }

    /// Add a struct declaration unless one with the same name exists.
    /// Fragment programs declare the same state structs over and over.
    pub fn add_struct(&mut self, def: StructDef) {
        if !self.structs.iter().any(|s| s.name == def.name) {
            self.structs.push(def);
        }
    }

    pub fn add_function(&mut self, fct: Function) {
        self.functions.push(fct);
    }
}

/// What kind of control-flow statement a pending block will close into.
#[derive(Debug)]
enum PendingKind {
    Root,
    If { cond: Expr },
    While { cond: Expr },
}

#[derive(Debug)]
struct PendingBlock {
    kind: PendingKind,
    stmts: Vec<Stmt>,
}

/// Builds a [`Function`] with an explicit block stack.
///
/// Suboperators open nested control flow in `open()` and close it in
/// `close()` — two separate calls with arbitrary code generated in between
/// by *other* suboperators.  The builder therefore exposes explicit
/// `open_if`/`open_while`/`close_block` instead of lexical scoping;
/// [`FunctionBuilder::finish`] verifies every opened block was closed.
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    args: Vec<(String, Type)>,
    ret: Type,
    stack: Vec<PendingBlock>,
    next_var: usize,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, args: Vec<(String, Type)>, ret: Type) -> FunctionBuilder {
        FunctionBuilder {
            name: name.into(),
            args,
            ret,
            stack: vec![PendingBlock {
                kind: PendingKind::Root,
                stmts: Vec::new(),
            }],
            next_var: 0,
        }
    }

    /// Reference to a declared argument.
    pub fn arg(&self, idx: usize) -> Result<Expr> {
        let (name, ty) = self
            .args
            .get(idx)
            .ok_or_else(|| InkFuseError::internal(format!("no function argument {idx}")))?;
        Ok(Expr::var(name.clone(), ty.clone()))
    }

    /// Append a statement to the innermost open block.
    pub fn append(&mut self, stmt: Stmt) {
        self.stack
            .last_mut()
            .expect("builder always has a root block")
            .stmts
            .push(stmt);
    }

    /// Declare a fresh named variable and return a reference to it.
    pub fn declare(&mut self, name: impl Into<String>, ty: Type) -> Expr {
        let name = name.into();
        self.append(Stmt::declare(name.clone(), ty.clone()));
        Expr::var(name, ty)
    }

    /// Declare a uniquely-named temporary with the given prefix.
    pub fn declare_tmp(&mut self, prefix: &str, ty: Type) -> Expr {
        let name = format!("{prefix}_{}", self.next_var);
        self.next_var += 1;
        self.declare(name, ty)
    }

    /// Open a nested `if` block; statements go into the `then` branch until
    /// the matching [`FunctionBuilder::close_block`].
    pub fn open_if(&mut self, cond: Expr) {
        self.stack.push(PendingBlock {
            kind: PendingKind::If { cond },
            stmts: Vec::new(),
        });
    }

    /// Open a nested `while` block.
    pub fn open_while(&mut self, cond: Expr) {
        self.stack.push(PendingBlock {
            kind: PendingKind::While { cond },
            stmts: Vec::new(),
        });
    }

    /// Close the innermost open block and splice it into its parent.
    pub fn close_block(&mut self) -> Result<()> {
        let pending = self
            .stack
            .pop()
            .ok_or_else(|| InkFuseError::internal("close_block on empty block stack"))?;
        let block = Block {
            stmts: pending.stmts,
        };
        let stmt = match pending.kind {
            PendingKind::Root => {
                return Err(InkFuseError::internal(
                    "close_block would close the function root",
                ));
            }
            PendingKind::If { cond } => Stmt::If {
                cond,
                then_block: block,
                else_block: None,
            },
            PendingKind::While { cond } => Stmt::While { cond, body: block },
        };
        self.append(stmt);
        Ok(())
    }

    /// Finalize.  Errors if control-flow blocks are still open.
    pub fn finish(mut self) -> Result<Function> {
        if self.stack.len() != 1 {
            return Err(InkFuseError::internal(format!(
                "function `{}` finished with {} unclosed block(s)",
                self.name,
                self.stack.len() - 1
            )));
        }
        let root = self.stack.pop().expect("root block present");
        Ok(Function {
            name: self.name,
            args: self.args,
            ret: self.ret,
            body: Block { stmts: root.stmts },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ArithOp;
    use crate::values::Value;

    fn builder() -> FunctionBuilder {
        FunctionBuilder::new(
            "f",
            vec![("x".to_string(), Type::UnsignedInt(8))],
            Type::UnsignedInt(1),
        )
    }

    #[test]
    fn nested_blocks_land_in_parent() {
        let mut b = builder();
        let x = b.arg(0).unwrap();
        b.open_while(Expr::arith(
            ArithOp::Lt,
            x.clone(),
            Expr::cnst(Value::U8(10)),
        ));
        b.open_if(Expr::arith(ArithOp::Eq, x.clone(), Expr::cnst(Value::U8(3))));
        b.append(Stmt::assign(x.clone(), Expr::cnst(Value::U8(0))));
        b.close_block().unwrap();
        b.close_block().unwrap();
        b.append(Stmt::ret(Expr::cnst(Value::U1(1))));
        let fct = b.finish().unwrap();
        assert_eq!(fct.body.stmts.len(), 2);
        match &fct.body.stmts[0] {
            Stmt::While { body, .. } => {
                assert!(matches!(body.stmts[0], Stmt::If { .. }));
            }
            other => panic!("expected while, got {other:?}"),
        }
    }

    #[test]
    fn unbalanced_blocks_are_internal_errors() {
        let mut b = builder();
        b.open_if(Expr::cnst(Value::Bool(true)));
        assert!(b.finish().is_err());
    }

    #[test]
    fn closing_root_fails() {
        let mut b = builder();
        assert!(b.close_block().is_err());
    }

    #[test]
    fn duplicate_struct_decls_collapse() {
        let mut p = Program::new("p");
        p.add_struct(StructDef::new("S", vec![("a".into(), Type::Bool)]));
        p.add_struct(StructDef::new("S", vec![("a".into(), Type::Bool)]));
        assert_eq!(p.structs.len(), 1);
    }
}
