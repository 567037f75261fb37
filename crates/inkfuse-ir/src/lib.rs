//! Typed IR for generated pipeline code.
//!
//! Both execution backends speak this IR: the fuser emits one function per
//! pipeline, the fragment generator emits one function per (suboperator,
//! type) combination.  The IR is deliberately C-shaped — a backend lowers it
//! to C source and shells out to a C compiler — but nothing in here knows
//! about a concrete backend.

pub mod expr;
pub mod program;
pub mod stmt;
pub mod types;
pub mod values;

pub use expr::{ArithOp, Expr};
pub use program::{Function, FunctionBuilder, Program, StructDef};
pub use stmt::{Block, Stmt};
pub use types::{CastResult, Type};
pub use values::Value;
