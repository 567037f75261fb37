//! IR statements and blocks.

use crate::expr::Expr;
use crate::types::Type;

/// An ordered sequence of statements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn new() -> Block {
        Block::default()
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }
}

/// An IR statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Declare {
        name: String,
        ty: Type,
    },
    Assign {
        lhs: Expr,
        rhs: Expr,
    },
    If {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
    },
    Return {
        expr: Option<Expr>,
    },
    /// Call a function for its effect.
    InvokeFct(Expr),
    Block(Block),
}

impl Stmt {
    pub fn declare(name: impl Into<String>, ty: Type) -> Stmt {
        Stmt::Declare {
            name: name.into(),
            ty,
        }
    }

    pub fn assign(lhs: Expr, rhs: Expr) -> Stmt {
        Stmt::Assign { lhs, rhs }
    }

    pub fn ret(expr: Expr) -> Stmt {
        Stmt::Return { expr: Some(expr) }
    }
}
