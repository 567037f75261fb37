//! IR → C lowering.

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::{ArithOp, Block, Expr, Function, Program, Stmt, StructDef, Type};
use inkfuse_runtime::registry::runtime_functions;

use crate::scoped_writer::ScopedWriter;

/// Lower a whole program to one C translation unit.
pub fn lower_program(program: &Program) -> Result<String> {
    let mut w = ScopedWriter::new();
    w.line("/* generated by inkfuse */");
    w.line("#include <stdint.h>");
    w.line("#include <stdbool.h>");
    w.line("#include <stddef.h>");
    w.blank();
    if !program.standalone {
        emit_runtime_preamble(&mut w)?;
    }
    for def in &program.structs {
        emit_struct(def, &mut w)?;
    }
    for fct in &program.functions {
        emit_function(fct, &mut w)?;
    }
    Ok(w.finish())
}

/// Extern declarations for every runtime symbol generated code may call.
fn emit_runtime_preamble(w: &mut ScopedWriter) -> Result<()> {
    for fct in runtime_functions() {
        let args = fct
            .args
            .iter()
            .map(type_name)
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        w.line(&format!(
            "extern {} {}({});",
            type_name(&fct.ret)?,
            fct.name,
            args
        ));
    }
    w.blank();
    Ok(())
}

fn emit_struct(def: &StructDef, w: &mut ScopedWriter) -> Result<()> {
    w.open(&format!("struct {}", def.name));
    for (name, ty) in &def.fields {
        w.line(&format!("{};", declaration(name, ty)?));
    }
    w.close(";");
    w.blank();
    Ok(())
}

fn emit_function(fct: &Function, w: &mut ScopedWriter) -> Result<()> {
    let args = fct
        .args
        .iter()
        .map(|(name, ty)| declaration(name, ty))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    w.open(&format!("{} {}({})", type_name(&fct.ret)?, fct.name, args));
    emit_block_stmts(&fct.body, w)?;
    w.close("");
    w.blank();
    Ok(())
}

fn emit_block_stmts(block: &Block, w: &mut ScopedWriter) -> Result<()> {
    for stmt in &block.stmts {
        emit_stmt(stmt, w)?;
    }
    Ok(())
}

fn emit_stmt(stmt: &Stmt, w: &mut ScopedWriter) -> Result<()> {
    match stmt {
        Stmt::Declare { name, ty } => {
            w.line(&format!("{};", declaration(name, ty)?));
        }
        Stmt::Assign { lhs, rhs } => {
            w.line(&format!("{} = {};", expr(lhs)?, expr(rhs)?));
        }
        Stmt::If {
            cond,
            then_block,
            else_block,
        } => {
            w.open(&format!("if ({})", expr(cond)?));
            emit_block_stmts(then_block, w)?;
            if let Some(alt) = else_block {
                w.chain("else");
                emit_block_stmts(alt, w)?;
            }
            w.close("");
        }
        Stmt::While { cond, body } => {
            w.open(&format!("while ({})", expr(cond)?));
            emit_block_stmts(body, w)?;
            w.close("");
        }
        Stmt::Return { expr: ret } => match ret {
            Some(e) => w.line(&format!("return {};", expr(e)?)),
            None => w.line("return;"),
        },
        Stmt::InvokeFct(call) => {
            w.line(&format!("{};", expr(call)?));
        }
        Stmt::Block(inner) => {
            w.open("");
            emit_block_stmts(inner, w)?;
            w.close("");
        }
    }
    Ok(())
}

fn expr(e: &Expr) -> Result<String> {
    Ok(match e {
        Expr::Const(v) => format!("({})", v.c_literal()),
        Expr::VarRef { name, .. } => name.clone(),
        Expr::Cast { target, inner } => {
            format!("(({})({}))", type_name(target)?, expr(inner)?)
        }
        Expr::Arith {
            op, left, right, ..
        } => match op {
            ArithOp::StrEq => format!("inkfuse_str_eq({}, {})", expr(left)?, expr(right)?),
            ArithOp::InList => {
                return Err(InkFuseError::internal(
                    "InList must be rewritten before code generation",
                ));
            }
            _ => format!("({} {} {})", expr(left)?, c_operator(*op), expr(right)?),
        },
        Expr::Deref { inner, .. } => format!("(*({}))", expr(inner)?),
        Expr::Ref { inner } => format!("(&({}))", expr(inner)?),
        Expr::StructAccess { inner, field, .. } => format!("({})->{}", expr(inner)?, field),
        Expr::InvokeFct { name, args, .. } => {
            let rendered = args.iter().map(expr).collect::<Result<Vec<_>>>()?;
            format!("{}({})", name, rendered.join(", "))
        }
    })
}

fn c_operator(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "+",
        ArithOp::Sub => "-",
        ArithOp::Mul => "*",
        ArithOp::Div => "/",
        ArithOp::Eq => "==",
        ArithOp::Neq => "!=",
        ArithOp::Lt => "<",
        ArithOp::Le => "<=",
        ArithOp::Gt => ">",
        ArithOp::Ge => ">=",
        ArithOp::And => "&&",
        ArithOp::Or => "||",
        ArithOp::StrEq | ArithOp::InList => unreachable!("handled in expr()"),
    }
}

/// C type name of an IR type usable in casts and scalar declarations.
fn type_name(ty: &Type) -> Result<String> {
    Ok(match ty {
        Type::SignedInt(b) => format!("int{}_t", 8 * b),
        Type::UnsignedInt(b) => format!("uint{}_t", 8 * b),
        Type::Float(4) => "float".to_string(),
        Type::Float(_) => "double".to_string(),
        Type::Bool => "bool".to_string(),
        Type::Char => "char".to_string(),
        Type::Date => "int32_t".to_string(),
        Type::Void => "void".to_string(),
        Type::Ptr(inner) => format!("{}*", type_name(inner)?),
        Type::Struct(name) => format!("struct {name}"),
        Type::ByteArray(n) => {
            return Err(InkFuseError::internal(format!(
                "ByteArray_{n} has no scalar C name; only declarations carry it"
            )));
        }
    })
}

/// Full declaration of `name` with type `ty`; byte arrays become aligned
/// char arrays here.
fn declaration(name: &str, ty: &Type) -> Result<String> {
    Ok(match ty {
        Type::ByteArray(n) => format!("_Alignas(8) char {name}[{n}]"),
        other => format!("{} {}", type_name(other)?, name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkfuse_ir::{FunctionBuilder, Value};

    #[test]
    fn lowers_a_minimal_function() {
        let mut b = FunctionBuilder::new(
            "answer",
            vec![("x".to_string(), Type::UnsignedInt(8))],
            Type::UnsignedInt(8),
        );
        let x = b.arg(0).unwrap();
        b.append(Stmt::ret(Expr::arith(
            ArithOp::Add,
            x,
            Expr::cnst(Value::U8(1)),
        )));
        let mut program = Program::new("test");
        program.standalone = true;
        program.add_function(b.finish().unwrap());

        let src = lower_program(&program).unwrap();
        assert!(src.contains("uint64_t answer(uint64_t x)"));
        assert!(src.contains("return (x + ((uint64_t)1ULL));"));
        // Standalone programs carry no runtime externs.
        assert!(!src.contains("inkfuse_malloc"));
    }

    #[test]
    fn runtime_preamble_declares_the_abi() {
        let mut program = Program::new("test");
        program.add_function(
            FunctionBuilder::new("noop", vec![], Type::Void)
                .finish()
                .unwrap(),
        );
        let src = lower_program(&program).unwrap();
        assert!(src.contains("extern void* inkfuse_malloc(uint64_t);"));
        assert!(src.contains("extern char* ht_at_sk_lookup_with_hash(void*, char*, uint64_t);"));
    }

    #[test]
    fn byte_arrays_declare_aligned_buffers() {
        assert_eq!(
            declaration("key", &Type::ByteArray(16)).unwrap(),
            "_Alignas(8) char key[16]"
        );
        assert!(type_name(&Type::ByteArray(16)).is_err());
    }

    #[test]
    fn struct_pointers_use_struct_tags() {
        let mut b = FunctionBuilder::new("f", vec![], Type::Void);
        b.append(Stmt::declare(
            "state",
            Type::ptr(Type::Struct("ScanState".into())),
        ));
        let mut program = Program::new("test");
        program.standalone = true;
        program.add_struct(StructDef::new(
            "ScanState",
            vec![("start".into(), Type::char_ptr())],
        ));
        program.add_function(b.finish().unwrap());
        let src = lower_program(&program).unwrap();
        assert!(src.contains("struct ScanState {"));
        assert!(src.contains("struct ScanState* state;"));
    }

    #[test]
    fn in_list_is_rejected() {
        let e = Expr::arith(
            ArithOp::InList,
            Expr::cnst(Value::I4(1)),
            Expr::cnst(Value::I4(2)),
        );
        assert!(expr(&e).is_err());
    }
}
