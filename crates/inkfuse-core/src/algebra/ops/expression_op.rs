//! Expression evaluation over a DAG-shaped node pool.
//!
//! Child references may point at arbitrary earlier nodes, so the pool is an
//! indexed arena and decay memoizes per node: shared subexpressions compile
//! once.  A computation with one constant operand becomes a
//! [`RuntimeExpressionSubop`] (the constant is a runtime parameter);
//! `InList` is rewritten into an Or-chain of equality comparisons here and
//! never reaches a backend.

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::{ArithOp, Type, Value};

use crate::algebra::iu::{IuId, IuSpace};
use crate::algebra::pipeline::PipelineDag;
use crate::algebra::subop::{
    binary_output_type, ExprOpcode, ExpressionSubop, RuntimeExpressionSubop, SubopKind,
    Suboperator,
};

use super::RelAlgOp;

/// Opcode of a compute node.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeOp {
    Arith(ArithOp),
    Cast(Type),
}

/// One node of the expression pool.
#[derive(Debug, Clone)]
pub enum ExprNode {
    /// A column produced by the child operator.
    IuRef(IuId),
    /// A literal; only valid as an operand of a computation.
    Const(Value),
    /// A computation over earlier nodes (indices into the pool).
    Compute { op: ComputeOp, children: Vec<usize> },
}

#[derive(Debug)]
pub struct ExpressionOp {
    child: Box<RelAlgOp>,
    nodes: Vec<ExprNode>,
    output_nodes: Vec<usize>,
    /// IU per compute node, created up front; `None` for consts.
    node_ius: Vec<Option<IuId>>,
    output_ius: Vec<IuId>,
    #[allow(dead_code)]
    tag: String,
}

impl ExpressionOp {
    pub fn new(
        ius: &IuSpace,
        child: Box<RelAlgOp>,
        tag: impl Into<String>,
        nodes: Vec<ExprNode>,
        output_nodes: Vec<usize>,
    ) -> Result<ExpressionOp> {
        let tag = tag.into();
        // Infer types in pool order; children always precede parents.
        let mut types: Vec<Option<Type>> = Vec::with_capacity(nodes.len());
        let mut node_ius: Vec<Option<IuId>> = Vec::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            let ty = match node {
                ExprNode::IuRef(iu) => Some(ius.ty(*iu)),
                ExprNode::Const(value) => Some(value.ty()),
                ExprNode::Compute { op, children } => {
                    Some(Self::infer(op, children, &nodes, &types, idx)?)
                }
            };
            let iu = match node {
                ExprNode::Compute { .. } => Some(ius.create(
                    ty.clone().expect("computed type present"),
                    format!("{tag}_n{idx}"),
                )),
                ExprNode::IuRef(iu) => Some(*iu),
                ExprNode::Const(_) => None,
            };
            types.push(ty);
            node_ius.push(iu);
        }
        let mut output_ius = Vec::new();
        for out in &output_nodes {
            let iu = node_ius
                .get(*out)
                .and_then(|iu| *iu)
                .ok_or_else(|| InkFuseError::unsupported("a constant cannot be an output"))?;
            output_ius.push(iu);
        }
        Ok(ExpressionOp {
            child,
            nodes,
            output_nodes,
            node_ius,
            output_ius,
            tag,
        })
    }

    fn infer(
        op: &ComputeOp,
        children: &[usize],
        nodes: &[ExprNode],
        types: &[Option<Type>],
        idx: usize,
    ) -> Result<Type> {
        let child_ty = |i: usize| -> Result<Type> {
            types
                .get(i)
                .and_then(Clone::clone)
                .ok_or_else(|| {
                    InkFuseError::internal(format!("node {idx} references later node {i}"))
                })
        };
        match op {
            ComputeOp::Cast(target) => {
                if children.len() != 1 {
                    return Err(InkFuseError::internal("cast takes one operand"));
                }
                Ok(target.clone())
            }
            ComputeOp::Arith(ArithOp::InList) => {
                if children.len() < 2 {
                    return Err(InkFuseError::internal("InList needs a probe and values"));
                }
                Ok(Type::Bool)
            }
            ComputeOp::Arith(arith) => {
                if children.len() != 2 {
                    return Err(InkFuseError::internal("binary opcode takes two operands"));
                }
                let left = child_ty(children[0])?;
                let right = child_ty(children[1])?;
                // A constant operand is cast to its partner's type during
                // decay; the result type follows the partner.
                let is_const = |i: usize| matches!(nodes[i], ExprNode::Const(_));
                let (left, right) = match (is_const(children[0]), is_const(children[1])) {
                    (true, false) => (right.clone(), right),
                    (false, true) => (left.clone(), left),
                    _ => (left, right),
                };
                Ok(binary_output_type(*arith, &left, &right))
            }
        }
    }

    pub fn output_ius(&self) -> &[IuId] {
        &self.output_ius
    }

    pub fn decay(&self, dag: &mut PipelineDag) -> Result<()> {
        self.child.decay(dag)?;
        let mut decayed = vec![false; self.nodes.len()];
        for out in &self.output_nodes {
            self.decay_node(*out, dag, &mut decayed)?;
        }
        Ok(())
    }

    /// Attach the suboperator for one node; shared nodes compile once.
    fn decay_node(&self, idx: usize, dag: &mut PipelineDag, decayed: &mut [bool]) -> Result<()> {
        if decayed[idx] {
            return Ok(());
        }
        decayed[idx] = true;
        let ExprNode::Compute { op, children } = &self.nodes[idx] else {
            // IU refs come from the child operator, consts from operands.
            return Ok(());
        };
        for child in children {
            self.decay_node(*child, dag, decayed)?;
        }
        let out_iu = self.node_ius[idx].expect("compute nodes have IUs");
        match op {
            ComputeOp::Cast(target) => {
                let src = self.operand_iu(children[0])?;
                dag.current().attach(Suboperator::new(
                    SubopKind::Expression(ExpressionSubop {
                        op: ExprOpcode::Cast(target.clone()),
                    }),
                    [src],
                    [out_iu],
                ));
                Ok(())
            }
            ComputeOp::Arith(ArithOp::InList) => self.decay_in_list(children, out_iu, dag),
            ComputeOp::Arith(arith) => {
                match (
                    self.node_value(children[0]),
                    self.node_value(children[1]),
                ) {
                    (Some(_), Some(_)) => Err(InkFuseError::unsupported(
                        "computation over two constants",
                    )),
                    (Some(value), None) => {
                        let operand = self.operand_iu(children[1])?;
                        let value = cast_value(value, &dag.ius().ty(operand))?;
                        dag.current().attach(Suboperator::new(
                            SubopKind::RuntimeExpression(RuntimeExpressionSubop {
                                op: *arith,
                                value,
                                const_on_left: true,
                            }),
                            [operand],
                            [out_iu],
                        ));
                        Ok(())
                    }
                    (None, Some(value)) => {
                        let operand = self.operand_iu(children[0])?;
                        let value = cast_value(value, &dag.ius().ty(operand))?;
                        dag.current().attach(Suboperator::new(
                            SubopKind::RuntimeExpression(RuntimeExpressionSubop {
                                op: *arith,
                                value,
                                const_on_left: false,
                            }),
                            [operand],
                            [out_iu],
                        ));
                        Ok(())
                    }
                    (None, None) => {
                        let left = self.operand_iu(children[0])?;
                        let right = self.operand_iu(children[1])?;
                        dag.current().attach(Suboperator::new(
                            SubopKind::Expression(ExpressionSubop {
                                op: ExprOpcode::Binary(*arith),
                            }),
                            [left, right],
                            [out_iu],
                        ));
                        Ok(())
                    }
                }
            }
        }
    }

    /// `x IN (c1, .., cn)` decays as `x == c1 OR .. OR x == cn`.
    fn decay_in_list(
        &self,
        children: &[usize],
        out_iu: IuId,
        dag: &mut PipelineDag,
    ) -> Result<()> {
        let probe = self.operand_iu(children[0])?;
        let probe_ty = dag.ius().ty(probe);
        let mut eq_ius = Vec::new();
        for (k, value_node) in children[1..].iter().enumerate() {
            let value = self.node_value(*value_node).ok_or_else(|| {
                InkFuseError::unsupported("InList values must be constants")
            })?;
            let value = cast_value(value, &probe_ty)?;
            let eq_iu = if eq_ius.is_empty() && children.len() == 2 {
                out_iu
            } else {
                dag.ius().create(Type::Bool, format!("in_list_eq{k}"))
            };
            dag.current().attach(Suboperator::new(
                SubopKind::RuntimeExpression(RuntimeExpressionSubop {
                    op: ArithOp::Eq,
                    value,
                    const_on_left: false,
                }),
                [probe],
                [eq_iu],
            ));
            eq_ius.push(eq_iu);
        }
        // Fold into a left-deep Or chain ending in the output IU.
        let mut acc = eq_ius[0];
        for (k, eq) in eq_ius.iter().enumerate().skip(1) {
            let target = if k + 1 == eq_ius.len() {
                out_iu
            } else {
                dag.ius().create(Type::Bool, format!("in_list_or{k}"))
            };
            dag.current().attach(Suboperator::new(
                SubopKind::Expression(ExpressionSubop {
                    op: ExprOpcode::Binary(ArithOp::Or),
                }),
                [acc, *eq],
                [target],
            ));
            acc = target;
        }
        Ok(())
    }

    fn operand_iu(&self, node: usize) -> Result<IuId> {
        self.node_ius[node]
            .ok_or_else(|| InkFuseError::unsupported("constant in a non-constant position"))
    }

    fn node_value(&self, node: usize) -> Option<Value> {
        match &self.nodes[node] {
            ExprNode::Const(value) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Convert a literal to the operand's type so generated comparisons are
/// exact.
fn cast_value(value: Value, target: &Type) -> Result<Value> {
    if &value.ty() == target {
        return Ok(value);
    }
    let as_i128: i128 = match &value {
        Value::I1(v) => i128::from(*v),
        Value::I2(v) => i128::from(*v),
        Value::I4(v) => i128::from(*v),
        Value::I8(v) => i128::from(*v),
        Value::U1(v) => i128::from(*v),
        Value::U2(v) => i128::from(*v),
        Value::U4(v) => i128::from(*v),
        Value::U8(v) => i128::from(*v),
        Value::Bool(v) => i128::from(*v),
        Value::Char(v) => i128::from(*v),
        Value::Date(v) => i128::from(*v),
        Value::F4(_) | Value::F8(_) => {
            let f = match value {
                Value::F4(v) => f64::from(v),
                Value::F8(v) => v,
                _ => unreachable!(),
            };
            return match target {
                Type::Float(4) => Ok(Value::F4(f as f32)),
                Type::Float(_) => Ok(Value::F8(f)),
                other => Err(InkFuseError::unsupported(format!(
                    "float literal used as {other}"
                ))),
            };
        }
    };
    Ok(match target {
        Type::SignedInt(1) => Value::I1(as_i128 as i8),
        Type::SignedInt(2) => Value::I2(as_i128 as i16),
        Type::SignedInt(4) => Value::I4(as_i128 as i32),
        Type::SignedInt(8) => Value::I8(as_i128 as i64),
        Type::UnsignedInt(1) => Value::U1(as_i128 as u8),
        Type::UnsignedInt(2) => Value::U2(as_i128 as u16),
        Type::UnsignedInt(4) => Value::U4(as_i128 as u32),
        Type::UnsignedInt(8) => Value::U8(as_i128 as u64),
        Type::Float(4) => Value::F4(as_i128 as f32),
        Type::Float(8) => Value::F8(as_i128 as f64),
        Type::Date => Value::Date(as_i128 as i32),
        Type::Bool => Value::Bool(as_i128 != 0),
        other => {
            return Err(InkFuseError::unsupported(format!(
                "literal used as {other}"
            )));
        }
    })
}
