//! Pipeline code generation.
//!
//! One [`CompilationContext`] turns one pipeline into one IR function with
//! the fixed `u8(void** global_state, void** thread_params, void*
//! resumption)` signature.  The fuser compiles the decayed pipeline as-is;
//! the fragment generator compiles tiny repiped pipelines — both through
//! this module, which is what keeps the two execution modes semantically
//! identical.
//!
//! Generation is demand-driven: sinks are opened, each suboperator requests
//! its source IUs, producers emit their code once and notify consumers.
//! Suboperators that open control flow (drivers, filter scopes) close it
//! again when the close cascade reaches them, so nesting mirrors the
//! request graph.

use hashbrown::{HashMap, HashSet};
use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::{ArithOp, Expr, FunctionBuilder, Program, Stmt, Type, Value};
use inkfuse_runtime::registry::runtime_function;

use crate::algebra::iu::IuId;
use crate::algebra::pipeline::Pipeline;
use crate::algebra::subop::state::state_struct_def;
use crate::algebra::subop::{
    AggCompute, ExprOpcode, GranuleKind, SubopKind, Suboperator,
};

/// Fixed argument list of every generated pipeline function.
pub fn execute_signature() -> Vec<(String, Type)> {
    vec![
        ("global_state".to_string(), Type::ptr(Type::void_ptr())),
        ("thread_params".to_string(), Type::ptr(Type::void_ptr())),
        ("resumption".to_string(), Type::void_ptr()),
    ]
}

/// Compile `pipe` into a new single-function program.
pub fn compile_pipeline(
    pipe: &Pipeline,
    program_name: &str,
    fct_name: &str,
    fused: bool,
) -> Result<Program> {
    let mut program = Program::new(program_name);
    compile_pipeline_into(&mut program, pipe, fct_name, fused)?;
    Ok(program)
}

/// Compile `pipe` as one additional function of `program`; the fragment
/// generator batches every fragment into a single program this way.
pub fn compile_pipeline_into(
    program: &mut Program,
    pipe: &Pipeline,
    fct_name: &str,
    fused: bool,
) -> Result<()> {
    let ctx = CompilationContext::new(pipe, fct_name, fused);
    ctx.compile(program)
}

struct CompilationContext<'p> {
    pipe: &'p Pipeline,
    fused: bool,
    builder: FunctionBuilder,
    computed: HashSet<usize>,
    /// Pending IU request per producer: (requestor, iu).
    requests: HashMap<usize, (usize, IuId)>,
    upstream_requests: HashMap<usize, usize>,
    serviced: HashMap<usize, usize>,
    iu_vars: HashMap<IuId, Expr>,
    state_vars: HashMap<usize, Expr>,
    structs: Vec<&'static str>,
}

impl<'p> CompilationContext<'p> {
    fn new(pipe: &'p Pipeline, fct_name: &str, fused: bool) -> CompilationContext<'p> {
        CompilationContext {
            pipe,
            fused,
            builder: FunctionBuilder::new(fct_name, execute_signature(), Type::UnsignedInt(1)),
            computed: HashSet::new(),
            requests: HashMap::new(),
            upstream_requests: HashMap::new(),
            serviced: HashMap::new(),
            iu_vars: HashMap::new(),
            state_vars: HashMap::new(),
            structs: Vec::new(),
        }
    }

    fn compile(mut self, program: &mut Program) -> Result<()> {
        // Roots are suboperators none of whose outputs are consumed inside
        // the pipeline: true sinks, and terminal nodes of repiped units
        // whose only products are ordering pseudo-IUs.
        let roots: Vec<usize> = (0..self.pipe.subops().len())
            .filter(|idx| {
                let op = self.pipe.subop(*idx);
                !op.is_source()
                    && op
                        .provided_ius
                        .iter()
                        .all(|iu| self.pipe.consumers_of(*iu).is_empty())
            })
            .collect();
        if roots.is_empty() {
            return Err(InkFuseError::internal("pipeline has no sink"));
        }
        if !self.pipe.subops().iter().any(Suboperator::is_source) {
            return Err(InkFuseError::internal("pipeline has no source"));
        }
        for root in &roots {
            if !self.computed.contains(root) {
                self.open(*root)?;
            }
        }
        for root in &roots {
            self.close_op(*root)?;
        }
        self.builder.append(Stmt::ret(Expr::cnst(Value::U1(1))));
        for name in &self.structs {
            if let Some(def) = state_struct_def(name) {
                program.add_struct(def);
            }
        }
        program.add_function(self.builder.finish()?);
        Ok(())
    }

    // ── Protocol ───────────────────────────────────────────────────────────

    fn open(&mut self, idx: usize) -> Result<()> {
        let sources: Vec<IuId> = self.pipe.subop(idx).source_ius.to_vec();
        if sources.is_empty() {
            return self.consume_all(idx);
        }
        for iu in sources {
            self.request_iu(idx, iu)?;
        }
        Ok(())
    }

    fn request_iu(&mut self, requestor: usize, iu: IuId) -> Result<()> {
        let producer = self.pipe.producer_of(iu).ok_or_else(|| {
            InkFuseError::internal(format!("no suboperator produces IU {iu:?}"))
        })?;
        *self.upstream_requests.entry(producer).or_insert(0) += 1;
        self.requests.insert(producer, (requestor, iu));
        if self.computed.contains(&producer) {
            self.notify_ius_ready(producer)
        } else {
            self.open(producer)
        }
    }

    fn notify_ius_ready(&mut self, producer: usize) -> Result<()> {
        self.computed.insert(producer);
        let Some((requestor, _iu)) = self.requests.remove(&producer) else {
            // Opened as a root; nobody waits on the produced IUs.
            return Ok(());
        };
        let serviced = self.serviced.entry(requestor).or_insert(0);
        *serviced += 1;
        if *serviced == self.pipe.subop(requestor).source_ius.len() {
            self.consume_all(requestor)?;
        }
        Ok(())
    }

    fn notify_op_closed(&mut self, idx: usize) -> Result<()> {
        let sources: Vec<IuId> = self.pipe.subop(idx).source_ius.to_vec();
        for iu in sources {
            let producer = self
                .pipe
                .producer_of(iu)
                .ok_or_else(|| InkFuseError::internal("closing consumer of unproduced IU"))?;
            let pending = self.upstream_requests.entry(producer).or_insert(0);
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                self.close_op(producer)?;
            }
        }
        Ok(())
    }

    fn close_op(&mut self, idx: usize) -> Result<()> {
        match &self.pipe.subop(idx).kind {
            SubopKind::TScanDriver(_) | SubopKind::FuseChunkSourceDriver => {
                let counter = self.iu_var(self.pipe.subop(idx).provided_ius[0])?;
                self.builder.append(Stmt::assign(
                    counter.clone(),
                    Expr::arith(ArithOp::Add, counter, Expr::cnst(Value::U8(1))),
                ));
                self.builder.close_block()?;
            }
            SubopKind::HashTableSource(src) => {
                let subop = self.pipe.subop(idx);
                let ptr_var = self.iu_var(subop.provided_ius[0])?;
                let advance = format!("ht_{}_it_advance", src.tables.comparator_tag());
                let call = self.ht_source_advance(idx, &advance)?;
                self.builder.append(Stmt::assign(ptr_var, call));
                self.builder.close_block()?;
            }
            SubopKind::ColumnFilterScope => {
                self.builder.close_block()?;
            }
            _ => {}
        }
        self.notify_op_closed(idx)
    }

    // ── Emission helpers ───────────────────────────────────────────────────

    fn iu_var(&self, iu: IuId) -> Result<Expr> {
        self.iu_vars
            .get(&iu)
            .cloned()
            .ok_or_else(|| InkFuseError::internal(format!("IU {iu:?} has no generated value")))
    }

    fn register_iu(&mut self, iu: IuId, expr: Expr) {
        self.iu_vars.insert(iu, expr);
    }

    /// Declared `struct S* state_<idx>` for the suboperator's state; lazily
    /// emitted at first use in the current block.
    fn state_var(&mut self, idx: usize) -> Result<Expr> {
        if let Some(var) = self.state_vars.get(&idx) {
            return Ok(var.clone());
        }
        let name = self.pipe.subop(idx).state_struct_name().ok_or_else(|| {
            InkFuseError::internal("state access on a stateless suboperator")
        })?;
        if !self.structs.contains(&name) {
            self.structs.push(name);
        }
        let struct_ptr = Type::ptr(Type::Struct(name.to_string()));
        let global = self.builder.arg(0)?;
        let entry = Expr::deref(Expr::arith(
            ArithOp::Add,
            global,
            Expr::cnst(Value::U4(idx as u32)),
        ));
        let var = self
            .builder
            .declare(format!("state_{idx}"), struct_ptr.clone());
        self.builder
            .append(Stmt::assign(var.clone(), Expr::cast(struct_ptr, entry)));
        self.state_vars.insert(idx, var.clone());
        Ok(var)
    }

    /// A runtime parameter: baked as a constant in fused mode when a value
    /// is known, loaded from the state struct otherwise.
    fn runtime_param(
        &mut self,
        idx: usize,
        field: &str,
        ty: Type,
        baked: Option<Value>,
    ) -> Result<Expr> {
        if self.fused {
            if let Some(value) = baked {
                return Ok(Expr::cnst(value));
            }
        }
        let state = self.state_var(idx)?;
        Ok(Expr::struct_access(state, field, ty))
    }

    fn null_char_ptr() -> Expr {
        Expr::cast(Type::char_ptr(), Expr::cnst(Value::U8(0)))
    }

    fn ht_source_advance(&mut self, idx: usize, fct: &str) -> Result<Expr> {
        let state = self.state_var(idx)?;
        let counter_name = format!("ht_it_{idx}");
        Ok(Expr::invoke(
            fct,
            vec![
                Expr::struct_access(state.clone(), "table", Type::void_ptr()),
                Expr::addr_of(Expr::var(counter_name, Type::UnsignedInt(8))),
                Expr::struct_access(state, "end", Type::UnsignedInt(8)),
            ],
            Type::char_ptr(),
        ))
    }

    // ── Per-kind code generation ───────────────────────────────────────────

    fn consume_all(&mut self, idx: usize) -> Result<()> {
        let subop = self.pipe.subop(idx).clone();
        match &subop.kind {
            SubopKind::TScanDriver(_) => {
                let state = self.state_var(idx)?;
                let counter_name = self.pipe.ius().var_name(subop.provided_ius[0]);
                let counter = self.builder.declare(counter_name, Type::UnsignedInt(8));
                self.builder.append(Stmt::assign(
                    counter.clone(),
                    Expr::struct_access(state.clone(), "start", Type::UnsignedInt(8)),
                ));
                self.builder.open_while(Expr::arith(
                    ArithOp::Lt,
                    counter.clone(),
                    Expr::struct_access(state, "end", Type::UnsignedInt(8)),
                ));
                self.register_iu(subop.provided_ius[0], counter);
                self.notify_ius_ready(idx)
            }
            SubopKind::FuseChunkSourceDriver => {
                let state = self.state_var(idx)?;
                let counter_name = self.pipe.ius().var_name(subop.provided_ius[0]);
                let counter = self.builder.declare(counter_name, Type::UnsignedInt(8));
                self.builder
                    .append(Stmt::assign(counter.clone(), Expr::cnst(Value::U8(0))));
                self.builder.open_while(Expr::arith(
                    ArithOp::Lt,
                    counter.clone(),
                    Expr::struct_access(state, "size", Type::UnsignedInt(8)),
                ));
                self.register_iu(subop.provided_ius[0], counter);
                self.notify_ius_ready(idx)
            }
            SubopKind::HashTableSource(src) => {
                let state = self.state_var(idx)?;
                let counter = self
                    .builder
                    .declare(format!("ht_it_{idx}"), Type::UnsignedInt(8));
                self.builder.append(Stmt::assign(
                    counter,
                    Expr::struct_access(state, "start", Type::UnsignedInt(8)),
                ));
                let advance = format!("ht_{}_it_advance", src.tables.comparator_tag());
                let ptr_name = self.pipe.ius().var_name(subop.provided_ius[0]);
                let ptr_var = self.builder.declare(ptr_name, Type::char_ptr());
                let call = self.ht_source_advance(idx, &advance)?;
                self.builder.append(Stmt::assign(ptr_var.clone(), call));
                self.builder.open_while(Expr::arith(
                    ArithOp::Neq,
                    ptr_var.clone(),
                    Self::null_char_ptr(),
                ));
                self.register_iu(subop.provided_ius[0], ptr_var);
                self.notify_ius_ready(idx)
            }
            SubopKind::TScanIuProvider(_) => {
                let counter = self.iu_var(subop.source_ius[0])?;
                let state = self.state_var(idx)?;
                let out_iu = subop.provided_ius[0];
                let ty = self.pipe.ius().ty(out_iu);
                let width = ty.byte_size() as u64;
                let base = Expr::struct_access(state, "start", Type::char_ptr());
                let offset = Expr::arith(ArithOp::Mul, counter, Expr::cnst(Value::U8(width)));
                let load = Expr::load_at(base, offset, ty.clone());
                let var = self
                    .builder
                    .declare(self.pipe.ius().var_name(out_iu), ty);
                self.builder.append(Stmt::assign(var.clone(), load));
                self.register_iu(out_iu, var);
                self.notify_ius_ready(idx)
            }
            SubopKind::FuseChunkSourceIuProvider => {
                let counter = self.iu_var(subop.source_ius[0])?;
                let state = self.state_var(idx)?;
                let out_iu = subop.provided_ius[0];
                let ty = self.pipe.ius().ty(out_iu);
                let base = Expr::struct_access(state.clone(), "start", Type::char_ptr());
                let stride = Expr::struct_access(state, "stride", Type::UnsignedInt(8));
                let shifted = Expr::arith(
                    ArithOp::Add,
                    base,
                    Expr::arith(ArithOp::Mul, counter, stride),
                );
                let (var_ty, value) = match ty {
                    // Byte arrays are addressed by element pointer.
                    Type::ByteArray(_) => (Type::char_ptr(), shifted),
                    other => (
                        other.clone(),
                        Expr::deref(Expr::cast(Type::ptr(other), shifted)),
                    ),
                };
                let var = self
                    .builder
                    .declare(self.pipe.ius().var_name(out_iu), var_ty);
                self.builder.append(Stmt::assign(var.clone(), value));
                self.register_iu(out_iu, var);
                self.notify_ius_ready(idx)
            }
            SubopKind::FuseChunkSink => {
                let value = self.iu_var(subop.source_ius[0])?;
                let state = self.state_var(idx)?;
                let ty = self.pipe.ius().ty(subop.source_ius[0]);
                let dest = Expr::struct_access(state.clone(), "dest", Type::char_ptr());
                let size_ptr = Expr::struct_access(
                    state.clone(),
                    "size_ptr",
                    Type::ptr(Type::UnsignedInt(8)),
                );
                let stride = Expr::struct_access(state, "stride", Type::UnsignedInt(8));
                let slot = Expr::arith(
                    ArithOp::Add,
                    dest,
                    Expr::arith(ArithOp::Mul, Expr::deref(size_ptr.clone()), stride.clone()),
                );
                match ty {
                    Type::ByteArray(_) => {
                        self.builder.append(Stmt::InvokeFct(Expr::invoke(
                            "memcpy",
                            vec![slot, value, stride],
                            Type::void_ptr(),
                        )));
                    }
                    other => {
                        self.builder.append(Stmt::assign(
                            Expr::deref(Expr::cast(Type::ptr(other), slot)),
                            value,
                        ));
                    }
                }
                self.builder.append(Stmt::assign(
                    Expr::deref(size_ptr.clone()),
                    Expr::arith(
                        ArithOp::Add,
                        Expr::deref(size_ptr),
                        Expr::cnst(Value::U8(1)),
                    ),
                ));
                Ok(())
            }
            SubopKind::CountingSink(_) => {
                let state = self.state_var(idx)?;
                let count = Expr::struct_access(state, "count", Type::UnsignedInt(8));
                self.builder.append(Stmt::assign(
                    count.clone(),
                    Expr::arith(ArithOp::Add, count, Expr::cnst(Value::U8(1))),
                ));
                Ok(())
            }
            SubopKind::Expression(expr_op) => {
                let out_iu = subop.provided_ius[0];
                let out_ty = self.pipe.ius().ty(out_iu);
                let value = match &expr_op.op {
                    ExprOpcode::Binary(op) => {
                        let left = self.iu_var(subop.source_ius[0])?;
                        let right = self.iu_var(subop.source_ius[1])?;
                        Expr::arith(*op, left, right)
                    }
                    ExprOpcode::Cast(target) => {
                        Expr::cast(target.clone(), self.iu_var(subop.source_ius[0])?)
                    }
                };
                let var = self
                    .builder
                    .declare(self.pipe.ius().var_name(out_iu), out_ty);
                self.builder.append(Stmt::assign(var.clone(), value));
                self.register_iu(out_iu, var);
                self.notify_ius_ready(idx)
            }
            SubopKind::RuntimeExpression(rexpr) => {
                let operand = self.iu_var(subop.source_ius[0])?;
                let operand_ty = operand.ty();
                let const_ty = rexpr.value.ty();
                let mut const_expr = self.runtime_param(
                    idx,
                    "value",
                    Type::UnsignedInt(8),
                    Some(rexpr.value.clone()),
                )?;
                if !self.fused {
                    // The state stores the raw bits; reinterpret in place.
                    const_expr = Expr::deref(Expr::cast(
                        Type::ptr(const_ty.clone()),
                        Expr::cast(Type::char_ptr(), Expr::addr_of(const_expr)),
                    ));
                }
                // Align the constant with the operand representation.
                if matches!(operand_ty, Type::Ptr(_)) {
                    const_expr = Expr::cast(operand_ty.clone(), const_expr);
                } else if const_ty != operand_ty {
                    const_expr = Expr::cast(operand_ty.clone(), const_expr);
                }
                let (left, right) = if rexpr.const_on_left {
                    (const_expr, operand)
                } else {
                    (operand, const_expr)
                };
                let out_iu = subop.provided_ius[0];
                let out_ty = self.pipe.ius().ty(out_iu);
                let var = self
                    .builder
                    .declare(self.pipe.ius().var_name(out_iu), out_ty);
                self.builder
                    .append(Stmt::assign(var.clone(), Expr::arith(rexpr.op, left, right)));
                self.register_iu(out_iu, var);
                self.notify_ius_ready(idx)
            }
            SubopKind::ColumnFilterScope => {
                let pred = self.iu_var(subop.source_ius[0])?;
                self.builder.open_if(pred);
                self.register_iu(subop.provided_ius[0], Expr::cnst(Value::Bool(true)));
                self.notify_ius_ready(idx)
            }
            SubopKind::ColumnFilterLogic => {
                // source_ius = [scope pseudo, value]; redefines the value
                // inside the scope's `if`.
                let input = self.iu_var(subop.source_ius[1])?;
                let out_iu = subop.provided_ius[0];
                let ty = self.pipe.ius().ty(out_iu);
                let var = self
                    .builder
                    .declare(self.pipe.ius().var_name(out_iu), ty);
                self.builder.append(Stmt::assign(var.clone(), input));
                self.register_iu(out_iu, var);
                self.notify_ius_ready(idx)
            }
            SubopKind::ScratchPadIuProvider => {
                let out_iu = subop.provided_ius[0];
                let ty = self.pipe.ius().ty(out_iu);
                let name = self.pipe.ius().var_name(out_iu);
                self.builder.append(Stmt::declare(name.clone(), ty));
                // The array decays to a char pointer at every use site.
                self.register_iu(out_iu, Expr::var(name, Type::char_ptr()));
                self.notify_ius_ready(idx)
            }
            SubopKind::KeyPacker(packing) => {
                let dest = self.iu_var(subop.source_ius[0])?;
                let value = self.iu_var(subop.source_ius[1])?;
                let ty = self.pipe.ius().ty(subop.source_ius[1]);
                let offset = self.runtime_param(
                    idx,
                    "offset",
                    Type::UnsignedInt(8),
                    Some(Value::U8(packing.offset)),
                )?;
                let slot = Expr::arith(ArithOp::Add, dest, offset);
                self.builder.append(Stmt::assign(
                    Expr::deref(Expr::cast(Type::ptr(ty), slot)),
                    value,
                ));
                if let Some(pseudo) = subop.provided_ius.first() {
                    self.register_iu(*pseudo, Expr::cnst(Value::Bool(true)));
                    return self.notify_ius_ready(idx);
                }
                Ok(())
            }
            SubopKind::KeyUnpacker(packing) => {
                let ptr = self.iu_var(subop.source_ius[0])?;
                let out_iu = subop.provided_ius[0];
                let ty = self.pipe.ius().ty(out_iu);
                let offset = self.runtime_param(
                    idx,
                    "offset",
                    Type::UnsignedInt(8),
                    Some(Value::U8(packing.offset)),
                )?;
                let load = Expr::load_at(ptr, offset, ty.clone());
                let var = self
                    .builder
                    .declare(self.pipe.ius().var_name(out_iu), ty);
                self.builder.append(Stmt::assign(var.clone(), load));
                self.register_iu(out_iu, var);
                self.notify_ius_ready(idx)
            }
            SubopKind::RuntimeFunction(fct) => {
                let decl = runtime_function(fct.fct_name).ok_or_else(|| {
                    InkFuseError::internal(format!(
                        "runtime function `{}` is not registered",
                        fct.fct_name
                    ))
                })?;
                let state = self.state_var(idx)?;
                let mut args =
                    vec![Expr::struct_access(state, "object", Type::void_ptr())];
                for arg_iu in &fct.args {
                    args.push(self.iu_var(*arg_iu)?);
                }
                let call = Expr::invoke(fct.fct_name, args, decl.ret.clone());
                match subop.provided_ius.first() {
                    Some(out_iu) => {
                        let ty = self.pipe.ius().ty(*out_iu);
                        let var = self
                            .builder
                            .declare(self.pipe.ius().var_name(*out_iu), ty);
                        self.builder.append(Stmt::assign(var.clone(), call));
                        self.register_iu(*out_iu, var);
                        self.notify_ius_ready(idx)
                    }
                    None => {
                        self.builder.append(Stmt::InvokeFct(call));
                        Ok(())
                    }
                }
            }
            SubopKind::Aggregator(agg) => {
                let ptr = self.iu_var(subop.source_ius[0])?;
                let offset = self.runtime_param(
                    idx,
                    "offset",
                    Type::UnsignedInt(8),
                    Some(Value::U8(agg.offset)),
                )?;
                let stored = agg.granule.stored_type();
                let target = Expr::deref(Expr::cast(
                    Type::ptr(stored.clone()),
                    Expr::arith(ArithOp::Add, ptr, offset),
                ));
                let addend = match agg.granule {
                    GranuleKind::Count => Expr::cnst(Value::I8(1)),
                    _ => {
                        let value = self.iu_var(subop.source_ius[1])?;
                        if value.ty() == stored {
                            value
                        } else {
                            Expr::cast(stored, value)
                        }
                    }
                };
                self.builder.append(Stmt::assign(
                    target.clone(),
                    Expr::arith(ArithOp::Add, target, addend),
                ));
                Ok(())
            }
            SubopKind::AggReader(reader) => {
                let ptr = self.iu_var(subop.source_ius[0])?;
                let out_iu = subop.provided_ius[0];
                let out_ty = self.pipe.ius().ty(out_iu);
                let offset_a = self.runtime_param(
                    idx,
                    "offset_a",
                    Type::UnsignedInt(8),
                    Some(Value::U8(reader.offset_a)),
                )?;
                let value = match &reader.compute {
                    AggCompute::Unpack { ty } => {
                        Expr::load_at(ptr, offset_a, ty.clone())
                    }
                    AggCompute::Avg { sum } => {
                        let offset_b = self.runtime_param(
                            idx,
                            "offset_b",
                            Type::UnsignedInt(8),
                            Some(Value::U8(reader.offset_b)),
                        )?;
                        let sum_value =
                            Expr::load_at(ptr.clone(), offset_a, sum.stored_type());
                        let count_value =
                            Expr::load_at(ptr, offset_b, Type::SignedInt(8));
                        Expr::arith(
                            ArithOp::Div,
                            Expr::cast(Type::Float(8), sum_value),
                            Expr::cast(Type::Float(8), count_value),
                        )
                    }
                };
                let var = self
                    .builder
                    .declare(self.pipe.ius().var_name(out_iu), out_ty);
                self.builder.append(Stmt::assign(var.clone(), value));
                self.register_iu(out_iu, var);
                self.notify_ius_ready(idx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::iu::IuSpace;
    use crate::algebra::pipeline::PipelineDag;
    use crate::algebra::subop::runtime_objects::{ColumnSlice, ScanCursor};
    use crate::algebra::subop::{RuntimeExpressionSubop, TScanDriver, TScanIuProvider};
    use inkfuse_backend_c::lower_program;
    use inkfuse_storage::{BaseColumn, Relation};
    use std::sync::Arc;

    /// scan(c) → c + 7 → (c+7) == 503 → filter → sink, the S1 shape.
    fn filter_pipeline() -> PipelineDag {
        let mut dag = PipelineDag::new();
        let ius = dag.ius().clone();
        let counter = ius.create_pseudo(Type::UnsignedInt(8), "row");
        let col = ius.create(Type::UnsignedInt(8), "c");
        let shifted = ius.create(Type::UnsignedInt(8), "shifted");
        let pred = ius.create(Type::Bool, "pred");
        let scope = ius.create_pseudo(Type::Void, "scope");
        let filtered = ius.create(Type::UnsignedInt(8), "filtered");

        let mut rel = Relation::new("t");
        rel.attach_filled("c", BaseColumn::U8(vec![496; 32])).unwrap();
        let rel = Arc::new(rel);

        let pipe = dag.build_new_pipeline();
        pipe.attach(Suboperator::new(
            SubopKind::TScanDriver(TScanDriver {
                cursor: Arc::new(ScanCursor::new(32)),
            }),
            [],
            [counter],
        ));
        pipe.attach(
            Suboperator::new(
                SubopKind::TScanIuProvider(TScanIuProvider {
                    column: ColumnSlice::new(rel, "c").unwrap(),
                }),
                [counter],
                [col],
            )
            .with_strong([counter]),
        );
        pipe.attach(Suboperator::new(
            SubopKind::RuntimeExpression(RuntimeExpressionSubop {
                op: ArithOp::Add,
                value: Value::U8(7),
                const_on_left: false,
            }),
            [col],
            [shifted],
        ));
        pipe.attach(Suboperator::new(
            SubopKind::RuntimeExpression(RuntimeExpressionSubop {
                op: ArithOp::Eq,
                value: Value::U8(503),
                const_on_left: false,
            }),
            [shifted],
            [pred],
        ));
        pipe.attach(Suboperator::new(
            SubopKind::ColumnFilterScope,
            [pred],
            [scope],
        ));
        pipe.attach(
            Suboperator::new(SubopKind::ColumnFilterLogic, [scope, shifted], [filtered])
                .with_strong([scope]),
        );
        pipe.attach(Suboperator::new(SubopKind::FuseChunkSink, [filtered], []));
        dag
    }

    #[test]
    fn fused_compilation_nests_filter_inside_scan_loop() {
        let mut dag = filter_pipeline();
        let pipe = dag.current().clone();
        let program = compile_pipeline(&pipe, "test_prog", "execute", true).unwrap();
        let src = lower_program(&program).unwrap();

        // Scan loop around the filter's if, constants baked.
        let while_pos = src.find("while (").expect("scan loop present");
        let if_pos = src.find("if (").expect("filter scope present");
        assert!(while_pos < if_pos);
        assert!(src.contains("503"));
        assert!(src.contains("struct TScanDriverState"));
        // Fused code bakes the runtime constant; no RuntimeExprState load.
        assert!(!src.contains("RuntimeExprState"));
    }

    #[test]
    fn fragments_load_runtime_parameters_from_state() {
        let mut dag = filter_pipeline();
        let pipe = dag.current().clone();
        // The +7 expression alone, repiped as an interpreted fragment.
        let repiped = pipe
            .repipe(
                &std::collections::BTreeSet::from([2]),
                &std::collections::HashSet::new(),
            )
            .unwrap();
        let program = compile_pipeline(&repiped, "frag", "fragment_0", false).unwrap();
        let src = lower_program(&program).unwrap();
        assert!(src.contains("struct RuntimeExprState"));
        assert!(src.contains("struct FuseChunkSourceDriverState"));
        assert!(src.contains("struct FuseChunkSinkState"));
        assert!(src.contains("->value"));
    }

    #[test]
    fn missing_producers_are_internal_errors() {
        let ius = IuSpace::new();
        let ghost = ius.create(Type::Bool, "ghost");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(SubopKind::FuseChunkSink, [ghost], []));
        assert!(matches!(
            compile_pipeline(&pipe, "p", "execute", true),
            Err(InkFuseError::Internal(_))
        ));
    }
}
