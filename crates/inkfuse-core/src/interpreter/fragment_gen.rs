//! Fragment generation.
//!
//! At process start the engine compiles one vectorized primitive per
//! (suboperator, discrete-parameter) combination into a single shared
//! object.  Each fragment is built the same way the interpreter cuts units
//! at query time: a minimal pipeline around the suboperator is repiped, so
//! the fragment's state layout is structurally identical to the unit the
//! runner binds at runtime — the identifier string is the contract between
//! the two.
//!
//! Runtime objects referenced during generation (cursors, tables,
//! materializers) are placeholders; fragments load the real pointers from
//! their state structs.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::{ArithOp, Program, Type, Value};
use inkfuse_storage::Relation;

use crate::algebra::compilation::compile_pipeline_into;
use crate::algebra::iu::{IuId, IuSpace};
use crate::algebra::pipeline::Pipeline;
use crate::algebra::subop::runtime_objects::{
    AggregationState, ColumnSlice, CountCollector, HashTableSet, JoinBuildState, KeySpec,
    MaterializerSet, RuntimeObject, ScanCursor,
};
use crate::algebra::subop::{
    binary_output_type, AggCompute, AggReaderSubop, AggregatorSubop, CountingSink, ExprOpcode,
    ExpressionSubop, GranuleKind, HashTableSource, KeyPackingSubop, RuntimeExpressionSubop,
    RuntimeFunctionSubop, SubopKind, Suboperator, TScanDriver, TScanIuProvider,
};
use smallvec::SmallVec;

/// One fragment of the pre-compiled library.
#[derive(Debug)]
pub struct Fragment {
    pub id: String,
    pub pipe: Pipeline,
}

/// Enumerate every fragment of the library.
pub fn generate_fragments() -> Result<Vec<Fragment>> {
    let mut out = Vec::new();
    tscan_fragments(&mut out)?;
    expression_fragments(&mut out)?;
    cast_fragments(&mut out)?;
    runtime_expression_fragments(&mut out)?;
    filter_fragments(&mut out)?;
    key_packing_fragments(&mut out)?;
    runtime_function_fragments(&mut out)?;
    aggregation_fragments(&mut out)?;
    hash_table_source_fragments(&mut out)?;
    counting_sink_fragments(&mut out)?;
    Ok(out)
}

/// Lower every fragment into one program; returns it with the symbol list.
pub fn build_fragment_program(name: &str) -> Result<(Program, Vec<String>)> {
    let fragments = generate_fragments()?;
    let mut program = Program::new(name);
    let mut ids = Vec::with_capacity(fragments.len());
    let mut seen = HashSet::new();
    for fragment in fragments {
        if !seen.insert(fragment.id.clone()) {
            return Err(InkFuseError::internal(format!(
                "fragment {} generated twice",
                fragment.id
            )));
        }
        compile_pipeline_into(&mut program, &fragment.pipe, &fragment.id, false)?;
        ids.push(fragment.id);
    }
    Ok((program, ids))
}

// ── Type universes ─────────────────────────────────────────────────────────

fn numeric_types() -> Vec<Type> {
    vec![
        Type::SignedInt(1),
        Type::SignedInt(2),
        Type::SignedInt(4),
        Type::SignedInt(8),
        Type::UnsignedInt(1),
        Type::UnsignedInt(2),
        Type::UnsignedInt(4),
        Type::UnsignedInt(8),
        Type::Float(4),
        Type::Float(8),
    ]
}

/// Types a storage column can produce and a packed key can carry.
fn storable_types() -> Vec<Type> {
    let mut types = numeric_types();
    types.push(Type::Char);
    types.push(Type::Date);
    types.push(Type::char_ptr());
    types
}

fn zero_value(ty: &Type) -> Result<Value> {
    Ok(match ty {
        Type::SignedInt(1) => Value::I1(0),
        Type::SignedInt(2) => Value::I2(0),
        Type::SignedInt(4) => Value::I4(0),
        Type::SignedInt(8) => Value::I8(0),
        Type::UnsignedInt(1) => Value::U1(0),
        Type::UnsignedInt(2) => Value::U2(0),
        Type::UnsignedInt(4) => Value::U4(0),
        Type::UnsignedInt(8) => Value::U8(0),
        Type::Float(4) => Value::F4(0.0),
        Type::Float(8) => Value::F8(0.0),
        Type::Bool => Value::Bool(false),
        Type::Char => Value::Char(0),
        Type::Date => Value::Date(0),
        other => {
            return Err(InkFuseError::internal(format!(
                "no literal placeholder for {other}"
            )));
        }
    })
}

// ── Placeholders ───────────────────────────────────────────────────────────

fn dummy_slice(ty: &Type) -> Result<ColumnSlice> {
    let mut rel = Relation::new("fragment");
    rel.attach_column("c", ty)?;
    ColumnSlice::new(Arc::new(rel), "c")
}

fn dummy_agg_state(spec: KeySpec) -> Arc<AggregationState> {
    Arc::new(AggregationState::new(spec, 0, Vec::new()))
}

fn dummy_join_state() -> Arc<JoinBuildState> {
    Arc::new(JoinBuildState::new(
        KeySpec::Simple { size: 8 },
        0,
        Arc::new(MaterializerSet::new(8)),
    ))
}

/// Repipe the fragment's minimal pipeline around its primary suboperator.
fn cut(pipe: &Pipeline, primary: usize, outputs: &[IuId]) -> Result<Fragment> {
    let unit = pipe.repipe(
        &BTreeSet::from([primary]),
        &outputs.iter().copied().collect(),
    )?;
    Ok(Fragment {
        id: pipe.subop(primary).id(pipe.ius()),
        pipe: unit,
    })
}

// ── Fragmentizers ──────────────────────────────────────────────────────────

/// One fragment per scannable column type: loop driver plus indexed IU
/// provider, identified by the provider.
fn tscan_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    for ty in storable_types() {
        let ius = IuSpace::new();
        let counter = ius.create_pseudo(Type::UnsignedInt(8), "row");
        let col = ius.create(ty.clone(), "col");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::TScanDriver(TScanDriver {
                cursor: Arc::new(ScanCursor::new(0)),
            }),
            [],
            [counter],
        ));
        pipe.attach(
            Suboperator::new(
                SubopKind::TScanIuProvider(TScanIuProvider {
                    column: dummy_slice(&ty)?,
                }),
                [counter],
                [col],
            )
            .with_strong([counter]),
        );
        out.push(cut(&pipe, 1, &[col])?);
    }
    Ok(())
}

fn binary_fragment(ty: &Type, op: ArithOp, dup: bool) -> Result<Fragment> {
    let ius = IuSpace::new();
    let a = ius.create(ty.clone(), "a");
    let b = if dup { a } else { ius.create(ty.clone(), "b") };
    let out = ius.create(binary_output_type(op, ty, ty), "out");
    let mut pipe = Pipeline::new(ius);
    pipe.attach(Suboperator::new(
        SubopKind::Expression(ExpressionSubop {
            op: ExprOpcode::Binary(op),
        }),
        [a, b],
        [out],
    ));
    cut(&pipe, 0, &[out])
}

fn expression_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    let numeric_ops = [
        ArithOp::Add,
        ArithOp::Sub,
        ArithOp::Mul,
        ArithOp::Div,
        ArithOp::Eq,
        ArithOp::Neq,
        ArithOp::Lt,
        ArithOp::Le,
        ArithOp::Gt,
        ArithOp::Ge,
    ];
    for ty in numeric_types() {
        for op in numeric_ops {
            out.push(binary_fragment(&ty, op, false)?);
            out.push(binary_fragment(&ty, op, true)?);
        }
    }
    let cmp_ops = [
        ArithOp::Eq,
        ArithOp::Neq,
        ArithOp::Lt,
        ArithOp::Le,
        ArithOp::Gt,
        ArithOp::Ge,
    ];
    for ty in [Type::Date, Type::Char] {
        for op in cmp_ops {
            out.push(binary_fragment(&ty, op, false)?);
        }
    }
    for op in [ArithOp::And, ArithOp::Or, ArithOp::Eq, ArithOp::Neq] {
        out.push(binary_fragment(&Type::Bool, op, false)?);
    }
    for op in [ArithOp::And, ArithOp::Or] {
        out.push(binary_fragment(&Type::Bool, op, true)?);
    }
    for op in [ArithOp::StrEq, ArithOp::Eq, ArithOp::Neq] {
        out.push(binary_fragment(&Type::char_ptr(), op, false)?);
    }
    Ok(())
}

fn cast_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    for src in numeric_types() {
        for target in numeric_types() {
            if src == target {
                continue;
            }
            let ius = IuSpace::new();
            let a = ius.create(src.clone(), "a");
            let cast = ius.create(target.clone(), "out");
            let mut pipe = Pipeline::new(ius);
            pipe.attach(Suboperator::new(
                SubopKind::Expression(ExpressionSubop {
                    op: ExprOpcode::Cast(target.clone()),
                }),
                [a],
                [cast],
            ));
            out.push(cut(&pipe, 0, &[cast])?);
        }
    }
    Ok(())
}

fn runtime_expression_fragment(
    ty: &Type,
    op: ArithOp,
    value: Value,
    const_on_left: bool,
) -> Result<Fragment> {
    let ius = IuSpace::new();
    let a = ius.create(ty.clone(), "a");
    let out = ius.create(binary_output_type(op, ty, ty), "out");
    let mut pipe = Pipeline::new(ius);
    pipe.attach(Suboperator::new(
        SubopKind::RuntimeExpression(RuntimeExpressionSubop {
            op,
            value,
            const_on_left,
        }),
        [a],
        [out],
    ));
    cut(&pipe, 0, &[out])
}

fn runtime_expression_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    let numeric_ops = [
        ArithOp::Add,
        ArithOp::Sub,
        ArithOp::Mul,
        ArithOp::Div,
        ArithOp::Eq,
        ArithOp::Neq,
        ArithOp::Lt,
        ArithOp::Le,
        ArithOp::Gt,
        ArithOp::Ge,
    ];
    for ty in numeric_types() {
        for op in numeric_ops {
            for const_on_left in [false, true] {
                out.push(runtime_expression_fragment(
                    &ty,
                    op,
                    zero_value(&ty)?,
                    const_on_left,
                )?);
            }
        }
    }
    let cmp_ops = [
        ArithOp::Eq,
        ArithOp::Neq,
        ArithOp::Lt,
        ArithOp::Le,
        ArithOp::Gt,
        ArithOp::Ge,
    ];
    for ty in [Type::Date, Type::Char] {
        for op in cmp_ops {
            for const_on_left in [false, true] {
                out.push(runtime_expression_fragment(
                    &ty,
                    op,
                    zero_value(&ty)?,
                    const_on_left,
                )?);
            }
        }
    }
    for op in [ArithOp::Eq, ArithOp::Neq] {
        for const_on_left in [false, true] {
            out.push(runtime_expression_fragment(
                &Type::Bool,
                op,
                Value::Bool(false),
                const_on_left,
            )?);
        }
    }
    // Pointer null checks, e.g. filtering unmatched join probes.
    for op in [ArithOp::Eq, ArithOp::Neq] {
        out.push(runtime_expression_fragment(
            &Type::char_ptr(),
            op,
            Value::U8(0),
            false,
        )?);
    }
    Ok(())
}

/// Filter scope plus one logic per filtered type; the scope's `if` is part
/// of every fragment, identified by the logic.
fn filter_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    let mut types = storable_types();
    types.push(Type::Bool);
    for ty in types {
        let ius = IuSpace::new();
        let pred = ius.create(Type::Bool, "pred");
        let scope = ius.create_pseudo(Type::Void, "scope");
        let target = ius.create(ty.clone(), "target");
        let filtered = ius.create(ty.clone(), "filtered");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::ColumnFilterScope,
            [pred],
            [scope],
        ));
        pipe.attach(
            Suboperator::new(SubopKind::ColumnFilterLogic, [scope, target], [filtered])
                .with_strong([scope]),
        );
        out.push(cut(&pipe, 1, &[filtered])?);
    }
    Ok(())
}

fn key_packing_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    for ty in storable_types() {
        // Packers write one value at a state-held offset behind a row
        // pointer.  Two destination shapes exist: the scratch-pad
        // byte-array column (addressed by element pointer) and a staged
        // tuple pointer column (addressed by loaded value).
        for dest_ty in [Type::ByteArray(8), Type::char_ptr()] {
            let ius = IuSpace::new();
            let key = ius.create(dest_ty, "compound_key");
            let value = ius.create(ty.clone(), "to_pack");
            let mut pipe = Pipeline::new(ius);
            pipe.attach(Suboperator::new(
                SubopKind::KeyPacker(KeyPackingSubop { offset: 0 }),
                [key, value],
                [],
            ));
            out.push(cut(&pipe, 0, &[])?);
        }

        // Unpacker: reads one value out of a packed row pointer.
        let ius = IuSpace::new();
        let ptr = ius.create(Type::char_ptr(), "packed_ptr");
        let unpacked = ius.create(ty.clone(), "unpacked");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::KeyUnpacker(KeyPackingSubop { offset: 0 }),
            [ptr],
            [unpacked],
        ));
        out.push(cut(&pipe, 0, &[unpacked])?);
    }
    Ok(())
}

fn runtime_function_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    // Tuple materialization, paced by any scannable column.
    for ty in storable_types() {
        let ius = IuSpace::new();
        let pace = ius.create(ty.clone(), "pace");
        let tuple = ius.create(Type::char_ptr(), "tuple");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(RuntimeFunctionSubop::materialize(
            Arc::new(MaterializerSet::new(8)),
            pace,
            tuple,
        ));
        out.push(cut(&pipe, 0, &[tuple])?);
    }

    // Exclusive tables for aggregation: lookup and lookup-or-insert per
    // comparator family.
    for (spec, fcts) in [
        (
            KeySpec::Simple { size: 8 },
            ["ht_sk_lookup", "ht_sk_lookup_or_insert"],
        ),
        (
            KeySpec::Complex { slots: 1, simple: 0 },
            ["ht_ck_lookup", "ht_ck_lookup_or_insert"],
        ),
    ] {
        for fct_name in fcts {
            let ius = IuSpace::new();
            let key = ius.create(Type::ByteArray(8), "key");
            let slot = ius.create(Type::char_ptr(), "slot");
            let mut pipe = Pipeline::new(ius);
            pipe.attach(Suboperator::new(
                SubopKind::RuntimeFunction(RuntimeFunctionSubop {
                    fct_name,
                    args: SmallVec::from_slice(&[key]),
                    object: RuntimeObject::AggTables(dummy_agg_state(spec)),
                    prefetching: false,
                }),
                [key],
                [slot],
            ));
            out.push(cut(&pipe, 0, &[slot])?);
        }
    }

    // Atomic tables for joins: hash-and-prefetch, then the two lookup
    // flavors, per comparator family.
    for tag in ["sk", "ck"] {
        let hash_fct = match tag {
            "sk" => "ht_at_sk_compute_hash_and_prefetch",
            _ => "ht_at_ck_compute_hash_and_prefetch",
        };
        let ius = IuSpace::new();
        let key = ius.create(Type::ByteArray(8), "key");
        let hash = ius.create(Type::UnsignedInt(8), "hash");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::RuntimeFunction(RuntimeFunctionSubop {
                fct_name: hash_fct,
                args: SmallVec::from_slice(&[key]),
                object: RuntimeObject::JoinTable(dummy_join_state()),
                prefetching: true,
            }),
            [key],
            [hash],
        ));
        out.push(cut(&pipe, 0, &[hash])?);

        let lookup_fcts = match tag {
            "sk" => [
                "ht_at_sk_lookup_with_hash",
                "ht_at_sk_lookup_with_hash_disable",
            ],
            _ => [
                "ht_at_ck_lookup_with_hash",
                "ht_at_ck_lookup_with_hash_disable",
            ],
        };
        for fct_name in lookup_fcts {
            let ius = IuSpace::new();
            let key = ius.create(Type::ByteArray(8), "key");
            let hash = ius.create(Type::UnsignedInt(8), "hash");
            let slot = ius.create(Type::char_ptr(), "slot");
            let mut pipe = Pipeline::new(ius);
            pipe.attach(Suboperator::new(
                SubopKind::RuntimeFunction(RuntimeFunctionSubop {
                    fct_name,
                    args: SmallVec::from_slice(&[key, hash]),
                    object: RuntimeObject::JoinTable(dummy_join_state()),
                    prefetching: true,
                }),
                [key, hash],
                [slot],
            ));
            out.push(cut(&pipe, 0, &[slot])?);
        }
    }
    Ok(())
}

fn aggregation_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    // Count: no value operand.
    {
        let ius = IuSpace::new();
        let ptr = ius.create(Type::char_ptr(), "group");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::Aggregator(AggregatorSubop {
                granule: GranuleKind::Count,
                offset: 8,
            }),
            [ptr],
            [],
        ));
        out.push(cut(&pipe, 0, &[])?);
    }

    // Sum granules, one fragment per accepted source type.
    let sums = [
        (
            GranuleKind::SumI4,
            vec![
                Type::SignedInt(1),
                Type::SignedInt(2),
                Type::SignedInt(4),
                Type::UnsignedInt(1),
                Type::UnsignedInt(2),
            ],
        ),
        (
            GranuleKind::SumI8,
            vec![
                Type::SignedInt(8),
                Type::UnsignedInt(4),
                Type::UnsignedInt(8),
            ],
        ),
        (GranuleKind::SumF8, vec![Type::Float(4), Type::Float(8)]),
    ];
    for (granule, types) in sums {
        for ty in types {
            let ius = IuSpace::new();
            let ptr = ius.create(Type::char_ptr(), "group");
            let value = ius.create(ty, "value");
            let mut pipe = Pipeline::new(ius);
            pipe.attach(Suboperator::new(
                SubopKind::Aggregator(AggregatorSubop {
                    granule,
                    offset: 8,
                }),
                [ptr, value],
                [],
            ));
            out.push(cut(&pipe, 0, &[])?);
        }
    }

    // Readers: plain granule unpacks and the shared-granule average.
    for ty in [Type::SignedInt(4), Type::SignedInt(8), Type::Float(8)] {
        let ius = IuSpace::new();
        let row = ius.create(Type::char_ptr(), "row");
        let value = ius.create(ty.clone(), "out");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::AggReader(AggReaderSubop {
                compute: AggCompute::Unpack { ty },
                offset_a: 8,
                offset_b: 0,
            }),
            [row],
            [value],
        ));
        out.push(cut(&pipe, 0, &[value])?);
    }
    for sum in [GranuleKind::SumI4, GranuleKind::SumI8, GranuleKind::SumF8] {
        let ius = IuSpace::new();
        let row = ius.create(Type::char_ptr(), "row");
        let avg = ius.create(Type::Float(8), "avg");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::AggReader(AggReaderSubop {
                compute: AggCompute::Avg { sum },
                offset_a: 8,
                offset_b: 16,
            }),
            [row],
            [avg],
        ));
        out.push(cut(&pipe, 0, &[avg])?);
    }
    Ok(())
}

fn hash_table_source_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    for spec in [
        KeySpec::Simple { size: 8 },
        KeySpec::Complex { slots: 1, simple: 0 },
    ] {
        let ius = IuSpace::new();
        let row = ius.create(Type::char_ptr(), "row");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::HashTableSource(HashTableSource {
                tables: Arc::new(HashTableSet::new(dummy_agg_state(spec))),
                cursor: Arc::new(AtomicU64::new(0)),
            }),
            [],
            [row],
        ));
        out.push(cut(&pipe, 0, &[row])?);
    }
    Ok(())
}

fn counting_sink_fragments(out: &mut Vec<Fragment>) -> Result<()> {
    let mut types = storable_types();
    types.push(Type::Bool);
    for ty in types {
        let ius = IuSpace::new();
        let value = ius.create(ty, "counted");
        let mut pipe = Pipeline::new(ius);
        pipe.attach(Suboperator::new(
            SubopKind::CountingSink(CountingSink {
                collector: Arc::new(CountCollector::new()),
            }),
            [value],
            [],
        ));
        out.push(cut(&pipe, 0, &[])?);
    }
    Ok(())
}
