//! IR-level declarations of the runtime ABI.
//!
//! Code generation invokes runtime functions by name; the backend emits
//! extern declarations for them.  Both take the signatures from this
//! registry so the IR, the C preamble, and `abi.rs` describe the same
//! functions.

use inkfuse_ir::Type;

/// Declaration of one runtime function.
#[derive(Debug, Clone)]
pub struct RuntimeFunction {
    pub name: &'static str,
    pub args: Vec<Type>,
    pub ret: Type,
}

impl RuntimeFunction {
    fn new(name: &'static str, args: Vec<Type>, ret: Type) -> RuntimeFunction {
        RuntimeFunction { name, args, ret }
    }
}

/// All runtime functions callable from generated code.
pub fn runtime_functions() -> Vec<RuntimeFunction> {
    let void_ptr = Type::void_ptr();
    let char_ptr = Type::char_ptr();
    let u64t = Type::UnsignedInt(8);
    let u64_ptr = Type::ptr(u64t.clone());

    let mut fns = vec![
        RuntimeFunction::new("inkfuse_malloc", vec![u64t.clone()], void_ptr.clone()),
        RuntimeFunction::new(
            "inkfuse_str_eq",
            vec![char_ptr.clone(), char_ptr.clone()],
            Type::Bool,
        ),
        RuntimeFunction::new("hash", vec![char_ptr.clone(), u64t.clone()], u64t.clone()),
        RuntimeFunction::new("hash4", vec![char_ptr.clone()], u64t.clone()),
        RuntimeFunction::new("hash8", vec![char_ptr.clone()], u64t.clone()),
        RuntimeFunction::new(
            "materialize_tuple",
            vec![void_ptr.clone()],
            char_ptr.clone(),
        ),
    ];

    // Exclusive tables, simple and complex comparators.
    for prefix in ["ht_sk", "ht_ck"] {
        for op in ["lookup", "lookup_or_insert", "insert"] {
            // ht_ck_insert is not part of the frozen surface.
            if prefix == "ht_ck" && op == "insert" {
                continue;
            }
            fns.push(RuntimeFunction::new(
                runtime_name(prefix, op),
                vec![void_ptr.clone(), char_ptr.clone()],
                char_ptr.clone(),
            ));
        }
        fns.push(RuntimeFunction::new(
            runtime_name(prefix, "it_advance"),
            vec![void_ptr.clone(), u64_ptr.clone(), u64t.clone()],
            char_ptr.clone(),
        ));
    }

    // Atomic tables.
    for prefix in ["ht_at_sk", "ht_at_ck"] {
        fns.push(RuntimeFunction::new(
            runtime_name(prefix, "compute_hash_and_prefetch"),
            vec![void_ptr.clone(), char_ptr.clone()],
            u64t.clone(),
        ));
        fns.push(RuntimeFunction::new(
            runtime_name(prefix, "slot_prefetch"),
            vec![void_ptr.clone(), u64t.clone()],
            Type::Void,
        ));
        for op in ["lookup_with_hash", "lookup_with_hash_disable"] {
            fns.push(RuntimeFunction::new(
                runtime_name(prefix, op),
                vec![void_ptr.clone(), char_ptr.clone(), u64t.clone()],
                char_ptr.clone(),
            ));
        }
        fns.push(RuntimeFunction::new(
            runtime_name(prefix, "it_advance"),
            vec![void_ptr.clone(), u64_ptr.clone(), u64t.clone()],
            char_ptr.clone(),
        ));
    }

    fns
}

/// Look up one declaration by name.
pub fn runtime_function(name: &str) -> Option<RuntimeFunction> {
    runtime_functions().into_iter().find(|f| f.name == name)
}

fn runtime_name(prefix: &str, op: &str) -> &'static str {
    // The full name set is small and closed; resolve to static strings so
    // RuntimeFunction stays copy-free.
    match (prefix, op) {
        ("ht_sk", "lookup") => "ht_sk_lookup",
        ("ht_sk", "lookup_or_insert") => "ht_sk_lookup_or_insert",
        ("ht_sk", "insert") => "ht_sk_insert",
        ("ht_sk", "it_advance") => "ht_sk_it_advance",
        ("ht_ck", "lookup") => "ht_ck_lookup",
        ("ht_ck", "lookup_or_insert") => "ht_ck_lookup_or_insert",
        ("ht_ck", "it_advance") => "ht_ck_it_advance",
        ("ht_at_sk", "compute_hash_and_prefetch") => "ht_at_sk_compute_hash_and_prefetch",
        ("ht_at_sk", "slot_prefetch") => "ht_at_sk_slot_prefetch",
        ("ht_at_sk", "lookup_with_hash") => "ht_at_sk_lookup_with_hash",
        ("ht_at_sk", "lookup_with_hash_disable") => "ht_at_sk_lookup_with_hash_disable",
        ("ht_at_sk", "it_advance") => "ht_at_sk_it_advance",
        ("ht_at_ck", "compute_hash_and_prefetch") => "ht_at_ck_compute_hash_and_prefetch",
        ("ht_at_ck", "slot_prefetch") => "ht_at_ck_slot_prefetch",
        ("ht_at_ck", "lookup_with_hash") => "ht_at_ck_lookup_with_hash",
        ("ht_at_ck", "lookup_with_hash_disable") => "ht_at_ck_lookup_with_hash_disable",
        ("ht_at_ck", "it_advance") => "ht_at_ck_it_advance",
        _ => unreachable!("unknown runtime function {prefix}_{op}"),
    }
}
