//! Stable C-ABI symbols for generated code.
//!
//! Generated pipelines are compiled into shared objects with undefined
//! references to these symbols; `dlopen` resolves them against the host
//! process (linked with `--export-dynamic`).  Names and signatures are
//! frozen — [`crate::registry`] mirrors them as IR declarations so code
//! generation and this file cannot drift apart silently.
//!
//! Table handles cross the boundary as `void*`; the `_sk_`/`_ck_` infix
//! picks the comparator the pointer was created with.

use std::os::raw::{c_char, c_void};

use crate::atomic_hash_table::AtomicHashTable;
use crate::comparators::{ComplexKeyComparator, SimpleKeyComparator};
use crate::exclusive_hash_table::ExclusiveHashTable;
use crate::memory::MemoryRegion;
use crate::tuple_materializer::TupleMaterializer;

/// Exclusive table with simple keys, as seen by generated code.
pub type HtSk = ExclusiveHashTable<SimpleKeyComparator>;
/// Exclusive table with complex keys.
pub type HtCk = ExclusiveHashTable<ComplexKeyComparator>;
/// Atomic table with simple keys.
pub type HtAtSk = AtomicHashTable<SimpleKeyComparator>;
/// Atomic table with complex keys.
pub type HtAtCk = AtomicHashTable<ComplexKeyComparator>;

// ── Memory ─────────────────────────────────────────────────────────────────

/// Allocate in the arena installed for the current thread.
#[no_mangle]
pub extern "C" fn inkfuse_malloc(size: u64) -> *mut c_void {
    MemoryRegion::installed_alloc(size as usize).cast()
}

// ── Hashing ────────────────────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn hash(ptr: *const c_char, len: u64) -> u64 {
    crate::hash::hash_bytes(ptr.cast(), len as usize)
}

#[no_mangle]
pub unsafe extern "C" fn hash4(ptr: *const c_char) -> u64 {
    crate::hash::hash4(ptr.cast())
}

#[no_mangle]
pub unsafe extern "C" fn hash8(ptr: *const c_char) -> u64 {
    crate::hash::hash8(ptr.cast())
}

// ── Strings ────────────────────────────────────────────────────────────────

/// Equality of two NUL-terminated strings; backs the `StrEq` opcode.
#[no_mangle]
pub unsafe extern "C" fn inkfuse_str_eq(a: *const c_char, b: *const c_char) -> bool {
    std::ffi::CStr::from_ptr(a) == std::ffi::CStr::from_ptr(b)
}

// ── Exclusive hash tables ──────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn ht_sk_lookup(table: *mut c_void, key: *const c_char) -> *mut c_char {
    (*table.cast::<HtSk>()).lookup(key.cast()).cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_sk_lookup_or_insert(
    table: *mut c_void,
    key: *const c_char,
) -> *mut c_char {
    (*table.cast::<HtSk>()).lookup_or_insert(key.cast()).0.cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_sk_insert(table: *mut c_void, key: *const c_char) -> *mut c_char {
    (*table.cast::<HtSk>()).insert(key.cast()).cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_sk_it_advance(
    table: *mut c_void,
    idx: *mut u64,
    end: u64,
) -> *mut c_char {
    (*table.cast::<HtSk>()).it_advance(&mut *idx, end).cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_ck_lookup(table: *mut c_void, key: *const c_char) -> *mut c_char {
    (*table.cast::<HtCk>()).lookup(key.cast()).cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_ck_lookup_or_insert(
    table: *mut c_void,
    key: *const c_char,
) -> *mut c_char {
    (*table.cast::<HtCk>()).lookup_or_insert(key.cast()).0.cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_ck_it_advance(
    table: *mut c_void,
    idx: *mut u64,
    end: u64,
) -> *mut c_char {
    (*table.cast::<HtCk>()).it_advance(&mut *idx, end).cast()
}

// ── Atomic hash tables ─────────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn ht_at_sk_compute_hash_and_prefetch(
    table: *mut c_void,
    key: *const c_char,
) -> u64 {
    (*table.cast::<HtAtSk>()).compute_hash_and_prefetch(key.cast())
}

#[no_mangle]
pub unsafe extern "C" fn ht_at_sk_slot_prefetch(table: *mut c_void, hash_value: u64) {
    (*table.cast::<HtAtSk>()).slot_prefetch(hash_value);
}

#[no_mangle]
pub unsafe extern "C" fn ht_at_sk_lookup_with_hash(
    table: *mut c_void,
    key: *const c_char,
    hash_value: u64,
) -> *mut c_char {
    (*table.cast::<HtAtSk>())
        .lookup_with_hash(key.cast(), hash_value)
        .cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_at_sk_lookup_with_hash_disable(
    table: *mut c_void,
    key: *const c_char,
    hash_value: u64,
) -> *mut c_char {
    (*table.cast::<HtAtSk>())
        .lookup_with_hash_disable(key.cast(), hash_value)
        .cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_at_sk_it_advance(
    table: *mut c_void,
    idx: *mut u64,
    end: u64,
) -> *mut c_char {
    (*table.cast::<HtAtSk>()).it_advance(&mut *idx, end).cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_at_ck_compute_hash_and_prefetch(
    table: *mut c_void,
    key: *const c_char,
) -> u64 {
    (*table.cast::<HtAtCk>()).compute_hash_and_prefetch(key.cast())
}

#[no_mangle]
pub unsafe extern "C" fn ht_at_ck_slot_prefetch(table: *mut c_void, hash_value: u64) {
    (*table.cast::<HtAtCk>()).slot_prefetch(hash_value);
}

#[no_mangle]
pub unsafe extern "C" fn ht_at_ck_lookup_with_hash(
    table: *mut c_void,
    key: *const c_char,
    hash_value: u64,
) -> *mut c_char {
    (*table.cast::<HtAtCk>())
        .lookup_with_hash(key.cast(), hash_value)
        .cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_at_ck_lookup_with_hash_disable(
    table: *mut c_void,
    key: *const c_char,
    hash_value: u64,
) -> *mut c_char {
    (*table.cast::<HtAtCk>())
        .lookup_with_hash_disable(key.cast(), hash_value)
        .cast()
}

#[no_mangle]
pub unsafe extern "C" fn ht_at_ck_it_advance(
    table: *mut c_void,
    idx: *mut u64,
    end: u64,
) -> *mut c_char {
    (*table.cast::<HtAtCk>()).it_advance(&mut *idx, end).cast()
}

// ── Tuple materialization ──────────────────────────────────────────────────

/// Reserve the next row slot in a thread-local materializer.
#[no_mangle]
pub unsafe extern "C" fn materialize_tuple(materializer: *mut c_void) -> *mut c_char {
    (*materializer.cast::<TupleMaterializer>())
        .materialize()
        .cast()
}

// ── Link anchoring ─────────────────────────────────────────────────────────

/// Addresses of every exported symbol.
///
/// Host code never calls the ABI functions directly, so without a live
/// reference the linker is free to drop their object file before `dlopen`
/// needs it.  The engine takes these addresses once at startup, which pins
/// the symbols and doubles as a sanity listing.
pub fn symbol_addresses() -> Vec<(&'static str, *const ())> {
    vec![
        ("inkfuse_malloc", inkfuse_malloc as *const ()),
        ("inkfuse_str_eq", inkfuse_str_eq as *const ()),
        ("hash", hash as *const ()),
        ("hash4", hash4 as *const ()),
        ("hash8", hash8 as *const ()),
        ("ht_sk_lookup", ht_sk_lookup as *const ()),
        ("ht_sk_lookup_or_insert", ht_sk_lookup_or_insert as *const ()),
        ("ht_sk_insert", ht_sk_insert as *const ()),
        ("ht_sk_it_advance", ht_sk_it_advance as *const ()),
        ("ht_ck_lookup", ht_ck_lookup as *const ()),
        ("ht_ck_lookup_or_insert", ht_ck_lookup_or_insert as *const ()),
        ("ht_ck_it_advance", ht_ck_it_advance as *const ()),
        (
            "ht_at_sk_compute_hash_and_prefetch",
            ht_at_sk_compute_hash_and_prefetch as *const (),
        ),
        ("ht_at_sk_slot_prefetch", ht_at_sk_slot_prefetch as *const ()),
        ("ht_at_sk_lookup_with_hash", ht_at_sk_lookup_with_hash as *const ()),
        (
            "ht_at_sk_lookup_with_hash_disable",
            ht_at_sk_lookup_with_hash_disable as *const (),
        ),
        ("ht_at_sk_it_advance", ht_at_sk_it_advance as *const ()),
        (
            "ht_at_ck_compute_hash_and_prefetch",
            ht_at_ck_compute_hash_and_prefetch as *const (),
        ),
        ("ht_at_ck_slot_prefetch", ht_at_ck_slot_prefetch as *const ()),
        ("ht_at_ck_lookup_with_hash", ht_at_ck_lookup_with_hash as *const ()),
        (
            "ht_at_ck_lookup_with_hash_disable",
            ht_at_ck_lookup_with_hash_disable as *const (),
        ),
        ("ht_at_ck_it_advance", ht_at_ck_it_advance as *const ()),
        ("materialize_tuple", materialize_tuple as *const ()),
    ]
}
