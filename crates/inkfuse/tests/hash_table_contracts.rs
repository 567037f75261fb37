//! Hash-table contracts the execution engine relies on: restart-flag
//! replay under vectorized insertion, the disabled-slot semantics behind
//! left semi joins, and the tag invariant.

use inkfuse::{AtomicHashTable, ExclusiveHashTable, MemoryRegion, SimpleKeyComparator};

const FILL_BIT: u8 = 0x80;

/// Replay a batch of inserts the way the interpreter replays a primitive:
/// run under an installed region, repeat while the restart flag was
/// raised.  Returns how many replays happened.
fn insert_batch_with_replay(
    table: &mut ExclusiveHashTable<SimpleKeyComparator>,
    region: &mut MemoryRegion,
    keys: std::ops::Range<u64>,
) -> usize {
    let mut replays = 0;
    loop {
        let restart = {
            let _guard = MemoryRegion::install(region);
            for key in keys.clone() {
                unsafe {
                    let (slot, _) = table.lookup_or_insert(key.to_le_bytes().as_ptr());
                    slot.add(8).cast::<u64>().write_unaligned(2 * key + 12);
                }
            }
            MemoryRegion::take_installed_restart()
        };
        if !restart {
            return replays;
        }
        replays += 1;
    }
}

#[test]
fn resize_under_vectorized_insert_raises_the_restart_flag() {
    let mut table = ExclusiveHashTable::new(SimpleKeyComparator::new(8), 8, 16);
    let mut region = MemoryRegion::new();

    let first = insert_batch_with_replay(&mut table, &mut region, 0..32);
    let second = insert_batch_with_replay(&mut table, &mut region, 32..1056);
    assert!(
        first + second >= 1,
        "growing 16 slots to 1056 entries must resize at least once"
    );

    assert_eq!(table.len(), 1056);
    for key in 0_u64..1056 {
        unsafe {
            let slot = table.lookup(key.to_le_bytes().as_ptr());
            assert!(!slot.is_null(), "key {key} missing");
            assert_eq!(slot.add(8).cast::<u64>().read_unaligned(), 2 * key + 12);
        }
    }
    // The replayed batch ran clean on its final attempt.
    assert!(!region.restart_flag());
}

#[test]
fn disabling_a_slot_hides_exactly_that_key() {
    let table = AtomicHashTable::new(SimpleKeyComparator::new(8), 8, 64);
    let keys: Vec<[u8; 8]> = (0_u64..16).map(u64::to_le_bytes).collect();
    for key in &keys {
        unsafe {
            table.insert_tuple(key.as_ptr());
        }
    }

    let probe = |key: &[u8; 8]| unsafe {
        let hash = table.compute_hash_and_prefetch(key.as_ptr());
        table.lookup_with_hash(key.as_ptr(), hash)
    };
    let disable = |key: &[u8; 8]| unsafe {
        let hash = table.compute_hash_and_prefetch(key.as_ptr());
        table.lookup_with_hash_disable(key.as_ptr(), hash)
    };

    assert!(!disable(&keys[3]).is_null());
    // The disabled slot no longer matches its key, idempotently.
    assert!(disable(&keys[3]).is_null());
    assert!(probe(&keys[3]).is_null());
    // Every other key is untouched.
    for (i, key) in keys.iter().enumerate() {
        if i != 3 {
            assert!(!probe(key).is_null(), "key {i} lost");
        }
    }
}

#[test]
fn tags_carry_fill_bit_and_fingerprint() {
    let mut table = ExclusiveHashTable::new(SimpleKeyComparator::new(8), 0, 64);
    for key in 0_u64..20 {
        unsafe {
            table.insert(key.to_le_bytes().as_ptr());
        }
    }
    let mut filled = 0;
    let mut idx = 0_u64;
    loop {
        let slot = table.it_advance(&mut idx, table.capacity());
        if slot.is_null() {
            break;
        }
        let tag = table.tag_at(idx - 1);
        assert_ne!(tag & FILL_BIT, 0);
        let key = unsafe { slot.cast::<u64>().read_unaligned() };
        let fingerprint = ((unsafe { table.hash_stored(slot) } >> 57) & 0x7F) as u8;
        assert_eq!(tag & 0x7F, fingerprint, "fingerprint mismatch for key {key}");
        filled += 1;
    }
    assert_eq!(filled, 20);
}
