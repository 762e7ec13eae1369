//! Property-based tests for the eviction heap.
//!
//! Drives the heap with arbitrary inputs and checks the structural
//! guarantees hold regardless of insertion order:
//! - extraction drains in descending comparator order
//! - the bounded reservoir keeps exactly the capacity-smallest elements
//! - heapsort agrees with a reference sort and preserves length
//! - handed-back elements never undercut what the reservoir kept

use std::cmp::Ordering;

use proptest::prelude::*;

use plancache::heap::{EvictionHeap, HeapState, TryInsert};

type IntCmp = fn(&i64, &i64) -> Ordering;

fn int_heap(capacity: usize) -> EvictionHeap<i64, IntCmp> {
    EvictionHeap::with_capacity(capacity, i64::cmp as IntCmp)
}

fn drain(heap: &mut EvictionHeap<i64, IntCmp>) -> Vec<i64> {
    let mut out = Vec::with_capacity(heap.len());
    while let Some(v) = heap.extract_max() {
        out.push(v);
    }
    out
}

proptest! {
    #[test]
    fn prop_extract_drains_in_descending_order(values in prop::collection::vec(any::<i64>(), 0..64)) {
        let mut heap = int_heap(values.len());
        for &v in &values {
            heap.add(v).unwrap();
        }
        heap.build();

        let drained = drain(&mut heap);
        let mut expected = values;
        expected.sort_unstable_by(|a, b| b.cmp(a));
        prop_assert_eq!(drained, expected);
    }

    #[test]
    fn prop_incremental_insert_matches_bulk_build(values in prop::collection::vec(any::<i64>(), 0..64)) {
        let mut incremental = int_heap(values.len());
        let mut bulk = int_heap(values.len());
        for &v in &values {
            incremental.insert(v).unwrap();
            bulk.add(v).unwrap();
        }
        bulk.build();

        prop_assert_eq!(drain(&mut incremental), drain(&mut bulk));
    }

    #[test]
    fn prop_reservoir_keeps_capacity_smallest(
        values in prop::collection::vec(any::<i64>(), 0..128),
        capacity in 0usize..16,
    ) {
        let mut heap = int_heap(capacity);
        for &v in &values {
            let _ = heap.try_insert(v);
            prop_assert!(heap.len() <= capacity);
        }

        let mut kept = drain(&mut heap);
        kept.sort_unstable();

        let mut expected = values;
        expected.sort_unstable();
        expected.truncate(capacity);
        prop_assert_eq!(kept, expected);
    }

    #[test]
    fn prop_handed_back_elements_never_undercut_the_kept(
        values in prop::collection::vec(any::<i64>(), 1..128),
        capacity in 1usize..16,
    ) {
        let mut heap = int_heap(capacity);
        for &v in &values {
            let handed_back = match heap.try_insert(v) {
                TryInsert::Accepted => continue,
                TryInsert::Rejected(r) | TryInsert::Replaced(r) => r,
            };
            // Whatever the reservoir refuses or displaces must be at least
            // as large as everything it retains.
            let max_kept = *heap.peek_max().unwrap();
            prop_assert!(handed_back >= max_kept);
        }
    }

    #[test]
    fn prop_sort_matches_reference_sort(values in prop::collection::vec(any::<i64>(), 0..64)) {
        let mut heap = int_heap(values.len());
        for &v in &values {
            heap.add(v).unwrap();
        }
        heap.sort();
        prop_assert_eq!(heap.state(), HeapState::Sorted);
        prop_assert_eq!(heap.len(), values.len());

        let sorted: Vec<i64> = heap.iter().copied().collect();
        let mut expected = values;
        expected.sort_unstable();
        let max = expected.last().copied();
        prop_assert_eq!(sorted, expected);

        // Rebuilding after a sort restores a usable heap.
        heap.build();
        prop_assert_eq!(heap.extract_max(), max);
    }

    #[test]
    fn prop_interleaved_insert_extract_never_misorders(
        ops in prop::collection::vec((any::<i64>(), any::<bool>()), 0..128),
    ) {
        let mut heap = int_heap(128);
        let mut reference = std::collections::BinaryHeap::new();
        for (value, is_insert) in ops {
            if is_insert {
                heap.insert(value).unwrap();
                reference.push(value);
            } else {
                prop_assert_eq!(heap.extract_max(), reference.pop());
            }
        }
        prop_assert_eq!(drain(&mut heap), reference.into_sorted_vec().into_iter().rev().collect::<Vec<i64>>());
    }
}
