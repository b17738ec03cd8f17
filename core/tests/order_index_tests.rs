use bibsort_core::{Collation, OrderIndex, SortValue};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn numbers(idx: &mut OrderIndex, entries: &[(u32, f64)]) {
    for &(recid, v) in entries {
        idx.insert_or_update(recid, SortValue::from(v));
    }
}

#[test]
fn inserts_come_out_sorted() {
    let mut idx = OrderIndex::new(8, Collation::Binary);
    numbers(&mut idx, &[(1, 30.0), (2, 10.0), (3, 20.0)]);
    assert_eq!(idx.order(), &[2, 3, 1]);
    let weights: Vec<u64> = idx.order().iter().map(|&r| idx.weight(r).unwrap()).collect();
    assert!(weights.windows(2).all(|w| w[0] < w[1]), "weights {weights:?}");
    assert!(idx.is_well_ordered());
}

#[test]
fn freed_gap_is_reused_without_widening() {
    let mut idx = OrderIndex::new(8, Collation::Binary);
    numbers(&mut idx, &[(1, 1.0), (2, 2.0), (3, 3.0)]);
    let before: Vec<u64> = [1, 3].iter().map(|&r| idx.weight(r).unwrap()).collect();

    idx.delete(2);
    let p = idx.insert_or_update(4, SortValue::from(2.5));

    assert_eq!(p.widened, None);
    assert!(!p.renumbered);
    assert_eq!(idx.order(), &[1, 4, 3]);
    let after: Vec<u64> = [1, 3].iter().map(|&r| idx.weight(r).unwrap()).collect();
    assert_eq!(before, after);
    assert!(before[0] < p.weight && p.weight < before[1]);
}

#[test]
fn collapsed_gap_widens_the_tail() {
    let mut idx = OrderIndex::new(8, Collation::Binary);
    numbers(&mut idx, &[(1, 0.0), (2, 100.0)]);
    // each value lands right after record 1 and halves the remaining gap
    let mut widened = None;
    for (recid, v) in [(3, 50.0), (4, 25.0), (5, 12.0), (6, 6.0), (7, 3.0)] {
        let p = idx.insert_or_update(recid, SortValue::from(v));
        assert!(idx.is_well_ordered(), "broken after inserting {recid}");
        if p.widened.is_some() && widened.is_none() {
            widened = Some((recid, p));
        }
    }
    let (recid, p) = widened.expect("gap never collapsed");
    assert_eq!(recid, 6);
    assert_eq!(p.widened.map(|w| w.delta), Some(16));
    assert!(!p.renumbered);
    assert_eq!(idx.order(), &[1, 7, 6, 5, 4, 3, 2]);
}

#[test]
fn equal_values_order_by_recid() {
    let mut idx = OrderIndex::new(8, Collation::Binary);
    for recid in [9, 3, 5] {
        idx.insert_or_update(recid, SortValue::from("same"));
    }
    assert_eq!(idx.order(), &[3, 5, 9]);

    let mut entries =
        vec![(9, SortValue::from("same")), (3, SortValue::from("same")), (1, SortValue::from("z"))];
    idx.sort_entries(&mut entries);
    assert_eq!(entries.iter().map(|(r, _)| *r).collect::<Vec<_>>(), vec![3, 9, 1]);
}

#[test]
fn folded_collation_ignores_case_and_accents() {
    let values = [(1, "Zoe"), (2, "emma"), (3, "Émile")];
    let mut binary = OrderIndex::new(8, Collation::Binary);
    let mut folded = OrderIndex::new(8, Collation::Folded { locale: "fr".into() });
    for (recid, v) in values {
        binary.insert_or_update(recid, SortValue::from(v));
        folded.insert_or_update(recid, SortValue::from(v));
    }
    assert_eq!(binary.order(), &[1, 2, 3]);
    assert_eq!(folded.order(), &[3, 2, 1]);
}

#[test]
fn snapshot_restores_the_same_index() {
    let mut idx = OrderIndex::new(8, Collation::Binary);
    numbers(&mut idx, &[(10, 4.0), (11, 2.0), (12, 9.0)]);
    let snapshot = idx.snapshot(bibsort_core::now());
    let restored = OrderIndex::load(snapshot.clone(), 8, Collation::Binary);
    assert_eq!(restored.order(), idx.order());
    assert_eq!(restored.snapshot(snapshot.last_updated), snapshot);
}

#[derive(Debug, Clone)]
enum Op {
    Upsert(u32, i32),
    Delete(u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u32..40, -5i32..5).prop_map(|(r, v)| Op::Upsert(r, v)),
        1 => (0u32..40).prop_map(Op::Delete),
    ]
}

proptest! {
    #[test]
    fn any_operation_sequence_stays_ordered(
        ops in prop::collection::vec(op(), 1..200),
        spacing in 2u64..10
    ) {
        let mut idx = OrderIndex::new(spacing, Collation::Binary);
        let mut expected: BTreeMap<u32, i32> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Upsert(r, v) => {
                    idx.insert_or_update(r, SortValue::from(v as i64));
                    expected.insert(r, v);
                }
                Op::Delete(r) => {
                    prop_assert_eq!(idx.delete(r).is_some(), expected.remove(&r).is_some());
                }
            }
            prop_assert!(idx.is_well_ordered());
        }
        let mut want: Vec<(i32, u32)> = expected.iter().map(|(&r, &v)| (v, r)).collect();
        want.sort();
        let want: Vec<u32> = want.into_iter().map(|(_, r)| r).collect();
        prop_assert_eq!(idx.order(), &want[..]);
    }
}
