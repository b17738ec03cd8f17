use bibsort_core::{BucketRow, Collation, OrderIndex, PersistenceGateway, SledGateway, SortValue};
use roaring::RoaringBitmap;

fn row(number: u32, recids: &[u32], boundary: u64) -> BucketRow {
    BucketRow {
        number,
        records: recids.iter().copied().collect(),
        boundary,
        last_updated: bibsort_core::now(),
    }
}

#[test]
fn sled_round_trips_index_and_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let mut idx = OrderIndex::new(8, Collation::Binary);
    for (recid, title) in [(1, "beta"), (2, "alpha"), (3, "gamma")] {
        idx.insert_or_update(recid, SortValue::from(title));
    }
    let snapshot = idx.snapshot(bibsort_core::now());

    let gw = SledGateway::open(dir.path().join("db")).unwrap();
    gw.store(7, &snapshot).unwrap();
    gw.store_bucket(7, &row(2, &[3], 24)).unwrap();
    gw.store_bucket(7, &row(1, &[2, 1], 16)).unwrap();

    assert_eq!(gw.load(7).unwrap(), Some(snapshot.clone()));
    assert_eq!(gw.last_updated(7).unwrap(), Some(snapshot.last_updated));
    assert_eq!(gw.methods().unwrap(), vec![7]);

    let rows = gw.load_buckets(7).unwrap();
    assert_eq!(rows.iter().map(|r| r.number).collect::<Vec<_>>(), vec![1, 2]);
    let expected: RoaringBitmap = [1, 2].into_iter().collect();
    assert_eq!(rows[0].records, expected);
    assert_eq!(rows[1].boundary, 24);
    assert!(gw.load(8).unwrap().is_none());
}

#[test]
fn truncate_and_delete_are_scoped_to_one_method() {
    let dir = tempfile::tempdir().unwrap();
    let gw = SledGateway::open(dir.path().join("db")).unwrap();
    for number in 1..=3 {
        gw.store_bucket(1, &row(number, &[number], number as u64 * 8)).unwrap();
        gw.store_bucket(2, &row(number, &[number], number as u64 * 8)).unwrap();
    }
    gw.store(1, &OrderIndex::new(8, Collation::Binary).snapshot(bibsort_core::now())).unwrap();

    gw.truncate_buckets(1, 1).unwrap();
    assert_eq!(gw.load_buckets(1).unwrap().len(), 1);
    assert_eq!(gw.load_buckets(2).unwrap().len(), 3);

    gw.delete_method(1).unwrap();
    assert!(gw.load(1).unwrap().is_none());
    assert!(gw.last_updated(1).unwrap().is_none());
    assert!(gw.load_buckets(1).unwrap().is_empty());
    assert_eq!(gw.load_buckets(2).unwrap().len(), 3);
}

#[test]
fn index_writes_stay_uncommitted_until_commit() {
    let dir = tempfile::tempdir().unwrap();
    let gw = SledGateway::open(dir.path().join("db")).unwrap();
    let snapshot = OrderIndex::new(8, Collation::Binary).snapshot(bibsort_core::now());

    gw.commit(3).unwrap();
    assert!(gw.meta(3).unwrap().is_none());

    gw.store(3, &snapshot).unwrap();
    let meta = gw.meta(3).unwrap().unwrap();
    assert!(!meta.committed);
    assert_eq!(meta.last_updated, snapshot.last_updated);

    gw.commit(3).unwrap();
    assert!(gw.meta(3).unwrap().unwrap().committed);

    // a later index write reopens the method until its buckets are committed again
    gw.store(3, &snapshot).unwrap();
    assert!(!gw.meta(3).unwrap().unwrap().committed);
}
