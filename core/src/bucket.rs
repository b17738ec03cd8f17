//! Bucket partitioning of an ordered record list.
//!
//! Bucket `b` holds a contiguous slice of the ordering as a roaring bitmap and
//! remembers the largest weight it admits (its boundary). Boundaries never
//! decrease with the bucket number, so the bucket for a weight is the first
//! one whose boundary is not below it.

use crate::error::BucketConsistencyError;
use crate::index::Placement;
use crate::persist::BucketRow;
use crate::{MethodId, RecId, Timestamp, Weight};
use roaring::RoaringBitmap;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// 1-based.
    pub number: u32,
    pub records: RoaringBitmap,
    pub boundary: Weight,
}

/// One step of an incremental bucket update, applied in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketChange {
    /// A record left `old` and/or arrived at `new`.
    Move { recid: RecId, old: Option<Weight>, new: Option<Weight> },
    /// Every weight `>= from` moved up by `delta`.
    Shift { from: Weight, delta: Weight },
}

impl BucketChange {
    /// Changes describing an index placement. A widening comes first so the
    /// new weight is matched against shifted boundaries.
    pub fn from_placement(placement: &Placement, out: &mut Vec<BucketChange>) {
        if let Some(w) = placement.widened {
            out.push(BucketChange::Shift { from: w.from, delta: w.delta });
        }
        out.push(BucketChange::Move {
            recid: placement.recid,
            old: placement.old_weight,
            new: Some(placement.weight),
        });
    }

    pub fn removal(recid: RecId, old: Weight) -> Self {
        BucketChange::Move { recid, old: Some(old), new: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketTable {
    buckets: Vec<Bucket>,
    dirty: BTreeSet<u32>,
}

impl BucketTable {
    /// Split `order` into `count` contiguous buckets of `len / count` records;
    /// the last bucket takes the remainder. Every bucket is marked dirty.
    pub fn build(order: &[RecId], weights: &HashMap<RecId, Weight>, count: usize) -> Self {
        let count = count.max(1);
        let step = order.len() / count;
        let mut buckets = Vec::with_capacity(count);
        let mut boundary = 0;
        for b in 0..count {
            let start = b * step;
            let end = if b + 1 == count { order.len() } else { start + step };
            let slice = &order[start..end];
            // empty buckets inherit the previous boundary
            if let Some(last) = slice.last() {
                boundary = weights.get(last).copied().unwrap_or(boundary);
            }
            buckets.push(Bucket {
                number: b as u32 + 1,
                records: slice.iter().copied().collect(),
                boundary,
            });
            tracing::debug!(bucket = b + 1, records = slice.len(), boundary, "bucket built");
        }
        let dirty = buckets.iter().map(|b| b.number).collect();
        Self { buckets, dirty }
    }

    /// Rebuild a table from persisted rows, which must be numbered `1..=K`.
    pub fn from_rows(
        method: MethodId,
        mut rows: Vec<BucketRow>,
    ) -> Result<Self, BucketConsistencyError> {
        if rows.is_empty() {
            return Err(BucketConsistencyError::Missing { method });
        }
        rows.sort_by_key(|r| r.number);
        for (i, row) in rows.iter().enumerate() {
            let expected = i as u32 + 1;
            if row.number != expected {
                return Err(BucketConsistencyError::Gap { method, expected, found: row.number });
            }
        }
        let buckets = rows
            .into_iter()
            .map(|r| Bucket { number: r.number, records: r.records, boundary: r.boundary })
            .collect();
        Ok(Self { buckets, dirty: BTreeSet::new() })
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn boundaries(&self) -> Vec<Weight> {
        self.buckets.iter().map(|b| b.boundary).collect()
    }

    pub fn total_records(&self) -> u64 {
        self.buckets.iter().map(|b| b.records.len()).sum()
    }

    /// Bucket numbers changed since the table was loaded or last persisted.
    pub fn dirty(&self) -> impl Iterator<Item = u32> + '_ {
        self.dirty.iter().copied()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Apply incremental changes. Buckets are never resplit here; sizes may
    /// drift until the next `build`.
    pub fn update(&mut self, changes: &[BucketChange]) {
        if self.buckets.is_empty() {
            return;
        }
        for change in changes {
            match *change {
                BucketChange::Shift { from, delta } => {
                    for bucket in self.buckets.iter_mut().filter(|b| b.boundary >= from) {
                        bucket.boundary = bucket.boundary.saturating_add(delta);
                        self.dirty.insert(bucket.number);
                    }
                }
                BucketChange::Move { recid, old, new } => {
                    self.remove(recid, old);
                    if let Some(weight) = new {
                        self.insert(recid, weight);
                    }
                }
            }
        }
    }

    /// Rows for every dirty bucket; clears the dirty set.
    pub fn take_dirty_rows(&mut self, last_updated: Timestamp) -> Vec<BucketRow> {
        let dirty = std::mem::take(&mut self.dirty);
        self.buckets
            .iter()
            .filter(|b| dirty.contains(&b.number))
            .map(|b| BucketRow {
                number: b.number,
                records: b.records.clone(),
                boundary: b.boundary,
                last_updated,
            })
            .collect()
    }

    /// Whether the buckets are pairwise disjoint and together hold exactly `order`.
    pub fn is_partition_of(&self, order: &[RecId]) -> bool {
        let mut seen = RoaringBitmap::new();
        for bucket in &self.buckets {
            if !seen.is_disjoint(&bucket.records) {
                return false;
            }
            seen |= &bucket.records;
        }
        let expected: RoaringBitmap = order.iter().copied().collect();
        seen == expected && expected.len() == order.len() as u64
    }

    /// Index of the first bucket whose boundary is `>= weight`.
    fn position_for(&self, weight: Weight) -> Option<usize> {
        let i = self.buckets.partition_point(|b| b.boundary < weight);
        (i < self.buckets.len()).then_some(i)
    }

    fn insert(&mut self, recid: RecId, weight: Weight) {
        let i = match self.position_for(weight) {
            Some(i) => i,
            None => {
                // past the last boundary: the last bucket grows
                let last = self.buckets.len() - 1;
                self.buckets[last].boundary = weight;
                last
            }
        };
        let bucket = &mut self.buckets[i];
        bucket.records.insert(recid);
        self.dirty.insert(bucket.number);
    }

    fn remove(&mut self, recid: RecId, old: Option<Weight>) {
        if let Some(i) = old.and_then(|w| self.position_for(w)) {
            let bucket = &mut self.buckets[i];
            if bucket.records.remove(recid) {
                self.dirty.insert(bucket.number);
                return;
            }
        }
        for bucket in self.buckets.iter_mut() {
            if bucket.records.remove(recid) {
                self.dirty.insert(bucket.number);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spaced(n: u32) -> (Vec<RecId>, HashMap<RecId, Weight>) {
        let order: Vec<RecId> = (1..=n).collect();
        let weights = order.iter().map(|&r| (r, r as Weight * 8)).collect();
        (order, weights)
    }

    #[test]
    fn remainder_goes_to_last_bucket() {
        let (order, weights) = spaced(10);
        let table = BucketTable::build(&order, &weights, 3);
        let sizes: Vec<u64> = table.buckets().iter().map(|b| b.records.len()).collect();
        assert_eq!(sizes, vec![3, 3, 4]);
        assert_eq!(table.boundaries(), vec![24, 48, 80]);
        assert!(table.is_partition_of(&order));
    }

    #[test]
    fn fewer_records_than_buckets() {
        let (order, weights) = spaced(2);
        let table = BucketTable::build(&order, &weights, 4);
        assert_eq!(table.boundaries(), vec![0, 0, 0, 16]);
        assert!(table.is_partition_of(&order));
    }

    #[test]
    fn move_crosses_buckets() {
        let (order, weights) = spaced(8);
        let mut table = BucketTable::build(&order, &weights, 2);
        table.take_dirty_rows(crate::now());
        table.update(&[BucketChange::Move { recid: 1, old: Some(8), new: Some(60) }]);
        assert!(!table.buckets()[0].records.contains(1));
        assert!(table.buckets()[1].records.contains(1));
        assert_eq!(table.dirty().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn insert_past_last_boundary_extends_it() {
        let (order, weights) = spaced(4);
        let mut table = BucketTable::build(&order, &weights, 2);
        table.update(&[BucketChange::Move { recid: 99, old: None, new: Some(1000) }]);
        assert_eq!(table.boundaries(), vec![16, 1000]);
        assert!(table.buckets()[1].records.contains(99));
    }

    #[test]
    fn shift_moves_boundaries_at_or_above() {
        let (order, weights) = spaced(4);
        let mut table = BucketTable::build(&order, &weights, 2);
        table.update(&[BucketChange::Shift { from: 17, delta: 16 }]);
        assert_eq!(table.boundaries(), vec![16, 48]);
    }

    #[test]
    fn rows_must_be_contiguous() {
        let row = |number| BucketRow {
            number,
            records: RoaringBitmap::new(),
            boundary: 0,
            last_updated: crate::now(),
        };
        assert!(matches!(
            BucketTable::from_rows(1, vec![]),
            Err(BucketConsistencyError::Missing { .. })
        ));
        assert!(matches!(
            BucketTable::from_rows(1, vec![row(1), row(3)]),
            Err(BucketConsistencyError::Gap { expected: 2, found: 3, .. })
        ));
        assert_eq!(BucketTable::from_rows(1, vec![row(2), row(1)]).unwrap().len(), 2);
    }
}
