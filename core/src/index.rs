//! The per-method order index.
//!
//! Three structures are kept in step: the washed value of every record, an
//! integer weight per record, and the list of records in ascending order.
//! Weights are strictly increasing along the list and leave gaps (the
//! spacing) so that most inserts find a free integer between their
//! neighbours without touching anything else.

use crate::washer::Collation;
use crate::{RecId, SortValue, Timestamp, Weight};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// The persisted form of an [`OrderIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub values: HashMap<RecId, SortValue>,
    pub weights: HashMap<RecId, Weight>,
    pub order: Vec<RecId>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: Timestamp,
}

/// Every weight `>= from` was raised by `delta` to make room for an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Widening {
    pub from: Weight,
    pub delta: Weight,
}

/// Where `insert_or_update` put a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub recid: RecId,
    pub position: usize,
    /// Weight before the call, if the record was already indexed.
    pub old_weight: Option<Weight>,
    pub weight: Weight,
    pub widened: Option<Widening>,
    /// The weight space overflowed and every record got a fresh weight.
    pub renumbered: bool,
}

#[derive(Debug, Clone)]
pub struct OrderIndex {
    values: HashMap<RecId, SortValue>,
    weights: HashMap<RecId, Weight>,
    order: Vec<RecId>,
    spacing: Weight,
    collation: Collation,
}

impl OrderIndex {
    pub fn new(spacing: Weight, collation: Collation) -> Self {
        Self {
            values: HashMap::new(),
            weights: HashMap::new(),
            order: Vec::new(),
            spacing,
            collation,
        }
    }

    pub fn with_capacity(capacity: usize, spacing: Weight, collation: Collation) -> Self {
        Self {
            values: HashMap::with_capacity(capacity),
            weights: HashMap::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
            spacing,
            collation,
        }
    }

    /// Restore an index from its persisted rows.
    pub fn load(snapshot: IndexSnapshot, spacing: Weight, collation: Collation) -> Self {
        Self {
            values: snapshot.values,
            weights: snapshot.weights,
            order: snapshot.order,
            spacing,
            collation,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, recid: RecId) -> bool {
        self.values.contains_key(&recid)
    }

    pub fn value(&self, recid: RecId) -> Option<&SortValue> {
        self.values.get(&recid)
    }

    pub fn weight(&self, recid: RecId) -> Option<Weight> {
        self.weights.get(&recid).copied()
    }

    pub fn weights(&self) -> &HashMap<RecId, Weight> {
        &self.weights
    }

    pub fn order(&self) -> &[RecId] {
        &self.order
    }

    pub fn spacing(&self) -> Weight {
        self.spacing
    }

    pub fn collation(&self) -> &Collation {
        &self.collation
    }

    /// Insert `recid`, or move it if it is already indexed.
    pub fn insert_or_update(&mut self, recid: RecId, value: SortValue) -> Placement {
        let old_weight = self.delete(recid);
        let position = self.position_for(recid, &value);
        self.values.insert(recid, value);

        let mut placement =
            Placement { recid, position, old_weight, weight: 0, widened: None, renumbered: false };

        if position == self.order.len() {
            let weight = match self.order.last() {
                None => Some(self.spacing),
                Some(&last) => self.weight_of(last).checked_add(self.spacing),
            };
            self.order.push(recid);
            match weight {
                Some(w) => {
                    self.weights.insert(recid, w);
                }
                None => {
                    self.renumber();
                    placement.renumbered = true;
                }
            }
            placement.weight = self.weight_of(recid);
            return placement;
        }

        let left = if position == 0 { 0 } else { self.weight_of(self.order[position - 1]) };
        let right = self.weight_of(self.order[position]);
        let gap = right.saturating_sub(left) / 2;
        self.order.insert(position, recid);

        if gap >= 1 {
            self.weights.insert(recid, left + gap);
        } else {
            let widened = left.checked_add(self.spacing).and_then(|weight| {
                self.create_space_for_new_weight(position).map(|delta| (weight, delta))
            });
            match widened {
                Some((weight, delta)) => {
                    self.weights.insert(recid, weight);
                    placement.widened = Some(Widening { from: right, delta });
                }
                None => {
                    self.renumber();
                    placement.renumbered = true;
                }
            }
        }
        placement.weight = self.weight_of(recid);
        placement
    }

    /// Remove `recid` from all three structures. Freed weights are not reclaimed.
    pub fn delete(&mut self, recid: RecId) -> Option<Weight> {
        let value = self.values.get(&recid)?;
        let pos = self.position_for(recid, value);
        let found = if self.order.get(pos) == Some(&recid) {
            Some(pos)
        } else {
            self.order.iter().position(|&r| r == recid)
        };
        if let Some(pos) = found {
            self.order.remove(pos);
        }
        self.values.remove(&recid);
        self.weights.remove(&recid)
    }

    /// Order entries the way the index orders them: by collated value, then by record id.
    pub fn sort_entries(&self, entries: &mut [(RecId, SortValue)]) {
        entries.sort_by(|a, b| self.collation.compare(&a.1, &b.1).then(a.0.cmp(&b.0)));
    }

    /// Append a record known to sort after every indexed record.
    pub fn push_sorted(&mut self, recid: RecId, value: SortValue) -> Weight {
        debug_assert!(self
            .order
            .last()
            .map_or(true, |&last| self.compare_entry(last, recid, &value) == Ordering::Less));
        let weight = (self.order.len() as Weight + 1).saturating_mul(self.spacing);
        self.values.insert(recid, value);
        self.weights.insert(recid, weight);
        self.order.push(recid);
        weight
    }

    pub fn snapshot(&self, last_updated: Timestamp) -> IndexSnapshot {
        IndexSnapshot {
            values: self.values.clone(),
            weights: self.weights.clone(),
            order: self.order.clone(),
            last_updated,
        }
    }

    pub fn into_snapshot(self, last_updated: Timestamp) -> IndexSnapshot {
        IndexSnapshot {
            values: self.values,
            weights: self.weights,
            order: self.order,
            last_updated,
        }
    }

    /// Whether the list, values and weights agree: same record set, values
    /// ascending (ties by record id) and weights strictly increasing.
    pub fn is_well_ordered(&self) -> bool {
        if self.values.len() != self.order.len() || self.weights.len() != self.order.len() {
            return false;
        }
        self.order.windows(2).all(|pair| {
            let (a, b) = (pair[0], pair[1]);
            let (Some(va), Some(vb)) = (self.values.get(&a), self.values.get(&b)) else {
                return false;
            };
            let value_order = self.collation.compare(va, vb).then(a.cmp(&b));
            value_order == Ordering::Less && self.weight_of(a) < self.weight_of(b)
        }) && self.order.iter().all(|r| self.values.contains_key(r))
    }

    fn weight_of(&self, recid: RecId) -> Weight {
        self.weights.get(&recid).copied().unwrap_or(0)
    }

    /// Compare the indexed record `other` against a candidate `(value, recid)`.
    fn compare_entry(&self, other: RecId, recid: RecId, value: &SortValue) -> Ordering {
        match self.values.get(&other) {
            Some(v) => self.collation.compare(v, value).then(other.cmp(&recid)),
            // records without a value only appear in corrupt snapshots; keep them in front
            None => Ordering::Less,
        }
    }

    fn position_for(&self, recid: RecId, value: &SortValue) -> usize {
        self.order
            .partition_point(|&other| self.compare_entry(other, recid, value) == Ordering::Less)
    }

    /// Raise the weight of every record after `position` by twice the spacing.
    /// Returns the shift, or `None` (leaving weights untouched) on overflow.
    fn create_space_for_new_weight(&mut self, position: usize) -> Option<Weight> {
        let delta = self.spacing.checked_mul(2)?;
        let tail = &self.order[position + 1..];
        if let Some(&last) = tail.last() {
            self.weight_of(last).checked_add(delta)?;
        }
        for recid in tail {
            if let Some(w) = self.weights.get_mut(recid) {
                *w += delta;
            }
        }
        tracing::debug!(position, shifted = tail.len(), delta, "widened weight gap");
        Some(delta)
    }

    fn renumber(&mut self) {
        tracing::warn!(
            records = self.order.len(),
            spacing = self.spacing,
            "weight space exhausted, renumbering"
        );
        for (i, recid) in self.order.iter().enumerate() {
            self.weights.insert(*recid, (i as Weight + 1).saturating_mul(self.spacing));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> OrderIndex {
        OrderIndex::new(8, Collation::Binary)
    }

    #[test]
    fn first_insert_gets_one_spacing() {
        let mut idx = index();
        let p = idx.insert_or_update(7, SortValue::from("x"));
        assert_eq!(p.weight, 8);
        assert_eq!(p.position, 0);
        assert_eq!(p.old_weight, None);
    }

    #[test]
    fn update_reports_old_weight() {
        let mut idx = index();
        idx.insert_or_update(1, SortValue::from(1.0));
        idx.insert_or_update(2, SortValue::from(2.0));
        let p = idx.insert_or_update(1, SortValue::from(3.0));
        assert_eq!(p.old_weight, Some(8));
        assert_eq!(idx.order(), &[2, 1]);
        assert!(idx.is_well_ordered());
    }

    #[test]
    fn delete_keeps_other_weights() {
        let mut idx = index();
        for (r, v) in [(1, 1.0), (2, 2.0), (3, 3.0)] {
            idx.insert_or_update(r, SortValue::from(v));
        }
        assert_eq!(idx.delete(2), Some(16));
        assert_eq!(idx.delete(2), None);
        assert_eq!(idx.order(), &[1, 3]);
        assert_eq!(idx.weight(3), Some(24));
    }

    #[test]
    fn append_overflow_renumbers() {
        let mut idx = OrderIndex::new(8, Collation::Binary);
        let mut snapshot = idx.snapshot(crate::now());
        snapshot.values.insert(1, SortValue::from(1.0));
        snapshot.weights.insert(1, Weight::MAX - 2);
        snapshot.order.push(1);
        idx = OrderIndex::load(snapshot, 8, Collation::Binary);

        let p = idx.insert_or_update(2, SortValue::from(2.0));
        assert!(p.renumbered);
        assert_eq!(idx.weight(1), Some(8));
        assert_eq!(idx.weight(2), Some(16));
        assert!(idx.is_well_ordered());
    }

    #[test]
    fn widening_overflow_renumbers() {
        let mut snapshot = index().snapshot(crate::now());
        let seeded = [
            (1, 1.0, Weight::MAX - 20),
            (2, 2.0, Weight::MAX - 19),
            (3, 3.0, Weight::MAX - 10),
        ];
        for (recid, value, weight) in seeded {
            snapshot.values.insert(recid, SortValue::from(value));
            snapshot.weights.insert(recid, weight);
            snapshot.order.push(recid);
        }
        let mut idx = OrderIndex::load(snapshot, 8, Collation::Binary);

        // no gap between 1 and 2, and shifting 3 up by 16 would overflow
        let p = idx.insert_or_update(4, SortValue::from(1.5));
        assert!(p.renumbered);
        assert_eq!(p.widened, None);
        assert_eq!(p.weight, 16);
        assert_eq!(idx.order(), &[1, 4, 2, 3]);
        assert_eq!(idx.weight(3), Some(32));
        assert!(idx.is_well_ordered());
    }
}
