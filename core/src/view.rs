//! Ordering a result set with a method's persisted weights and buckets.

use crate::error::SortError;
use crate::persist::PersistenceGateway;
use crate::{MethodId, RecId, Weight};
use roaring::RoaringBitmap;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Read-only copy of one method's weights and bucket bitmaps.
#[derive(Debug, Clone, Default)]
pub struct SortedView {
    weights: HashMap<RecId, Weight>,
    buckets: Vec<RoaringBitmap>,
}

impl SortedView {
    /// Fails when fewer (or more) than `expected_buckets` rows are stored, so
    /// the caller can fall back to sorting without the index.
    pub fn load(
        gateway: &dyn PersistenceGateway,
        method: MethodId,
        expected_buckets: usize,
    ) -> Result<Self, SortError> {
        let mut rows = gateway.load_buckets(method)?;
        if rows.len() != expected_buckets {
            return Err(SortError::IncompleteBuckets {
                expected: expected_buckets,
                found: rows.len(),
            });
        }
        rows.sort_by_key(|r| r.number);
        let weights = gateway.load(method)?.map(|s| s.weights).unwrap_or_default();
        Ok(Self::from_parts(weights, rows.into_iter().map(|r| r.records).collect()))
    }

    /// `buckets` must be in bucket-number order.
    pub fn from_parts(weights: HashMap<RecId, Weight>, buckets: Vec<RoaringBitmap>) -> Self {
        Self { weights, buckets }
    }

    /// Order `hits` and return at most `limit` of them.
    ///
    /// Buckets are intersected with `hits` in order until enough records are
    /// gathered; only those are sorted by weight. Hits without a weight (not
    /// indexed yet, or with no value for the method) come last, by record id.
    pub fn sort(&self, hits: &RoaringBitmap, order: SortOrder, limit: Option<usize>) -> Vec<RecId> {
        let limit = limit.unwrap_or(usize::MAX).min(hits.len() as usize);
        let buckets: Box<dyn Iterator<Item = &RoaringBitmap>> = match order {
            SortOrder::Ascending => Box::new(self.buckets.iter()),
            SortOrder::Descending => Box::new(self.buckets.iter().rev()),
        };

        let mut solution = RoaringBitmap::new();
        for bucket in buckets {
            solution |= hits & bucket;
            if solution.len() as usize >= limit {
                break;
            }
        }

        let mut weighted = Vec::with_capacity(solution.len() as usize);
        let mut missing = Vec::new();
        for recid in solution.iter() {
            match self.weights.get(&recid) {
                Some(&w) => weighted.push((w, recid)),
                // in a bucket but no longer weighted: the bucket rows lag the index
                None => missing.push(recid),
            }
        }
        weighted.sort_unstable();
        if order == SortOrder::Descending {
            weighted.reverse();
        }

        let mut out: Vec<RecId> = weighted.into_iter().map(|(_, recid)| recid).collect();
        if out.len() < limit {
            missing.extend((hits - &solution).iter());
            missing.sort_unstable();
            out.extend(missing);
        }
        out.truncate(limit);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> SortedView {
        let weights: HashMap<RecId, Weight> = (1..=6).map(|r| (r, (7 - r) as Weight * 8)).collect();
        // record 6 has the lowest weight, record 1 the highest
        let buckets = vec![[6, 5, 4].into_iter().collect(), [3, 2, 1].into_iter().collect()];
        SortedView::from_parts(weights, buckets)
    }

    #[test]
    fn ascending_with_limit_stops_early() {
        let hits: RoaringBitmap = [1, 2, 5, 6].into_iter().collect();
        assert_eq!(view().sort(&hits, SortOrder::Ascending, Some(2)), vec![6, 5]);
        assert_eq!(view().sort(&hits, SortOrder::Ascending, None), vec![6, 5, 2, 1]);
    }

    #[test]
    fn descending_and_unindexed_hits() {
        let hits: RoaringBitmap = [2, 4, 42].into_iter().collect();
        assert_eq!(view().sort(&hits, SortOrder::Descending, None), vec![2, 4, 42]);
    }
}
