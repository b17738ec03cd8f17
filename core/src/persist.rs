use crate::error::PersistenceError;
use crate::index::IndexSnapshot;
use crate::{MethodId, Timestamp, Weight};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use sled::transaction::{TransactionError, TransactionResult};
use sled::Transactional;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// One persisted bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRow {
    pub number: u32,
    pub records: RoaringBitmap,
    pub boundary: Weight,
    pub last_updated: Timestamp,
}

/// Bookkeeping row written next to a method's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodMeta {
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: Timestamp,
    /// Cleared when the index row is written, set once every bucket row of
    /// the same run is stored. A method left uncommitted must be rebuilt.
    pub committed: bool,
}

/// Storage of index snapshots and bucket rows. Every write replaces one
/// logical row as a whole.
pub trait PersistenceGateway {
    fn load(&self, method: MethodId) -> Result<Option<IndexSnapshot>, PersistenceError>;

    /// Write the index row together with an uncommitted [`MethodMeta`]
    /// stamped with `snapshot.last_updated`.
    fn store(&self, method: MethodId, snapshot: &IndexSnapshot) -> Result<(), PersistenceError>;

    fn load_buckets(&self, method: MethodId) -> Result<Vec<BucketRow>, PersistenceError>;

    fn store_bucket(&self, method: MethodId, row: &BucketRow) -> Result<(), PersistenceError>;

    /// Drop bucket rows numbered above `keep`.
    fn truncate_buckets(&self, method: MethodId, keep: u32) -> Result<(), PersistenceError>;

    /// Drop the index row, the meta row and every bucket row of a method.
    fn delete_method(&self, method: MethodId) -> Result<(), PersistenceError>;

    fn meta(&self, method: MethodId) -> Result<Option<MethodMeta>, PersistenceError>;

    /// Mark the last stored index row and its buckets as consistent. A no-op
    /// for a method with no meta row.
    fn commit(&self, method: MethodId) -> Result<(), PersistenceError>;

    /// When the method's index row was last written.
    fn last_updated(&self, method: MethodId) -> Result<Option<Timestamp>, PersistenceError> {
        Ok(self.meta(method)?.map(|m| m.last_updated))
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedBucket {
    boundary: Weight,
    #[serde(with = "time::serde::rfc3339")]
    last_updated: Timestamp,
    bitmap: Vec<u8>,
}

fn encode_bucket(row: &BucketRow) -> Result<Vec<u8>, PersistenceError> {
    let mut bitmap = Vec::with_capacity(row.records.serialized_size());
    row.records.serialize_into(&mut bitmap).map_err(|e| PersistenceError::Backend(e.to_string()))?;
    let encoded = EncodedBucket { boundary: row.boundary, last_updated: row.last_updated, bitmap };
    Ok(bincode::serialize(&encoded)?)
}

fn decode_bucket(
    method: MethodId,
    number: u32,
    bytes: &[u8],
) -> Result<BucketRow, PersistenceError> {
    let encoded: EncodedBucket = bincode::deserialize(bytes)?;
    let records = RoaringBitmap::deserialize_from(&encoded.bitmap[..])
        .map_err(|source| PersistenceError::Bitmap { method, bucket: number, source })?;
    Ok(BucketRow {
        number,
        records,
        boundary: encoded.boundary,
        last_updated: encoded.last_updated,
    })
}

fn bucket_key(method: MethodId, number: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&method.to_be_bytes());
    key[4..].copy_from_slice(&number.to_be_bytes());
    key
}

/// Gateway backed by a sled database with one tree per row kind.
pub struct SledGateway {
    db: sled::Db,
    methoddata: sled::Tree,
    meta: sled::Tree,
    buckets: sled::Tree,
}

impl SledGateway {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, PersistenceError> {
        let methoddata = db.open_tree("methoddata")?;
        let meta = db.open_tree("methodmeta")?;
        let buckets = db.open_tree("buckets")?;
        Ok(Self { db, methoddata, meta, buckets })
    }

    /// Ids of every method with a stored index.
    pub fn methods(&self) -> Result<Vec<MethodId>, PersistenceError> {
        let mut ids = Vec::new();
        for item in self.meta.iter() {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 4]>::try_from(&key[..]) {
                ids.push(MethodId::from_be_bytes(bytes));
            }
        }
        Ok(ids)
    }

    fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }
}

impl PersistenceGateway for SledGateway {
    fn load(&self, method: MethodId) -> Result<Option<IndexSnapshot>, PersistenceError> {
        match self.methoddata.get(method.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store(&self, method: MethodId, snapshot: &IndexSnapshot) -> Result<(), PersistenceError> {
        let key = method.to_be_bytes();
        let bytes = bincode::serialize(snapshot)?;
        let meta = MethodMeta { last_updated: snapshot.last_updated, committed: false };
        let meta = bincode::serialize(&meta)?;
        let trees = (&self.methoddata, &self.meta);
        let written: TransactionResult<()> = trees.transaction(|(data, meta_tree)| {
            data.insert(&key[..], bytes.as_slice())?;
            meta_tree.insert(&key[..], meta.as_slice())?;
            Ok(())
        });
        written.map_err(|e| match e {
            TransactionError::Storage(e) => PersistenceError::Storage(e),
            TransactionError::Abort(()) => {
                PersistenceError::Backend(format!("index write for method {method} aborted"))
            }
        })?;
        self.flush()?;
        tracing::debug!(method, records = snapshot.order.len(), "index row stored");
        Ok(())
    }

    fn load_buckets(&self, method: MethodId) -> Result<Vec<BucketRow>, PersistenceError> {
        let mut rows = Vec::new();
        for item in self.buckets.scan_prefix(method.to_be_bytes()) {
            let (key, value) = item?;
            let number = key
                .get(4..8)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map(u32::from_be_bytes)
                .ok_or_else(|| {
                    PersistenceError::Backend(format!("malformed bucket key for method {method}"))
                })?;
            rows.push(decode_bucket(method, number, &value)?);
        }
        Ok(rows)
    }

    fn store_bucket(&self, method: MethodId, row: &BucketRow) -> Result<(), PersistenceError> {
        let bytes = encode_bucket(row)?;
        self.buckets.insert(bucket_key(method, row.number), bytes)?;
        self.flush()?;
        tracing::debug!(
            method,
            bucket = row.number,
            records = row.records.len(),
            "bucket row stored"
        );
        Ok(())
    }

    fn truncate_buckets(&self, method: MethodId, keep: u32) -> Result<(), PersistenceError> {
        let start = bucket_key(method, keep.saturating_add(1));
        let end = bucket_key(method, u32::MAX);
        let mut batch = sled::Batch::default();
        for item in self.buckets.range(start..=end) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.buckets.apply_batch(batch)?;
        self.flush()
    }

    fn delete_method(&self, method: MethodId) -> Result<(), PersistenceError> {
        self.methoddata.remove(method.to_be_bytes())?;
        self.meta.remove(method.to_be_bytes())?;
        let mut batch = sled::Batch::default();
        for item in self.buckets.scan_prefix(method.to_be_bytes()) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.buckets.apply_batch(batch)?;
        self.flush()
    }

    fn meta(&self, method: MethodId) -> Result<Option<MethodMeta>, PersistenceError> {
        match self.meta.get(method.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn commit(&self, method: MethodId) -> Result<(), PersistenceError> {
        let Some(mut meta) = self.meta(method)? else { return Ok(()) };
        meta.committed = true;
        self.meta.insert(method.to_be_bytes(), bincode::serialize(&meta)?)?;
        self.flush()
    }
}

/// In-process gateway.
#[derive(Default)]
pub struct MemoryGateway {
    indexes: RwLock<HashMap<MethodId, IndexSnapshot>>,
    metas: RwLock<HashMap<MethodId, MethodMeta>>,
    buckets: RwLock<HashMap<MethodId, BTreeMap<u32, BucketRow>>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceGateway for MemoryGateway {
    fn load(&self, method: MethodId) -> Result<Option<IndexSnapshot>, PersistenceError> {
        Ok(self.indexes.read().get(&method).cloned())
    }

    fn store(&self, method: MethodId, snapshot: &IndexSnapshot) -> Result<(), PersistenceError> {
        self.indexes.write().insert(method, snapshot.clone());
        let meta = MethodMeta { last_updated: snapshot.last_updated, committed: false };
        self.metas.write().insert(method, meta);
        Ok(())
    }

    fn load_buckets(&self, method: MethodId) -> Result<Vec<BucketRow>, PersistenceError> {
        Ok(self
            .buckets
            .read()
            .get(&method)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn store_bucket(&self, method: MethodId, row: &BucketRow) -> Result<(), PersistenceError> {
        self.buckets.write().entry(method).or_default().insert(row.number, row.clone());
        Ok(())
    }

    fn truncate_buckets(&self, method: MethodId, keep: u32) -> Result<(), PersistenceError> {
        if let Some(rows) = self.buckets.write().get_mut(&method) {
            rows.retain(|&number, _| number <= keep);
        }
        Ok(())
    }

    fn delete_method(&self, method: MethodId) -> Result<(), PersistenceError> {
        self.indexes.write().remove(&method);
        self.metas.write().remove(&method);
        self.buckets.write().remove(&method);
        Ok(())
    }

    fn meta(&self, method: MethodId) -> Result<Option<MethodMeta>, PersistenceError> {
        Ok(self.metas.read().get(&method).copied())
    }

    fn commit(&self, method: MethodId) -> Result<(), PersistenceError> {
        if let Some(meta) = self.metas.write().get_mut(&method) {
            meta.committed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_keys_sort_by_method_then_number() {
        assert!(bucket_key(1, 2) < bucket_key(1, 10));
        assert!(bucket_key(1, u32::MAX) < bucket_key(2, 0));
    }

    #[test]
    fn memory_truncate_keeps_low_numbers() {
        let gw = MemoryGateway::new();
        for number in 1..=4 {
            let row = BucketRow {
                number,
                records: RoaringBitmap::new(),
                boundary: 0,
                last_updated: crate::now(),
            };
            gw.store_bucket(9, &row).unwrap();
        }
        gw.truncate_buckets(9, 2).unwrap();
        let numbers: Vec<u32> = gw.load_buckets(9).unwrap().iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn memory_commit_marks_the_stored_index() {
        let gw = MemoryGateway::new();
        let snapshot = crate::OrderIndex::new(8, crate::Collation::Binary).snapshot(crate::now());
        gw.store(4, &snapshot).unwrap();
        let expected = MethodMeta { last_updated: snapshot.last_updated, committed: false };
        assert_eq!(gw.meta(4).unwrap(), Some(expected));
        gw.commit(4).unwrap();
        assert_eq!(gw.meta(4).unwrap().map(|m| m.committed), Some(true));
        gw.delete_method(4).unwrap();
        assert!(gw.meta(4).unwrap().is_none());
    }
}
