//! Error types for the sort engine.
//!
//! Every failure is scoped to a single method: the orchestrator records it in
//! the run report and moves on to the next method.

use crate::MethodId;
use std::path::PathBuf;
use thiserror::Error;

/// No usable raw data could be obtained for a method.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("sorting method {method} has no data")]
    NoData { method: String },

    #[error("record column {column} is not available for sorting")]
    UnknownColumn { column: String },

    #[error("field extraction failed: {0}")]
    Backend(String),
}

/// Reading or writing persisted index and bucket rows failed.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("bitmap for method {method} bucket {bucket} is unreadable: {source}")]
    Bitmap {
        method: MethodId,
        bucket: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("persistence backend error: {0}")]
    Backend(String),
}

/// A method definition, washer or engine setting could not be understood.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown definition {definition:?}, expected MARC:, FIELD:, RNK: or BIBREC:")]
    UnknownDefinition { definition: String },

    #[error("definition {definition:?} names no source")]
    EmptyDefinition { definition: String },

    #[error("invalid MARC tag {tag:?}")]
    InvalidTag { tag: String },

    #[error("washer {name:?} is not implemented")]
    UnknownWasher { name: String },

    #[error("no sorting method called {name:?}")]
    UnknownMethod { name: String },

    #[error("a sorting method called {name:?} already exists")]
    DuplicateMethod { name: String },

    #[error("invalid engine setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted bucket rows do not describe a usable partition.
#[derive(Debug, Error)]
pub enum BucketConsistencyError {
    #[error("no bucket data found for method {method}")]
    Missing { method: MethodId },

    #[error("bucket gap for method {method}: expected {expected}, found {found}")]
    Gap { method: MethodId, expected: u32, found: u32 },
}

/// Sorting a hit set through the buckets is not possible.
#[derive(Debug, Error)]
pub enum SortError {
    #[error("only {found} of {expected} buckets are built")]
    IncompleteBuckets { expected: usize, found: usize },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Failure of one method's run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    BucketConsistency(#[from] BucketConsistencyError),

    #[error("run cancelled at a checkpoint")]
    Cancelled,
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
