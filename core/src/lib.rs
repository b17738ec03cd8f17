//! Incremental sort-order maintenance for record collections.
//!
//! Each configured sort method owns an [`OrderIndex`] (washed values, integer
//! weights and the ordered record list) and a [`BucketTable`] that splits the
//! ordering into disjoint roaring bitmaps. The [`Orchestrator`] decides per
//! method whether to rebuild everything or apply only the records that changed.

pub mod bucket;
pub mod config;
pub mod error;
pub mod extract;
pub mod index;
pub mod method;
pub mod orchestrator;
pub mod persist;
pub mod scheduler;
pub mod value;
pub mod view;
pub mod washer;

pub use bucket::{Bucket, BucketChange, BucketTable};
pub use config::EngineConfig;
pub use error::{
    BucketConsistencyError, ConfigError, EngineError, ExtractionError, PersistenceError, SortError,
};
pub use extract::{FieldExtractor, RankingSet, RecordCatalog, RecordEntry, RecordSource};
pub use index::{IndexSnapshot, OrderIndex, Placement, Widening};
pub use method::{FieldSource, Method, MethodCatalog, MethodRecord, MethodRegistry};
pub use orchestrator::{MethodOutcome, Orchestrator, RunMode, RunReport, RunRequest};
pub use persist::{BucketRow, MemoryGateway, MethodMeta, PersistenceGateway, SledGateway};
pub use scheduler::{LoggingScheduler, Scheduler};
pub use value::SortValue;
pub use view::{SortOrder, SortedView};
pub use washer::{Collation, ValueWasher, WasherRegistry, WasherSpec};

pub type RecId = u32;
pub type MethodId = u32;
pub type Weight = u64;
pub type Timestamp = time::OffsetDateTime;

/// Current UTC time truncated to whole seconds, the resolution stored rows carry.
pub fn now() -> Timestamp {
    let now = time::OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}
