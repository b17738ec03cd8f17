//! Per-method run orchestration.
//!
//! For every selected method the orchestrator picks one transition out of
//! `Idle`:
//!
//! - `Rebalancing`: no persisted data yet, a forced rebalance, a ranking
//!   source updated since the last run, a changed bucket count, or a previous
//!   run that stored the index but never committed its buckets.
//! - `Deleting`: the ranking source behind the method is gone.
//! - `IncrementalUpdating`: everything else, scoped to the supplied records
//!   or to the records modified since the method's last update.
//!
//! A method that fails ends in `Failed`; the next method runs regardless. If
//! the failure came after its index row was written, the method stays
//! uncommitted and its next run rebuilds it.

use crate::bucket::{BucketChange, BucketTable};
use crate::config::EngineConfig;
use crate::error::{EngineError, ExtractionError, Result};
use crate::extract::{FieldExtractor, RecordSource};
use crate::index::OrderIndex;
use crate::method::{FieldSource, Method, MethodRecord, MethodRegistry};
use crate::persist::PersistenceGateway;
use crate::scheduler::Scheduler;
use crate::washer::WasherRegistry;
use crate::{RecId, SortValue, Timestamp};
use roaring::RoaringBitmap;
use std::fmt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Pick rebalance, delete or incremental update per method.
    #[default]
    Update,
    /// Rebuild every selected method from scratch.
    Rebalance,
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub mode: RunMode,
    /// All registered methods when `None`.
    pub methods: Option<Vec<String>>,
    /// Records to re-examine; the modification feed when `None`.
    pub recids: Option<RoaringBitmap>,
}

impl RunRequest {
    pub fn update() -> Self {
        Self::default()
    }

    pub fn rebalance() -> Self {
        Self { mode: RunMode::Rebalance, ..Self::default() }
    }

    pub fn with_methods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_recids<I: IntoIterator<Item = RecId>>(mut self, recids: I) -> Self {
        self.recids = Some(recids.into_iter().collect());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodState {
    Idle,
    Rebalancing,
    IncrementalUpdating,
    Deleting,
    Failed,
}

#[derive(Debug)]
pub enum MethodOutcome {
    Rebalanced { records: usize, buckets: usize },
    Updated { inserted: usize, modified: usize, deleted: usize },
    /// Nothing changed; nothing was written.
    Unchanged,
    Deleted,
    /// Configuration or extraction problem; the method was not touched.
    Skipped(EngineError),
    /// Persistence or bucket consistency problem; stored rows may be stale.
    Failed(EngineError),
    Cancelled,
}

impl MethodOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, MethodOutcome::Failed(_))
    }
}

impl fmt::Display for MethodOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodOutcome::Rebalanced { records, buckets } => {
                write!(f, "rebalanced {records} records into {buckets} buckets")
            }
            MethodOutcome::Updated { inserted, modified, deleted } => {
                write!(f, "updated: {inserted} inserted, {modified} modified, {deleted} deleted")
            }
            MethodOutcome::Unchanged => f.write_str("unchanged"),
            MethodOutcome::Deleted => f.write_str("data deleted"),
            MethodOutcome::Skipped(e) => write!(f, "skipped: {e}"),
            MethodOutcome::Failed(e) => write!(f, "failed: {e}"),
            MethodOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Outcome of every method touched by one run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<(String, MethodOutcome)>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn outcome(&self, method: &str) -> Option<&MethodOutcome> {
        self.outcomes.iter().find(|(name, _)| name == method).map(|(_, o)| o)
    }

    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter(|(_, o)| o.is_failure()).map(|(name, _)| name.as_str())
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed().next().is_none()
    }
}

pub struct Orchestrator<'a> {
    registry: &'a dyn MethodRegistry,
    records: &'a dyn RecordSource,
    extractor: &'a dyn FieldExtractor,
    gateway: &'a dyn PersistenceGateway,
    washers: WasherRegistry,
    config: EngineConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        registry: &'a dyn MethodRegistry,
        records: &'a dyn RecordSource,
        extractor: &'a dyn FieldExtractor,
        gateway: &'a dyn PersistenceGateway,
        config: EngineConfig,
    ) -> Self {
        Self { registry, records, extractor, gateway, washers: WasherRegistry::default(), config }
    }

    pub fn with_washers(mut self, washers: WasherRegistry) -> Self {
        self.washers = washers;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn run(&self, request: &RunRequest, scheduler: &mut dyn Scheduler) -> RunReport {
        let mut report = RunReport::default();
        let rows = match self.registry.methods(request.methods.as_deref()) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "could not read sorting methods");
                report.outcomes.push(("*".to_string(), MethodOutcome::Failed(e.into())));
                return report;
            }
        };
        if let Some(names) = &request.methods {
            for name in names.iter().filter(|n| !rows.iter().any(|r| &r.name == *n)) {
                warn!(method = name.as_str(), "no information for method");
                let e = crate::error::ConfigError::UnknownMethod { name: name.clone() };
                report.outcomes.push((name.clone(), MethodOutcome::Skipped(e.into())));
            }
        }
        if rows.is_empty() {
            info!("no sorting methods to run");
            return report;
        }
        info!(methods = rows.len(), mode = ?request.mode, "sorting run started");

        let mut universe = None;
        for (i, row) in rows.iter().enumerate() {
            if scheduler.checkpoint().is_break() {
                report.cancel(&rows[i..]);
                break;
            }
            let outcome = match self.run_method(row, request, scheduler, &mut universe) {
                Ok(outcome) => outcome,
                Err(EngineError::Cancelled) => {
                    report.cancel(&rows[i..]);
                    break;
                }
                Err(e @ (EngineError::Config(_) | EngineError::Extraction(_))) => {
                    warn!(method = row.name.as_str(), error = %e, "method skipped");
                    MethodOutcome::Skipped(e)
                }
                Err(e) => {
                    error!(
                        method = row.name.as_str(),
                        error = %e,
                        state = ?MethodState::Failed,
                        "method could not be executed correctly"
                    );
                    MethodOutcome::Failed(e)
                }
            };
            info!(method = row.name.as_str(), outcome = %outcome, "method done");
            report.outcomes.push((row.name.clone(), outcome));
        }
        scheduler.report_progress("Sorting run done.");
        report
    }

    fn run_method(
        &self,
        row: &MethodRecord,
        request: &RunRequest,
        scheduler: &mut dyn Scheduler,
        universe: &mut Option<RoaringBitmap>,
    ) -> Result<MethodOutcome> {
        let mut method = Method::from_record(row)?;
        self.washers.check(&method.washer)?;
        let meta = self.gateway.meta(method.id)?;
        method.last_updated = meta.map(|m| m.last_updated);

        let mode = match meta {
            Some(meta) if !meta.committed => {
                warn!(
                    method = method.name.as_str(),
                    "previous run stopped between index and bucket writes, rebuilding"
                );
                RunMode::Rebalance
            }
            _ => request.mode,
        };
        let state = self.plan(&method, mode)?;
        info!(method = method.name.as_str(), ?state, "method transition");
        match state {
            MethodState::Rebalancing => self.rebalance(&method, scheduler, universe),
            MethodState::IncrementalUpdating => {
                self.update(&method, request.recids.as_ref(), scheduler, universe)
            }
            MethodState::Deleting => self.delete(&method, scheduler),
            MethodState::Idle | MethodState::Failed => Ok(MethodOutcome::Unchanged),
        }
    }

    /// Choose the transition for a method at the start of its run.
    pub fn plan(&self, method: &Method, mode: RunMode) -> Result<MethodState> {
        if let FieldSource::RankingSource(name) = &method.source {
            match self.records.ranking_updated_at(name)? {
                None if method.last_updated.is_some() => return Ok(MethodState::Deleting),
                None => return Err(ExtractionError::NoData { method: method.name.clone() }.into()),
                Some(ranked) => {
                    let stale = method.last_updated.is_some_and(|last| ranked >= last);
                    if mode == RunMode::Update && stale {
                        return Ok(MethodState::Rebalancing);
                    }
                }
            }
        }
        if mode == RunMode::Rebalance || method.last_updated.is_none() {
            return Ok(MethodState::Rebalancing);
        }
        Ok(MethodState::IncrementalUpdating)
    }

    fn rebalance(
        &self,
        method: &Method,
        scheduler: &mut dyn Scheduler,
        universe: &mut Option<RoaringBitmap>,
    ) -> Result<MethodOutcome> {
        scheduler.report_progress(&format!("Rebalancing {} method.", method.name));
        let universe = self.universe(universe)?;
        info!(method = method.name.as_str(), records = universe.len(), "rebalancing");

        let mut values = self.extractor.extract(&method.source, universe)?;
        if values.is_empty() {
            return Err(ExtractionError::NoData { method: method.name.clone() }.into());
        }
        self.washers.wash_all(&method.washer, &mut values)?;

        let mut entries: Vec<(RecId, SortValue)> = values.into_iter().collect();
        let mut index = OrderIndex::with_capacity(
            entries.len(),
            self.config.spacing,
            method.washer.collation(),
        );
        index.sort_entries(&mut entries);
        let interval = self.config.checkpoint_interval.max(1);
        for (i, (recid, value)) in entries.into_iter().enumerate() {
            if i > 0 && i % interval == 0 && scheduler.checkpoint().is_break() {
                info!(method = method.name.as_str(), assigned = i, "rebalance interrupted");
                return Err(EngineError::Cancelled);
            }
            index.push_sorted(recid, value);
        }

        let now = crate::now();
        let mut buckets = BucketTable::build(index.order(), index.weights(), self.config.buckets);
        let records = index.len();
        self.gateway.store(method.id, &index.into_snapshot(now))?;
        self.persist_buckets(method, &mut buckets, now)?;
        self.gateway.truncate_buckets(method.id, buckets.len() as u32)?;
        self.gateway.commit(method.id)?;
        debug!(
            method = method.name.as_str(),
            bucketed = buckets.total_records(),
            "buckets persisted"
        );
        Ok(MethodOutcome::Rebalanced { records, buckets: buckets.len() })
    }

    fn update(
        &self,
        method: &Method,
        explicit: Option<&RoaringBitmap>,
        scheduler: &mut dyn Scheduler,
        universe: &mut Option<RoaringBitmap>,
    ) -> Result<MethodOutcome> {
        let Some(snapshot) = self.gateway.load(method.id)? else {
            return self.rebalance(method, scheduler, universe);
        };
        let (scope, stamp) = match explicit {
            // explicit records keep the old timestamp so the next scan misses nothing
            Some(recids) => (recids.clone(), snapshot.last_updated),
            None => {
                let now = crate::now();
                (self.records.modified_since(snapshot.last_updated)?, now)
            }
        };
        if scope.is_empty() {
            debug!(method = method.name.as_str(), "no records modified since the last update");
            return Ok(MethodOutcome::Unchanged);
        }

        let rows = self.gateway.load_buckets(method.id)?;
        if rows.len() != self.config.buckets {
            info!(
                method = method.name.as_str(),
                stored = rows.len(),
                configured = self.config.buckets,
                "bucket count changed"
            );
            return self.rebalance(method, scheduler, universe);
        }
        let mut buckets = BucketTable::from_rows(method.id, rows)?;

        scheduler.report_progress(&format!("Updating method {}", method.name));
        let live = &scope & self.universe(universe)?;
        let mut values = self.extractor.extract(&method.source, &live)?;
        if values.is_empty() {
            warn!(
                method = method.name.as_str(),
                records = scope.len(),
                "no data for the modified records"
            );
        }
        self.washers.wash_all(&method.washer, &mut values)?;

        let mut index = OrderIndex::load(snapshot, self.config.spacing, method.washer.collation());
        let deleted: Vec<RecId> = scope
            .iter()
            .filter(|r| !values.contains_key(r) && index.contains(*r))
            .collect();
        let mut entries: Vec<(RecId, SortValue)> = values.into_iter().collect();
        entries.sort_unstable_by_key(|(recid, _)| *recid);
        let mut modified = Vec::new();
        let mut inserted = Vec::new();
        for (recid, value) in entries {
            match index.value(recid) {
                Some(old) if *old == value => {}
                Some(_) => modified.push((recid, value)),
                None => inserted.push((recid, value)),
            }
        }
        if modified.is_empty() && inserted.is_empty() && deleted.is_empty() {
            debug!(method = method.name.as_str(), "values unchanged");
            return Ok(MethodOutcome::Unchanged);
        }
        debug!(
            method = method.name.as_str(),
            modified = modified.len(),
            inserted = inserted.len(),
            deleted = deleted.len(),
            "applying record changes"
        );

        let outcome = MethodOutcome::Updated {
            inserted: inserted.len(),
            modified: modified.len(),
            deleted: deleted.len(),
        };
        let mut changes = Vec::new();
        let mut renumbered = false;
        for (recid, value) in modified.into_iter().chain(inserted) {
            let placement = index.insert_or_update(recid, value);
            renumbered |= placement.renumbered;
            BucketChange::from_placement(&placement, &mut changes);
        }
        for recid in deleted {
            if let Some(weight) = index.delete(recid) {
                changes.push(BucketChange::removal(recid, weight));
            }
        }

        self.gateway.store(method.id, &index.snapshot(stamp))?;
        if renumbered {
            buckets = BucketTable::build(index.order(), index.weights(), self.config.buckets);
        } else {
            buckets.update(&changes);
        }
        self.persist_buckets(method, &mut buckets, stamp)?;
        self.gateway.commit(method.id)?;
        Ok(outcome)
    }

    fn delete(&self, method: &Method, scheduler: &mut dyn Scheduler) -> Result<MethodOutcome> {
        scheduler.report_progress(&format!("Deleting data for method {}", method.name));
        self.gateway.delete_method(method.id)?;
        Ok(MethodOutcome::Deleted)
    }

    fn persist_buckets(
        &self,
        method: &Method,
        buckets: &mut BucketTable,
        stamp: Timestamp,
    ) -> Result<()> {
        for row in buckets.take_dirty_rows(stamp) {
            self.gateway.store_bucket(method.id, &row)?;
        }
        Ok(())
    }

    fn universe<'u>(
        &self,
        cache: &'u mut Option<RoaringBitmap>,
    ) -> Result<&'u RoaringBitmap, ExtractionError> {
        let universe = match cache.take() {
            Some(universe) => universe,
            None => self.records.all_recids(self.config.include_deleted)?,
        };
        Ok(cache.insert(universe))
    }
}

impl RunReport {
    fn cancel(&mut self, remaining: &[MethodRecord]) {
        self.cancelled = true;
        for row in remaining {
            self.outcomes.push((row.name.clone(), MethodOutcome::Cancelled));
        }
    }
}
