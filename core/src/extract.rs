//! Raw value extraction and record change tracking.

use crate::error::ExtractionError;
use crate::method::FieldSource;
use crate::{RecId, SortValue, Timestamp};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use time::macros::format_description;

/// Pulls raw per-record values for a method definition.
///
/// Records without a value are absent from the result; the caller reads that
/// as "drop this record from the ordering".
pub trait FieldExtractor {
    fn extract(
        &self,
        source: &FieldSource,
        recids: &RoaringBitmap,
    ) -> Result<HashMap<RecId, SortValue>, ExtractionError>;
}

/// The record universe and its change feed.
pub trait RecordSource {
    fn all_recids(&self, include_deleted: bool) -> Result<RoaringBitmap, ExtractionError>;

    /// Records modified at or after `since`.
    fn modified_since(&self, since: Timestamp) -> Result<RoaringBitmap, ExtractionError>;

    /// Last update of a ranking source; `None` once the source is gone.
    fn ranking_updated_at(&self, name: &str) -> Result<Option<Timestamp>, ExtractionError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub recid: RecId,
    #[serde(with = "time::serde::rfc3339")]
    pub creation_date: Timestamp,
    /// Defaults to the creation date.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub modification_date: Option<Timestamp>,
    /// MARC-style fields, e.g. `245__a -> ["A title"]`.
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<String>>,
}

impl RecordEntry {
    pub fn modified_at(&self) -> Timestamp {
        self.modification_date.unwrap_or(self.creation_date)
    }

    /// First value of the first tag matching `pattern`.
    fn first_value(&self, pattern: &str) -> Option<&str> {
        self.fields
            .iter()
            .filter(|(tag, _)| tag_matches(pattern, tag))
            .find_map(|(_, values)| values.first())
            .map(String::as_str)
    }
}

/// Scores produced by a ranking method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingSet {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: Timestamp,
    pub scores: HashMap<RecId, f64>,
}

/// In-memory record store implementing both [`FieldExtractor`] and [`RecordSource`].
#[derive(Debug, Clone, Default)]
pub struct RecordCatalog {
    records: BTreeMap<RecId, RecordEntry>,
    field_tags: HashMap<String, Vec<String>>,
    rankings: HashMap<String, RankingSet>,
    deleted_markers: Vec<String>,
}

impl RecordCatalog {
    pub fn new(deleted_markers: Vec<String>) -> Self {
        Self { deleted_markers, ..Self::default() }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, recid: RecId) -> Option<&RecordEntry> {
        self.records.get(&recid)
    }

    /// Add or replace a record.
    pub fn upsert(&mut self, record: RecordEntry) {
        self.records.insert(record.recid, record);
    }

    pub fn remove(&mut self, recid: RecId) -> Option<RecordEntry> {
        self.records.remove(&recid)
    }

    /// Map a logical field name (`title`) to tag patterns.
    pub fn set_field_tags(&mut self, field: &str, tags: Vec<String>) {
        self.field_tags.insert(field.to_string(), tags);
    }

    pub fn upsert_ranking(&mut self, ranking: RankingSet) {
        self.rankings.insert(ranking.name.clone(), ranking);
    }

    pub fn remove_ranking(&mut self, name: &str) -> Option<RankingSet> {
        self.rankings.remove(name)
    }

    pub fn is_deleted(&self, record: &RecordEntry) -> bool {
        record
            .fields
            .iter()
            .filter(|(tag, _)| tag_matches("980__%", tag))
            .flat_map(|(_, values)| values.iter())
            .any(|v| self.deleted_markers.iter().any(|m| v.trim().eq_ignore_ascii_case(m)))
    }

    fn values_for_tags(
        &self,
        tags: &[String],
        recids: &RoaringBitmap,
    ) -> HashMap<RecId, SortValue> {
        let mut out = HashMap::new();
        let mut remaining = recids.clone();
        for tag in tags {
            if remaining.is_empty() {
                break;
            }
            let mut found = RoaringBitmap::new();
            for recid in remaining.iter() {
                if let Some(value) = self.records.get(&recid).and_then(|r| r.first_value(tag)) {
                    out.insert(recid, SortValue::Text(value.to_string()));
                    found.insert(recid);
                }
            }
            tracing::debug!(
                tag = tag.as_str(),
                queried = remaining.len(),
                found = found.len(),
                "tag queried"
            );
            remaining -= &found;
        }
        out
    }

    fn column_values(
        &self,
        column: &str,
        recids: &RoaringBitmap,
    ) -> Result<HashMap<RecId, SortValue>, ExtractionError> {
        let pick: fn(&RecordEntry) -> Timestamp = match column {
            "creation_date" => |r| r.creation_date,
            "modification_date" => |r| r.modified_at(),
            _ => return Err(ExtractionError::UnknownColumn { column: column.to_string() }),
        };
        let format = format_description!("[year][month][day][hour][minute][second]");
        let mut out = HashMap::new();
        for recid in recids.iter() {
            if let Some(record) = self.records.get(&recid) {
                let text = pick(record)
                    .format(format)
                    .map_err(|e| ExtractionError::Backend(e.to_string()))?;
                out.insert(recid, SortValue::Text(text));
            }
        }
        Ok(out)
    }
}

impl FieldExtractor for RecordCatalog {
    fn extract(
        &self,
        source: &FieldSource,
        recids: &RoaringBitmap,
    ) -> Result<HashMap<RecId, SortValue>, ExtractionError> {
        match source {
            FieldSource::MarcTags(tags) => Ok(self.values_for_tags(tags, recids)),
            FieldSource::FieldAlias(field) => match self.field_tags.get(field) {
                Some(tags) if !tags.is_empty() => Ok(self.values_for_tags(tags, recids)),
                _ => {
                    tracing::debug!(field = field.as_str(), "no tags found for field");
                    Ok(HashMap::new())
                }
            },
            FieldSource::RankingSource(name) => Ok(self
                .rankings
                .get(name)
                .map(|ranking| {
                    ranking
                        .scores
                        .iter()
                        .filter(|(recid, _)| recids.contains(**recid))
                        .map(|(&recid, &score)| (recid, SortValue::Number(score)))
                        .collect()
                })
                .unwrap_or_default()),
            FieldSource::TableColumn(column) => self.column_values(column, recids),
        }
    }
}

impl RecordSource for RecordCatalog {
    fn all_recids(&self, include_deleted: bool) -> Result<RoaringBitmap, ExtractionError> {
        Ok(self
            .records
            .values()
            .filter(|r| include_deleted || !self.is_deleted(r))
            .map(|r| r.recid)
            .collect())
    }

    fn modified_since(&self, since: Timestamp) -> Result<RoaringBitmap, ExtractionError> {
        Ok(self.records.values().filter(|r| r.modified_at() >= since).map(|r| r.recid).collect())
    }

    fn ranking_updated_at(&self, name: &str) -> Result<Option<Timestamp>, ExtractionError> {
        Ok(self.rankings.get(name).map(|r| r.last_updated))
    }
}

/// SQL `LIKE` matching: `_` is any one character, `%` any run of characters.
pub fn tag_matches(pattern: &str, tag: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = tag.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ti < t.len() {
        match p.get(pi) {
            Some('%') => {
                backtrack = Some((pi, ti));
                pi += 1;
            }
            Some(&c) if c == '_' || c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    pi = bp + 1;
                    ti = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|&c| c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record(recid: RecId, fields: &[(&str, &str)]) -> RecordEntry {
        RecordEntry {
            recid,
            creation_date: datetime!(2024-01-02 03:04:05 UTC),
            modification_date: None,
            fields: fields.iter().map(|(t, v)| (t.to_string(), vec![v.to_string()])).collect(),
        }
    }

    #[test]
    fn like_patterns() {
        assert!(tag_matches("245__a", "245__a"));
        assert!(tag_matches("245__a", "24510a"));
        assert!(tag_matches("245%", "245__b"));
        assert!(tag_matches("%a", "100__a"));
        assert!(!tag_matches("245__a", "245__b"));
        assert!(!tag_matches("245", "245__a"));
    }

    #[test]
    fn first_tag_wins_per_record() {
        let mut catalog = RecordCatalog::new(vec!["DELETED".into()]);
        catalog.upsert(record(1, &[("245__a", "Title one"), ("246__a", "Alt one")]));
        catalog.upsert(record(2, &[("246__a", "Alt two")]));
        catalog.upsert(record(3, &[("100__a", "Nobody")]));
        let recids: RoaringBitmap = [1, 2, 3].into_iter().collect();
        let source = FieldSource::MarcTags(vec!["245__a".into(), "246__a".into()]);
        let values = catalog.extract(&source, &recids).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[&1], SortValue::from("Title one"));
        assert_eq!(values[&2], SortValue::from("Alt two"));
    }

    #[test]
    fn creation_date_column() {
        let mut catalog = RecordCatalog::default();
        catalog.upsert(record(5, &[]));
        let recids: RoaringBitmap = [5].into_iter().collect();
        let values = catalog
            .extract(&FieldSource::TableColumn("creation_date".into()), &recids)
            .unwrap();
        assert_eq!(values[&5], SortValue::from("20240102030405"));
        assert!(catalog.extract(&FieldSource::TableColumn("owner".into()), &recids).is_err());
    }

    #[test]
    fn deleted_records_leave_the_universe() {
        let mut catalog = RecordCatalog::new(vec!["DELETED".into()]);
        catalog.upsert(record(1, &[("245__a", "Kept")]));
        catalog.upsert(record(2, &[("980__c", "DELETED")]));
        assert_eq!(catalog.all_recids(false).unwrap().iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(catalog.all_recids(true).unwrap().len(), 2);
    }
}
