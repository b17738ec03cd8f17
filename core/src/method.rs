//! Sort method definitions and the registry that lists them.

use crate::error::ConfigError;
use crate::washer::WasherSpec;
use crate::{MethodId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where a method's raw values come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    /// MARC tags tried in order, first present value wins (`MARC: 245__a,100__a`).
    MarcTags(Vec<String>),
    /// A logical field resolved to tags by the record store (`FIELD: title`).
    FieldAlias(String),
    /// Scores of a ranking method (`RNK: citations`).
    RankingSource(String),
    /// A record-level column (`BIBREC: creation_date`).
    TableColumn(String),
}

impl FromStr for FieldSource {
    type Err = ConfigError;

    fn from_str(definition: &str) -> Result<Self, Self::Err> {
        let Some((kind, rest)) = definition.split_once(':') else {
            return Err(ConfigError::UnknownDefinition { definition: definition.to_string() });
        };
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(ConfigError::EmptyDefinition { definition: definition.to_string() });
        }
        match kind.trim().to_ascii_uppercase().as_str() {
            "MARC" => {
                let tags: Vec<String> = rest
                    .split(',')
                    .map(|t| t.trim().replace(' ', ""))
                    .filter(|t| !t.is_empty())
                    .collect();
                if tags.is_empty() {
                    return Err(ConfigError::EmptyDefinition { definition: definition.to_string() });
                }
                for tag in &tags {
                    validate_tag(tag)?;
                }
                Ok(FieldSource::MarcTags(tags))
            }
            "FIELD" => Ok(FieldSource::FieldAlias(rest.to_string())),
            "RNK" => Ok(FieldSource::RankingSource(rest.to_string())),
            "BIBREC" => Ok(FieldSource::TableColumn(rest.to_string())),
            _ => Err(ConfigError::UnknownDefinition { definition: definition.to_string() }),
        }
    }
}

impl fmt::Display for FieldSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldSource::MarcTags(tags) => write!(f, "MARC: {}", tags.join(",")),
            FieldSource::FieldAlias(name) => write!(f, "FIELD: {name}"),
            FieldSource::RankingSource(name) => write!(f, "RNK: {name}"),
            FieldSource::TableColumn(name) => write!(f, "BIBREC: {name}"),
        }
    }
}

/// Tags start with two digits (`245__a`, `100%`).
fn validate_tag(tag: &str) -> Result<(), ConfigError> {
    let bytes = tag.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_digit() && bytes[1].is_ascii_digit() {
        Ok(())
    } else {
        Err(ConfigError::InvalidTag { tag: tag.to_string() })
    }
}

/// A method row as the registry stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRecord {
    pub id: MethodId,
    pub name: String,
    pub definition: String,
    #[serde(default)]
    pub washer: Option<String>,
}

/// A parsed, runnable sort method.
#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    pub id: MethodId,
    pub name: String,
    pub source: FieldSource,
    pub washer: WasherSpec,
    /// Time of the last successful write of this method's index.
    pub last_updated: Option<Timestamp>,
}

impl Method {
    pub fn from_record(record: &MethodRecord) -> Result<Self, ConfigError> {
        let source = record.definition.parse()?;
        let washer = match &record.washer {
            Some(raw) => raw.parse::<WasherSpec>().unwrap_or_default(),
            None => WasherSpec::identity(),
        };
        Ok(Self { id: record.id, name: record.name.clone(), source, washer, last_updated: None })
    }
}

/// Read-only view of the configured sort methods.
pub trait MethodRegistry {
    /// All methods, or only those named. Unknown names are left out; the
    /// caller compares against its request.
    fn methods(&self, names: Option<&[String]>) -> Result<Vec<MethodRecord>, ConfigError>;
}

/// Methods kept in a JSON file.
#[derive(Debug, Clone, Default)]
pub struct MethodCatalog {
    path: Option<PathBuf>,
    records: Vec<MethodRecord>,
}

impl MethodCatalog {
    pub fn new(records: Vec<MethodRecord>) -> Self {
        Self { path: None, records }
    }

    /// Load the catalog; a missing file is an empty catalog.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|source| ConfigError::Parse { path: path.clone(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        Ok(Self { path: Some(path), records })
    }

    pub fn records(&self) -> &[MethodRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<&MethodRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Register a new method; the definition is validated before it is stored.
    pub fn add(
        &mut self,
        name: &str,
        definition: &str,
        washer: Option<&str>,
    ) -> Result<&MethodRecord, ConfigError> {
        if self.get(name).is_some() {
            return Err(ConfigError::DuplicateMethod { name: name.to_string() });
        }
        let source: FieldSource = definition.parse()?;
        let id = self.records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        self.records.push(MethodRecord {
            id,
            name: name.to_string(),
            definition: source.to_string(),
            washer: washer.map(str::to_string),
        });
        tracing::info!(method = name, id, "sorting method added");
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn remove(&mut self, name: &str) -> Result<MethodRecord, ConfigError> {
        let pos = self
            .records
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| ConfigError::UnknownMethod { name: name.to_string() })?;
        Ok(self.records.remove(pos))
    }

    /// Write the catalog back to the file it was opened from.
    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else { return Ok(()) };
        let json = serde_json::to_string_pretty(&self.records)
            .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        let mut f =
            File::create(path).map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        f.write_all(json.as_bytes())
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        Ok(())
    }
}

impl MethodRegistry for MethodCatalog {
    fn methods(&self, names: Option<&[String]>) -> Result<Vec<MethodRecord>, ConfigError> {
        Ok(match names {
            None => self.records.clone(),
            Some(names) => names.iter().filter_map(|n| self.get(n).cloned()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_definition_kind() {
        assert_eq!(
            "MARC: 245__a, 100__a".parse::<FieldSource>().unwrap(),
            FieldSource::MarcTags(vec!["245__a".into(), "100__a".into()])
        );
        assert_eq!(
            "FIELD: title".parse::<FieldSource>().unwrap(),
            FieldSource::FieldAlias("title".into())
        );
        assert_eq!(
            "RNK:citations".parse::<FieldSource>().unwrap(),
            FieldSource::RankingSource("citations".into())
        );
        assert_eq!(
            "BIBREC: creation_date".parse::<FieldSource>().unwrap(),
            FieldSource::TableColumn("creation_date".into())
        );
    }

    #[test]
    fn rejects_malformed_definitions() {
        assert!(matches!(
            "TITLE: x".parse::<FieldSource>(),
            Err(ConfigError::UnknownDefinition { .. })
        ));
        assert!(matches!(
            "245__a".parse::<FieldSource>(),
            Err(ConfigError::UnknownDefinition { .. })
        ));
        assert!(matches!("MARC: ab_c".parse::<FieldSource>(), Err(ConfigError::InvalidTag { .. })));
        assert!(matches!(
            "RNK:  ".parse::<FieldSource>(),
            Err(ConfigError::EmptyDefinition { .. })
        ));
    }

    #[test]
    fn display_round_trips() {
        let src = FieldSource::MarcTags(vec!["245__a".into(), "246__a".into()]);
        assert_eq!(src.to_string().parse::<FieldSource>().unwrap(), src);
    }

    #[test]
    fn catalog_assigns_ids_and_rejects_duplicates() {
        let mut catalog = MethodCatalog::default();
        assert_eq!(catalog.add("title", "FIELD: title", None).unwrap().id, 1);
        assert_eq!(catalog.add("latest first", "BIBREC: creation_date", None).unwrap().id, 2);
        assert!(matches!(
            catalog.add("title", "FIELD: title", None),
            Err(ConfigError::DuplicateMethod { .. })
        ));
        assert!(catalog.add("bad", "MARC: x", None).is_err());
        catalog.remove("title").unwrap();
        assert_eq!(catalog.add("author", "FIELD: author", None).unwrap().id, 3);
    }

    #[test]
    fn registry_filters_by_name() {
        let mut catalog = MethodCatalog::default();
        catalog.add("title", "FIELD: title", None).unwrap();
        catalog.add("author", "FIELD: author", None).unwrap();
        let wanted = vec!["author".to_string(), "missing".to_string()];
        let rows = catalog.methods(Some(&wanted)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "author");
    }
}
