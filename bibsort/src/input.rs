//! Loading record dumps, ranking sets and field aliases from JSON files.

use anyhow::{bail, Context, Result};
use bibsort_core::{RankingSet, RecId, RecordCatalog, RecordEntry};
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every `.json` / `.jsonl` file under `input`, or `input` itself.
fn input_files(input: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            let ext = p.extension().and_then(|s| s.to_str());
            if p.is_file() && matches!(ext, Some("json" | "jsonl")) {
                files.push(p.to_path_buf());
            }
        }
    } else if input.is_file() {
        files.push(input.to_path_buf());
    }
    files
}

/// Read records into `catalog`. A JSON file holds one record or an array of
/// them; a JSONL file holds one record per line.
pub fn load_records(input: &Path, catalog: &mut RecordCatalog) -> Result<usize> {
    let mut loaded = 0;
    for file in input_files(input) {
        let handle = File::open(&file).with_context(|| format!("opening {}", file.display()))?;
        let reader = BufReader::new(handle);
        if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: RecordEntry = serde_json::from_str(&line)
                    .with_context(|| format!("{}:{}: bad record", file.display(), n + 1))?;
                catalog.upsert(record);
                loaded += 1;
            }
        } else {
            let json: serde_json::Value = serde_json::from_reader(reader)
                .with_context(|| format!("parsing {}", file.display()))?;
            let records: Vec<RecordEntry> = match json {
                serde_json::Value::Array(_) => serde_json::from_value(json)?,
                serde_json::Value::Object(_) => vec![serde_json::from_value(json)?],
                _ => Vec::new(),
            };
            loaded += records.len();
            for record in records {
                catalog.upsert(record);
            }
        }
    }
    tracing::info!(records = loaded, input = %input.display(), "records loaded");
    Ok(loaded)
}

/// A JSON array of ranking sets.
pub fn load_rankings(path: &Path, catalog: &mut RecordCatalog) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let rankings: Vec<RankingSet> = serde_json::from_reader(BufReader::new(file))?;
    for ranking in rankings {
        tracing::debug!(
            ranking = ranking.name.as_str(),
            scores = ranking.scores.len(),
            "ranking loaded"
        );
        catalog.upsert_ranking(ranking);
    }
    Ok(())
}

/// A JSON object mapping field names to tag patterns, e.g. `{"title": ["245__a"]}`.
pub fn load_fields(path: &Path, catalog: &mut RecordCatalog) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let fields: HashMap<String, Vec<String>> = serde_json::from_reader(BufReader::new(file))?;
    for (field, tags) in fields {
        catalog.set_field_tags(&field, tags);
    }
    Ok(())
}

/// Parse `1,5-9,12` into a bitmap.
pub fn parse_recids(raw: &str) -> Result<RoaringBitmap> {
    let mut recids = RoaringBitmap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let bound = |raw: &str| -> Result<RecId> {
                    raw.trim().parse().with_context(|| format!("bad record id in {part:?}"))
                };
                let (lo, hi) = (bound(lo)?, bound(hi)?);
                if lo > hi {
                    bail!("empty record range {part:?}");
                }
                recids.insert_range(lo..=hi);
            }
            None => {
                recids.insert(part.parse().with_context(|| format!("bad record id {part:?}"))?);
            }
        }
    }
    Ok(recids)
}
