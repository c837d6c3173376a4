use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::record::{ClusterTags, InputKey};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open input {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("cannot read input header: {0}")]
    Header(#[source] csv::Error),
    #[error("input header has no `pmid` column")]
    MissingKeyColumn,
}

const TAG_COLUMNS: [&str; 4] = [
    "lev1_cluster_id",
    "lev2_cluster_id",
    "lev3_cluster_id",
    "lev4_cluster_id",
];

/// Keys read from the cluster relation CSV, capped at `limit` data rows.
///
/// Rows that fail to parse and keys already seen earlier in the file are
/// dropped with a warning; they still count towards the cap.
pub fn read_keys(path: &Path, limit: usize) -> Result<Vec<InputKey>, SourceError> {
    let reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| SourceError::Open {
            path: path.display().to_string(),
            source,
        })?;
    let keys = collect_keys(reader, limit)?;
    info!("Loaded {} keys from {}", keys.len(), path.display());
    Ok(keys)
}

/// Same as [`read_keys`] over any reader; used for in-memory inputs.
pub fn read_keys_from<R: Read>(input: R, limit: usize) -> Result<Vec<InputKey>, SourceError> {
    let reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    collect_keys(reader, limit)
}

fn collect_keys<R: Read>(
    mut reader: csv::Reader<R>,
    limit: usize,
) -> Result<Vec<InputKey>, SourceError> {
    let headers = reader.headers().map_err(SourceError::Header)?.clone();
    let pmid_col = headers
        .iter()
        .position(|h| h == "pmid")
        .ok_or(SourceError::MissingKeyColumn)?;
    let tag_cols: Vec<Option<usize>> = TAG_COLUMNS
        .iter()
        .map(|name| headers.iter().position(|h| h == *name))
        .collect();

    let mut seen = HashSet::new();
    let mut keys = Vec::new();

    for (i, row) in reader.records().take(limit).enumerate() {
        let line = i + 2;
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping input line {}: {}", line, e);
                continue;
            }
        };
        if row.len() != headers.len() {
            warn!(
                "Skipping input line {}: expected {} columns, got {}",
                line,
                headers.len(),
                row.len()
            );
            continue;
        }
        let key = match parse_row(&row, pmid_col, &tag_cols) {
            Ok(k) => k,
            Err(reason) => {
                warn!("Skipping input line {}: {}", line, reason);
                continue;
            }
        };
        if !seen.insert(key.pmid) {
            warn!("Skipping input line {}: duplicate pmid {}", line, key.pmid);
            continue;
        }
        keys.push(key);
    }

    Ok(keys)
}

fn parse_row(
    row: &csv::StringRecord,
    pmid_col: usize,
    tag_cols: &[Option<usize>],
) -> Result<InputKey, String> {
    let raw = row.get(pmid_col).unwrap_or_default();
    let pmid = raw
        .parse::<i64>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| format!("invalid pmid {:?}", raw))?;

    let mut levels = [None; 4];
    for (slot, col) in levels.iter_mut().zip(tag_cols) {
        let Some(col) = col else { continue };
        let value = row.get(*col).unwrap_or_default();
        if value.is_empty() || value.eq_ignore_ascii_case("nan") {
            continue;
        }
        // pandas writes integer columns with NaNs as floats ("3.0", "nan")
        let parsed = value
            .parse::<i32>()
            .ok()
            .or_else(|| {
                value
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.abs() <= i32::MAX as f64)
                    .map(|f| f as i32)
            })
            .ok_or_else(|| format!("invalid cluster id {:?}", value))?;
        *slot = Some(parsed);
    }

    Ok(InputKey {
        pmid,
        tags: ClusterTags {
            lev1: levels[0],
            lev2: levels[1],
            lev3: levels[2],
            lev4: levels[3],
        },
    })
}
