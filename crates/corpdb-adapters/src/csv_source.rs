//! CSV exports → candidate records.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use corpdb_core::{CandidateRecord, SourceRef};
use serde::Serialize;
use tracing::{debug, info};

use crate::{AdapterError, CandidateAssembler};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CsvFileStats {
    pub rows: usize,
    pub candidates: usize,
    /// Rows with neither a name nor a corporate number.
    pub skipped_no_identity: usize,
}

/// Every `*.csv` matching `pattern`, sorted. No match is an error.
pub fn discover_csv_files(pattern: &str) -> Result<Vec<PathBuf>, AdapterError> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern)? {
        let path = entry.map_err(|e| AdapterError::Io {
            path: e.path().to_path_buf(),
            source: e.into_error(),
        })?;
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if path.is_file() && is_csv {
            files.push(path);
        }
    }
    files.sort();
    if files.is_empty() {
        return Err(AdapterError::NoInput(pattern.to_string()));
    }
    Ok(files)
}

/// UTF-8 text with the BOM stripped; invalid sequences are replaced.
pub fn decode_csv_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

pub fn read_csv_str(
    source_id: &str,
    locator_prefix: &str,
    data: &str,
    assembler: &CandidateAssembler,
) -> Result<(Vec<CandidateRecord>, CsvFileStats), AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(data.as_bytes());
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let columns = assembler.headers().resolve_all(&headers);
    let mapped = columns.iter().filter(|c| !c.is_empty()).count();
    debug!(source_id, locator_prefix, headers = headers.len(), mapped, "resolved csv headers");

    let observed_at = Utc::now();
    let mut stats = CsvFileStats::default();
    let mut candidates = Vec::new();
    for row in reader.records() {
        let row = row?;
        stats.rows += 1;
        let line = row.position().map_or(stats.rows + 1, |p| p.line() as usize);
        let source = SourceRef {
            source_id: source_id.to_string(),
            locator: format!("{locator_prefix}:{line}"),
            observed_at,
        };
        let cells = columns
            .iter()
            .zip(row.iter())
            .map(|(cols, value)| (cols.as_slice(), value));
        match assembler.assemble_resolved(source, cells) {
            Some(candidate) => {
                stats.candidates += 1;
                candidates.push(candidate);
            }
            None => stats.skipped_no_identity += 1,
        }
    }
    Ok((candidates, stats))
}

pub fn read_csv_file(
    source_id: &str,
    path: &Path,
    assembler: &CandidateAssembler,
) -> Result<(Vec<CandidateRecord>, CsvFileStats), AdapterError> {
    let bytes = fs::read(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let data = decode_csv_bytes(&bytes);
    let (candidates, stats) =
        read_csv_str(source_id, &path.display().to_string(), &data, assembler)?;
    info!(
        source_id,
        path = %path.display(),
        rows = stats.rows,
        candidates = stats.candidates,
        skipped = stats.skipped_no_identity,
        "read csv file"
    );
    Ok((candidates, stats))
}
