//! National corporate-number master file (the NTA "zenkoku" bulk download).
//!
//! Headerless CSV, one registered corporation per row. Only the columns used
//! for backfilling are read: number (1), name (6), prefecture (9), city (10)
//! and street (11). The file is read as UTF-8; undecodable bytes are replaced.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use csv::ByteRecord;
use serde::Serialize;

use crate::normalize::is_valid_corporate_number;
use crate::AdapterError;

const NUMBER_COLUMN: usize = 1;
const NAME_COLUMN: usize = 6;
const PREFECTURE_COLUMN: usize = 9;
const CITY_COLUMN: usize = 10;
const STREET_COLUMN: usize = 11;
const MIN_COLUMNS: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MasterEntry {
    pub corporate_number: String,
    pub name: String,
    pub prefecture: String,
    /// City and street joined, without the prefecture.
    pub address: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MasterStats {
    pub rows: usize,
    pub kept: usize,
    /// Short rows and rows whose number fails validation.
    pub skipped: usize,
}

fn cell(row: &ByteRecord, index: usize) -> String {
    row.get(index)
        .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
        .unwrap_or_default()
}

fn entry_from_row(row: &ByteRecord) -> Option<MasterEntry> {
    if row.len() < MIN_COLUMNS {
        return None;
    }
    let corporate_number = cell(row, NUMBER_COLUMN);
    let name = cell(row, NAME_COLUMN);
    if !is_valid_corporate_number(&corporate_number) || name.is_empty() {
        return None;
    }
    Some(MasterEntry {
        corporate_number,
        name,
        prefecture: cell(row, PREFECTURE_COLUMN),
        address: format!("{}{}", cell(row, CITY_COLUMN), cell(row, STREET_COLUMN)),
    })
}

/// Streams master rows and hands each usable entry to `visit`. The file is
/// never held in memory whole.
pub fn scan_master<R: Read>(
    input: R,
    mut visit: impl FnMut(MasterEntry),
) -> Result<MasterStats, AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);
    let mut stats = MasterStats::default();
    let mut row = ByteRecord::new();
    while reader.read_byte_record(&mut row)? {
        stats.rows += 1;
        match entry_from_row(&row) {
            Some(entry) => {
                stats.kept += 1;
                visit(entry);
            }
            None => stats.skipped += 1,
        }
    }
    Ok(stats)
}

pub fn scan_master_file(
    path: &Path,
    visit: impl FnMut(MasterEntry),
) -> Result<MasterStats, AdapterError> {
    let file = File::open(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    scan_master(BufReader::new(file), visit)
}
