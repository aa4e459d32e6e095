//! Fuzzy matching of free-text industry labels against the master list.

use std::fs;
use std::path::Path;

use corpdb_core::{IndustryLevel, IndustryMasterEntry};
use serde::Deserialize;

use crate::normalize::fold_width;
use crate::AdapterError;

pub const DEFAULT_MIN_SCORE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndustryMatch<'a> {
    pub entry: &'a IndustryMasterEntry,
    pub score: usize,
    pub exact: bool,
}

#[derive(Debug, Clone)]
pub struct IndustryMaster {
    entries: Vec<(IndustryMasterEntry, Vec<char>)>,
    min_score: usize,
}

#[derive(Debug, Deserialize)]
struct MasterRow {
    field: String,
    value: String,
}

/// Lowercased, width-folded, with whitespace, brackets and separators removed.
pub fn normalize_industry_label(raw: &str) -> String {
    fold_width(raw)
        .to_lowercase()
        .chars()
        .filter(|c| {
            !c.is_whitespace()
                && !matches!(
                    c,
                    '(' | ')' | '[' | ']' | '【' | '】' | '「' | '」' | '・' | '/' | '、' | ','
                        | '-' | '_' | '.' | '･'
                )
        })
        .collect()
}

fn longest_common_substring(a: &[char], b: &[char]) -> usize {
    let mut best = 0;
    let mut prev = vec![0usize; b.len() + 1];
    for ca in a {
        let mut row = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                row[j + 1] = prev[j] + 1;
                best = best.max(row[j + 1]);
            }
        }
        prev = row;
    }
    best
}

fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn contains(haystack: &[char], needle: &[char]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Containment scores one above the contained length; otherwise the larger
/// of the longest common substring and the shared prefix.
pub fn similarity_score(a: &[char], b: &[char]) -> usize {
    if contains(a, b) || contains(b, a) {
        return a.len().min(b.len()) + 1;
    }
    longest_common_substring(a, b).max(common_prefix(a, b))
}

impl IndustryMaster {
    pub fn new(entries: Vec<IndustryMasterEntry>, min_score: usize) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| {
                let key = normalize_industry_label(&entry.value).chars().collect();
                (entry, key)
            })
            .collect();
        Self { entries, min_score }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), DEFAULT_MIN_SCORE)
    }

    /// `field,value` rows; `field` is one of large/middle/small/detail.
    pub fn from_csv_str(data: &str, min_score: usize) -> Result<Self, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(data.as_bytes());
        let mut entries = Vec::new();
        for row in reader.deserialize::<MasterRow>() {
            let row = row?;
            let level = IndustryLevel::parse(&row.field)
                .ok_or_else(|| AdapterError::Rules(format!("unknown industry level '{}'", row.field)))?;
            if !row.value.is_empty() {
                entries.push(IndustryMasterEntry {
                    level,
                    value: row.value,
                });
            }
        }
        Ok(Self::new(entries, min_score))
    }

    pub fn load(path: impl AsRef<Path>, min_score: usize) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_csv_str(data.trim_start_matches('\u{feff}'), min_score)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn min_score(&self) -> usize {
        self.min_score
    }

    /// Best master entry for `raw`, restricted to `level` when given.
    /// Ties keep master-list order.
    pub fn best_match(&self, raw: &str, level: Option<IndustryLevel>) -> Option<IndustryMatch<'_>> {
        let query: Vec<char> = normalize_industry_label(raw).chars().collect();
        if query.is_empty() {
            return None;
        }
        let mut best: Option<IndustryMatch<'_>> = None;
        for (entry, key) in &self.entries {
            if level.is_some_and(|l| l != entry.level) || key.is_empty() {
                continue;
            }
            if *key == query {
                return Some(IndustryMatch {
                    entry,
                    score: key.len(),
                    exact: true,
                });
            }
            let score = similarity_score(&query, key);
            if best.map_or(true, |b| score > b.score) {
                best = Some(IndustryMatch {
                    entry,
                    score,
                    exact: false,
                });
            }
        }
        best.filter(|m| m.score >= self.min_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "\
field,value
large,情報通信業
middle,ソフトウェア業
middle,情報処理・提供サービス業
large,建設業
middle,総合工事業
detail,受託開発ソフトウェア業
";

    fn master() -> IndustryMaster {
        IndustryMaster::from_csv_str(MASTER, DEFAULT_MIN_SCORE).expect("master")
    }

    #[test]
    fn exact_match_wins() {
        let master = master();
        let m = master.best_match(" 情報通信業 ", None).unwrap();
        assert!(m.exact);
        assert_eq!(m.entry.value, "情報通信業");
        assert_eq!(m.entry.level, IndustryLevel::Large);
    }

    #[test]
    fn unrelated_label_stays_unmatched() {
        assert!(master().best_match("IT・ソフトウェア", Some(IndustryLevel::Large)).is_none());
    }

    #[test]
    fn shared_substring_of_three_or_more_matches() {
        let master = master();
        let m = master.best_match("ソフトウェア開発", Some(IndustryLevel::Middle)).unwrap();
        assert_eq!(m.entry.value, "ソフトウェア業");
        assert!(m.score >= 3);
    }

    #[test]
    fn containment_is_preferred() {
        let m = master().best_match("建設", None).map(|m| m.entry.value.clone());
        assert_eq!(m.as_deref(), Some("建設業"));
    }

    #[test]
    fn threshold_is_configurable() {
        let strict = IndustryMaster::from_csv_str(MASTER, 10).unwrap();
        assert!(strict.best_match("ソフトウェア開発", None).is_none());
        assert!(strict.best_match("情報通信業", None).is_some());
    }

    #[test]
    fn scoring_helpers() {
        let a: Vec<char> = "abcdef".chars().collect();
        let b: Vec<char> = "xxcdeyy".chars().collect();
        assert_eq!(similarity_score(&a, &b), 3);
        let c: Vec<char> = "abz".chars().collect();
        assert_eq!(similarity_score(&a, &c), 2);
        let d: Vec<char> = "bcd".chars().collect();
        assert_eq!(similarity_score(&a, &d), 4);
        assert_eq!(normalize_industry_label("ＩＴ・ソフト （受託）"), "itソフト受託");
    }

    #[test]
    fn unknown_level_is_rejected() {
        assert!(IndustryMaster::from_csv_str("field,value\nhuge,何か\n", 3).is_err());
    }
}
