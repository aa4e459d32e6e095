//! Entity matcher: ordered exact-match lookups against the store, with a
//! prefecture and address tiebreak when a name matches several records.

use corpdb_adapters::normalize::{clean_address, fold_width, is_valid_corporate_number};
use corpdb_adapters::MasterEntry;
use corpdb_core::{CompanyField, CompanyRecord};
use corpdb_storage::{CompanyStore, Filter, StoreError, StoredCompany};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStrategy {
    CorporateNumber,
    NamePrefectureRepresentative,
    NamePrefecture,
    Name,
    /// For sources that carry no usable name; not part of the default order.
    PhoneNumber,
}

impl LookupStrategy {
    pub const DEFAULT_ORDER: [LookupStrategy; 4] = [
        LookupStrategy::CorporateNumber,
        LookupStrategy::NamePrefectureRepresentative,
        LookupStrategy::NamePrefecture,
        LookupStrategy::Name,
    ];

    pub fn is_name_based(self) -> bool {
        matches!(
            self,
            LookupStrategy::NamePrefectureRepresentative
                | LookupStrategy::NamePrefecture
                | LookupStrategy::Name
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            LookupStrategy::CorporateNumber => "corporate_number",
            LookupStrategy::NamePrefectureRepresentative => "name_prefecture_representative",
            LookupStrategy::NamePrefecture => "name_prefecture",
            LookupStrategy::Name => "name",
            LookupStrategy::PhoneNumber => "phone_number",
        }
    }

    fn fields(self) -> &'static [CompanyField] {
        match self {
            LookupStrategy::CorporateNumber => &[CompanyField::CorporateNumber],
            LookupStrategy::NamePrefectureRepresentative => &[
                CompanyField::Name,
                CompanyField::Prefecture,
                CompanyField::RepresentativeName,
            ],
            LookupStrategy::NamePrefecture => &[CompanyField::Name, CompanyField::Prefecture],
            LookupStrategy::Name => &[CompanyField::Name],
            LookupStrategy::PhoneNumber => &[CompanyField::PhoneNumber],
        }
    }

    /// Exact-match filters for `record`, or `None` when a key field is
    /// missing and the strategy does not apply.
    pub fn filters(self, record: &CompanyRecord) -> Option<Vec<Filter>> {
        if self == LookupStrategy::CorporateNumber
            && !record
                .corporate_number
                .as_deref()
                .is_some_and(is_valid_corporate_number)
        {
            return None;
        }
        self.fields()
            .iter()
            .map(|&field| {
                let value = record.get(field)?;
                let text = value.as_text()?.trim();
                (!text.is_empty()).then(|| Filter::eq(field, text))
            })
            .collect()
    }
}

impl std::fmt::Display for LookupStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The record a lookup step settled on.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMatch {
    pub strategy: LookupStrategy,
    pub company: StoredCompany,
    /// Records the winning step matched; above one means the pick is the
    /// first by id among several.
    pub match_count: usize,
    /// Set when the location tiebreak settled a name match: how many records
    /// the name step matched before it.
    pub narrowed_from: Option<usize>,
}

impl EntityMatch {
    pub fn is_ambiguous(&self) -> bool {
        self.match_count > 1
    }
}

/// Lowest address similarity the tiebreak accepts.
pub const MIN_ADDRESS_SIMILARITY: f64 = 0.3;

/// Rows fetched for a tiebreak; same-name clusters larger than this are
/// left ambiguous.
const TIEBREAK_LIMIT: usize = 50;

/// Anything carrying a prefecture and addresses the tiebreak can compare.
pub trait Located {
    fn prefecture(&self) -> Option<&str>;
    /// Comparable forms of every address on the record.
    fn comparable_addresses(&self) -> Vec<String>;
}

impl Located for CompanyRecord {
    fn prefecture(&self) -> Option<&str> {
        self.prefecture.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }

    fn comparable_addresses(&self) -> Vec<String> {
        [self.address.as_deref(), self.headquarters_address.as_deref()]
            .into_iter()
            .flatten()
            .filter_map(|a| comparable_address(Located::prefecture(self), a))
            .collect()
    }
}

impl Located for StoredCompany {
    fn prefecture(&self) -> Option<&str> {
        Located::prefecture(&self.record)
    }

    fn comparable_addresses(&self) -> Vec<String> {
        self.record.comparable_addresses()
    }
}

impl Located for MasterEntry {
    fn prefecture(&self) -> Option<&str> {
        Some(self.prefecture.as_str()).filter(|p| !p.is_empty())
    }

    fn comparable_addresses(&self) -> Vec<String> {
        comparable_address(Located::prefecture(self), &self.address)
            .into_iter()
            .collect()
    }
}

/// Width-folded address without whitespace or map noise, led by the
/// prefecture when it does not already start with it.
pub fn comparable_address(prefecture: Option<&str>, address: &str) -> Option<String> {
    let cleaned = clean_address(address)?;
    let folded: String = fold_width(&cleaned)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if folded.is_empty() {
        return None;
    }
    Some(match prefecture {
        Some(pref) if !folded.starts_with(pref) => format!("{pref}{folded}"),
        _ => folded,
    })
}

/// Best normalized Levenshtein similarity between any address of `a` and
/// any of `b`; `None` when either side has no address.
pub fn address_similarity(a: &impl Located, b: &impl Located) -> Option<f64> {
    let ours = a.comparable_addresses();
    let theirs = b.comparable_addresses();
    ours.iter()
        .flat_map(|x| theirs.iter().map(move |y| strsim::normalized_levenshtein(x, y)))
        .reduce(f64::max)
}

/// How a location pick was settled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocationPick {
    OnlyCandidate,
    Prefecture,
    Address(f64),
}

/// Picks one of `rows` for `target`: a lone row wins, then a lone row in the
/// target's prefecture, then the unique best address score at or above
/// `min_similarity`. Anything else is left unresolved.
pub fn pick_by_location<T: Located>(
    target: &impl Located,
    mut rows: Vec<T>,
    min_similarity: f64,
) -> Option<(T, LocationPick)> {
    if rows.len() == 1 {
        return rows.pop().map(|row| (row, LocationPick::OnlyCandidate));
    }
    if let Some(pref) = target.prefecture() {
        let (mut same, other): (Vec<T>, Vec<T>) =
            rows.into_iter().partition(|row| row.prefecture() == Some(pref));
        rows = match same.len() {
            1 => return same.pop().map(|row| (row, LocationPick::Prefecture)),
            0 => other,
            _ => same,
        };
    }

    let mut scored: Vec<(f64, T)> = rows
        .into_iter()
        .filter_map(|row| address_similarity(target, &row).map(|score| (score, row)))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut scored = scored.into_iter();
    let (best, row) = scored.next()?;
    let runner_up = scored.next().map(|(score, _)| score);
    (best >= min_similarity && runner_up.map_or(true, |r| r < best))
        .then_some((row, LocationPick::Address(best)))
}

#[derive(Debug, Clone)]
pub struct EntityMatcher {
    strategies: Vec<LookupStrategy>,
    min_address_similarity: f64,
}

impl Default for EntityMatcher {
    fn default() -> Self {
        Self::new(LookupStrategy::DEFAULT_ORDER.to_vec())
    }
}

impl EntityMatcher {
    pub fn new(strategies: Vec<LookupStrategy>) -> Self {
        Self {
            strategies,
            min_address_similarity: MIN_ADDRESS_SIMILARITY,
        }
    }

    pub fn with_min_address_similarity(mut self, min: f64) -> Self {
        self.min_address_similarity = min;
        self
    }

    pub fn strategies(&self) -> &[LookupStrategy] {
        &self.strategies
    }

    /// Runs each applicable strategy in order and stops at the first step
    /// that matches anything. A name step matching several records is
    /// narrowed by prefecture and address before it counts as ambiguous.
    pub async fn find(
        &self,
        store: &dyn CompanyStore,
        candidate: &CompanyRecord,
    ) -> Result<Option<EntityMatch>, StoreError> {
        for &strategy in &self.strategies {
            let Some(filters) = strategy.filters(candidate) else {
                continue;
            };
            let Some(found) = store.find_one(&filters).await? else {
                debug!(strategy = strategy.label(), "no match");
                continue;
            };
            if found.is_ambiguous() && strategy.is_name_based() {
                let rows = store.find_many(&filters, TIEBREAK_LIMIT).await?;
                if let Some((company, pick)) =
                    pick_by_location(candidate, rows, self.min_address_similarity)
                {
                    debug!(
                        strategy = strategy.label(),
                        match_count = found.match_count,
                        chosen_id = %company.id,
                        ?pick,
                        "name match narrowed by location"
                    );
                    return Ok(Some(EntityMatch {
                        strategy,
                        company,
                        match_count: 1,
                        narrowed_from: Some(found.match_count),
                    }));
                }
            }
            if found.is_ambiguous() {
                warn!(
                    strategy = strategy.label(),
                    match_count = found.match_count,
                    chosen_id = %found.company.id,
                    name = candidate.name.as_deref().unwrap_or_default(),
                    "ambiguous match; taking the first record"
                );
            }
            return Ok(Some(EntityMatch {
                strategy,
                company: found.company,
                match_count: found.match_count,
                narrowed_from: None,
            }));
        }
        Ok(None)
    }
}
