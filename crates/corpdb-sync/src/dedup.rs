//! Store-wide cleanup: corporate-number dedupe, invalid-number clearing and
//! near-duplicate name review.

use std::collections::BTreeMap;

use corpdb_adapters::normalize::{fold_width, is_valid_corporate_number};
use corpdb_core::{CompanyField, CompanyRecord, FieldValue};
use corpdb_storage::{
    BatchError, BatchReport, BatchWriter, CompanyStore, StoreError, StoredCompany, WriteMode,
    WriteOp,
};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, info};

/// Documents read per `scan` page.
pub const SCAN_PAGE_SIZE: usize = 1000;

/// Legal-form words dropped before comparing names.
const LEGAL_FORMS: &[&str] = &[
    "特定非営利活動法人",
    "一般社団法人",
    "一般財団法人",
    "公益社団法人",
    "公益財団法人",
    "社会福祉法人",
    "株式会社",
    "有限会社",
    "合同会社",
    "合資会社",
    "合名会社",
    "医療法人",
    "学校法人",
    "(株)",
    "(有)",
    "(同)",
    "㈱",
    "㈲",
    "co.,ltd.",
    "co.ltd.",
    "inc.",
];

pub async fn load_all(
    store: &dyn CompanyStore,
    page_size: usize,
) -> Result<Vec<StoredCompany>, StoreError> {
    let page_size = page_size.max(1);
    let mut all = Vec::new();
    let mut after: Option<String> = None;
    loop {
        let page = store.scan(after.as_deref(), page_size).await?;
        let done = page.len() < page_size;
        after = page.last().map(|c| c.id.clone());
        all.extend(page);
        if done || after.is_none() {
            break;
        }
    }
    debug!(documents = all.len(), "loaded store snapshot");
    Ok(all)
}

/// Records sharing one valid corporate number.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub corporate_number: String,
    pub survivor_id: String,
    pub duplicate_ids: Vec<String>,
    /// Values copied onto the survivor's blank fields.
    pub fills: CompanyRecord,
}

impl DuplicateGroup {
    pub fn filled_fields(&self) -> Vec<CompanyField> {
        self.fills.populated_fields()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroupRow {
    pub corporate_number: String,
    pub survivor_id: String,
    pub duplicate_ids: String,
    pub filled_fields: String,
}

impl From<&DuplicateGroup> for DuplicateGroupRow {
    fn from(group: &DuplicateGroup) -> Self {
        Self {
            corporate_number: group.corporate_number.clone(),
            survivor_id: group.survivor_id.clone(),
            duplicate_ids: group.duplicate_ids.join(" "),
            filled_fields: group
                .filled_fields()
                .iter()
                .map(|f| f.key())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Longest text, largest number, longest list; flags prefer `true`.
fn richer(a: &FieldValue, b: &FieldValue) -> bool {
    match (a, b) {
        (FieldValue::Text(a), FieldValue::Text(b)) => a.trim().chars().count() > b.trim().chars().count(),
        (FieldValue::Integer(a), FieldValue::Integer(b)) => a > b,
        (FieldValue::List(a), FieldValue::List(b)) => a.len() > b.len(),
        (FieldValue::Flag(a), FieldValue::Flag(b)) => *a && !*b,
        _ => false,
    }
}

fn survivor_fills(survivor: &CompanyRecord, duplicates: &[&StoredCompany]) -> CompanyRecord {
    let mut fills = CompanyRecord::default();
    for &field in CompanyField::ALL {
        if !survivor.is_blank(field) {
            continue;
        }
        let mut best: Option<FieldValue> = None;
        for dup in duplicates {
            let Some(value) = dup.record.get(field).filter(|v| !v.is_blank()) else {
                continue;
            };
            if best.as_ref().map_or(true, |b| richer(&value, b)) {
                best = Some(value);
            }
        }
        if best.is_some() {
            // Values come from the same field, so the type always fits.
            let _ = fills.set(field, best);
        }
    }
    fills
}

/// Groups records by valid corporate number. The smallest id survives.
pub fn plan_corporate_number_dedupe(records: &[StoredCompany]) -> Vec<DuplicateGroup> {
    let mut by_number: BTreeMap<&str, Vec<&StoredCompany>> = BTreeMap::new();
    for company in records {
        if let Some(number) = company
            .record
            .corporate_number
            .as_deref()
            .filter(|n| is_valid_corporate_number(n))
        {
            by_number.entry(number).or_default().push(company);
        }
    }

    by_number
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(number, mut members)| {
            members.sort_by(|a, b| a.id.cmp(&b.id));
            let survivor = members[0];
            let duplicates = &members[1..];
            DuplicateGroup {
                corporate_number: number.to_string(),
                survivor_id: survivor.id.clone(),
                duplicate_ids: duplicates.iter().map(|d| d.id.clone()).collect(),
                fills: survivor_fills(&survivor.record, duplicates),
            }
        })
        .collect()
}

/// Survivor fills are queued ahead of the deletes of their group.
pub async fn apply_dedupe(
    store: &dyn CompanyStore,
    groups: &[DuplicateGroup],
    max_batch_size: usize,
) -> Result<BatchReport, BatchError> {
    let mut writer = BatchWriter::new(store, max_batch_size);
    for group in groups {
        if !group.fills.is_empty() {
            writer
                .push(WriteOp::Upsert {
                    id: group.survivor_id.clone(),
                    fields: group.fills.clone(),
                    mode: WriteMode::fill_only(),
                })
                .await?;
        }
        for id in &group.duplicate_ids {
            writer.push(WriteOp::Delete { id: id.clone() }).await?;
        }
    }
    let report = writer.finish().await?;
    info!(
        groups = groups.len(),
        batches = report.batches,
        ops = report.committed_ops,
        "corporate-number dedupe committed"
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidCorporateNumber {
    pub id: String,
    pub name: Option<String>,
    pub corporate_number: String,
}

/// Records whose stored corporate number is present but fails validity.
pub fn plan_invalid_corporate_numbers(records: &[StoredCompany]) -> Vec<InvalidCorporateNumber> {
    records
        .iter()
        .filter_map(|company| {
            let number = company.record.corporate_number.as_deref()?;
            (!number.trim().is_empty() && !is_valid_corporate_number(number)).then(|| {
                InvalidCorporateNumber {
                    id: company.id.clone(),
                    name: company.record.name.clone(),
                    corporate_number: number.to_string(),
                }
            })
        })
        .collect()
}

/// Clears the field; the records themselves are kept.
pub async fn apply_invalid_cleanup(
    store: &dyn CompanyStore,
    invalid: &[InvalidCorporateNumber],
    max_batch_size: usize,
) -> Result<BatchReport, BatchError> {
    let mut writer = BatchWriter::new(store, max_batch_size);
    for item in invalid {
        writer
            .push(WriteOp::ClearFields {
                id: item.id.clone(),
                fields: vec![CompanyField::CorporateNumber],
            })
            .await?;
    }
    writer.finish().await
}

#[derive(Debug, Clone, Copy)]
pub struct NameReviewConfig {
    pub review_threshold: f64,
}

impl Default for NameReviewConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.92,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NameReviewItem {
    pub prefecture: String,
    pub id_a: String,
    pub name_a: String,
    pub id_b: String,
    pub name_b: String,
    pub score: f64,
}

/// Width-folded, lowercased, legal forms and whitespace removed.
pub fn comparable_name(name: &str) -> String {
    let mut folded: String = fold_width(name)
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    for form in LEGAL_FORMS {
        folded = folded.replace(form, "");
    }
    folded
}

pub struct NameReviewEngine {
    config: NameReviewConfig,
}

impl NameReviewEngine {
    pub fn new(config: NameReviewConfig) -> Self {
        Self { config }
    }

    /// Pairs within one prefecture whose names look alike. Pairs carrying two
    /// different valid corporate numbers are distinct companies and skipped.
    pub fn review(&self, records: &[StoredCompany]) -> Vec<NameReviewItem> {
        let mut by_prefecture: BTreeMap<&str, Vec<(&StoredCompany, &str, String)>> = BTreeMap::new();
        for company in records {
            let (Some(prefecture), Some(name)) = (
                company.record.prefecture.as_deref(),
                company.record.name.as_deref(),
            ) else {
                continue;
            };
            let key = comparable_name(name);
            if key.is_empty() {
                continue;
            }
            by_prefecture
                .entry(prefecture)
                .or_default()
                .push((company, name, key));
        }

        let mut items = Vec::new();
        for (prefecture, members) in by_prefecture {
            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    let (a, name_a, key_a) = &members[i];
                    let (b, name_b, key_b) = &members[j];
                    if distinct_numbers(&a.record, &b.record) {
                        continue;
                    }
                    let score = jaro_winkler(key_a, key_b);
                    if score >= self.config.review_threshold {
                        items.push(NameReviewItem {
                            prefecture: prefecture.to_string(),
                            id_a: a.id.clone(),
                            name_a: name_a.to_string(),
                            id_b: b.id.clone(),
                            name_b: name_b.to_string(),
                            score,
                        });
                    }
                }
            }
        }
        items.sort_by(|x, y| y.score.total_cmp(&x.score));
        items
    }
}

fn distinct_numbers(a: &CompanyRecord, b: &CompanyRecord) -> bool {
    match (a.corporate_number.as_deref(), b.corporate_number.as_deref()) {
        (Some(x), Some(y)) => {
            is_valid_corporate_number(x) && is_valid_corporate_number(y) && x != y
        }
        _ => false,
    }
}
