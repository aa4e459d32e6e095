//! Store-wide backfills: corporate numbers from the national master file and
//! the derived `hasAnyWebPresence` flag.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use corpdb_adapters::normalize::is_valid_corporate_number;
use corpdb_adapters::MasterEntry;
use corpdb_core::{CompanyField, CompanyRecord};
use corpdb_storage::{
    BatchError, BatchReport, BatchWriter, CompanyStore, StoredCompany, WriteMode, WriteOp,
};
use serde::Serialize;
use tracing::info;

use crate::dedup::comparable_name;
use crate::matcher::{pick_by_location, LocationPick};

/// Records with a blank corporate number and a usable name, keyed by
/// comparable name.
pub fn backfill_targets(records: &[StoredCompany]) -> BTreeMap<String, Vec<&StoredCompany>> {
    let mut targets: BTreeMap<String, Vec<&StoredCompany>> = BTreeMap::new();
    for company in records {
        if !company.record.is_blank(CompanyField::CorporateNumber) {
            continue;
        }
        let Some(name) = company.record.name.as_deref() else {
            continue;
        };
        let key = comparable_name(name);
        if !key.is_empty() {
            targets.entry(key).or_default().push(company);
        }
    }
    targets
}

/// Master entries whose comparable name is in `wanted`.
#[derive(Debug, Default)]
pub struct MasterIndex {
    by_name: HashMap<String, Vec<MasterEntry>>,
}

impl MasterIndex {
    pub fn insert_if_wanted(&mut self, wanted: &HashSet<String>, entry: MasterEntry) {
        let key = comparable_name(&entry.name);
        if wanted.contains(&key) {
            self.by_name.entry(key).or_default().push(entry);
        }
    }

    pub fn get(&self, key: &str) -> &[MasterEntry] {
        self.by_name.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.by_name.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillOutcome {
    Assigned,
    NotInMaster,
    /// Several master entries and no prefecture or address settles it.
    Unresolved,
    /// Another stored record already carries the number.
    NumberInUse,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorporateNumberBackfill {
    pub id: String,
    pub name: String,
    pub prefecture: Option<String>,
    pub outcome: BackfillOutcome,
    pub corporate_number: Option<String>,
    pub master_name: Option<String>,
    pub master_candidates: usize,
    /// Set when the address comparison picked the entry.
    pub address_score: Option<f64>,
}

impl CorporateNumberBackfill {
    pub fn is_assigned(&self) -> bool {
        self.outcome == BackfillOutcome::Assigned
    }
}

/// Resolves each target against the master entries sharing its name. A
/// number is never handed to two records, nor to one when a stored record
/// already has it.
pub fn plan_corporate_number_backfill(
    records: &[StoredCompany],
    master: &MasterIndex,
    min_address_similarity: f64,
) -> Vec<CorporateNumberBackfill> {
    let mut in_use: BTreeSet<String> = records
        .iter()
        .filter_map(|c| c.record.corporate_number.as_deref())
        .filter(|n| is_valid_corporate_number(n))
        .map(str::to_string)
        .collect();

    let mut plan = Vec::new();
    for (key, companies) in backfill_targets(records) {
        let entries = master.get(&key);
        for company in companies {
            let mut item = CorporateNumberBackfill {
                id: company.id.clone(),
                name: company.record.name.clone().unwrap_or_default(),
                prefecture: company.record.prefecture.clone(),
                outcome: BackfillOutcome::NotInMaster,
                corporate_number: None,
                master_name: None,
                master_candidates: entries.len(),
                address_score: None,
            };
            if entries.is_empty() {
                plan.push(item);
                continue;
            }
            let Some((entry, pick)) =
                pick_by_location(company, entries.to_vec(), min_address_similarity)
            else {
                item.outcome = BackfillOutcome::Unresolved;
                plan.push(item);
                continue;
            };
            if let LocationPick::Address(score) = pick {
                item.address_score = Some(score);
            }
            item.outcome = if in_use.insert(entry.corporate_number.clone()) {
                BackfillOutcome::Assigned
            } else {
                BackfillOutcome::NumberInUse
            };
            item.master_name = Some(entry.name);
            item.corporate_number = Some(entry.corporate_number);
            plan.push(item);
        }
    }
    plan
}

pub async fn apply_corporate_number_backfill(
    store: &dyn CompanyStore,
    plan: &[CorporateNumberBackfill],
    max_batch_size: usize,
) -> Result<BatchReport, BatchError> {
    let mut writer = BatchWriter::new(store, max_batch_size);
    for item in plan.iter().filter(|i| i.is_assigned()) {
        writer
            .push(WriteOp::Upsert {
                id: item.id.clone(),
                fields: CompanyRecord {
                    corporate_number: item.corporate_number.clone(),
                    ..Default::default()
                },
                mode: WriteMode::fill_only(),
            })
            .await?;
    }
    let report = writer.finish().await?;
    info!(
        committed_ops = report.committed_ops,
        batches = report.batches,
        "corporate-number backfill committed"
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebPresenceChange {
    pub id: String,
    pub name: Option<String>,
    pub before: Option<bool>,
    pub after: bool,
}

/// Records whose stored flag disagrees with their web fields.
pub fn plan_web_presence_backfill(records: &[StoredCompany]) -> Vec<WebPresenceChange> {
    records
        .iter()
        .filter_map(|company| {
            let after = company.record.has_web_presence();
            let before = company.record.has_any_web_presence;
            (before != Some(after)).then(|| WebPresenceChange {
                id: company.id.clone(),
                name: company.record.name.clone(),
                before,
                after,
            })
        })
        .collect()
}

pub async fn apply_web_presence_backfill(
    store: &dyn CompanyStore,
    changes: &[WebPresenceChange],
    max_batch_size: usize,
) -> Result<BatchReport, BatchError> {
    let mode = WriteMode::FillOnly {
        overwrite: BTreeSet::from([CompanyField::HasAnyWebPresence]),
    };
    let mut writer = BatchWriter::new(store, max_batch_size);
    for change in changes {
        writer
            .push(WriteOp::Upsert {
                id: change.id.clone(),
                fields: CompanyRecord {
                    has_any_web_presence: Some(change.after),
                    ..Default::default()
                },
                mode: mode.clone(),
            })
            .await?;
    }
    writer.finish().await
}
