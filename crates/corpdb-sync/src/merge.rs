//! Fill-only merge policy and the create/update decision.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use corpdb_adapters::normalize::is_valid_corporate_number;
use corpdb_core::{CandidateRecord, CompanyField, CompanyRecord, FieldFill, SourceRef};
use corpdb_storage::{StoredCompany, WriteMode};
use serde::Deserialize;

/// Stamps owned by the reconciler; values a source carries for them are ignored.
const STAMP_FIELDS: [CompanyField; 2] = [CompanyField::CreatedAt, CompanyField::UpdatedAt];

#[derive(Debug, Clone, Deserialize)]
struct MergeRulesFile {
    #[serde(default)]
    always_overwrite: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePolicy {
    pub always_overwrite: BTreeSet<CompanyField>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            always_overwrite: BTreeSet::from([CompanyField::UpdatedAt]),
        }
    }
}

/// What the reconciler should write for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    /// No existing record. `id` is the corporate number when it is valid;
    /// otherwise the store generates one.
    Create {
        id: Option<String>,
        record: CompanyRecord,
        fills: Vec<FieldFill>,
    },
    /// `payload` holds only the fields to fill plus the `updatedAt` stamp,
    /// written with `mode`.
    Update {
        id: String,
        payload: CompanyRecord,
        mode: WriteMode,
        fills: Vec<FieldFill>,
    },
    Unchanged { id: String },
}

impl MergeDecision {
    pub fn fills(&self) -> &[FieldFill] {
        match self {
            MergeDecision::Create { fills, .. } | MergeDecision::Update { fills, .. } => fills,
            MergeDecision::Unchanged { .. } => &[],
        }
    }
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn provenance(fields: &[CompanyField], source: &SourceRef) -> Vec<FieldFill> {
    fields
        .iter()
        .filter(|f| !STAMP_FIELDS.contains(f))
        .map(|&field| FieldFill {
            field,
            source: source.clone(),
        })
        .collect()
}

impl MergePolicy {
    /// Never overwrite anything, timestamps included.
    pub fn fill_only() -> Self {
        Self {
            always_overwrite: BTreeSet::new(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let rules: MergeRulesFile = serde_yaml::from_str(yaml).context("parsing merge rules")?;
        let mut always_overwrite = BTreeSet::new();
        for key in rules.always_overwrite {
            let Some(field) = CompanyField::from_key(&key) else {
                bail!("unknown field '{key}' in always_overwrite");
            };
            always_overwrite.insert(field);
        }
        Ok(Self { always_overwrite })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    pub fn write_mode(&self) -> WriteMode {
        WriteMode::FillOnly {
            overwrite: self.always_overwrite.clone(),
        }
    }

    /// Like `write_mode`, but a stored `hasAnyWebPresence = false` may be
    /// raised to `true`.
    fn update_mode(&self) -> WriteMode {
        let mut overwrite = self.always_overwrite.clone();
        overwrite.insert(CompanyField::HasAnyWebPresence);
        WriteMode::FillOnly { overwrite }
    }

    /// `existing` with every blank field filled from `candidate`. Populated
    /// fields keep their value unless listed in `always_overwrite`.
    pub fn merge(&self, existing: &CompanyRecord, candidate: &CompanyRecord) -> CompanyRecord {
        let mut merged = existing.clone();
        merged.fill_from(candidate, &self.always_overwrite);
        merged
    }

    pub fn decide(
        &self,
        existing: Option<&StoredCompany>,
        candidate: &CandidateRecord,
        now: DateTime<Utc>,
    ) -> MergeDecision {
        let mut incoming = candidate.record.clone();
        for field in STAMP_FIELDS {
            // Clearing always type-checks.
            let _ = incoming.set(field, None);
        }
        let stamp = timestamp(now);

        let Some(existing) = existing else {
            let fills = provenance(&incoming.populated_fields(), &candidate.source);
            let id = incoming
                .corporate_number
                .clone()
                .filter(|n| is_valid_corporate_number(n));
            let mut record = incoming;
            if record.has_web_presence() {
                record.has_any_web_presence = Some(true);
            } else if record.is_blank(CompanyField::HasAnyWebPresence) {
                record.has_any_web_presence = Some(false);
            }
            record.created_at = Some(stamp.clone());
            record.updated_at = Some(stamp);
            return MergeDecision::Create { id, record, fills };
        };

        let mut merged = existing.record.clone();
        let mut written = merged.fill_from(&incoming, &self.always_overwrite);
        if written.is_empty() {
            return MergeDecision::Unchanged {
                id: existing.id.clone(),
            };
        }
        let fills = provenance(&written, &candidate.source);
        // Web fields already stored or just filled raise the flag; a stored
        // `true` is never lowered here.
        if merged.has_web_presence() && merged.has_any_web_presence != Some(true) {
            merged.has_any_web_presence = Some(true);
            if !written.contains(&CompanyField::HasAnyWebPresence) {
                written.push(CompanyField::HasAnyWebPresence);
            }
        }
        let mut payload = merged.project(&written);
        payload.updated_at = Some(stamp);
        MergeDecision::Update {
            id: existing.id.clone(),
            payload,
            mode: self.update_mode(),
            fills,
        }
    }
}
