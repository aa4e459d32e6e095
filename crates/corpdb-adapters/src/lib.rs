//! Source adapters: field normalization, header mapping, CSV and page inputs,
//! and assembly of candidate records.

use std::path::PathBuf;

use corpdb_core::{CandidateRecord, CompanyField, CompanyRecord, FieldValue, IndustryLevel, SourceRef};
use corpdb_storage::FetchError;
use thiserror::Error;
use tracing::warn;

pub mod csv_source;
pub mod headers;
pub mod industry;
pub mod master;
pub mod normalize;
pub mod page;

pub use csv_source::{discover_csv_files, read_csv_file, CsvFileStats};
pub use headers::{normalize_header, HeaderMap, ResolvedColumn};
pub use industry::{IndustryMaster, IndustryMatch};
pub use master::{scan_master, scan_master_file, MasterEntry, MasterStats};
pub use normalize::{normalize_field, AmountUnit, FieldRule};
pub use page::{fetch_page_candidate, LabelValueExtractor, PageExtractor};

pub const CRATE_NAME: &str = "corpdb-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown field key '{0}' in header rules")]
    UnknownField(String),
    #[error("invalid rules: {0}")]
    Rules(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no input files matched {0}")]
    NoInput(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Builds candidate records from raw `(label, value)` cells.
#[derive(Debug, Clone)]
pub struct CandidateAssembler {
    headers: HeaderMap,
    industries: IndustryMaster,
}

impl CandidateAssembler {
    pub fn new(headers: HeaderMap, industries: IndustryMaster) -> Self {
        Self {
            headers,
            industries,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn industries(&self) -> &IndustryMaster {
        &self.industries
    }

    /// Cells keyed by raw label (page tables, ad-hoc maps).
    pub fn assemble<'a>(
        &self,
        source: SourceRef,
        cells: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Option<CandidateRecord> {
        let resolved: Vec<(Vec<ResolvedColumn>, &str)> = cells
            .into_iter()
            .map(|(label, value)| (self.headers.resolve(label), value))
            .collect();
        self.assemble_resolved(source, resolved.iter().map(|(c, v)| (c.as_slice(), *v)))
    }

    /// Cells whose columns were resolved once up front (CSV rows).
    pub fn assemble_resolved<'a>(
        &self,
        source: SourceRef,
        cells: impl IntoIterator<Item = (&'a [ResolvedColumn], &'a str)>,
    ) -> Option<CandidateRecord> {
        let record = self.build_record(cells);
        let has_identity =
            !record.is_blank(CompanyField::Name) || !record.is_blank(CompanyField::CorporateNumber);
        has_identity.then(|| CandidateRecord::new(source, record))
    }

    fn build_record<'a>(
        &self,
        cells: impl IntoIterator<Item = (&'a [ResolvedColumn], &'a str)>,
    ) -> CompanyRecord {
        let mut record = CompanyRecord::default();
        let mut raw_address: Option<&str> = None;

        for (columns, raw) in cells {
            if raw.trim().is_empty() {
                continue;
            }
            for column in columns {
                // First non-blank source column wins.
                if !record.is_blank(column.field) {
                    continue;
                }
                let value = match FieldRule::for_field(column.field) {
                    FieldRule::Industry => {
                        self.apply_industry(&mut record, column.field, raw);
                        continue;
                    }
                    _ => normalize_field(column.field, raw, column.unit),
                };
                if matches!(column.field, CompanyField::Address | CompanyField::HeadquartersAddress)
                    && raw_address.is_none()
                {
                    raw_address = Some(raw);
                }
                set_field(&mut record, column.field, value);
            }
        }

        if record.prefecture.is_none() {
            record.prefecture = record
                .address
                .as_deref()
                .or(record.headquarters_address.as_deref())
                .and_then(normalize::prefecture_from_address)
                .map(str::to_string);
        }
        if record.postal_code.is_none() {
            record.postal_code = raw_address.and_then(normalize::postal_code_in_address);
        }
        record
    }

    /// Industry cells keep only master-list values; unmatched labels leave
    /// the field empty.
    fn apply_industry(&self, record: &mut CompanyRecord, field: CompanyField, raw: &str) {
        let level = IndustryLevel::ALL.into_iter().find(|l| l.field() == field);
        let Some(found) = self.industries.best_match(raw, level) else {
            return;
        };
        let value = found.entry.value.clone();
        if field == CompanyField::Industry && record.is_blank(found.entry.level.field()) {
            set_field(record, found.entry.level.field(), Some(FieldValue::Text(value.clone())));
        }
        set_field(record, field, Some(FieldValue::Text(value)));
    }
}

fn set_field(record: &mut CompanyRecord, field: CompanyField, value: Option<FieldValue>) {
    if value.is_none() {
        return;
    }
    if let Err(err) = record.set(field, value) {
        warn!(%err, "normalized value does not fit field");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn assembler() -> CandidateAssembler {
        let headers = HeaderMap::from_yaml_str(
            r#"
fields:
  name: { aliases: [会社名, 企業名] }
  corporateNumber: { aliases: [法人番号] }
  address: { aliases: [住所, 所在地] }
  capitalStock: { aliases: [資本金] }
  industry: { aliases: [業種] }
  phoneNumber: { aliases: [電話番号] }
"#,
        )
        .unwrap();
        let industries =
            IndustryMaster::from_csv_str("field,value\nlarge,情報通信業\nmiddle,ソフトウェア業\n", 3)
                .unwrap();
        CandidateAssembler::new(headers, industries)
    }

    fn source() -> SourceRef {
        SourceRef {
            source_id: "test".into(),
            locator: "row:1".into(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn assembles_typed_candidate_from_labels() {
        let candidate = assembler()
            .assemble(
                source(),
                [
                    ("会社名", "株式会社テスト"),
                    ("法人番号", "1234567890123"),
                    ("資本金", "1000万円"),
                    ("住所", "〒100-0001 東京都千代田区千代田1-1 /地図"),
                    ("電話番号", "2020/01/01"),
                ],
            )
            .unwrap();
        let r = &candidate.record;
        assert_eq!(r.name.as_deref(), Some("株式会社テスト"));
        assert_eq!(r.corporate_number.as_deref(), Some("1234567890123"));
        assert_eq!(r.capital_stock, Some(10_000));
        assert_eq!(r.address.as_deref(), Some("東京都千代田区千代田1-1"));
        assert_eq!(r.prefecture.as_deref(), Some("東京都"));
        assert_eq!(r.postal_code.as_deref(), Some("100-0001"));
        assert_eq!(r.phone_number, None);
    }

    #[test]
    fn first_non_blank_column_wins() {
        let candidate = assembler()
            .assemble(source(), [("会社名", " "), ("企業名", "株式会社B"), ("会社名", "株式会社C")])
            .unwrap();
        assert_eq!(candidate.record.name.as_deref(), Some("株式会社B"));
    }

    #[test]
    fn industries_resolve_to_master_values_or_stay_empty() {
        let a = assembler();
        let matched = a
            .assemble(source(), [("会社名", "X"), ("業種", "ソフトウェア開発")])
            .unwrap();
        assert_eq!(matched.record.industry.as_deref(), Some("ソフトウェア業"));
        assert_eq!(matched.record.industry_middle.as_deref(), Some("ソフトウェア業"));

        let unmatched = a
            .assemble(source(), [("会社名", "X"), ("業種", "飲食業")])
            .unwrap();
        assert_eq!(unmatched.record.industry, None);
    }

    #[test]
    fn rows_without_identity_produce_no_candidate() {
        assert!(assembler()
            .assemble(source(), [("資本金", "1000万円"), ("法人番号", "0000000000000")])
            .is_none());
    }
}
