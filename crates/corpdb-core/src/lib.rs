//! Core record schema and provenance types for corpdb.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "corpdb-core";

/// Storage shape of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    List,
    Flag,
}

/// Dynamically typed field value, used where code walks the schema generically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

fn is_blank_text(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || s.eq_ignore_ascii_case("null") || s.eq_ignore_ascii_case("undefined")
}

impl FieldValue {
    /// Empty strings, whitespace-only strings and empty lists carry no data,
    /// and neither do the `null`/`undefined` literals of legacy exports.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text(s) => is_blank_text(s),
            FieldValue::List(items) => items.iter().all(|item| is_blank_text(item)),
            FieldValue::Integer(_) | FieldValue::Flag(_) => false,
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Integer(_) => FieldKind::Integer,
            FieldValue::List(_) => FieldKind::List,
            FieldValue::Flag(_) => FieldKind::Flag,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Text(s) => serde_json::Value::from(s.as_str()),
            FieldValue::Integer(n) => serde_json::Value::from(*n),
            FieldValue::List(items) => serde_json::Value::from(items.clone()),
            FieldValue::Flag(b) => serde_json::Value::from(*b),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(n) => write!(f, "{n}"),
            FieldValue::List(items) => f.write_str(&items.join("; ")),
            FieldValue::Flag(b) => write!(f, "{b}"),
        }
    }
}

/// Rust types that can back a record field.
pub trait FieldType: Sized {
    const KIND: FieldKind;
    fn into_value(self) -> FieldValue;
    fn from_value(value: FieldValue) -> Option<Self>;
}

impl FieldType for String {
    const KIND: FieldKind = FieldKind::Text;

    fn into_value(self) -> FieldValue {
        FieldValue::Text(self)
    }

    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl FieldType for i64 {
    const KIND: FieldKind = FieldKind::Integer;

    fn into_value(self) -> FieldValue {
        FieldValue::Integer(self)
    }

    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::Integer(n) => Some(n),
            _ => None,
        }
    }
}

impl FieldType for Vec<String> {
    const KIND: FieldKind = FieldKind::List;

    fn into_value(self) -> FieldValue {
        FieldValue::List(self)
    }

    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl FieldType for bool {
    const KIND: FieldKind = FieldKind::Flag;

    fn into_value(self) -> FieldValue {
        FieldValue::Flag(self)
    }

    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::Flag(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field {field} expects a {expected:?} value, got {actual:?}")]
pub struct FieldTypeError {
    pub field: CompanyField,
    pub expected: FieldKind,
    pub actual: FieldKind,
}

macro_rules! company_fields {
    ($( $(#[$meta:meta])* $variant:ident => $field:ident : $ty:ty = $key:literal ),+ $(,)?) => {
        /// Canonical company document as stored in `companies_new`.
        ///
        /// Every field is optional; absent and blank values are treated alike by
        /// the merge policy.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct CompanyRecord {
            $(
                $(#[$meta])*
                #[serde(rename = $key, default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )+
        }

        /// One variant per `CompanyRecord` field.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum CompanyField {
            $(
                #[serde(rename = $key)]
                $variant,
            )+
        }

        impl CompanyField {
            pub const ALL: &'static [CompanyField] = &[$(CompanyField::$variant),+];

            /// Document key (camelCase) of the field.
            pub fn key(self) -> &'static str {
                match self {
                    $(CompanyField::$variant => $key,)+
                }
            }

            pub fn from_key(key: &str) -> Option<Self> {
                match key {
                    $($key => Some(CompanyField::$variant),)+
                    _ => None,
                }
            }

            pub fn kind(self) -> FieldKind {
                match self {
                    $(CompanyField::$variant => <$ty as FieldType>::KIND,)+
                }
            }
        }

        impl CompanyRecord {
            pub fn get(&self, field: CompanyField) -> Option<FieldValue> {
                match field {
                    $(CompanyField::$variant => self.$field.clone().map(FieldType::into_value),)+
                }
            }

            pub fn set(
                &mut self,
                field: CompanyField,
                value: Option<FieldValue>,
            ) -> Result<(), FieldTypeError> {
                match field {
                    $(
                        CompanyField::$variant => {
                            self.$field = match value {
                                None => None,
                                Some(value) => {
                                    let actual = value.kind();
                                    Some(<$ty as FieldType>::from_value(value).ok_or(FieldTypeError {
                                        field,
                                        expected: <$ty as FieldType>::KIND,
                                        actual,
                                    })?)
                                }
                            };
                        }
                    )+
                }
                Ok(())
            }
        }
    };
}

company_fields! {
    /// 13-digit corporate number; only ever holds a validated value.
    CorporateNumber => corporate_number: String = "corporateNumber",
    Name => name: String = "name",
    NameEn => name_en: String = "nameEn",
    NameKana => name_kana: String = "nameKana",
    CorporationType => corporation_type: String = "corporationType",
    Prefecture => prefecture: String = "prefecture",
    Address => address: String = "address",
    HeadquartersAddress => headquarters_address: String = "headquartersAddress",
    PostalCode => postal_code: String = "postalCode",
    PhoneNumber => phone_number: String = "phoneNumber",
    ContactPhoneNumber => contact_phone_number: String = "contactPhoneNumber",
    FaxNumber => fax_number: String = "faxNumber",
    Email => email: String = "email",
    CompanyUrl => company_url: String = "companyUrl",
    ContactFormUrl => contact_form_url: String = "contactFormUrl",
    RepresentativeName => representative_name: String = "representativeName",
    RepresentativeKana => representative_kana: String = "representativeKana",
    RepresentativeTitle => representative_title: String = "representativeTitle",
    RepresentativeBirthDate => representative_birth_date: String = "representativeBirthDate",
    /// ISO `YYYY-MM-DD`.
    DateOfEstablishment => date_of_establishment: String = "dateOfEstablishment",
    FoundingYear => founding_year: i64 = "foundingYear",
    MarketSegment => market_segment: String = "marketSegment",
    SecuritiesCode => securities_code: String = "securitiesCode",
    /// Financial amounts below are thousand-yen integers.
    CapitalStock => capital_stock: i64 = "capitalStock",
    LatestRevenue => latest_revenue: i64 = "latestRevenue",
    LatestProfit => latest_profit: i64 = "latestProfit",
    RevenueFromStatements => revenue_from_statements: i64 = "revenueFromStatements",
    OperatingIncome => operating_income: i64 = "operatingIncome",
    OrdinaryIncome => ordinary_income: i64 = "ordinaryIncome",
    TotalAssets => total_assets: i64 = "totalAssets",
    TotalLiabilities => total_liabilities: i64 = "totalLiabilities",
    NetAssets => net_assets: i64 = "netAssets",
    IssuedShares => issued_shares: i64 = "issuedShares",
    LatestFiscalYearMonth => latest_fiscal_year_month: String = "latestFiscalYearMonth",
    FiscalMonth => fiscal_month: String = "fiscalMonth",
    EmployeeCount => employee_count: i64 = "employeeCount",
    OfficeCount => office_count: i64 = "officeCount",
    FactoryCount => factory_count: i64 = "factoryCount",
    StoreCount => store_count: i64 = "storeCount",
    Industry => industry: String = "industry",
    IndustryLarge => industry_large: String = "industryLarge",
    IndustryMiddle => industry_middle: String = "industryMiddle",
    IndustrySmall => industry_small: String = "industrySmall",
    IndustryDetail => industry_detail: String = "industryDetail",
    IndustryCategories => industry_categories: Vec<String> = "industryCategories",
    BusinessSummary => business_summary: String = "businessSummary",
    BusinessDescriptions => business_descriptions: String = "businessDescriptions",
    BusinessItems => business_items: Vec<String> = "businessItems",
    CompanyDescription => company_description: String = "companyDescription",
    Overview => overview: String = "overview",
    Executives => executives: Vec<String> = "executives",
    Shareholders => shareholders: Vec<String> = "shareholders",
    Banks => banks: Vec<String> = "banks",
    Suppliers => suppliers: Vec<String> = "suppliers",
    Clients => clients: Vec<String> = "clients",
    Subsidiaries => subsidiaries: Vec<String> = "subsidiaries",
    Offices => offices: Vec<String> = "offices",
    Certifications => certifications: Vec<String> = "certifications",
    TransactionType => transaction_type: String = "transactionType",
    HasAnyWebPresence => has_any_web_presence: bool = "hasAnyWebPresence",
    ProfileUrl => profile_url: String = "profileUrl",
    ExternalDetailUrl => external_detail_url: String = "externalDetailUrl",
    Urls => urls: Vec<String> = "urls",
    Facebook => facebook: String = "facebook",
    Linkedin => linkedin: String = "linkedin",
    Wantedly => wantedly: String = "wantedly",
    Youtrust => youtrust: String = "youtrust",
    MetaKeywords => meta_keywords: Vec<String> = "metaKeywords",
    SpecialNote => special_note: String = "specialNote",
    /// RFC 3339 timestamps maintained by the reconciler.
    CreatedAt => created_at: String = "createdAt",
    UpdatedAt => updated_at: String = "updatedAt",
}

/// Fields whose presence makes `hasAnyWebPresence` true.
pub const WEB_PRESENCE_FIELDS: [CompanyField; 9] = [
    CompanyField::CompanyUrl,
    CompanyField::ContactFormUrl,
    CompanyField::Urls,
    CompanyField::ProfileUrl,
    CompanyField::ExternalDetailUrl,
    CompanyField::Facebook,
    CompanyField::Linkedin,
    CompanyField::Wantedly,
    CompanyField::Youtrust,
];

impl fmt::Display for CompanyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl CompanyRecord {
    pub fn is_blank(&self, field: CompanyField) -> bool {
        self.get(field).map_or(true, |v| v.is_blank())
    }

    /// Fields carrying data, in schema order.
    pub fn populated_fields(&self) -> Vec<CompanyField> {
        CompanyField::ALL
            .iter()
            .copied()
            .filter(|f| !self.is_blank(*f))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.populated_fields().is_empty()
    }

    /// Derived value of `hasAnyWebPresence`.
    pub fn has_web_presence(&self) -> bool {
        WEB_PRESENCE_FIELDS.iter().any(|&f| !self.is_blank(f))
    }

    /// Copy non-blank fields of `other` into blank fields of `self`.
    ///
    /// Fields listed in `overwrite` are replaced whenever `other` carries a
    /// different non-blank value. Returns the fields that were written.
    pub fn fill_from(
        &mut self,
        other: &CompanyRecord,
        overwrite: &BTreeSet<CompanyField>,
    ) -> Vec<CompanyField> {
        let mut written = Vec::new();
        for &field in CompanyField::ALL {
            let Some(incoming) = other.get(field) else {
                continue;
            };
            if incoming.is_blank() {
                continue;
            }
            let current = self.get(field);
            let target_blank = current.as_ref().map_or(true, FieldValue::is_blank);
            let replace = overwrite.contains(&field) && current.as_ref() != Some(&incoming);
            if (target_blank || replace) && self.set(field, Some(incoming)).is_ok() {
                written.push(field);
            }
        }
        written
    }

    /// Project only the listed fields into a new record.
    pub fn project(&self, fields: &[CompanyField]) -> CompanyRecord {
        let mut out = CompanyRecord::default();
        for &field in fields {
            // Same field on both sides, so the type always lines up.
            let _ = out.set(field, self.get(field));
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Where a candidate value was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_id: String,
    /// `path:line` for CSV rows, the page URL for fetched pages.
    pub locator: String,
    pub observed_at: DateTime<Utc>,
}

/// Partially populated projection of one CSV row or one fetched page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source: SourceRef,
    pub record: CompanyRecord,
}

impl CandidateRecord {
    pub fn new(source: SourceRef, record: CompanyRecord) -> Self {
        Self { source, record }
    }
}

/// Provenance entry: which source filled which field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFill {
    pub field: CompanyField,
    pub source: SourceRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndustryLevel {
    Large,
    Middle,
    Small,
    Detail,
}

impl IndustryLevel {
    pub const ALL: [IndustryLevel; 4] = [
        IndustryLevel::Large,
        IndustryLevel::Middle,
        IndustryLevel::Small,
        IndustryLevel::Detail,
    ];

    pub fn field(self) -> CompanyField {
        match self {
            IndustryLevel::Large => CompanyField::IndustryLarge,
            IndustryLevel::Middle => CompanyField::IndustryMiddle,
            IndustryLevel::Small => CompanyField::IndustrySmall,
            IndustryLevel::Detail => CompanyField::IndustryDetail,
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "large" | "大" => Some(IndustryLevel::Large),
            "middle" | "中" => Some(IndustryLevel::Middle),
            "small" | "小" => Some(IndustryLevel::Small),
            "detail" | "細" => Some(IndustryLevel::Detail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndustryMasterEntry {
    #[serde(rename = "field")]
    pub level: IndustryLevel,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_keys_round_trip_through_from_key() {
        for &field in CompanyField::ALL {
            assert_eq!(CompanyField::from_key(field.key()), Some(field));
        }
        assert_eq!(CompanyField::from_key("noSuchField"), None);
    }

    #[test]
    fn serializes_with_document_keys_and_skips_absent_fields() {
        let record = CompanyRecord {
            name: Some("株式会社テスト".into()),
            capital_stock: Some(10000),
            ..Default::default()
        };
        let json = record.to_json();
        assert_eq!(json["name"], "株式会社テスト");
        assert_eq!(json["capitalStock"], 10000);
        assert!(json.get("corporateNumber").is_none());
    }

    #[test]
    fn set_rejects_mismatched_kind() {
        let mut record = CompanyRecord::default();
        let err = record
            .set(CompanyField::CapitalStock, Some(FieldValue::Text("1000".into())))
            .unwrap_err();
        assert_eq!(err.expected, FieldKind::Integer);
        assert_eq!(err.actual, FieldKind::Text);
        assert!(record.capital_stock.is_none());
    }

    #[test]
    fn blankness_covers_empty_strings_and_lists() {
        let record = CompanyRecord {
            name: Some("  ".into()),
            banks: Some(vec![]),
            employee_count: Some(0),
            ..Default::default()
        };
        assert!(record.is_blank(CompanyField::Name));
        assert!(record.is_blank(CompanyField::Banks));
        assert!(!record.is_blank(CompanyField::EmployeeCount));
        assert_eq!(record.populated_fields(), vec![CompanyField::EmployeeCount]);
    }

    #[test]
    fn legacy_null_literals_are_blank() {
        let record = CompanyRecord {
            name: Some("null".into()),
            email: Some(" Undefined ".into()),
            banks: Some(vec!["null".into(), "".into()]),
            company_url: Some("https://nullsoft.example".into()),
            ..Default::default()
        };
        assert!(record.is_blank(CompanyField::Name));
        assert!(record.is_blank(CompanyField::Email));
        assert!(record.is_blank(CompanyField::Banks));
        assert!(!record.is_blank(CompanyField::CompanyUrl));
    }

    #[test]
    fn web_presence_follows_web_fields() {
        let mut record = CompanyRecord {
            company_url: Some("undefined".into()),
            urls: Some(vec![]),
            has_any_web_presence: Some(true),
            ..Default::default()
        };
        assert!(!record.has_web_presence());
        record.wantedly = Some("https://www.wantedly.com/companies/example".into());
        assert!(record.has_web_presence());
    }

    #[test]
    fn fill_from_only_writes_blank_targets() {
        let mut existing = CompanyRecord {
            name: Some("株式会社A".into()),
            capital_stock: Some(3000),
            phone_number: Some(String::new()),
            ..Default::default()
        };
        let incoming = CompanyRecord {
            name: Some("株式会社B".into()),
            capital_stock: Some(5000),
            phone_number: Some("03-1234-5678".into()),
            banks: Some(vec!["みずほ銀行".into()]),
            ..Default::default()
        };
        let written = existing.fill_from(&incoming, &BTreeSet::new());
        assert_eq!(written, vec![CompanyField::PhoneNumber, CompanyField::Banks]);
        assert_eq!(existing.name.as_deref(), Some("株式会社A"));
        assert_eq!(existing.capital_stock, Some(3000));
        assert_eq!(existing.phone_number.as_deref(), Some("03-1234-5678"));
    }

    #[test]
    fn fill_from_replaces_overwrite_fields_only_when_different() {
        let overwrite: BTreeSet<_> = [CompanyField::UpdatedAt].into_iter().collect();
        let mut existing = CompanyRecord {
            updated_at: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let incoming = CompanyRecord {
            updated_at: Some("2025-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert_eq!(existing.fill_from(&incoming, &overwrite), vec![CompanyField::UpdatedAt]);
        assert!(existing.fill_from(&incoming, &overwrite).is_empty());
    }

    #[test]
    fn industry_levels_map_to_record_fields() {
        assert_eq!(IndustryLevel::Middle.field(), CompanyField::IndustryMiddle);
        assert_eq!(IndustryLevel::parse("Detail"), Some(IndustryLevel::Detail));
        assert_eq!(IndustryLevel::parse("中"), Some(IndustryLevel::Middle));
        assert_eq!(IndustryLevel::parse("other"), None);
    }
}
