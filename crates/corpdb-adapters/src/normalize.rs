//! Field normalizer: raw cell text in, typed value or `None` out.
//!
//! Nothing in here returns an error. Malformed input is data; it simply
//! yields `None` and the field is left out of the candidate.

use std::fmt;

use chrono::NaiveDate;
use corpdb_core::{CompanyField, FieldValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const PREFECTURES: [&str; 47] = [
    "北海道", "青森県", "岩手県", "宮城県", "秋田県", "山形県", "福島県", "茨城県", "栃木県",
    "群馬県", "埼玉県", "千葉県", "東京都", "神奈川県", "新潟県", "富山県", "石川県", "福井県",
    "山梨県", "長野県", "岐阜県", "静岡県", "愛知県", "三重県", "滋賀県", "京都府", "大阪府",
    "兵庫県", "奈良県", "和歌山県", "鳥取県", "島根県", "岡山県", "広島県", "山口県", "徳島県",
    "香川県", "愛媛県", "高知県", "福岡県", "佐賀県", "長崎県", "熊本県", "大分県", "宮崎県",
    "鹿児島県", "沖縄県",
];

static DATE_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:\d{4}年\d{1,2}月|\d{4}/\d{1,2}/\d{1,2}|\d{4}-\d{1,2}-\d{1,2}|(?:明治|大正|昭和|平成|令和)(?:元|\d{1,2})年)",
    )
    .expect("date-like pattern")
});
static AMOUNT_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(兆|億|千万|百万|万|千)?(円)?").expect("amount pattern")
});
static COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?)(万|千)?").expect("count pattern"));
static ERA_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(明治|大正|昭和|平成|令和)(元|\d{1,2})年(?:(\d{1,2})月(?:(\d{1,2})日)?)?")
        .expect("era date pattern")
});
static WESTERN_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})(?:年|/|-|\.)(\d{1,2})(?:(?:月|/|-|\.)(?:(\d{1,2})日?)?)?")
        .expect("date pattern")
});
static YEAR_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})(?:年|$)").expect("year pattern"));
static POSTAL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^〒?\s*(\d{3})-?(\d{4})\s*").expect("postal prefix pattern"));
/// Postal prefix as written, before any width folding.
static RAW_POSTAL_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^〒?\s*[0-9０-９]{3}[-－ー−‐]?[0-9０-９]{4}\s*").expect("raw postal prefix pattern")
});
static PHONE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i:tel|phone|電話番号|電話|代表)\s*[:.]?\s*").expect("phone label pattern")
});
static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email pattern")
});
static HTTP_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://[A-Za-z0-9\-._~:/?#\[\]@!$&'()*+,;=%]+").expect("url pattern")
});
static MAP_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:/地図|Google\s*マップ(?:で表示)?).*$").expect("map noise pattern")
});
static PLACEHOLDER_CORPORATE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:9\d{2}0{10}|10{12})$").expect("placeholder pattern"));

/// Full-width ASCII and the ideographic space folded to half-width.
pub fn fold_width(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            '\u{3000}' => ' ',
            _ => c,
        })
        .collect()
}

/// Dash look-alikes to `-`; only for numeric codes, katakana `ー` is a dash there.
fn fold_dashes(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'ー' | '−' | '‐' | '‑' | '–' | '—' | '―' => '-',
            _ => c,
        })
        .collect()
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn clean_text(raw: &str) -> Option<String> {
    let s = collapse_whitespace(raw);
    (!s.is_empty()).then_some(s)
}

pub fn looks_like_date(raw: &str) -> bool {
    DATE_LIKE.is_match(fold_width(raw).trim())
}

/// Unit a bare financial figure is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AmountUnit {
    Yen,
    ThousandYen,
    TenThousandYen,
    MillionYen,
    HundredMillionYen,
    TrillionYen,
}

impl AmountUnit {
    /// Multiplier to the thousand-yen scale.
    pub fn factor(self) -> f64 {
        match self {
            AmountUnit::Yen => 0.001,
            AmountUnit::ThousandYen => 1.0,
            AmountUnit::TenThousandYen => 10.0,
            AmountUnit::MillionYen => 1_000.0,
            AmountUnit::HundredMillionYen => 100_000.0,
            AmountUnit::TrillionYen => 1_000_000_000.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AmountUnit::Yen => "円",
            AmountUnit::ThousandYen => "千円",
            AmountUnit::TenThousandYen => "万円",
            AmountUnit::MillionYen => "百万円",
            AmountUnit::HundredMillionYen => "億円",
            AmountUnit::TrillionYen => "兆円",
        }
    }

    /// Parses `百万円`, `(千円)`, `単位:億円` and the like.
    pub fn from_label(label: &str) -> Option<Self> {
        let folded = fold_width(label);
        let s: String = folded
            .chars()
            .filter(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '[' | ']' | '【' | '】'))
            .collect();
        let s = s.trim_start_matches("単位").trim_start_matches(':');
        match s {
            "円" | "yen" => Some(AmountUnit::Yen),
            "千円" | "千" => Some(AmountUnit::ThousandYen),
            "万円" | "万" => Some(AmountUnit::TenThousandYen),
            "百万円" | "百万" => Some(AmountUnit::MillionYen),
            "億円" | "億" => Some(AmountUnit::HundredMillionYen),
            "兆円" | "兆" => Some(AmountUnit::TrillionYen),
            _ => None,
        }
    }

    /// Unit carried inside a header such as `売上(百万)` or `資本金（千円）`.
    pub fn from_header(header: &str) -> Option<Self> {
        let folded = fold_width(header);
        let open = folded.rfind('(')?;
        let close = folded[open..].find(')')? + open;
        Self::from_label(&folded[open + 1..close])
    }
}

impl fmt::Display for AmountUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl TryFrom<String> for AmountUnit {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_label(&value).ok_or_else(|| format!("unknown amount unit '{value}'"))
    }
}

impl From<AmountUnit> for String {
    fn from(value: AmountUnit) -> Self {
        value.label().to_string()
    }
}

fn multiplier_factor(label: &str) -> f64 {
    match label {
        "兆" => 1_000_000_000.0,
        "億" => 100_000.0,
        "千万" => 10_000.0,
        "百万" => 1_000.0,
        "万" => 10.0,
        _ => 1.0,
    }
}

fn strip_sign(s: &str) -> (bool, &str) {
    for mark in ['△', '▲', '-', '−'] {
        if let Some(rest) = s.strip_prefix(mark) {
            return (true, rest);
        }
    }
    (false, s)
}

/// Financial figure normalized to thousand-yen.
///
/// Bare numbers take `default_unit`, or thousand-yen when none is known.
/// Compound figures (`1億5000万円`) are summed; ranges keep the lower bound.
pub fn normalize_amount(raw: &str, default_unit: Option<AmountUnit>) -> Option<i64> {
    let folded = fold_width(raw);
    let s = folded.trim();
    if s.is_empty() || looks_like_date(s) {
        return None;
    }
    let (negative, s) = strip_sign(s);
    let s = s.split(['~', '〜']).next().unwrap_or(s);
    let body: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .skip_while(|c| matches!(c, '約' | '概'))
        .collect();

    let mut total = 0.0;
    let mut pos = 0;
    let mut matched = false;
    for caps in AMOUNT_SEGMENT.captures_iter(&body) {
        let whole = caps.get(0)?;
        if whole.start() != pos {
            break;
        }
        let value: f64 = caps[1].parse().ok()?;
        let has_yen = caps.get(3).is_some();
        let factor = match caps.get(2) {
            Some(mult) => multiplier_factor(mult.as_str()),
            None if has_yen => AmountUnit::Yen.factor(),
            None => default_unit.unwrap_or(AmountUnit::ThousandYen).factor(),
        };
        total += value * factor;
        pos = whole.end();
        matched = true;
        if has_yen {
            break;
        }
    }
    if !matched || body[pos..].starts_with(['年', '月', '日', '人', '名']) {
        return None;
    }
    let total = if negative { -total } else { total };
    (total.is_finite() && total.abs() < i64::MAX as f64).then(|| total.round() as i64)
}

/// Headcounts and other counts: `1,200名`, `約3千人`, `12万株`.
pub fn normalize_count(raw: &str) -> Option<i64> {
    let folded = fold_width(raw);
    if looks_like_date(&folded) {
        return None;
    }
    let body: String = folded
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .skip_while(|c| matches!(c, '約' | '概'))
        .collect();
    let caps = COUNT.captures(&body)?;
    let rest = &body[caps.get(0)?.end()..];
    if rest.starts_with(['年', '月', '日', '円']) {
        return None;
    }
    let value: f64 = caps[1].parse().ok()?;
    let factor = match caps.get(2).map(|m| m.as_str()) {
        Some("万") => 10_000.0,
        Some("千") => 1_000.0,
        _ => 1.0,
    };
    let total = value * factor;
    (total.is_finite() && total >= 0.0 && total < i64::MAX as f64).then(|| total.round() as i64)
}

/// `NNN-NNNN`; seven bare digits are reformatted. A 13-digit value is a
/// corporate number in the wrong column and is rejected.
pub fn normalize_postal_code(raw: &str) -> Option<String> {
    let folded = fold_dashes(&fold_width(raw));
    let s: String = folded
        .trim()
        .trim_start_matches('〒')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if !s.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return None;
    }
    let bytes = s.as_bytes();
    if s.len() == 8 && bytes[3] == b'-' && s.chars().filter(|c| *c == '-').count() == 1 {
        return Some(s);
    }
    if s.len() == 7 && s.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("{}-{}", &s[..3], &s[3..]));
    }
    None
}

pub fn is_placeholder_corporate_number(digits: &str) -> bool {
    let mut chars = digits.chars();
    let all_same = match chars.next() {
        Some(first) => chars.all(|c| c == first),
        None => true,
    };
    all_same || PLACEHOLDER_CORPORATE_NUMBER.is_match(digits)
}

pub fn is_valid_corporate_number(value: &str) -> bool {
    value.len() == 13
        && value.chars().all(|c| c.is_ascii_digit())
        && !is_placeholder_corporate_number(value)
}

/// 13-digit corporate number, or `None` for anything else including the
/// known placeholders. Spreadsheet exponent notation (`2.01E+12`) is expanded.
pub fn normalize_corporate_number(raw: &str) -> Option<String> {
    let folded = fold_width(raw);
    let s = folded.trim();
    if s.is_empty() {
        return None;
    }
    let expanded;
    let s = match s.parse::<f64>() {
        Ok(value) if s.contains(['e', 'E']) => {
            if !value.is_finite() || value < 0.0 {
                return None;
            }
            expanded = format!("{value:.0}");
            expanded.as_str()
        }
        _ => s,
    };
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    is_valid_corporate_number(&digits).then_some(digits)
}

fn era_base(era: &str) -> Option<i32> {
    match era {
        "明治" => Some(1868),
        "大正" => Some(1912),
        "昭和" => Some(1926),
        "平成" => Some(1989),
        "令和" => Some(2019),
        _ => None,
    }
}

fn era_year(era: &str, year: &str) -> Option<i32> {
    let n: i32 = if year == "元" { 1 } else { year.parse().ok()? };
    if n < 1 {
        return None;
    }
    era_base(era).map(|base| base + n - 1)
}

/// ISO `YYYY-MM-DD`. Missing day defaults to the 1st; a missing month is
/// not guessed.
pub fn normalize_date(raw: &str) -> Option<String> {
    let folded = fold_width(raw);
    let s: String = folded.chars().filter(|c| !c.is_whitespace()).collect();

    let (year, month, day) = if let Some(caps) = ERA_DATE.captures(&s) {
        let year = era_year(&caps[1], &caps[2])?;
        let month: u32 = caps.get(3)?.as_str().parse().ok()?;
        let day = caps.get(4).map_or(Some(1), |d| d.as_str().parse().ok())?;
        (year, month, day)
    } else {
        let caps = WESTERN_DATE.captures(&s)?;
        let year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let day = caps.get(3).map_or(Some(1), |d| d.as_str().parse().ok())?;
        (year, month, day)
    };
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Four-digit year from a date, an era year or a bare `1998年`.
pub fn normalize_year(raw: &str) -> Option<i64> {
    let folded = fold_width(raw);
    let s: String = folded.chars().filter(|c| !c.is_whitespace()).collect();
    let year = if let Some(caps) = ERA_DATE.captures(&s) {
        era_year(&caps[1], &caps[2])?
    } else {
        YEAR_ONLY
            .captures(&s)
            .or_else(|| WESTERN_DATE.captures(&s))?
            .get(1)?
            .as_str()
            .parse()
            .ok()?
    };
    (1600..=2100).contains(&year).then_some(i64::from(year))
}

/// Digits, hyphens, parentheses and spaces only, with at least 9 digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let folded = fold_dashes(&fold_width(raw));
    let s = PHONE_LABEL.replace(folded.trim(), "");
    let s = s.trim();
    if s.is_empty() || looks_like_date(s) {
        return None;
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '-' | '(' | ')' | '+' | ' '))
    {
        return None;
    }
    let digits = s.chars().filter(|c| c.is_ascii_digit()).count();
    (digits >= 9).then(|| collapse_whitespace(s))
}

pub fn normalize_email(raw: &str) -> Option<String> {
    EMAIL
        .find(&fold_width(raw))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// First `http(s)://` URL in noisy text.
pub fn clean_url(raw: &str) -> Option<String> {
    HTTP_URL
        .find(&fold_width(raw))
        .map(|m| m.as_str().to_string())
}

/// Leading `〒NNN-NNNN` of an address, if any.
pub fn postal_code_in_address(raw: &str) -> Option<String> {
    let folded = fold_dashes(&fold_width(raw));
    let caps = POSTAL_PREFIX.captures(folded.trim())?;
    Some(format!("{}-{}", &caps[1], &caps[2]))
}

/// Address without a postal prefix or trailing map-link text.
pub fn clean_address(raw: &str) -> Option<String> {
    let s = collapse_whitespace(raw);
    let s = RAW_POSTAL_PREFIX.replace(&s, "");
    let s = MAP_NOISE.replace(&s, "");
    clean_text(&s)
}

pub fn prefecture_from_address(address: &str) -> Option<&'static str> {
    let address = address.trim();
    let address = match RAW_POSTAL_PREFIX.find(address) {
        Some(m) => &address[m.end()..],
        None => address,
    };
    PREFECTURES.iter().copied().find(|p| address.starts_with(p))
}

/// One of the 47 prefecture names; `東京` and `大阪` gain their suffix.
pub fn normalize_prefecture(raw: &str) -> Option<String> {
    let s: String = fold_width(raw).chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return None;
    }
    if let Some(p) = PREFECTURES.iter().find(|p| **p == s) {
        return Some(p.to_string());
    }
    for suffix in ["都", "道", "府", "県"] {
        let candidate = format!("{s}{suffix}");
        if let Some(p) = PREFECTURES.iter().find(|p| **p == candidate) {
            return Some(p.to_string());
        }
    }
    prefecture_from_address(&s).map(str::to_string)
}

/// Company or person name as matched against stored records.
pub fn normalize_name(raw: &str) -> Option<String> {
    let folded = fold_width(raw);
    let stripped: String = folded
        .chars()
        .filter(|c| !matches!(c, '「' | '」' | '[' | ']'))
        .collect();
    clean_text(&stripped)
}

/// Splits `A、B、C` style cells; order kept, duplicates dropped.
pub fn split_list(raw: &str) -> Option<Vec<String>> {
    let folded = fold_width(raw);
    let mut items: Vec<String> = Vec::new();
    for part in folded.split(['、', ',', ';', '\n', '|']) {
        if let Some(item) = clean_text(part) {
            if !items.contains(&item) {
                items.push(item);
            }
        }
    }
    (!items.is_empty()).then_some(items)
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match fold_width(raw).trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "有" | "あり" | "○" | "◯" => Some(true),
        "false" | "0" | "no" | "n" | "無" | "なし" | "×" | "-" => Some(false),
        _ => None,
    }
}

/// Parsing rule applied to a field's raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    Text,
    Name,
    CorporateNumber,
    PostalCode,
    Phone,
    Email,
    Url,
    Address,
    Prefecture,
    Date,
    Year,
    Amount,
    Count,
    List,
    Flag,
    /// Raw label, resolved against the industry master afterwards.
    Industry,
    /// Maintained by the reconciler, never read from a source.
    Managed,
}

impl FieldRule {
    pub fn for_field(field: CompanyField) -> Self {
        use CompanyField::*;
        match field {
            CorporateNumber => FieldRule::CorporateNumber,
            Name | NameEn | NameKana | RepresentativeName | RepresentativeKana => FieldRule::Name,
            PostalCode => FieldRule::PostalCode,
            PhoneNumber | ContactPhoneNumber | FaxNumber => FieldRule::Phone,
            CompanyField::Email => FieldRule::Email,
            CompanyUrl | ContactFormUrl | ProfileUrl | ExternalDetailUrl | Facebook | Linkedin
            | Wantedly | Youtrust => FieldRule::Url,
            CompanyField::Address | HeadquartersAddress => FieldRule::Address,
            CompanyField::Prefecture => FieldRule::Prefecture,
            DateOfEstablishment | RepresentativeBirthDate => FieldRule::Date,
            FoundingYear => FieldRule::Year,
            CapitalStock | LatestRevenue | LatestProfit | RevenueFromStatements
            | OperatingIncome | OrdinaryIncome | TotalAssets | TotalLiabilities | NetAssets => {
                FieldRule::Amount
            }
            EmployeeCount | OfficeCount | FactoryCount | StoreCount | IssuedShares => {
                FieldRule::Count
            }
            CompanyField::Industry | IndustryLarge | IndustryMiddle | IndustrySmall
            | IndustryDetail => FieldRule::Industry,
            CreatedAt | UpdatedAt => FieldRule::Managed,
            HasAnyWebPresence => FieldRule::Flag,
            IndustryCategories | BusinessItems | Executives | Shareholders | Banks | Suppliers
            | Clients | Subsidiaries | Offices | Certifications | MetaKeywords | Urls => {
                FieldRule::List
            }
            CorporationType | RepresentativeTitle | MarketSegment | SecuritiesCode
            | LatestFiscalYearMonth | FiscalMonth | BusinessSummary | BusinessDescriptions
            | CompanyDescription | Overview | TransactionType | SpecialNote => FieldRule::Text,
        }
    }
}

/// Normalize one raw cell for `field`. `unit` only affects amounts.
pub fn normalize_field(
    field: CompanyField,
    raw: &str,
    unit: Option<AmountUnit>,
) -> Option<FieldValue> {
    let text = |v: Option<String>| v.map(FieldValue::Text);
    match FieldRule::for_field(field) {
        FieldRule::Text | FieldRule::Industry => text(clean_text(raw)),
        FieldRule::Name => text(normalize_name(raw)),
        FieldRule::CorporateNumber => text(normalize_corporate_number(raw)),
        FieldRule::PostalCode => text(normalize_postal_code(raw)),
        FieldRule::Phone => text(normalize_phone(raw)),
        FieldRule::Email => text(normalize_email(raw)),
        FieldRule::Url => text(clean_url(raw)),
        FieldRule::Address => text(clean_address(raw)),
        FieldRule::Prefecture => text(normalize_prefecture(raw)),
        FieldRule::Date => text(normalize_date(raw)),
        FieldRule::Year => normalize_year(raw).map(FieldValue::Integer),
        FieldRule::Amount => normalize_amount(raw, unit).map(FieldValue::Integer),
        FieldRule::Count => normalize_count(raw).map(FieldValue::Integer),
        FieldRule::List => split_list(raw).map(FieldValue::List),
        FieldRule::Flag => parse_flag(raw).map(FieldValue::Flag),
        FieldRule::Managed => None,
    }
}
