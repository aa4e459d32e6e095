//! Source header → record field mapping, loaded from `rules/headers.yaml`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use corpdb_core::CompanyField;
use serde::Deserialize;

use crate::normalize::{fold_width, AmountUnit};
use crate::AdapterError;

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderRulesFile {
    pub fields: BTreeMap<String, HeaderRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderRule {
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Unit of bare amounts when the header itself names none.
    #[serde(default)]
    pub unit: Option<AmountUnit>,
}

/// One field a column feeds, with the amount unit in effect for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedColumn {
    pub field: CompanyField,
    pub unit: Option<AmountUnit>,
}

/// BOM dropped, full-width folded, all whitespace removed.
pub fn normalize_header(raw: &str) -> String {
    fold_width(raw.trim_start_matches('\u{feff}'))
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// `売上(百万)` → `売上`; headers without a trailing bracket are returned as is.
fn strip_bracket_suffix(header: &str) -> &str {
    match header.rfind('(') {
        Some(open) if header.ends_with(')') && open > 0 => &header[..open],
        _ => header,
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    by_alias: HashMap<String, Vec<(CompanyField, Option<AmountUnit>)>>,
}

impl HeaderMap {
    pub fn from_rules(rules: HeaderRulesFile) -> Result<Self, AdapterError> {
        let mut by_alias: HashMap<String, Vec<(CompanyField, Option<AmountUnit>)>> =
            HashMap::new();
        for (key, rule) in rules.fields {
            let field =
                CompanyField::from_key(&key).ok_or_else(|| AdapterError::UnknownField(key.clone()))?;
            for alias in &rule.aliases {
                let targets = by_alias.entry(normalize_header(alias)).or_default();
                if !targets.iter().any(|(f, _)| *f == field) {
                    targets.push((field, rule.unit));
                }
            }
        }
        Ok(Self { by_alias })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, AdapterError> {
        Self::from_rules(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Fields a header feeds. Aliases win; a header that is itself a
    /// document key maps to that field. Unknown headers resolve to nothing.
    pub fn resolve(&self, header: &str) -> Vec<ResolvedColumn> {
        let normalized = normalize_header(header);
        let header_unit = AmountUnit::from_header(&normalized);
        let targets = self
            .by_alias
            .get(&normalized)
            .or_else(|| self.by_alias.get(strip_bracket_suffix(&normalized)));

        if let Some(targets) = targets {
            return targets
                .iter()
                .map(|(field, unit)| ResolvedColumn {
                    field: *field,
                    unit: header_unit.or(*unit),
                })
                .collect();
        }
        CompanyField::from_key(&normalized)
            .map(|field| ResolvedColumn {
                field,
                unit: header_unit,
            })
            .into_iter()
            .collect()
    }

    pub fn resolve_all<S: AsRef<str>>(&self, headers: &[S]) -> Vec<Vec<ResolvedColumn>> {
        headers.iter().map(|h| self.resolve(h.as_ref())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
fields:
  name:
    aliases: [会社名, 企業名, 商号又は名称, 法人名, companyName]
  latestRevenue:
    aliases: [売上, 売上高, 直近売上]
    unit: 千円
  industry:
    aliases: [業種1, 業種]
  industryLarge:
    aliases: [業種1, 業種(大)]
"#;

    fn map() -> HeaderMap {
        HeaderMap::from_yaml_str(RULES).expect("rules")
    }

    #[test]
    fn headers_are_normalized_before_lookup() {
        assert_eq!(normalize_header("\u{feff}会社 名"), "会社名");
        assert_eq!(normalize_header("業種（大）"), "業種(大)");
        let resolved = map().resolve("\u{feff}会社名");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].field, CompanyField::Name);
    }

    #[test]
    fn header_unit_overrides_rule_unit() {
        let map = map();
        let plain = map.resolve("売上");
        assert_eq!(plain[0].unit, Some(AmountUnit::ThousandYen));
        let millions = map.resolve("売上(百万)");
        assert_eq!(millions[0].field, CompanyField::LatestRevenue);
        assert_eq!(millions[0].unit, Some(AmountUnit::MillionYen));
    }

    #[test]
    fn one_header_can_feed_several_fields() {
        let fields: Vec<_> = map().resolve("業種1").into_iter().map(|c| c.field).collect();
        assert_eq!(fields, vec![CompanyField::Industry, CompanyField::IndustryLarge]);
    }

    #[test]
    fn document_keys_map_directly_and_unknown_headers_are_ignored() {
        let map = map();
        assert_eq!(map.resolve("corporateNumber")[0].field, CompanyField::CorporateNumber);
        assert!(map.resolve("備考欄").is_empty());
    }

    #[test]
    fn unknown_field_keys_are_rejected() {
        let err = HeaderMap::from_yaml_str("fields:\n  nope:\n    aliases: [x]\n").unwrap_err();
        assert!(matches!(err, AdapterError::UnknownField(key) if key == "nope"));
    }
}
