//! Label/value extraction from fetched company-profile pages.

use corpdb_core::{CandidateRecord, SourceRef};
use corpdb_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::normalize::{clean_text, clean_url};
use crate::{AdapterError, CandidateAssembler};

/// Turns a page into `(label, value)` pairs for the header mapping.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, html: &str) -> Result<Vec<(String, String)>, AdapterError>;
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

/// Generic profile tables: `<tr><th>label</th><td>value</td></tr>` rows,
/// `<dl><dt>label</dt><dd>value</dd></dl>` lists and the keywords meta tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelValueExtractor;

impl PageExtractor for LabelValueExtractor {
    fn extract(&self, html: &str) -> Result<Vec<(String, String)>, AdapterError> {
        let document = Html::parse_document(html);
        let row_sel = selector("tr")?;
        let label_sel = selector("th")?;
        let value_sel = selector("td")?;
        let dl_sel = selector("dl")?;
        let meta_sel = selector(r#"meta[name="keywords"]"#)?;

        let mut pairs = Vec::new();
        for row in document.select(&row_sel) {
            let label = row.select(&label_sel).next().and_then(element_text);
            let value = row.select(&value_sel).next().and_then(element_text);
            if let (Some(label), Some(value)) = (label, value) {
                pairs.push((label, value));
            }
        }

        for dl in document.select(&dl_sel) {
            let mut label: Option<String> = None;
            for child in dl.children().filter_map(ElementRef::wrap) {
                match child.value().name() {
                    "dt" => label = element_text(child),
                    "dd" => {
                        if let (Some(l), Some(value)) = (label.take(), element_text(child)) {
                            pairs.push((l, value));
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(keywords) = document
            .select(&meta_sel)
            .next()
            .and_then(|m| m.value().attr("content"))
            .and_then(clean_text)
        {
            pairs.push(("metaKeywords".to_string(), keywords));
        }

        Ok(pairs)
    }
}

/// Fetch one page and assemble a candidate from it. `None` when the page
/// carries no identity (no name and no corporate number).
pub async fn fetch_page_candidate(
    http: &HttpFetcher,
    extractor: &dyn PageExtractor,
    assembler: &CandidateAssembler,
    source_id: &str,
    url: &str,
) -> Result<Option<CandidateRecord>, AdapterError> {
    let page = http.fetch_page(source_id, url).await?;
    let pairs = extractor.extract(&page.body)?;
    debug!(url, labels = pairs.len(), "extracted page labels");

    let source = SourceRef {
        source_id: source_id.to_string(),
        locator: page.final_url.clone(),
        observed_at: page.fetched_at,
    };
    let mut candidate = assembler.assemble(source, pairs.iter().map(|(l, v)| (l.as_str(), v.as_str())));
    if let Some(candidate) = candidate.as_mut() {
        if candidate.record.external_detail_url.is_none() {
            candidate.record.external_detail_url = clean_url(&page.final_url);
        }
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
<html><head><meta name="keywords" content="製造, 部品"></head>
<body>
<table>
  <tr><th>会社名</th><td>株式会社 テスト</td></tr>
  <tr><th>資本金</th><td>1,000万円</td></tr>
  <tr><td>no label</td></tr>
</table>
<dl>
  <dt>代表者</dt><dd>山田 太郎</dd>
  <dt>電話番号</dt><dd>03-1234-5678</dd>
  <dt>空欄</dt><dd> </dd>
</dl>
</body></html>
"#;

    #[test]
    fn extracts_table_rows_definition_lists_and_keywords() {
        let pairs = LabelValueExtractor.extract(PROFILE).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("会社名".to_string(), "株式会社 テスト".to_string()),
                ("資本金".to_string(), "1,000万円".to_string()),
                ("代表者".to_string(), "山田 太郎".to_string()),
                ("電話番号".to_string(), "03-1234-5678".to_string()),
                ("metaKeywords".to_string(), "製造, 部品".to_string()),
            ]
        );
    }

    #[test]
    fn page_without_profile_markup_yields_nothing() {
        let pairs = LabelValueExtractor.extract("<html><body><p>hello</p></body></html>").unwrap();
        assert!(pairs.is_empty());
    }
}
