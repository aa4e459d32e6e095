//! Document store contract, in-memory and PostgreSQL stores, and HTTP fetch
//! utilities for corpdb.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use corpdb_core::{CompanyField, CompanyRecord, FieldTypeError, FieldValue};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

pub mod http;
pub mod pg;

pub use http::{BackoffPolicy, FetchError, FetchedPage, HttpClientConfig, HttpFetcher};
pub use pg::PgCompanyStore;

pub const CRATE_NAME: &str = "corpdb-storage";

/// Firestore's commit limit; Postgres batches reuse the same size.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("document {0} not found")]
    NotFound(String),
    #[error(transparent)]
    FieldType(#[from] FieldTypeError),
    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Worth retrying with backoff; everything else fails the record at once.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Exact-match predicate on one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: CompanyField,
    pub value: FieldValue,
}

impl Filter {
    pub fn eq(field: CompanyField, value: impl Into<String>) -> Self {
        Self {
            field,
            value: FieldValue::Text(value.into()),
        }
    }

    pub fn matches(&self, record: &CompanyRecord) -> bool {
        record.get(self.field).as_ref() == Some(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredCompany {
    pub id: String,
    pub record: CompanyRecord,
}

/// First hit of a lookup plus the total number of documents that matched.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundRecord {
    pub company: StoredCompany,
    pub match_count: usize,
}

impl FoundRecord {
    pub fn is_ambiguous(&self) -> bool {
        self.match_count > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Only blank fields are written, except those listed in `overwrite`.
    FillOnly { overwrite: BTreeSet<CompanyField> },
    /// Every non-blank incoming field replaces the stored one.
    Replace,
}

impl WriteMode {
    pub fn fill_only() -> Self {
        WriteMode::FillOnly {
            overwrite: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Upsert {
        id: String,
        fields: CompanyRecord,
        mode: WriteMode,
    },
    ClearFields {
        id: String,
        fields: Vec<CompanyField>,
    },
    Delete {
        id: String,
    },
}

/// Apply an upsert to the current document state; shared by every store.
pub fn apply_write(
    existing: Option<CompanyRecord>,
    fields: &CompanyRecord,
    mode: &WriteMode,
) -> (CompanyRecord, Vec<CompanyField>) {
    let mut doc = existing.unwrap_or_default();
    let written = match mode {
        WriteMode::FillOnly { overwrite } => doc.fill_from(fields, overwrite),
        WriteMode::Replace => {
            let all: BTreeSet<CompanyField> = CompanyField::ALL.iter().copied().collect();
            doc.fill_from(fields, &all)
        }
    };
    (doc, written)
}

pub fn clear_fields(doc: &mut CompanyRecord, fields: &[CompanyField]) {
    for &field in fields {
        // Clearing never fails: `None` fits every field type.
        let _ = doc.set(field, None);
    }
}

/// Datastore operations the reconciler relies on.
#[async_trait]
pub trait CompanyStore: Send + Sync {
    /// First document (in id order) matching every filter.
    async fn find_one(&self, filters: &[Filter]) -> Result<Option<FoundRecord>, StoreError>;

    /// Up to `limit` documents (in id order) matching every filter.
    async fn find_many(
        &self,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<StoredCompany>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<StoredCompany>, StoreError>;

    /// Merge-write `fields` into document `id`, creating it when absent.
    /// Returns the fields actually written.
    async fn upsert(
        &self,
        id: &str,
        fields: &CompanyRecord,
        mode: &WriteMode,
    ) -> Result<Vec<CompanyField>, StoreError>;

    async fn create_with_generated_id(&self, fields: &CompanyRecord) -> Result<String, StoreError>;

    /// Returns `false` without writing when `id` already exists.
    async fn create_if_absent(&self, id: &str, fields: &CompanyRecord) -> Result<bool, StoreError>;

    async fn delete_batch(&self, ids: &[String]) -> Result<usize, StoreError>;

    /// Commit all ops together or none of them.
    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError>;

    /// Id-ordered page of documents with ids strictly greater than `after`.
    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<StoredCompany>, StoreError>;
}

/// Timestamp + sequence document ids for records without a corporate number.
#[derive(Debug, Default)]
pub struct IdGenerator {
    sequence: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) % 10_000;
        format!("{}{:04}", Utc::now().timestamp_millis(), seq)
    }
}

#[derive(Debug, Error)]
#[error("batch {batch_index} failed after {committed_ops} committed ops: {source}")]
pub struct BatchError {
    pub batch_index: usize,
    pub committed_ops: usize,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batches: usize,
    pub committed_ops: usize,
}

/// Buffers write ops and commits them in chunks of at most `max_batch_size`.
///
/// Each chunk commits independently, so a failure loses at most the chunk in
/// flight.
pub struct BatchWriter<'a> {
    store: &'a dyn CompanyStore,
    max_batch_size: usize,
    pending: Vec<WriteOp>,
    report: BatchReport,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn CompanyStore, max_batch_size: usize) -> Self {
        Self {
            store,
            max_batch_size: max_batch_size.max(1),
            pending: Vec::new(),
            report: BatchReport::default(),
        }
    }

    pub async fn push(&mut self, op: WriteOp) -> Result<(), BatchError> {
        self.pending.push(op);
        if self.pending.len() >= self.max_batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), BatchError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        self.store
            .apply_batch(&ops)
            .await
            .map_err(|source| BatchError {
                batch_index: self.report.batches,
                committed_ops: self.report.committed_ops,
                source,
            })?;
        self.report.batches += 1;
        self.report.committed_ops += ops.len();
        debug!(
            batch = self.report.batches,
            ops = ops.len(),
            "committed write batch"
        );
        Ok(())
    }

    pub async fn finish(mut self) -> Result<BatchReport, BatchError> {
        self.flush().await?;
        Ok(self.report)
    }
}

/// In-process store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, CompanyRecord>>,
    ids: IdGenerator,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = (String, CompanyRecord)>) -> Self {
        Self {
            docs: RwLock::new(records.into_iter().collect()),
            ids: IdGenerator::new(),
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<String, CompanyRecord> {
        self.docs.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    fn apply_op(docs: &mut BTreeMap<String, CompanyRecord>, op: &WriteOp) {
        match op {
            WriteOp::Upsert { id, fields, mode } => {
                let (doc, _) = apply_write(docs.remove(id), fields, mode);
                docs.insert(id.clone(), doc);
            }
            WriteOp::ClearFields { id, fields } => {
                if let Some(doc) = docs.get_mut(id) {
                    clear_fields(doc, fields);
                }
            }
            WriteOp::Delete { id } => {
                docs.remove(id);
            }
        }
    }
}

#[async_trait]
impl CompanyStore for MemoryStore {
    async fn find_one(&self, filters: &[Filter]) -> Result<Option<FoundRecord>, StoreError> {
        if filters.is_empty() {
            return Ok(None);
        }
        let docs = self.docs.read().await;
        let mut hits = docs
            .iter()
            .filter(|(_, record)| filters.iter().all(|f| f.matches(record)));
        let Some((id, record)) = hits.next() else {
            return Ok(None);
        };
        let match_count = 1 + hits.count();
        Ok(Some(FoundRecord {
            company: StoredCompany {
                id: id.clone(),
                record: record.clone(),
            },
            match_count,
        }))
    }

    async fn find_many(
        &self,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<StoredCompany>, StoreError> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|(_, record)| filters.iter().all(|f| f.matches(record)))
            .take(limit)
            .map(|(id, record)| StoredCompany {
                id: id.clone(),
                record: record.clone(),
            })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredCompany>, StoreError> {
        Ok(self.docs.read().await.get(id).map(|record| StoredCompany {
            id: id.to_string(),
            record: record.clone(),
        }))
    }

    async fn upsert(
        &self,
        id: &str,
        fields: &CompanyRecord,
        mode: &WriteMode,
    ) -> Result<Vec<CompanyField>, StoreError> {
        let mut docs = self.docs.write().await;
        let (doc, written) = apply_write(docs.remove(id), fields, mode);
        docs.insert(id.to_string(), doc);
        Ok(written)
    }

    async fn create_with_generated_id(&self, fields: &CompanyRecord) -> Result<String, StoreError> {
        let mut docs = self.docs.write().await;
        let mut id = self.ids.next_id();
        while docs.contains_key(&id) {
            id = self.ids.next_id();
        }
        docs.insert(id.clone(), fields.clone());
        Ok(id)
    }

    async fn create_if_absent(&self, id: &str, fields: &CompanyRecord) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(id) {
            return Ok(false);
        }
        docs.insert(id.to_string(), fields.clone());
        Ok(true)
    }

    async fn delete_batch(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut docs = self.docs.write().await;
        Ok(ids.iter().filter(|id| docs.remove(*id).is_some()).count())
    }

    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        for op in ops {
            Self::apply_op(&mut docs, op);
        }
        Ok(())
    }

    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<StoredCompany>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|(id, _)| after.map_or(true, |a| id.as_str() > a))
            .take(limit)
            .map(|(id, record)| StoredCompany {
                id: id.clone(),
                record: record.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(name: &str, prefecture: &str) -> CompanyRecord {
        CompanyRecord {
            name: Some(name.to_string()),
            prefecture: Some(prefecture.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn find_one_returns_first_by_id_and_counts_matches() {
        let store = MemoryStore::with_records([
            ("b".to_string(), company("株式会社A", "東京都")),
            ("a".to_string(), company("株式会社A", "東京都")),
            ("c".to_string(), company("株式会社A", "大阪府")),
        ]);
        let found = store
            .find_one(&[
                Filter::eq(CompanyField::Name, "株式会社A"),
                Filter::eq(CompanyField::Prefecture, "東京都"),
            ])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.company.id, "a");
        assert_eq!(found.match_count, 2);
        assert!(found.is_ambiguous());
    }

    #[tokio::test]
    async fn find_many_is_id_ordered_and_limited() {
        let store = MemoryStore::with_records([
            ("c".to_string(), company("株式会社A", "東京都")),
            ("a".to_string(), company("株式会社A", "大阪府")),
            ("b".to_string(), company("株式会社A", "東京都")),
            ("d".to_string(), company("株式会社B", "東京都")),
        ]);
        let name = [Filter::eq(CompanyField::Name, "株式会社A")];
        let ids: Vec<_> = store
            .find_many(&name, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(store.find_many(&name, 2).await.unwrap().len(), 2);
        assert!(store.find_many(&[], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_one_without_filters_matches_nothing() {
        let store = MemoryStore::with_records([("a".to_string(), company("A", "東京都"))]);
        assert!(store.find_one(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fill_only_upsert_keeps_populated_fields() {
        let store = MemoryStore::with_records([(
            "1".to_string(),
            CompanyRecord {
                capital_stock: Some(3000),
                ..company("株式会社A", "東京都")
            },
        )]);
        let incoming = CompanyRecord {
            capital_stock: Some(5000),
            phone_number: Some("03-1234-5678".into()),
            ..Default::default()
        };
        let written = store
            .upsert("1", &incoming, &WriteMode::fill_only())
            .await
            .unwrap();
        assert_eq!(written, vec![CompanyField::PhoneNumber]);
        let stored = store.get("1").await.unwrap().unwrap().record;
        assert_eq!(stored.capital_stock, Some(3000));
        assert_eq!(stored.phone_number.as_deref(), Some("03-1234-5678"));
    }

    #[tokio::test]
    async fn create_if_absent_never_clobbers() {
        let store = MemoryStore::new();
        assert!(store.create_if_absent("x", &company("A", "東京都")).await.unwrap());
        assert!(!store.create_if_absent("x", &company("B", "京都府")).await.unwrap());
        let stored = store.get("x").await.unwrap().unwrap();
        assert_eq!(stored.record.name.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn generated_ids_are_unique() {
        let store = MemoryStore::new();
        let a = store.create_with_generated_id(&company("A", "東京都")).await.unwrap();
        let b = store.create_with_generated_id(&company("B", "東京都")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn batch_writer_commits_in_chunks() {
        let store = MemoryStore::with_records(
            (0..5).map(|i| (format!("id{i}"), company(&format!("C{i}"), "東京都"))),
        );
        let mut writer = BatchWriter::new(&store, 2);
        for i in 0..5 {
            writer
                .push(WriteOp::Delete { id: format!("id{i}") })
                .await
                .unwrap();
        }
        let report = writer.finish().await.unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.committed_ops, 5);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn clear_fields_op_unsets_values() {
        let store = MemoryStore::with_records([(
            "1".to_string(),
            CompanyRecord {
                corporate_number: Some("0000000000000".into()),
                ..company("A", "東京都")
            },
        )]);
        store
            .apply_batch(&[WriteOp::ClearFields {
                id: "1".into(),
                fields: vec![CompanyField::CorporateNumber],
            }])
            .await
            .unwrap();
        let stored = store.get("1").await.unwrap().unwrap().record;
        assert!(stored.corporate_number.is_none());
        assert_eq!(stored.name.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn scan_pages_in_id_order() {
        let store = MemoryStore::with_records(
            ["c", "a", "b"].map(|id| (id.to_string(), company(id, "東京都"))),
        );
        let first = store.scan(None, 2).await.unwrap();
        assert_eq!(first.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        let rest = store.scan(Some("b"), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "c");
    }

    #[test]
    fn transient_errors_are_only_availability_failures() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(!StoreError::Query("syntax".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }
}
