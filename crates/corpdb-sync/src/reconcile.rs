//! Match → merge → write for one candidate at a time.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use corpdb_core::{CandidateRecord, CompanyField, FieldFill};
use corpdb_storage::{BackoffPolicy, CompanyStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info_span, warn, Instrument};

use crate::matcher::{EntityMatch, EntityMatcher, LookupStrategy};
use crate::merge::{MergeDecision, MergePolicy};

/// What to do when the winning lookup step matched several records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Merge into the first record by id and report the ambiguity.
    #[default]
    FirstMatch,
    /// Write nothing and report the candidate for manual review.
    HoldForReview,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub dry_run: bool,
    pub ambiguity: AmbiguityPolicy,
    pub retry: BackoffPolicy,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("candidate carries no field the matcher looks up")]
    NoIdentity,
    #[error("store failed after {attempts} attempt(s): {source}")]
    Store {
        attempts: usize,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created { id: String },
    Updated { id: String, filled: Vec<CompanyField> },
    Unchanged { id: String },
    /// Dry run; `id` is `None` when the store would generate one.
    WouldCreate { id: Option<String> },
    WouldUpdate { id: String, filled: Vec<CompanyField> },
    HeldForReview { strategy: LookupStrategy, match_count: usize },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Created { .. } => "created",
            ReconcileOutcome::Updated { .. } => "updated",
            ReconcileOutcome::Unchanged { .. } => "unchanged",
            ReconcileOutcome::WouldCreate { .. } => "would_create",
            ReconcileOutcome::WouldUpdate { .. } => "would_update",
            ReconcileOutcome::HeldForReview { .. } => "held_for_review",
        }
    }

    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Created { .. } | ReconcileOutcome::WouldCreate { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub outcome: ReconcileOutcome,
    pub matched: Option<EntityMatch>,
    pub fills: Vec<FieldFill>,
}

/// Serializes read-merge-write per identity key across concurrent tasks.
/// A task holding several keys takes them in sorted order.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    const PRUNE_ABOVE: usize = 1024;

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > Self::PRUNE_ABOVE {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn lock_all(&self, keys: &BTreeSet<String>) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }
}

/// Every key a lookup in `strategies` could resolve `candidate` through.
/// Two candidates that might land on one record share at least one key.
pub fn identity_keys(candidate: &CandidateRecord, strategies: &[LookupStrategy]) -> BTreeSet<String> {
    let record = &candidate.record;
    strategies
        .iter()
        .filter_map(|&strategy| {
            let (prefix, field) = match strategy {
                LookupStrategy::CorporateNumber => ("cn", CompanyField::CorporateNumber),
                LookupStrategy::PhoneNumber => ("tel", CompanyField::PhoneNumber),
                s if s.is_name_based() => ("name", CompanyField::Name),
                _ => return None,
            };
            let filters = strategy.filters(record)?;
            let value = filters.iter().find(|f| f.field == field)?.value.as_text()?;
            Some(format!("{prefix}:{value}"))
        })
        .collect()
}

pub struct Reconciler {
    store: Arc<dyn CompanyStore>,
    matcher: EntityMatcher,
    policy: MergePolicy,
    options: ReconcileOptions,
    locks: IdentityLocks,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn CompanyStore>,
        matcher: EntityMatcher,
        policy: MergePolicy,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            store,
            matcher,
            policy,
            options,
            locks: IdentityLocks::default(),
        }
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn CompanyStore> {
        &self.store
    }

    pub async fn reconcile(&self, candidate: &CandidateRecord) -> Result<Reconciled, ReconcileError> {
        let keys = identity_keys(candidate, self.matcher.strategies());
        if keys.is_empty() {
            return Err(ReconcileError::NoIdentity);
        }
        let span = info_span!(
            "reconcile",
            source_id = %candidate.source.source_id,
            locator = %candidate.source.locator,
        );
        async {
            let _guards = self.locks.lock_all(&keys).await;
            let reconciled = self.with_retry(|| self.reconcile_once(candidate)).await?;
            debug!(
                outcome = reconciled.outcome.label(),
                fills = reconciled.fills.len(),
                "reconciled candidate"
            );
            Ok::<_, ReconcileError>(reconciled)
        }
        .instrument(span)
        .await
    }

    /// Retries the whole read-merge-write on transient store failures.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, ReconcileError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let retry = self.options.retry;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < retry.max_retries => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ReconcileError::Store {
                        attempts: attempt + 1,
                        source,
                    })
                }
            }
        }
    }

    async fn reconcile_once(&self, candidate: &CandidateRecord) -> Result<Reconciled, StoreError> {
        let matched = self.matcher.find(self.store.as_ref(), &candidate.record).await?;

        let held = matched
            .as_ref()
            .filter(|m| m.is_ambiguous())
            .filter(|_| self.options.ambiguity == AmbiguityPolicy::HoldForReview)
            .map(|m| (m.strategy, m.match_count));
        if let Some((strategy, match_count)) = held {
            return Ok(Reconciled {
                outcome: ReconcileOutcome::HeldForReview {
                    strategy,
                    match_count,
                },
                matched,
                fills: Vec::new(),
            });
        }

        let decision = self
            .policy
            .decide(matched.as_ref().map(|m| &m.company), candidate, Utc::now());
        let dry_run = self.options.dry_run;
        let write_mode = self.policy.write_mode();

        let (outcome, fills) = match decision {
            MergeDecision::Create { id, fills, .. } if dry_run => {
                (ReconcileOutcome::WouldCreate { id }, fills)
            }
            MergeDecision::Create {
                id: Some(id),
                record,
                fills,
            } => {
                if self.store.create_if_absent(&id, &record).await? {
                    (ReconcileOutcome::Created { id }, fills)
                } else {
                    // The id exists but no longer carries this corporate number.
                    let written = self.store.upsert(&id, &record, &write_mode).await?;
                    let fills = keep_written(fills, &written);
                    let filled = filled_fields(&fills);
                    (ReconcileOutcome::Updated { id, filled }, fills)
                }
            }
            MergeDecision::Create {
                id: None,
                record,
                fills,
            } => {
                let id = self.store.create_with_generated_id(&record).await?;
                (ReconcileOutcome::Created { id }, fills)
            }
            MergeDecision::Update { id, fills, .. } if dry_run => {
                let filled = filled_fields(&fills);
                (ReconcileOutcome::WouldUpdate { id, filled }, fills)
            }
            MergeDecision::Update {
                id,
                payload,
                mode,
                fills,
            } => {
                let written = self.store.upsert(&id, &payload, &mode).await?;
                let fills = keep_written(fills, &written);
                if fills.is_empty() {
                    (ReconcileOutcome::Unchanged { id }, fills)
                } else {
                    let filled = filled_fields(&fills);
                    (ReconcileOutcome::Updated { id, filled }, fills)
                }
            }
            MergeDecision::Unchanged { id } => (ReconcileOutcome::Unchanged { id }, Vec::new()),
        };

        Ok(Reconciled {
            outcome,
            matched,
            fills,
        })
    }
}

fn filled_fields(fills: &[FieldFill]) -> Vec<CompanyField> {
    fills.iter().map(|f| f.field).collect()
}

/// Drops provenance for fields the store did not write (filled concurrently).
fn keep_written(fills: Vec<FieldFill>, written: &[CompanyField]) -> Vec<FieldFill> {
    fills
        .into_iter()
        .filter(|f| written.contains(&f.field))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use corpdb_core::{CompanyRecord, SourceRef};
    use corpdb_storage::MemoryStore;

    use flaky::FlakyStore;

    fn candidate(record: CompanyRecord) -> CandidateRecord {
        CandidateRecord::new(
            SourceRef {
                source_id: "test".into(),
                locator: "t.csv:2".into(),
                observed_at: Utc::now(),
            },
            record,
        )
    }

    fn named(name: &str) -> CompanyRecord {
        CompanyRecord {
            name: Some(name.to_string()),
            prefecture: Some("東京都".into()),
            ..Default::default()
        }
    }

    fn fast_retry() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn reconciler(store: Arc<dyn CompanyStore>, options: ReconcileOptions) -> Reconciler {
        Reconciler::new(store, EntityMatcher::default(), MergePolicy::default(), options)
    }

    fn keys(record: CompanyRecord, strategies: &[LookupStrategy]) -> Vec<String> {
        identity_keys(&candidate(record), strategies).into_iter().collect()
    }

    #[test]
    fn identity_keys_cover_every_applicable_lookup() {
        let order = LookupStrategy::DEFAULT_ORDER;
        let mut record = named(" 株式会社A ");
        assert_eq!(keys(record.clone(), &order), vec!["name:株式会社A"]);

        record.corporate_number = Some("1234567890123".into());
        record.phone_number = Some("03-1111-2222".into());
        assert_eq!(
            keys(record.clone(), &order),
            vec!["cn:1234567890123", "name:株式会社A"]
        );
        let mut with_phone = order.to_vec();
        with_phone.push(LookupStrategy::PhoneNumber);
        assert_eq!(
            keys(record, &with_phone),
            vec!["cn:1234567890123", "name:株式会社A", "tel:03-1111-2222"]
        );

        let placeholder = CompanyRecord {
            corporate_number: Some("0000000000000".into()),
            ..Default::default()
        };
        assert!(keys(placeholder, &order).is_empty());
    }

    #[tokio::test]
    async fn candidates_without_any_lookup_key_are_rejected() {
        let r = reconciler(Arc::new(MemoryStore::new()), ReconcileOptions::default());
        let err = r.reconcile(&candidate(CompanyRecord::default())).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NoIdentity));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let store = Arc::new(MemoryStore::with_records([("a".to_string(), named("株式会社A"))]));
        let r = reconciler(
            store.clone(),
            ReconcileOptions {
                dry_run: true,
                ..Default::default()
            },
        );

        let mut fill = named("株式会社A");
        fill.phone_number = Some("03-1111-2222".into());
        let update = r.reconcile(&candidate(fill)).await.unwrap();
        assert_eq!(
            update.outcome,
            ReconcileOutcome::WouldUpdate {
                id: "a".into(),
                filled: vec![CompanyField::PhoneNumber]
            }
        );
        let create = r.reconcile(&candidate(named("株式会社B"))).await.unwrap();
        assert_eq!(create.outcome, ReconcileOutcome::WouldCreate { id: None });

        let docs = store.snapshot().await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs["a"].phone_number, None);
    }

    #[tokio::test]
    async fn ambiguous_matches_can_be_held() {
        let store = Arc::new(MemoryStore::with_records([
            ("1".to_string(), named("株式会社A")),
            ("2".to_string(), named("株式会社A")),
        ]));
        let mut c = named("株式会社A");
        c.email = Some("info@example.com".into());

        let held = reconciler(
            store.clone(),
            ReconcileOptions {
                ambiguity: AmbiguityPolicy::HoldForReview,
                ..Default::default()
            },
        )
        .reconcile(&candidate(c.clone()))
        .await
        .unwrap();
        assert_eq!(
            held.outcome,
            ReconcileOutcome::HeldForReview {
                strategy: LookupStrategy::NamePrefecture,
                match_count: 2
            }
        );
        assert_eq!(store.snapshot().await["1"].email, None);

        let merged = reconciler(store.clone(), ReconcileOptions::default())
            .reconcile(&candidate(c))
            .await
            .unwrap();
        assert!(matches!(merged.outcome, ReconcileOutcome::Updated { ref id, .. } if id == "1"));
        assert_eq!(merged.matched.map(|m| m.match_count), Some(2));
    }

    #[tokio::test]
    async fn existing_id_without_matching_number_is_merged_not_clobbered() {
        let mut stale = named("株式会社旧");
        stale.capital_stock = Some(1);
        let store = Arc::new(MemoryStore::with_records([("1234567890123".to_string(), stale)]));
        let mut c = named("株式会社新");
        c.corporate_number = Some("1234567890123".into());
        c.capital_stock = Some(99);
        c.phone_number = Some("03-0000-1111".into());

        let result = reconciler(store.clone(), ReconcileOptions::default())
            .reconcile(&candidate(c))
            .await
            .unwrap();
        assert!(matches!(result.outcome, ReconcileOutcome::Updated { .. }));
        let doc = &store.snapshot().await["1234567890123"];
        assert_eq!(doc.name.as_deref(), Some("株式会社旧"));
        assert_eq!(doc.capital_stock, Some(1));
        assert_eq!(doc.corporate_number.as_deref(), Some("1234567890123"));
        assert_eq!(doc.phone_number.as_deref(), Some("03-0000-1111"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_reported() {
        let flaky = Arc::new(FlakyStore::new(2));
        let ok = reconciler(
            flaky.clone(),
            ReconcileOptions {
                retry: fast_retry(),
                ..Default::default()
            },
        )
        .reconcile(&candidate(named("株式会社A")))
        .await
        .unwrap();
        assert!(ok.outcome.is_creation());
        // Two failed attempts, then the name+prefecture and name lookups.
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);

        let down = Arc::new(FlakyStore::new(usize::MAX));
        let err = reconciler(
            down,
            ReconcileOptions {
                retry: fast_retry(),
                ..Default::default()
            },
        )
        .reconcile(&candidate(named("株式会社A")))
        .await
        .unwrap_err();
        assert!(matches!(err, ReconcileError::Store { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn numbered_and_unnumbered_rows_for_one_company_create_one_record() {
        let store = Arc::new(FlakyStore::yielding());
        let r = Arc::new(reconciler(store.clone(), ReconcileOptions::default()));
        let mut numbered = named("株式会社並行");
        numbered.corporate_number = Some("1234567890123".into());
        let mut unnumbered = named("株式会社並行");
        unnumbered.phone_number = Some("06-1234-5678".into());

        let (a, b) = (candidate(numbered), candidate(unnumbered));
        let (ra, rb) = tokio::join!(r.reconcile(&a), r.reconcile(&b));
        let outcomes = [ra.unwrap().outcome, rb.unwrap().outcome];
        assert_eq!(outcomes.iter().filter(|o| o.is_creation()).count(), 1);

        let docs = store.inner.snapshot().await;
        assert_eq!(docs.len(), 1);
        let doc = &docs["1234567890123"];
        assert_eq!(doc.phone_number.as_deref(), Some("06-1234-5678"));
    }

    #[tokio::test]
    async fn concurrent_fills_for_one_identity_are_not_lost() {
        let store = Arc::new(MemoryStore::with_records([("a".to_string(), named("株式会社A"))]));
        let r = Arc::new(reconciler(store.clone(), ReconcileOptions::default()));
        let mut phone = named("株式会社A");
        phone.phone_number = Some("03-1111-2222".into());
        let mut mail = named("株式会社A");
        mail.email = Some("a@example.com".into());

        let (c1, c2) = (candidate(phone), candidate(mail));
        let (r1, r2) = tokio::join!(r.reconcile(&c1), r.reconcile(&c2));
        r1.unwrap();
        r2.unwrap();
        let doc = &store.snapshot().await["a"];
        assert_eq!(doc.phone_number.as_deref(), Some("03-1111-2222"));
        assert_eq!(doc.email.as_deref(), Some("a@example.com"));
    }

    /// Store whose lookups fail with a transient error a fixed number of
    /// times, and which can hand control to other tasks after every read.
    mod flaky {
        use super::*;
        use corpdb_storage::{Filter, FoundRecord, StoredCompany, WriteMode, WriteOp};

        pub struct FlakyStore {
            pub inner: MemoryStore,
            failures: usize,
            yield_after_reads: bool,
            pub calls: AtomicUsize,
        }

        impl FlakyStore {
            pub fn new(failures: usize) -> Self {
                Self {
                    inner: MemoryStore::new(),
                    failures,
                    yield_after_reads: false,
                    calls: AtomicUsize::new(0),
                }
            }

            pub fn yielding() -> Self {
                Self {
                    yield_after_reads: true,
                    ..Self::new(0)
                }
            }

            async fn after_read(&self) {
                if self.yield_after_reads {
                    tokio::task::yield_now().await;
                }
            }
        }

        #[async_trait::async_trait]
        impl CompanyStore for FlakyStore {
            async fn find_one(&self, filters: &[Filter]) -> Result<Option<FoundRecord>, StoreError> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    return Err(StoreError::Unavailable("connection reset".into()));
                }
                let found = self.inner.find_one(filters).await;
                self.after_read().await;
                found
            }

            async fn find_many(
                &self,
                filters: &[Filter],
                limit: usize,
            ) -> Result<Vec<StoredCompany>, StoreError> {
                let found = self.inner.find_many(filters, limit).await;
                self.after_read().await;
                found
            }

            async fn get(&self, id: &str) -> Result<Option<StoredCompany>, StoreError> {
                let found = self.inner.get(id).await;
                self.after_read().await;
                found
            }

            async fn upsert(
                &self,
                id: &str,
                fields: &CompanyRecord,
                mode: &WriteMode,
            ) -> Result<Vec<CompanyField>, StoreError> {
                self.inner.upsert(id, fields, mode).await
            }

            async fn create_with_generated_id(
                &self,
                fields: &CompanyRecord,
            ) -> Result<String, StoreError> {
                self.inner.create_with_generated_id(fields).await
            }

            async fn create_if_absent(
                &self,
                id: &str,
                fields: &CompanyRecord,
            ) -> Result<bool, StoreError> {
                self.inner.create_if_absent(id, fields).await
            }

            async fn delete_batch(&self, ids: &[String]) -> Result<usize, StoreError> {
                self.inner.delete_batch(ids).await
            }

            async fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
                self.inner.apply_batch(ops).await
            }

            async fn scan(
                &self,
                after: Option<&str>,
                limit: usize,
            ) -> Result<Vec<StoredCompany>, StoreError> {
                self.inner.scan(after, limit).await
            }
        }
    }
}
