//! PostgreSQL-backed `companies_new` collection: one JSONB document per row.

use async_trait::async_trait;
use corpdb_core::{CompanyField, CompanyRecord};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{
    apply_write, CompanyStore, Filter, FoundRecord, IdGenerator, StoreError, StoredCompany,
    WriteMode, WriteOp,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            // serialization_failure and deadlock_detected succeed on retry
            sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) =>
            {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// `{"name": "...", "prefecture": "..."}` for a `doc @> $1` containment query.
pub fn filters_to_containment(filters: &[Filter]) -> Value {
    let mut object = Map::new();
    for filter in filters {
        object.insert(filter.field.key().to_string(), filter.value.to_json());
    }
    Value::Object(object)
}

#[derive(Debug, Clone)]
pub struct PgCompanyStore {
    pool: PgPool,
    ids: std::sync::Arc<IdGenerator>,
}

impl PgCompanyStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            ids: std::sync::Arc::new(IdGenerator::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Query(format!("migration failed: {err}")))
    }

    fn decode(row: &PgRow) -> Result<StoredCompany, StoreError> {
        let Json(record): Json<CompanyRecord> = row.try_get("doc")?;
        Ok(StoredCompany {
            id: row.try_get("id")?,
            record,
        })
    }

    /// Fill-only read-merge-write under a row lock.
    ///
    /// Keys the typed schema does not know about survive, because only the
    /// written fields are merged into the stored JSONB.
    async fn upsert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
        fields: &CompanyRecord,
        mode: &WriteMode,
    ) -> Result<Option<Vec<CompanyField>>, StoreError> {
        let existing = sqlx::query("SELECT id, doc FROM companies_new WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;

        match existing {
            Some(row) => {
                let current = Self::decode(&row)?.record;
                let (merged, written) = apply_write(Some(current), fields, mode);
                if !written.is_empty() {
                    let patch = merged.project(&written);
                    sqlx::query(
                        r#"
                        UPDATE companies_new
                           SET doc = doc || $2,
                               updated_at = NOW()
                         WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .bind(Json(&patch))
                    .execute(&mut **tx)
                    .await?;
                }
                Ok(Some(written))
            }
            None => {
                let (doc, written) = apply_write(None, fields, mode);
                let inserted = sqlx::query(
                    "INSERT INTO companies_new (id, doc) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
                )
                .bind(id)
                .bind(Json(&doc))
                .execute(&mut **tx)
                .await?;
                // A concurrent insert won the race; the caller re-reads under lock.
                if inserted.rows_affected() == 0 {
                    return Ok(None);
                }
                Ok(Some(written))
            }
        }
    }
}

#[async_trait]
impl CompanyStore for PgCompanyStore {
    async fn find_one(&self, filters: &[Filter]) -> Result<Option<FoundRecord>, StoreError> {
        if filters.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(
            r#"
            SELECT id, doc, COUNT(*) OVER () AS match_count
              FROM companies_new
             WHERE doc @> $1
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(filters_to_containment(filters))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let match_count: i64 = row.try_get("match_count")?;
        Ok(Some(FoundRecord {
            company: Self::decode(&row)?,
            match_count: usize::try_from(match_count).unwrap_or(usize::MAX),
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
        let rows = sqlx::query(
            "SELECT id, doc FROM companies_new WHERE doc @> $1 ORDER BY id LIMIT $2",
        )
        .bind(filters_to_containment(filters))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<StoredCompany>, StoreError> {
        let row = sqlx::query("SELECT id, doc FROM companies_new WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn upsert(
        &self,
        id: &str,
        fields: &CompanyRecord,
        mode: &WriteMode,
    ) -> Result<Vec<CompanyField>, StoreError> {
        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            match Self::upsert_in_tx(&mut tx, id, fields, mode).await? {
                Some(written) => {
                    tx.commit().await?;
                    return Ok(written);
                }
                None => {
                    tx.rollback().await?;
                    debug!(id, "insert lost race, retrying as update");
                }
            }
        }
        Err(StoreError::Unavailable(format!(
            "document {id} kept changing during upsert"
        )))
    }

    async fn create_with_generated_id(&self, fields: &CompanyRecord) -> Result<String, StoreError> {
        loop {
            let id = self.ids.next_id();
            if self.create_if_absent(&id, fields).await? {
                return Ok(id);
            }
        }
    }

    async fn create_if_absent(&self, id: &str, fields: &CompanyRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO companies_new (id, doc) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(Json(fields))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_batch(&self, ids: &[String]) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM companies_new WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                WriteOp::Upsert { id, fields, mode } => {
                    if Self::upsert_in_tx(&mut tx, id, fields, mode).await?.is_none() {
                        return Err(StoreError::Unavailable(format!(
                            "document {id} created concurrently"
                        )));
                    }
                }
                WriteOp::ClearFields { id, fields } => {
                    let keys: Vec<String> = fields.iter().map(|f| f.key().to_string()).collect();
                    sqlx::query(
                        r#"
                        UPDATE companies_new
                           SET doc = doc - $2::text[],
                               updated_at = NOW()
                         WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .bind(keys)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::Delete { id } => {
                    sqlx::query("DELETE FROM companies_new WHERE id = $1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<StoredCompany>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, doc
              FROM companies_new
             WHERE ($1::text IS NULL OR id > $1)
             ORDER BY id
             LIMIT $2
            "#,
        )
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_become_a_containment_document() {
        let doc = filters_to_containment(&[
            Filter::eq(CompanyField::Name, "株式会社A"),
            Filter::eq(CompanyField::Prefecture, "東京都"),
        ]);
        assert_eq!(doc, json!({"name": "株式会社A", "prefecture": "東京都"}));
    }

    #[test]
    fn pool_failures_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }
}
