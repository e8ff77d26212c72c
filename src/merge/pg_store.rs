// src/merge/pg_store.rs

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::store::{MergeTx, PatientLookup, PatientStore, RelatedEntity, StoreError};
use crate::models::{
    MergeLog, MergeLogRow, NewMergeLog, PatientIdentity, PatientState, MergeState,
};

/// lock_not_available, raised when `lock_timeout` expires
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
/// query_canceled, raised when `statement_timeout` expires
const PG_QUERY_CANCELED: &str = "57014";

fn map_db_error(e: sqlx::Error) -> StoreError {
    if let Some(db) = e.as_database_error() {
        if let Some(code) = db.code() {
            if code == PG_LOCK_NOT_AVAILABLE || code == PG_QUERY_CANCELED {
                return StoreError::Unavailable(format!("lock or statement timeout: {db}"));
            }
        }
    }
    StoreError::Database(e)
}

pub struct PgPatientStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgPatientStore {
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }
}

async fn fetch_state<'e, E>(executor: E, patient_id: Uuid) -> Result<Option<PatientState>, StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, PatientState>(
        r#"
        SELECT patient_id, merge_state, merged_into
        FROM patient
        WHERE patient_id = $1
        "#,
    )
    .bind(patient_id)
    .fetch_optional(executor)
    .await
    .map_err(map_db_error)
}

#[async_trait]
impl PatientStore for PgPatientStore {
    async fn active_identities(&self) -> Result<Vec<PatientIdentity>, StoreError> {
        let rows = sqlx::query_as::<_, PatientIdentity>(
            r#"
            SELECT
              p.patient_id,
              p.first_name,
              p.last_name,
              COALESCE(
                array_agg(pn.phone_number::text) FILTER (WHERE pn.phone_number IS NOT NULL),
                '{}'
              ) AS phones,
              p.email,
              p.created_at
            FROM patient p
            LEFT JOIN phone_number pn ON pn.patient_id = p.patient_id
            WHERE p.merge_state = $1
            GROUP BY p.patient_id
            ORDER BY p.created_at ASC, p.patient_id ASC
            "#,
        )
        .bind(MergeState::Active)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(rows)
    }

    async fn patient_state(&self, patient_id: Uuid) -> Result<Option<PatientState>, StoreError> {
        fetch_state(&self.pool, patient_id).await
    }

    async fn begin(&self) -> Result<Box<dyn MergeTx>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        // SET LOCAL does not take bind parameters
        let settings = [
            format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms),
            format!("SET LOCAL statement_timeout = '{}ms'", self.lock_timeout_ms * 2),
        ];
        for sql in &settings {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
        }

        Ok(Box::new(PgMergeTx { tx }))
    }

    async fn list_merge_logs(
        &self,
        patient_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<MergeLog>, StoreError> {
        let rows = sqlx::query_as::<_, MergeLogRow>(
            r#"
            SELECT merge_log_id, source_patient_id, target_patient_id, strategy,
                   merged_by_user_id, merged_at, relationship_snapshot
            FROM merge_log
            WHERE $1::uuid IS NULL
               OR source_patient_id = $1
               OR target_patient_id = $1
            ORDER BY merged_at DESC, merge_log_id DESC
            LIMIT $2
            "#,
        )
        .bind(patient_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(rows.into_iter().map(MergeLog::from).collect())
    }

    async fn get_merge_log(&self, merge_log_id: Uuid) -> Result<Option<MergeLog>, StoreError> {
        let row = sqlx::query_as::<_, MergeLogRow>(
            r#"
            SELECT merge_log_id, source_patient_id, target_patient_id, strategy,
                   merged_by_user_id, merged_at, relationship_snapshot
            FROM merge_log
            WHERE merge_log_id = $1
            "#,
        )
        .bind(merge_log_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(row.map(MergeLog::from))
    }
}

/// One merge transaction. Dropped without commit, sqlx rolls it back.
pub struct PgMergeTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PatientLookup for PgMergeTx {
    async fn patient_state(&mut self, patient_id: Uuid) -> Result<Option<PatientState>, StoreError> {
        fetch_state(&mut *self.tx, patient_id).await
    }
}

#[async_trait]
impl MergeTx for PgMergeTx {
    async fn lock_patients(&mut self, patient_ids: &[Uuid]) -> Result<Vec<PatientState>, StoreError> {
        // fixed lock order so two merges over the same pair cannot deadlock
        let rows = sqlx::query_as::<_, PatientState>(
            r#"
            SELECT patient_id, merge_state, merged_into
            FROM patient
            WHERE patient_id = ANY($1)
            ORDER BY patient_id
            FOR UPDATE
            "#,
        )
        .bind(patient_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        Ok(rows)
    }

    async fn count_references(
        &mut self,
        entity: RelatedEntity,
        patient_id: Uuid,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = $1",
            entity.table(),
            entity.patient_column()
        );
        let n: i64 = sqlx::query_scalar(&sql)
            .bind(patient_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_db_error)?;

        Ok(n.max(0) as u64)
    }

    async fn reassign(
        &mut self,
        entity: RelatedEntity,
        from: Uuid,
        to: Uuid,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE {table} SET {col} = $1 WHERE {col} = $2",
            table = entity.table(),
            col = entity.patient_column()
        );
        let res = sqlx::query(&sql)
            .bind(to)
            .bind(from)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error)?;

        Ok(res.rows_affected())
    }

    async fn demote_source_primary_phone(
        &mut self,
        source_id: Uuid,
        target_id: Uuid,
    ) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE phone_number
            SET is_primary = false, updated_at = now()
            WHERE patient_id = $1
              AND is_primary = true
              AND EXISTS (
                SELECT 1 FROM phone_number
                WHERE patient_id = $2 AND is_primary = true
              )
            "#,
        )
        .bind(source_id)
        .bind(target_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        Ok(res.rows_affected())
    }

    async fn mark_merged(&mut self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE patient
            SET merge_state = $1, merged_into = $2
            WHERE patient_id = $3
              AND merge_state = $4
            "#,
        )
        .bind(MergeState::Merged)
        .bind(target_id)
        .bind(source_id)
        .bind(MergeState::Active)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        if res.rows_affected() != 1 {
            return Err(StoreError::Unavailable(format!(
                "patient {source_id} changed state while locked"
            )));
        }
        Ok(())
    }

    async fn insert_merge_log(&mut self, log: &NewMergeLog) -> Result<MergeLog, StoreError> {
        let row = sqlx::query_as::<_, MergeLogRow>(
            r#"
            INSERT INTO merge_log (
              source_patient_id,
              target_patient_id,
              strategy,
              merged_by_user_id,
              merged_at,
              relationship_snapshot
            )
            VALUES ($1,$2,$3,$4,$5,$6)
            RETURNING merge_log_id, source_patient_id, target_patient_id, strategy,
                      merged_by_user_id, merged_at, relationship_snapshot
            "#,
        )
        .bind(log.source_patient_id)
        .bind(log.target_patient_id)
        .bind(log.strategy)
        .bind(log.merged_by_user_id)
        .bind(log.merged_at)
        .bind(sqlx::types::Json(&log.relationship_snapshot))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        Ok(row.into())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_db_error)
    }
}
