//! PostgreSQL checkpoint row store.
//!
//! Two tables: `checkpoints` holds the full lifecycle record keyed by
//! `(algorithm, id)`, `submission_buffer` holds the reconstructable
//! submission unit for checkpoints that have not reached a cluster yet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::checkpoint::{CheckpointedRequest, LifecycleStage, SubmissionBufferEntry};

use super::{CheckpointStore, StoreError, UpdateOutcome};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    algorithm           TEXT        NOT NULL,
    id                  TEXT        NOT NULL,
    lifecycle_stage     TEXT        NOT NULL,
    received_by_host    TEXT        NOT NULL,
    cluster             TEXT        NOT NULL,
    tag                 TEXT,
    parent_request_id   TEXT,
    job_uid             TEXT,
    payload             JSONB,
    payload_uri         TEXT,
    result_uri          TEXT,
    failure_cause       TEXT,
    failure_details     TEXT,
    failure_code        TEXT,
    created_at          TIMESTAMPTZ NOT NULL,
    sent_at             TIMESTAMPTZ,
    PRIMARY KEY (algorithm, id)
);
CREATE INDEX IF NOT EXISTS checkpoints_tag_idx ON checkpoints (tag);
CREATE INDEX IF NOT EXISTS checkpoints_host_stage_idx
    ON checkpoints (received_by_host, lifecycle_stage);

CREATE TABLE IF NOT EXISTS submission_buffer (
    algorithm   TEXT  NOT NULL,
    request_id  TEXT  NOT NULL,
    cluster     TEXT  NOT NULL,
    manifest    JSONB NOT NULL,
    PRIMARY KEY (algorithm, request_id)
);
"#;

/// Checkpoint store backed by a PostgreSQL pool.
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Connects to the database and ensures the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Creates a store from an existing pool. Schema is assumed present.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_checkpoint(row: &sqlx::postgres::PgRow) -> Result<CheckpointedRequest, StoreError> {
        let stage: String = row.get("lifecycle_stage");
        let lifecycle_stage = LifecycleStage::parse(&stage)
            .ok_or_else(|| StoreError::InvalidRecord(format!("unknown lifecycle stage {stage}")))?;

        Ok(CheckpointedRequest {
            id: row.get("id"),
            algorithm: row.get("algorithm"),
            lifecycle_stage,
            received_by_host: row.get("received_by_host"),
            cluster: row.get("cluster"),
            tag: row.get("tag"),
            parent_request_id: row.get("parent_request_id"),
            job_uid: row.get("job_uid"),
            payload: row.get::<Option<serde_json::Value>, _>("payload"),
            payload_uri: row.get("payload_uri"),
            result_uri: row.get("result_uri"),
            algorithm_failure_cause: row.get("failure_cause"),
            algorithm_failure_details: row.get("failure_details"),
            algorithm_failure_code: row.get("failure_code"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            sent_at: row.get::<Option<DateTime<Utc>>, _>("sent_at"),
        })
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn upsert(&self, checkpoint: &CheckpointedRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                algorithm, id, lifecycle_stage, received_by_host, cluster,
                tag, parent_request_id, job_uid, payload, payload_uri,
                result_uri, failure_cause, failure_details, failure_code,
                created_at, sent_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (algorithm, id) DO UPDATE SET
                lifecycle_stage = EXCLUDED.lifecycle_stage,
                received_by_host = EXCLUDED.received_by_host,
                cluster = EXCLUDED.cluster,
                tag = EXCLUDED.tag,
                parent_request_id = EXCLUDED.parent_request_id,
                job_uid = EXCLUDED.job_uid,
                payload = EXCLUDED.payload,
                payload_uri = EXCLUDED.payload_uri,
                result_uri = EXCLUDED.result_uri,
                failure_cause = EXCLUDED.failure_cause,
                failure_details = EXCLUDED.failure_details,
                failure_code = EXCLUDED.failure_code,
                created_at = EXCLUDED.created_at,
                sent_at = EXCLUDED.sent_at
            "#,
        )
        .bind(&checkpoint.algorithm)
        .bind(&checkpoint.id)
        .bind(checkpoint.lifecycle_stage.as_str())
        .bind(&checkpoint.received_by_host)
        .bind(&checkpoint.cluster)
        .bind(&checkpoint.tag)
        .bind(&checkpoint.parent_request_id)
        .bind(&checkpoint.job_uid)
        .bind(&checkpoint.payload)
        .bind(&checkpoint.payload_uri)
        .bind(&checkpoint.result_uri)
        .bind(&checkpoint.algorithm_failure_cause)
        .bind(&checkpoint.algorithm_failure_details)
        .bind(&checkpoint.algorithm_failure_code)
        .bind(checkpoint.created_at)
        .bind(checkpoint.sent_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_if_stage(
        &self,
        checkpoint: &CheckpointedRequest,
        expected: &[LifecycleStage],
    ) -> Result<UpdateOutcome, StoreError> {
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();

        let result = sqlx::query(
            r#"
            UPDATE checkpoints SET
                lifecycle_stage = $3,
                job_uid = $4,
                payload = $5,
                payload_uri = $6,
                result_uri = $7,
                failure_cause = $8,
                failure_details = $9,
                failure_code = $10,
                sent_at = $11
            WHERE algorithm = $1 AND id = $2 AND lifecycle_stage = ANY($12)
            "#,
        )
        .bind(&checkpoint.algorithm)
        .bind(&checkpoint.id)
        .bind(checkpoint.lifecycle_stage.as_str())
        .bind(&checkpoint.job_uid)
        .bind(&checkpoint.payload)
        .bind(&checkpoint.payload_uri)
        .bind(&checkpoint.result_uri)
        .bind(&checkpoint.algorithm_failure_cause)
        .bind(&checkpoint.algorithm_failure_details)
        .bind(&checkpoint.algorithm_failure_code)
        .bind(checkpoint.sent_at)
        .bind(&expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(UpdateOutcome::StaleTransition)
        } else {
            Ok(UpdateOutcome::Applied)
        }
    }

    async fn get(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<Option<CheckpointedRequest>, StoreError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE algorithm = $1 AND id = $2")
            .bind(algorithm)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<CheckpointedRequest>, StoreError> {
        let rows = sqlx::query("SELECT * FROM checkpoints WHERE tag = $1")
            .bind(tag)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_checkpoint).collect()
    }

    async fn get_buffered_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<CheckpointedRequest>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE received_by_host = $1 AND lifecycle_stage = $2",
        )
        .bind(host)
        .bind(LifecycleStage::Buffered.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_checkpoint).collect()
    }

    async fn put_entry(&self, entry: &SubmissionBufferEntry) -> Result<(), StoreError> {
        let manifest = serde_json::to_value(&entry.manifest)?;

        sqlx::query(
            r#"
            INSERT INTO submission_buffer (algorithm, request_id, cluster, manifest)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (algorithm, request_id) DO UPDATE SET
                cluster = EXCLUDED.cluster,
                manifest = EXCLUDED.manifest
            "#,
        )
        .bind(&entry.algorithm)
        .bind(&entry.request_id)
        .bind(&entry.cluster)
        .bind(&manifest)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_entry(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<Option<SubmissionBufferEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT cluster, manifest FROM submission_buffer WHERE algorithm = $1 AND request_id = $2",
        )
        .bind(algorithm)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let manifest: serde_json::Value = row.get("manifest");
        Ok(Some(SubmissionBufferEntry {
            request_id: id.to_string(),
            algorithm: algorithm.to_string(),
            cluster: row.get("cluster"),
            manifest: serde_json::from_value(manifest)?,
        }))
    }

    async fn remove_entry(&self, id: &str, algorithm: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM submission_buffer WHERE algorithm = $1 AND request_id = $2")
            .bind(algorithm)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
