//! `ingest_runs` table in PostgreSQL.
//!
//! [`IngestRunRow`] is the storage shape; the `From`/`TryFrom` impls below are
//! the only place the two representations meet.

use async_trait::async_trait;
use chess_core::PostgresConfig;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use super::RunStore;
use crate::error::StoreError;
use crate::model::{IngestRun, RunStatus};

/// Row from the `ingest_runs` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct IngestRunRow {
    pub id: Uuid,
    pub status: String,
    pub requested_user: String,
    pub months: Vec<String>,
    pub dataset_id: String,
    pub note: String,
    pub report_uri: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&IngestRun> for IngestRunRow {
    fn from(run: &IngestRun) -> Self {
        Self {
            id: run.id,
            status: run.status.as_str().to_string(),
            requested_user: run.requested_user.clone(),
            months: run.months.clone(),
            dataset_id: run.dataset_id.clone(),
            note: run.note.clone(),
            report_uri: run.report_uri.clone(),
            error: run.error.clone(),
            created_at: run.created_at,
            updated_at: run.updated_at,
            finished_at: run.finished_at,
        }
    }
}

impl TryFrom<IngestRunRow> for IngestRun {
    type Error = StoreError;

    fn try_from(row: IngestRunRow) -> Result<Self, Self::Error> {
        let status: RunStatus = row.status.parse().map_err(|e: crate::model::ParseStatusError| {
            StoreError::Corrupt {
                location: format!("ingest_runs/{}", row.id),
                reason: e.to_string(),
            }
        })?;
        Ok(IngestRun {
            id: row.id,
            status,
            requested_user: row.requested_user,
            months: row.months,
            dataset_id: row.dataset_id,
            note: row.note,
            report_uri: row.report_uri,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with the configured pool size and apply pending migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!(host = %config.host, db = %config.database, "PostgreSQL connected");

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        info!("ingest_runs migrations applied");

        Ok(Self::new(pool))
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn upsert(&self, run: &IngestRun) -> Result<(), StoreError> {
        let row = IngestRunRow::from(run);
        // Immutable columns are written once, on insert.
        sqlx::query(
            "INSERT INTO ingest_runs (id, status, requested_user, months, dataset_id, note,
                                      report_uri, error, created_at, updated_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                report_uri = EXCLUDED.report_uri,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at,
                finished_at = EXCLUDED.finished_at",
        )
        .bind(row.id)
        .bind(&row.status)
        .bind(&row.requested_user)
        .bind(&row.months)
        .bind(&row.dataset_id)
        .bind(&row.note)
        .bind(&row.report_uri)
        .bind(&row.error)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(run_id = %run.id, error = %e, "ingest run upsert failed");
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<IngestRun>, StoreError> {
        let rows = sqlx::query_as::<_, IngestRunRow>(
            "SELECT id, status, requested_user, months, dataset_id, note,
                    report_uri, error, created_at, updated_at, finished_at
             FROM ingest_runs
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IngestRun::try_from).collect()
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_mapping_roundtrip() {
        let run = IngestRun::new(
            Uuid::new_v4(),
            "fabiano",
            vec!["2022-11".to_string(), "2022-12".to_string()],
            "ds-classical",
            "world championship prep",
            Utc::now(),
        )
        .advance(RunStatus::Running, Utc::now(), None, None);

        let row = IngestRunRow::from(&run);
        assert_eq!(row.status, "RUNNING");
        assert_eq!(row.months, run.months);

        let back = IngestRun::try_from(row).unwrap();
        assert_eq!(back, run);
    }

    #[test]
    fn test_row_with_unknown_status_is_corrupt() {
        let run = IngestRun::new(Uuid::new_v4(), "ding", vec!["2023-04".to_string()], "", "", Utc::now());
        let mut row = IngestRunRow::from(&run);
        row.status = "ARCHIVED".to_string();

        match IngestRun::try_from(row) {
            Err(StoreError::Corrupt { location, reason }) => {
                assert!(location.contains(&run.id.to_string()));
                assert!(reason.contains("ARCHIVED"));
            }
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }
}
