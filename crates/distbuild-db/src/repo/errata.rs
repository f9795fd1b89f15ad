//! Errata record repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use distbuild_core::errata::{ErrataRecord, NewErrataRecord, ReleaseStart, ReleaseStatus};
use sqlx::PgPool;

use crate::error::map_unique;
use crate::{DbError, DbResult};

#[async_trait]
pub trait ErrataRepo: Send + Sync {
    async fn create(&self, record: &NewErrataRecord, now: DateTime<Utc>)
    -> DbResult<ErrataRecord>;
    async fn get(&self, id: &str) -> DbResult<ErrataRecord>;
    async fn list(&self, status: Option<ReleaseStatus>) -> DbResult<Vec<ErrataRecord>>;
    /// Move a record to in progress and clear its previous release log,
    /// unless a release is already running.
    async fn begin_release(&self, id: &str, now: DateTime<Utc>) -> DbResult<ReleaseStart>;
    /// Record the outcome of a release that was started.
    async fn finish_release(
        &self,
        id: &str,
        status: ReleaseStatus,
        log: &str,
        now: DateTime<Utc>,
    ) -> DbResult<ErrataRecord>;
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ErrataRow {
    id: String,
    platform: String,
    title: String,
    packages: Vec<String>,
    release_status: String,
    last_release_log: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ErrataRow> for ErrataRecord {
    type Error = DbError;

    fn try_from(row: ErrataRow) -> Result<Self, Self::Error> {
        let release_status = row
            .release_status
            .parse()
            .map_err(|e: distbuild_core::Error| DbError::Decode(e.to_string()))?;
        Ok(ErrataRecord {
            id: row.id,
            platform: row.platform,
            title: row.title,
            packages: row.packages,
            release_status,
            last_release_log: row.last_release_log,
            updated_at: row.updated_at,
        })
    }
}

/// PostgreSQL implementation of ErrataRepo.
pub struct PgErrataRepo {
    pool: PgPool,
}

impl PgErrataRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ErrataRepo for PgErrataRepo {
    async fn create(
        &self,
        record: &NewErrataRecord,
        now: DateTime<Utc>,
    ) -> DbResult<ErrataRecord> {
        let row = sqlx::query_as::<_, ErrataRow>(
            r#"
            INSERT INTO errata_records (id, platform, title, packages, release_status, updated_at)
            VALUES ($1, $2, $3, $4, 'not_released', $5)
            RETURNING *
            "#,
        )
        .bind(&record.id)
        .bind(&record.platform)
        .bind(&record.title)
        .bind(&record.packages)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, || format!("errata record {}", record.id)))?;
        row.try_into()
    }

    async fn get(&self, id: &str) -> DbResult<ErrataRecord> {
        sqlx::query_as::<_, ErrataRow>("SELECT * FROM errata_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("errata record {}", id)))?
            .try_into()
    }

    async fn list(&self, status: Option<ReleaseStatus>) -> DbResult<Vec<ErrataRecord>> {
        let rows = sqlx::query_as::<_, ErrataRow>(
            r#"
            SELECT * FROM errata_records
            WHERE ($1::text IS NULL OR release_status = $1)
            ORDER BY id
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ErrataRecord::try_from).collect()
    }

    async fn begin_release(&self, id: &str, now: DateTime<Utc>) -> DbResult<ReleaseStart> {
        let started: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE errata_records
            SET release_status = 'in_progress', last_release_log = NULL, updated_at = $2
            WHERE id = $1 AND release_status <> 'in_progress'
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if started.is_some() {
            return Ok(ReleaseStart::Started);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM errata_records WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(if exists {
            ReleaseStart::AlreadyInProgress
        } else {
            ReleaseStart::NotFound
        })
    }

    async fn finish_release(
        &self,
        id: &str,
        status: ReleaseStatus,
        log: &str,
        now: DateTime<Utc>,
    ) -> DbResult<ErrataRecord> {
        sqlx::query_as::<_, ErrataRow>(
            r#"
            UPDATE errata_records
            SET release_status = $2, last_release_log = $3, updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(log)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("errata record {}", id)))?
        .try_into()
    }
}
