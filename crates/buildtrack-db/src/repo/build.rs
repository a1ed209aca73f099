//! Build repository.

use async_trait::async_trait;
use buildtrack_core::executor::LogLine;
use buildtrack_core::{Build, BuildFinder, BuildId, BuildStatus, BuildStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A build record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: i64,
    pub name: String,
    pub team_name: String,
    pub pipeline_name: Option<String>,
    pub job_name: Option<String>,
    pub status: String,
    pub plan: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRecord> for Build {
    type Error = DbError;

    fn try_from(record: BuildRecord) -> DbResult<Self> {
        let status: BuildStatus = record.status.parse().map_err(|_| {
            DbError::InvalidRecord(format!(
                "build {} has unknown status {:?}",
                record.id, record.status
            ))
        })?;

        Ok(Build {
            id: BuildId::new(record.id),
            name: record.name,
            team_name: record.team_name,
            pipeline_name: record.pipeline_name,
            job_name: record.job_name,
            status,
            plan: record.plan,
            created_at: record.created_at,
            start_time: record.start_time,
            end_time: record.end_time,
        })
    }
}

/// PostgreSQL implementation of [`BuildFinder`] and [`BuildStore`].
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn started_builds(&self) -> DbResult<Vec<Build>> {
        let records = sqlx::query_as::<_, BuildRecord>(
            r#"
            SELECT id, name, team_name, pipeline_name, job_name, status, plan,
                   created_at, start_time, end_time
            FROM builds
            WHERE status = 'started'
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(Build::try_from).collect()
    }

    pub async fn finish(&self, id: BuildId, status: BuildStatus) -> DbResult<bool> {
        if !status.is_terminal() {
            return Err(DbError::InvalidRecord(format!(
                "cannot finish build {} as {}",
                id, status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE builds SET status = $2, end_time = NOW()
            WHERE id = $1 AND status = 'started'
            "#,
        )
        .bind(id.as_i64())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn save_log(&self, id: BuildId, line: &LogLine) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_events (build_id, stream, content, timestamp)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id.as_i64())
        .bind(line.stream.as_str())
        .bind(&line.content)
        .bind(line.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BuildFinder for PgBuildRepo {
    async fn get_all_started_builds(&self) -> buildtrack_core::Result<Vec<Build>> {
        Ok(self.started_builds().await?)
    }
}

#[async_trait]
impl BuildStore for PgBuildRepo {
    async fn finish_build(
        &self,
        id: BuildId,
        status: BuildStatus,
    ) -> buildtrack_core::Result<bool> {
        Ok(self.finish(id, status).await?)
    }

    async fn append_log(&self, id: BuildId, line: &LogLine) -> buildtrack_core::Result<()> {
        Ok(self.save_log(id, line).await?)
    }
}
