use chrono::{DateTime, Utc};
use executors::logs::{ExecutionLogEntry, LogLevel, LogSource};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub line_no: i64,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionLog {
    /// Upsert a batch of parsed entries for one execution. `(execution_id,
    /// line_no)` is the natural key, so replaying a chunk after an
    /// at-least-once redelivery overwrites instead of duplicating.
    pub async fn batch_insert_or_update(
        pool: &SqlitePool,
        execution_id: Uuid,
        entries: &[ExecutionLogEntry],
    ) -> Result<(), sqlx::Error> {
        for entry in entries {
            sqlx::query(
                r#"INSERT INTO execution_logs (id, execution_id, line_no, level, source, message, timestamp)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)
                   ON CONFLICT (execution_id, line_no)
                   DO UPDATE SET level = $4, source = $5, message = $6, timestamp = $7"#,
            )
            .bind(Uuid::new_v4())
            .bind(execution_id)
            .bind(entry.line_no)
            .bind(entry.level)
            .bind(entry.source)
            .bind(&entry.message)
            .bind(entry.timestamp)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub async fn find_by_execution_id(
        pool: &SqlitePool,
        execution_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionLog>(
            r#"SELECT id, execution_id, line_no, level, source, message, timestamp
               FROM execution_logs
               WHERE execution_id = $1
               ORDER BY line_no ASC"#,
        )
        .bind(execution_id)
        .fetch_all(pool)
        .await
    }
}
