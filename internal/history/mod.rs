use crate::errors::{CoreError, CoreResult};
use crate::models::{
    BackendResult, BackendResultStatus, Execution, ExecutionStatus, ExecutionsStats, TaskStats,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    task_name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    archive_size INTEGER,
    archive_hash TEXT,
    error_message TEXT,
    duration_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_executions_task_id ON executions(task_id);
CREATE INDEX IF NOT EXISTS idx_executions_started_at ON executions(started_at);
CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

CREATE TABLE IF NOT EXISTS backend_uploads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL,
    backend_id TEXT NOT NULL,
    backend_name TEXT NOT NULL,
    status TEXT NOT NULL,
    uploaded_at TEXT,
    size INTEGER,
    remote_path TEXT,
    error_message TEXT,
    FOREIGN KEY (execution_id) REFERENCES executions(id)
);

CREATE INDEX IF NOT EXISTS idx_backend_uploads_execution_id ON backend_uploads(execution_id);
";

/// Durable record of executions and their per-backend upload rows.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Open (creating if needed) the history database and run the idempotent
    /// schema setup.
    pub async fn open(path: &Path) -> CoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> CoreResult<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn create_execution(&self, exec: &Execution) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO executions (
                id, task_id, task_name, started_at, completed_at, status,
                archive_size, archive_hash, error_message, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(exec.id.to_string())
        .bind(exec.task_id.to_string())
        .bind(&exec.task_name)
        .bind(exec.started_at.to_rfc3339())
        .bind(exec.completed_at.map(|t| t.to_rfc3339()))
        .bind(exec.status.as_str())
        .bind(exec.archive_size)
        .bind(&exec.archive_hash)
        .bind(&exec.error_message)
        .bind(exec.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write the terminal fields of an execution row.
    pub async fn update_execution(&self, exec: &Execution) -> CoreResult<()> {
        sqlx::query(
            "UPDATE executions SET
                completed_at = ?, status = ?, archive_size = ?,
                archive_hash = ?, error_message = ?, duration_ms = ?
            WHERE id = ?",
        )
        .bind(exec.completed_at.map(|t| t.to_rfc3339()))
        .bind(exec.status.as_str())
        .bind(exec.archive_size)
        .bind(&exec.archive_hash)
        .bind(&exec.error_message)
        .bind(exec.duration_ms)
        .bind(exec.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_execution(&self, id: Uuid) -> CoreResult<Execution> {
        let row = sqlx::query(
            "SELECT id, task_id, task_name, started_at, completed_at, status,
                archive_size, archive_hash, error_message, duration_ms
            FROM executions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("execution not found: {id}")))?;
        let mut exec = decode_execution(&row)?;
        exec.backend_results = self.get_backend_uploads(id).await?;
        Ok(exec)
    }

    /// Most-recent-first listing, deterministic on ties.
    pub async fn list_executions(
        &self,
        task_id: Option<Uuid>,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> CoreResult<Vec<Execution>> {
        let mut query = String::from(
            "SELECT id, task_id, task_name, started_at, completed_at, status,
                archive_size, archive_hash, error_message, duration_ms
            FROM executions WHERE 1=1",
        );
        if task_id.is_some() {
            query.push_str(" AND task_id = ?");
        }
        if status.is_some() {
            query.push_str(" AND status = ?");
        }
        query.push_str(" ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&query);
        if let Some(task_id) = task_id {
            q = q.bind(task_id.to_string());
        }
        if let Some(status) = status {
            q = q.bind(status.as_str());
        }
        let rows = q.bind(limit).bind(offset).fetch_all(&self.pool).await?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            let mut exec = decode_execution(&row)?;
            exec.backend_results = self.get_backend_uploads(exec.id).await?;
            executions.push(exec);
        }
        Ok(executions)
    }

    pub async fn add_backend_upload(
        &self,
        execution_id: Uuid,
        result: &BackendResult,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO backend_uploads (
                execution_id, backend_id, backend_name, status, uploaded_at,
                size, remote_path, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution_id.to_string())
        .bind(result.backend_id.to_string())
        .bind(&result.backend_name)
        .bind(result.status.as_str())
        .bind(result.uploaded_at.map(|t| t.to_rfc3339()))
        .bind(result.size)
        .bind(&result.remote_path)
        .bind(&result.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_backend_uploads(&self, execution_id: Uuid) -> CoreResult<Vec<BackendResult>> {
        let rows = sqlx::query(
            "SELECT backend_id, backend_name, status, uploaded_at, size, remote_path, error_message
            FROM backend_uploads WHERE execution_id = ? ORDER BY id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(decode_backend_result(&row)?);
        }
        Ok(results)
    }

    pub async fn get_task_stats(&self, task_id: Uuid) -> CoreResult<TaskStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0) AS success,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(AVG(CASE WHEN duration_ms IS NOT NULL THEN duration_ms ELSE 0 END), 0.0) AS avg_duration
            FROM executions WHERE task_id = ?",
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let mut stats = TaskStats {
            total_executions: row.try_get::<i64, _>("total")?,
            success_count: row.try_get::<i64, _>("success")?,
            failure_count: row.try_get::<i64, _>("failed")?,
            average_duration_ms: row.try_get::<f64, _>("avg_duration")? as i64,
            ..TaskStats::default()
        };

        let last = sqlx::query(
            "SELECT status, archive_size FROM executions
            WHERE task_id = ? ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = last {
            stats.last_execution_status = row.try_get("status")?;
            stats.last_archive_size = row.try_get::<Option<i64>, _>("archive_size")?.unwrap_or(0);
        }
        Ok(stats)
    }

    pub async fn get_execution_count(
        &self,
        since: Option<DateTime<Utc>>,
        status: Option<ExecutionStatus>,
    ) -> CoreResult<i64> {
        let mut query = String::from("SELECT COUNT(*) AS total FROM executions WHERE 1=1");
        if since.is_some() {
            query.push_str(" AND started_at >= ?");
        }
        if status.is_some() {
            query.push_str(" AND status = ?");
        }
        let mut q = sqlx::query(&query);
        if let Some(since) = since {
            q = q.bind(since.to_rfc3339());
        }
        if let Some(status) = status {
            q = q.bind(status.as_str());
        }
        let row = q.fetch_one(&self.pool).await?;
        Ok(row.try_get("total")?)
    }

    pub async fn get_execution_stats(&self) -> CoreResult<ExecutionsStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0) AS success,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0) AS running
            FROM executions",
        )
        .fetch_one(&self.pool)
        .await?;

        let last_24h = self
            .get_execution_count(Some(Utc::now() - Duration::hours(24)), None)
            .await?;
        Ok(ExecutionsStats {
            total: row.try_get("total")?,
            success: row.try_get("success")?,
            failed: row.try_get("failed")?,
            running: row.try_get("running")?,
            last_24h,
        })
    }

    /// Delete all history. Uploads go first; a failure leaves both tables
    /// untouched.
    pub async fn clear_history(&self) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM backend_uploads")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM executions")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn decode_execution(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Execution> {
    let id: String = row.try_get("id")?;
    let task_id: String = row.try_get("task_id")?;
    let status: String = row.try_get("status")?;
    Ok(Execution {
        id: parse_uuid(&id)?,
        task_id: parse_uuid(&task_id)?,
        task_name: row.try_get("task_name")?,
        started_at: parse_timestamp(&row.try_get::<String, _>("started_at")?)?,
        completed_at: parse_optional_timestamp(row.try_get::<Option<String>, _>("completed_at")?)?,
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| CoreError::Execution(format!("unknown execution status: {status}")))?,
        archive_size: row.try_get::<Option<i64>, _>("archive_size")?.unwrap_or(0),
        archive_hash: row
            .try_get::<Option<String>, _>("archive_hash")?
            .unwrap_or_default(),
        backend_results: Vec::new(),
        error_message: row
            .try_get::<Option<String>, _>("error_message")?
            .unwrap_or_default(),
        duration_ms: row.try_get::<Option<i64>, _>("duration_ms")?.unwrap_or(0),
    })
}

fn decode_backend_result(row: &sqlx::sqlite::SqliteRow) -> CoreResult<BackendResult> {
    let backend_id: String = row.try_get("backend_id")?;
    let status: String = row.try_get("status")?;
    Ok(BackendResult {
        backend_id: parse_uuid(&backend_id)?,
        backend_name: row.try_get("backend_name")?,
        status: BackendResultStatus::parse(&status)
            .ok_or_else(|| CoreError::Execution(format!("unknown upload status: {status}")))?,
        uploaded_at: parse_optional_timestamp(row.try_get::<Option<String>, _>("uploaded_at")?)?,
        size: row.try_get::<Option<i64>, _>("size")?.unwrap_or(0),
        remote_path: row
            .try_get::<Option<String>, _>("remote_path")?
            .unwrap_or_default(),
        error_message: row
            .try_get::<Option<String>, _>("error_message")?
            .unwrap_or_default(),
    })
}

fn parse_uuid(value: &str) -> CoreResult<Uuid> {
    Uuid::from_str(value).map_err(|err| CoreError::Execution(format!("invalid id {value}: {err}")))
}

fn parse_timestamp(value: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| CoreError::Execution(format!("invalid timestamp {value}: {err}")))
}

fn parse_optional_timestamp(value: Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => Ok(Some(parse_timestamp(&raw)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::HistoryStore;
    use crate::models::{BackendResult, BackendResultStatus, Execution, ExecutionStatus};
    use chrono::{Duration, Utc};
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn open_store(dir: &std::path::Path) -> HistoryStore {
        HistoryStore::open(&dir.join("archivist.db"))
            .await
            .expect("open history store")
    }

    fn running_execution(task_id: Uuid, name: &str) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            task_id,
            task_name: name.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            archive_size: 0,
            archive_hash: String::new(),
            backend_results: Vec::new(),
            error_message: String::new(),
            duration_ms: 0,
        }
    }

    fn upload_result(status: BackendResultStatus) -> BackendResult {
        BackendResult {
            backend_id: Uuid::new_v4(),
            backend_name: "disk".to_string(),
            status,
            uploaded_at: Some(Utc::now()),
            size: 128,
            remote_path: "daily_20250101_000000.tar.gz".to_string(),
            error_message: String::new(),
        }
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let first = open_store(dir.path()).await;
        first.close().await;
        let second = open_store(dir.path()).await;
        second.close().await;
    }

    #[tokio::test]
    async fn create_update_get_round_trip() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let mut exec = running_execution(Uuid::new_v4(), "nightly");
        store.create_execution(&exec).await.expect("create");

        exec.status = ExecutionStatus::Success;
        exec.completed_at = Some(Utc::now());
        exec.archive_size = 4096;
        exec.archive_hash = format!("sha256:{}", "a".repeat(64));
        exec.duration_ms = 1500;
        store.update_execution(&exec).await.expect("update");

        let loaded = store.get_execution(exec.id).await.expect("get");
        assert_eq!(loaded.status, ExecutionStatus::Success);
        assert_eq!(loaded.archive_size, 4096);
        assert_eq!(loaded.archive_hash, exec.archive_hash);
        assert_eq!(loaded.duration_ms, 1500);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn get_unknown_execution_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let err = store
            .get_execution(Uuid::new_v4())
            .await
            .expect_err("missing");
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn list_orders_most_recent_first() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let task_id = Uuid::new_v4();
        let base = Utc::now();
        for i in 0..3 {
            let mut exec = running_execution(task_id, "nightly");
            exec.started_at = base + Duration::seconds(i);
            store.create_execution(&exec).await.expect("create");
        }

        let listed = store
            .list_executions(Some(task_id), None, 10, 0)
            .await
            .expect("list");
        assert_eq!(listed.len(), 3);
        assert!(listed[0].started_at >= listed[1].started_at);
        assert!(listed[1].started_at >= listed[2].started_at);

        let paged = store
            .list_executions(Some(task_id), None, 1, 1)
            .await
            .expect("page");
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, listed[1].id);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let task_id = Uuid::new_v4();
        let mut running = running_execution(task_id, "nightly");
        store.create_execution(&running).await.expect("create");
        running.status = ExecutionStatus::Failed;
        store.update_execution(&running).await.expect("update");
        store
            .create_execution(&running_execution(task_id, "nightly"))
            .await
            .expect("create second");

        let failed = store
            .list_executions(None, Some(ExecutionStatus::Failed), 10, 0)
            .await
            .expect("failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, running.id);
    }

    #[tokio::test]
    async fn backend_uploads_append_in_order() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let exec = running_execution(Uuid::new_v4(), "nightly");
        store.create_execution(&exec).await.expect("create");

        let first = upload_result(BackendResultStatus::Success);
        let mut second = upload_result(BackendResultStatus::Failed);
        second.backend_name = "offsite".to_string();
        second.error_message = "network error".to_string();
        store
            .add_backend_upload(exec.id, &first)
            .await
            .expect("first upload");
        store
            .add_backend_upload(exec.id, &second)
            .await
            .expect("second upload");

        let loaded = store.get_execution(exec.id).await.expect("get");
        assert_eq!(loaded.backend_results.len(), 2);
        assert_eq!(loaded.backend_results[0].backend_id, first.backend_id);
        assert_eq!(loaded.backend_results[1].backend_id, second.backend_id);
        assert_eq!(
            loaded.backend_results[1].status,
            BackendResultStatus::Failed
        );
        assert_eq!(loaded.backend_results[1].error_message, "network error");
    }

    #[tokio::test]
    async fn task_stats_aggregate_history() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let task_id = Uuid::new_v4();
        let base = Utc::now();

        let mut success = running_execution(task_id, "nightly");
        success.started_at = base;
        store.create_execution(&success).await.expect("create");
        success.status = ExecutionStatus::Success;
        success.duration_ms = 1000;
        success.archive_size = 2048;
        store.update_execution(&success).await.expect("update");

        let mut failed = running_execution(task_id, "nightly");
        failed.started_at = base + Duration::seconds(5);
        store.create_execution(&failed).await.expect("create");
        failed.status = ExecutionStatus::Failed;
        failed.duration_ms = 3000;
        store.update_execution(&failed).await.expect("update");

        let stats = store.get_task_stats(task_id).await.expect("stats");
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.average_duration_ms, 2000);
        assert_eq!(stats.last_execution_status, "failed");
    }

    #[tokio::test]
    async fn execution_stats_count_last_24h() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let task_id = Uuid::new_v4();

        let mut old = running_execution(task_id, "nightly");
        old.started_at = Utc::now() - Duration::days(2);
        store.create_execution(&old).await.expect("create old");
        store
            .create_execution(&running_execution(task_id, "nightly"))
            .await
            .expect("create recent");

        let stats = store.get_execution_stats().await.expect("stats");
        assert_eq!(stats.total, 2);
        assert_eq!(stats.running, 2);
        assert_eq!(stats.last_24h, 1);
    }

    #[tokio::test]
    async fn clear_history_empties_both_tables() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let exec = running_execution(Uuid::new_v4(), "nightly");
        store.create_execution(&exec).await.expect("create");
        store
            .add_backend_upload(exec.id, &upload_result(BackendResultStatus::Success))
            .await
            .expect("upload");

        store.clear_history().await.expect("clear");
        let stats = store.get_execution_stats().await.expect("stats");
        assert_eq!(stats.total, 0);
        let err = store.get_execution(exec.id).await.expect_err("gone");
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
