//! SQLite task repository implementation.
//!
//! Implements `TaskRepository` from `stepchain-core` over the `tasks` table.
//! `inputForCurrentStep` and `history` are stored as JSON text. Timestamps
//! are RFC 3339 with fixed microsecond precision so that string order is
//! time order, which the lease relies on.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use stepchain_core::repository::task::TaskRepository;
use stepchain_types::error::RepositoryError;
use stepchain_types::task::{HistoryEntry, Task, TaskAux, TaskFilter, TaskStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `TaskRepository`.
#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: DatabasePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct TaskRow {
    id: String,
    status: String,
    current_step: i64,
    input_for_current_step: String,
    history: String,
    created_at: String,
    updated_at: String,
    retry_count: i64,
    lease_id: Option<String>,
    output_file: Option<String>,
    score: Option<i64>,
    input_seed: Option<String>,
    input_source: Option<String>,
    input_source_url: Option<String>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            current_step: row.try_get("currentStep")?,
            input_for_current_step: row.try_get("inputForCurrentStep")?,
            history: row.try_get("history")?,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
            retry_count: row.try_get("retryCount")?,
            lease_id: row.try_get("leaseId")?,
            output_file: row.try_get("outputFile")?,
            score: row.try_get("score")?,
            input_seed: row.try_get("inputSeed")?,
            input_source: row.try_get("inputSource")?,
            input_source_url: row.try_get("inputSourceUrl")?,
        })
    }

    fn into_task(self) -> Result<Task, RepositoryError> {
        let id = self
            .id
            .parse::<Uuid>()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?;
        let status: TaskStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let input_for_current_step = serde_json::from_str(&self.input_for_current_step)
            .map_err(|e| RepositoryError::Query(format!("invalid inputForCurrentStep JSON: {e}")))?;
        let history: Vec<HistoryEntry> = serde_json::from_str(&self.history)
            .map_err(|e| RepositoryError::Query(format!("invalid history JSON: {e}")))?;
        let lease_id = self
            .lease_id
            .map(|s| s.parse::<Uuid>())
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("invalid leaseId: {e}")))?;

        Ok(Task {
            id,
            status,
            current_step: usize::try_from(self.current_step)
                .map_err(|_| RepositoryError::Query(format!("invalid currentStep: {}", self.current_step)))?,
            input_for_current_step,
            history,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| RepositoryError::Query(format!("invalid retryCount: {}", self.retry_count)))?,
            lease_id,
            aux: TaskAux {
                output_file: self.output_file,
                score: self.score,
                input_seed: self.input_seed,
                input_source: self.input_source,
                input_source_url: self.input_source_url,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json(value: &impl serde::Serialize, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

/// Pool and I/O failures are connection errors; everything else is a query error.
fn db_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            RepositoryError::Connection(e.to_string())
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

fn rows_into_tasks(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Task>, RepositoryError> {
    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        let r = TaskRow::from_row(row).map_err(db_error)?;
        tasks.push(r.into_task()?);
    }
    Ok(tasks)
}

// ---------------------------------------------------------------------------
// TaskRepository impl
// ---------------------------------------------------------------------------

impl TaskRepository for SqliteTaskRepository {
    async fn insert_task(&self, task: &Task) -> Result<(), RepositoryError> {
        let input = to_json(&task.input_for_current_step, "inputForCurrentStep")?;
        let history = to_json(&task.history, "history")?;

        sqlx::query(
            r#"INSERT INTO tasks
               (id, status, currentStep, inputForCurrentStep, history, createdAt, updatedAt,
                retryCount, leaseId, outputFile, score, inputSeed, inputSource, inputSourceUrl)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(task.status.as_str())
        .bind(task.current_step as i64)
        .bind(&input)
        .bind(&history)
        .bind(format_datetime(&task.created_at))
        .bind(format_datetime(&task.updated_at))
        .bind(i64::from(task.retry_count))
        .bind(task.lease_id.map(|id| id.to_string()))
        .bind(&task.aux.output_file)
        .bind(task.aux.score)
        .bind(&task.aux.input_seed)
        .bind(&task.aux.input_source)
        .bind(&task.aux.input_source_url)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("task {} already exists", task.id))
            }
            other => db_error(other),
        })?;

        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => {
                let r = TaskRow::from_row(&row).map_err(db_error)?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn lease_next_pending(&self, now: DateTime<Utc>) -> Result<Option<Task>, RepositoryError> {
        // Single statement on the single writer connection: the inner SELECT
        // and the flip cannot interleave with another lease.
        let row = sqlx::query(
            r#"UPDATE tasks SET status = 'RUNNING', updatedAt = ?, leaseId = ?
               WHERE id = (
                   SELECT id FROM tasks WHERE status = 'PENDING'
                   ORDER BY createdAt ASC, id ASC LIMIT 1
               ) AND status = 'PENDING'
               RETURNING *"#,
        )
        .bind(format_datetime(&now))
        .bind(Uuid::now_v7().to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => {
                let r = TaskRow::from_row(&row).map_err(db_error)?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn update_task(&self, task: &Task, lease_id: Uuid) -> Result<(), RepositoryError> {
        let input = to_json(&task.input_for_current_step, "inputForCurrentStep")?;
        let history = to_json(&task.history, "history")?;

        let result = sqlx::query(
            r#"UPDATE tasks SET
                 status = ?, currentStep = ?, inputForCurrentStep = ?, history = ?,
                 updatedAt = ?, retryCount = ?, leaseId = ?, outputFile = ?, score = ?,
                 inputSeed = ?, inputSource = ?, inputSourceUrl = ?
               WHERE id = ? AND status = 'RUNNING' AND leaseId = ?"#,
        )
        .bind(task.status.as_str())
        .bind(task.current_step as i64)
        .bind(&input)
        .bind(&history)
        .bind(format_datetime(&task.updated_at))
        .bind(i64::from(task.retry_count))
        .bind(task.lease_id.map(|id| id.to_string()))
        .bind(&task.aux.output_file)
        .bind(task.aux.score)
        .bind(&task.aux.input_seed)
        .bind(&task.aux.input_source)
        .bind(&task.aux.input_source_url)
        .bind(task.id.to_string())
        .bind(lease_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current: Option<(String,)> = sqlx::query_as("SELECT status FROM tasks WHERE id = ?")
            .bind(task.id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(db_error)?;

        match current {
            None => Err(RepositoryError::NotFound),
            Some((status,)) => Err(RepositoryError::Conflict(format!(
                "task {} is {status}, not held by lease {lease_id}",
                task.id
            ))),
        }
    }

    async fn reset_running(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'PENDING', updatedAt = ?, leaseId = NULL WHERE status = 'RUNNING'",
        )
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'PENDING', updatedAt = ?, leaseId = NULL WHERE status = 'RUNNING' AND updatedAt < ?",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(format_datetime(&cutoff))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, RepositoryError> {
        let limit = i64::from(filter.limit);
        let rows = match filter.status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE status = ? ORDER BY createdAt DESC, id DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY createdAt DESC, id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(db_error)?;

        rows_into_tasks(&rows)
    }

    async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, RepositoryError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool.reader)
                .await
                .map_err(db_error)?;

        let mut counts = Vec::with_capacity(rows.len());
        for (status, n) in rows {
            let status: TaskStatus = status.parse().map_err(RepositoryError::Query)?;
            counts.push((status, n as u64));
        }
        counts.sort_by_key(|(status, _)| TaskStatus::ALL.iter().position(|s| s == status));
        Ok(counts)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn test_repo() -> SqliteTaskRepository {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_workflow(dir.path(), "test").await.unwrap();
        std::mem::forget(dir);
        SqliteTaskRepository::new(pool)
    }

    fn task_at(offset_secs: i64, input: serde_json::Value) -> Task {
        let mut task = Task::new(input, TaskAux::default());
        task.created_at = Utc::now() + Duration::seconds(offset_secs);
        task.updated_at = task.created_at;
        task
    }

    #[tokio::test]
    async fn test_insert_and_get_task() {
        let repo = test_repo().await;
        let mut task = Task::new(
            json!({"prompt": "a lighthouse"}),
            TaskAux {
                input_seed: Some("seed-1".to_string()),
                input_source: Some("rss".to_string()),
                input_source_url: Some("https://example.com/feed".to_string()),
                ..Default::default()
            },
        );
        task.history
            .push(HistoryEntry::success(0, "outline", json!("in"), json!("out")));
        repo.insert_task(&task).await.unwrap();

        let loaded = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.current_step, 0);
        assert_eq!(loaded.input_for_current_step, json!({"prompt": "a lighthouse"}));
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.history[0].output, Some(json!("out")));
        assert_eq!(loaded.aux, task.aux);
        assert_eq!(
            loaded.created_at.timestamp_micros(),
            task.created_at.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_get_missing_task_is_none() {
        let repo = test_repo().await;
        assert!(repo.get_task(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_duplicate_conflicts() {
        let repo = test_repo().await;
        let task = task_at(0, json!(1));
        repo.insert_task(&task).await.unwrap();
        let err = repo.insert_task(&task).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_lease_oldest_pending_first() {
        let repo = test_repo().await;
        let newer = task_at(5, json!("newer"));
        let older = task_at(-5, json!("older"));
        let mut done = task_at(-50, json!("done"));
        done.status = TaskStatus::Completed;
        for t in [&newer, &older, &done] {
            repo.insert_task(t).await.unwrap();
        }

        let now = Utc::now();
        let first = repo.lease_next_pending(now).await.unwrap().unwrap();
        assert_eq!(first.id, older.id);
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.updated_at.timestamp_micros(), now.timestamp_micros());
        assert!(first.lease_id.is_some());

        let second = repo.lease_next_pending(Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.id, newer.id);

        assert!(repo.lease_next_pending(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_leases_are_exclusive() {
        let repo = test_repo().await;
        repo.insert_task(&task_at(0, json!("only"))).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.lease_next_pending(Utc::now()).await.unwrap()
            }));
        }

        let mut won = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn test_update_task_compare_and_set() {
        let repo = test_repo().await;
        repo.insert_task(&task_at(0, json!("S"))).await.unwrap();
        let leased = repo.lease_next_pending(Utc::now()).await.unwrap().unwrap();
        let lease = leased.lease_id.unwrap();

        let mut task = leased.clone();
        task.status = TaskStatus::Pending;
        task.current_step = 1;
        task.input_for_current_step = json!("SA");
        task.retry_count = 2;
        task.lease_id = None;
        task.aux.score = Some(7);
        task.history
            .push(HistoryEntry::success(0, "a", json!("S"), json!("SA")));

        // Wrong lease token is refused.
        let err = repo.update_task(&task, Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        repo.update_task(&task, lease).await.unwrap();
        let loaded = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.current_step, 1);
        assert_eq!(loaded.input_for_current_step, json!("SA"));
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.lease_id, None);
        assert_eq!(loaded.aux.score, Some(7));
        assert_eq!(loaded.history.len(), 1);

        // Row is PENDING now, so the same lease cannot write again.
        task.status = TaskStatus::Failed;
        let err = repo.update_task(&task, lease).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let missing = task_at(0, json!(null));
        let err = repo.update_task(&missing, lease).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_requeued_lease_cannot_overwrite_new_holder() {
        let repo = test_repo().await;
        let task = task_at(0, json!("S"));
        repo.insert_task(&task).await.unwrap();

        let stale = repo
            .lease_next_pending(Utc::now() - Duration::hours(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            repo.requeue_stale(Utc::now() - Duration::hours(1))
                .await
                .unwrap(),
            1
        );
        let requeued = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.lease_id, None);

        // The new holder advances and leases the task again.
        let holder = repo.lease_next_pending(Utc::now()).await.unwrap().unwrap();
        assert_ne!(holder.lease_id, stale.lease_id);
        let mut advanced = holder.clone();
        advanced.status = TaskStatus::Pending;
        advanced.current_step = 1;
        advanced.lease_id = None;
        advanced
            .history
            .push(HistoryEntry::success(0, "a", json!("S"), json!("SA")));
        repo.update_task(&advanced, holder.lease_id.unwrap())
            .await
            .unwrap();
        let current = repo.lease_next_pending(Utc::now()).await.unwrap().unwrap();

        let mut late = stale.clone();
        late.status = TaskStatus::Failed;
        late.lease_id = None;
        late.history
            .push(HistoryEntry::failure(0, "a", "late"));
        let err = repo
            .update_task(&late, stale.lease_id.unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.current_step, 1);
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.lease_id, current.lease_id);
    }

    #[tokio::test]
    async fn test_closed_pool_is_connection_error() {
        let repo = test_repo().await;
        repo.close().await;
        let err = repo.get_task(&Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Connection(_)));
    }

    #[tokio::test]
    async fn test_reset_and_requeue_running() {
        let repo = test_repo().await;
        repo.insert_task(&task_at(-2, json!(1))).await.unwrap();
        repo.insert_task(&task_at(-1, json!(2))).await.unwrap();

        repo.lease_next_pending(Utc::now() - Duration::hours(2))
            .await
            .unwrap()
            .unwrap();
        repo.lease_next_pending(Utc::now()).await.unwrap().unwrap();

        let requeued = repo
            .requeue_stale(Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(
            repo.count_by_status().await.unwrap(),
            vec![(TaskStatus::Pending, 1), (TaskStatus::Running, 1)]
        );

        assert_eq!(repo.reset_running().await.unwrap(), 1);
        assert_eq!(
            repo.count_by_status().await.unwrap(),
            vec![(TaskStatus::Pending, 2)]
        );
    }

    #[tokio::test]
    async fn test_list_tasks_newest_first() {
        let repo = test_repo().await;
        let a = task_at(-30, json!("a"));
        let b = task_at(-20, json!("b"));
        let mut c = task_at(-10, json!("c"));
        c.status = TaskStatus::Failed;
        for t in [&a, &b, &c] {
            repo.insert_task(t).await.unwrap();
        }

        let all = repo.list_tasks(&TaskFilter::default()).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![c.id, b.id, a.id]);

        let failed = repo
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Failed),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, c.id);

        let limited = repo
            .list_tasks(&TaskFilter {
                status: None,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_format_datetime_sorts_lexically() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.000009Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.1Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_datetime(&early), "2026-01-01T00:00:00.000009Z");
        assert_eq!(format_datetime(&late), "2026-01-01T00:00:00.100000Z");
        assert!(format_datetime(&early) < format_datetime(&late));
    }
}
