use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::tasks::{CreateTask, Task, TaskLog, TaskStatus};

/// Async-safe handle to the task database.
///
/// Wraps `TaskDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous
/// SQLite I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TaskDb>>,
}

impl DbHandle {
    pub fn new(db: TaskDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TaskDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct TaskDb {
    conn: Connection,
}

impl TaskDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    user_id TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    progress INTEGER NOT NULL DEFAULT 0,
                    prompt TEXT NOT NULL,
                    repo_url TEXT,
                    selected_agent TEXT,
                    selected_model TEXT,
                    sandbox_url TEXT,
                    branch_name TEXT,
                    logs TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);
                ",
            )
            .context("Failed to create tasks table")?;
        Ok(())
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    pub fn create_task(&self, data: &CreateTask) -> Result<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let logs = vec![TaskLog::info("Task created, preparing to start...")];
        let logs_json = serde_json::to_string(&logs).context("Failed to encode task logs")?;
        let selected_agent = data
            .selected_agent
            .clone()
            .unwrap_or_else(|| "claude".to_string());

        self.conn
            .execute(
                "INSERT INTO tasks
                    (id, user_id, status, progress, prompt, repo_url,
                     selected_agent, selected_model, logs, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id,
                    data.user_id,
                    data.prompt,
                    data.repo_url,
                    selected_agent,
                    data.selected_model,
                    logs_json,
                    now,
                ],
            )
            .context("Failed to insert task")?;

        self.get_task(&id)?
            .ok_or_else(|| anyhow::anyhow!("Task {} vanished after insert", id))
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.conn
            .query_row(
                "SELECT id, user_id, status, progress, prompt, repo_url,
                        selected_agent, selected_model, sandbox_url, branch_name,
                        logs, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id],
                Self::row_to_task,
            )
            .optional()
            .context("Failed to fetch task")
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, status, progress, prompt, repo_url,
                    selected_agent, selected_model, sandbox_url, branch_name,
                    logs, created_at, updated_at
             FROM tasks ORDER BY created_at DESC",
        )?;
        let tasks = stmt
            .query_map([], Self::row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list tasks")?;
        Ok(tasks)
    }

    /// Delete one task. Returns false if no row matched.
    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(affected > 0)
    }

    /// Delete every task in one of the given statuses, returning the count.
    pub fn delete_tasks_by_status(&self, statuses: &[TaskStatus]) -> Result<usize> {
        let mut deleted = 0;
        for status in statuses {
            deleted += self
                .conn
                .execute(
                    "DELETE FROM tasks WHERE status = ?1",
                    params![status.as_str()],
                )
                .context("Failed to delete tasks by status")?;
        }
        Ok(deleted)
    }

    pub fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if let (Some(message), TaskStatus::Error) = (error_message, status) {
            self.append_log(id, &TaskLog::error(message))?;
        }
        let now = chrono::Utc::now().to_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )
            .context("Failed to update task status")?;
        Ok(affected > 0)
    }

    pub fn update_progress(&self, id: &str, progress: i64, message: Option<&str>) -> Result<bool> {
        if let Some(message) = message {
            self.append_log(id, &TaskLog::info(message))?;
        }
        let now = chrono::Utc::now().to_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE tasks SET progress = ?1, updated_at = ?2 WHERE id = ?3",
                params![progress, now, id],
            )
            .context("Failed to update task progress")?;
        Ok(affected > 0)
    }

    pub fn set_sandbox_url(&self, id: &str, url: &str) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE tasks SET sandbox_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![url, now, id],
            )
            .context("Failed to update sandbox URL")?;
        Ok(affected > 0)
    }

    /// Append one log entry to the task's JSON-encoded log array.
    pub fn append_log(&self, id: &str, log: &TaskLog) -> Result<bool> {
        let current: Option<String> = self
            .conn
            .query_row("SELECT logs FROM tasks WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to read task logs")?;

        let Some(current) = current else {
            return Ok(false);
        };

        let mut logs: Vec<serde_json::Value> = serde_json::from_str(&current).unwrap_or_default();
        logs.push(serde_json::to_value(log).context("Failed to encode log entry")?);
        let encoded = serde_json::to_string(&logs).context("Failed to encode task logs")?;
        let now = chrono::Utc::now().to_rfc3339();

        let affected = self
            .conn
            .execute(
                "UPDATE tasks SET logs = ?1, updated_at = ?2 WHERE id = ?3",
                params![encoded, now, id],
            )
            .context("Failed to write task logs")?;
        Ok(affected > 0)
    }

    /// Insert a bare row bypassing the model layer, so tests can seed
    /// arbitrary stored shapes (notably foreign `logs` JSON).
    #[cfg(test)]
    pub fn raw_insert_for_tests(&self, id: &str, prompt: &str, logs_json: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO tasks (id, prompt, logs, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![id, prompt, logs_json, now],
            )
            .context("Failed to insert raw task row")?;
        Ok(())
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let status: String = row.get(2)?;
        let logs_json: String = row.get(10)?;
        Ok(Task {
            id: row.get(0)?,
            user_id: row.get(1)?,
            status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
            progress: row.get(3)?,
            prompt: row.get(4)?,
            repo_url: row.get(5)?,
            selected_agent: row.get(6)?,
            selected_model: row.get(7)?,
            sandbox_url: row.get(8)?,
            branch_name: row.get(9)?,
            logs: serde_json::from_str(&logs_json).unwrap_or_default(),
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

/// Convenience wrapper that appends typed log lines for one task.
pub struct TaskLogger {
    db: DbHandle,
    task_id: String,
}

impl TaskLogger {
    pub fn new(db: DbHandle, task_id: impl Into<String>) -> Self {
        Self {
            db,
            task_id: task_id.into(),
        }
    }

    pub async fn info(&self, message: impl Into<String>) -> Result<()> {
        self.append(TaskLog::info(message)).await
    }

    pub async fn error(&self, message: impl Into<String>) -> Result<()> {
        self.append(TaskLog::error(message)).await
    }

    pub async fn success(&self, message: impl Into<String>) -> Result<()> {
        self.append(TaskLog::success(message)).await
    }

    pub async fn command(&self, message: impl Into<String>) -> Result<()> {
        self.append(TaskLog::command(message)).await
    }

    pub async fn update_status(
        &self,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let id = self.task_id.clone();
        self.db
            .call(move |db| db.update_status(&id, status, error_message.as_deref()))
            .await?;
        Ok(())
    }

    pub async fn update_progress(&self, progress: i64, message: Option<String>) -> Result<()> {
        let id = self.task_id.clone();
        self.db
            .call(move |db| db.update_progress(&id, progress, message.as_deref()))
            .await?;
        Ok(())
    }

    async fn append(&self, log: TaskLog) -> Result<()> {
        let id = self.task_id.clone();
        self.db.call(move |db| db.append_log(&id, &log)).await?;
        Ok(())
    }
}
