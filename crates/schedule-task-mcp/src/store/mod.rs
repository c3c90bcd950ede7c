//! SQLite-backed durable store for tasks and their bounded history.
//!
//! Two relations, `tasks` and `task_history`, related one-to-many with
//! cascade delete. Opened in WAL mode so timer fires and inbound calls can
//! read consistently while writes commit.

pub mod legacy;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Connection, Row, SqlitePool};
use tracing::{debug, info};

use crate::error::SchedulerResult;
use crate::task::{HistoryEntry, HistoryStatus, RunStatus, Task, TaskStatus};
use crate::time;
use crate::trigger::TriggerType;

/// Partial update of a task's last-fire bookkeeping. The outer `Option`
/// marks a field as untouched; the inner one maps to SQL NULL.
#[derive(Debug, Default)]
pub struct StatusPatch {
    pub last_run: Option<Option<DateTime<Utc>>>,
    pub last_status: Option<Option<RunStatus>>,
    pub last_message: Option<Option<String>>,
    pub next_run: Option<Option<DateTime<Utc>>>,
}

pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Opens (creating if missing) the database at `path` and brings the
    /// schema up to date.
    pub async fn open(path: &Path) -> SchedulerResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        debug!("task store ready at {}", path.display());
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> SchedulerResult<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                trigger_type TEXT NOT NULL,
                trigger_config TEXT NOT NULL,
                mcp_server TEXT,
                mcp_tool TEXT,
                mcp_arguments TEXT,
                agent_prompt TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'scheduled',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_run TEXT,
                last_status TEXT,
                last_message TEXT,
                next_run TEXT
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                run_at TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_task_history_task ON task_history (task_id, id)",
        )
        .execute(&mut *conn)
        .await?;

        // An earlier schema carried a name column; rebuild without it.
        let columns = sqlx::query("PRAGMA table_info(tasks)")
            .fetch_all(&mut *conn)
            .await?;
        let has_name_column = columns
            .iter()
            .any(|row| row.get::<String, _>("name") == "name");
        if has_name_column {
            info!("migrating tasks table: dropping legacy name column");
            self.drop_name_column(&mut conn).await?;
        }

        Ok(())
    }

    async fn drop_name_column(
        &self,
        conn: &mut sqlx::pool::PoolConnection<sqlx::Sqlite>,
    ) -> SchedulerResult<()> {
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut **conn)
            .await?;

        let result: SchedulerResult<()> = async {
            let mut tx = conn.begin().await?;

            sqlx::query(
                r#"
                CREATE TABLE tasks_rebuild (
                    id TEXT PRIMARY KEY,
                    trigger_type TEXT NOT NULL,
                    trigger_config TEXT NOT NULL,
                    mcp_server TEXT,
                    mcp_tool TEXT,
                    mcp_arguments TEXT,
                    agent_prompt TEXT,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    status TEXT NOT NULL DEFAULT 'scheduled',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    last_run TEXT,
                    last_status TEXT,
                    last_message TEXT,
                    next_run TEXT
                )
                "#,
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO tasks_rebuild (id, trigger_type, trigger_config, mcp_server,
                    mcp_tool, mcp_arguments, agent_prompt, enabled, status, created_at,
                    updated_at, last_run, last_status, last_message, next_run)
                SELECT id, trigger_type, trigger_config, mcp_server,
                    mcp_tool, mcp_arguments, agent_prompt, enabled, status, created_at,
                    updated_at, last_run, last_status, last_message, next_run
                FROM tasks
                "#,
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query("DROP TABLE tasks").execute(&mut *tx).await?;
            sqlx::query("ALTER TABLE tasks_rebuild RENAME TO tasks")
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        }
        .await;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut **conn)
            .await?;

        result
    }

    /// Writes the task row and replaces all of its history rows with the
    /// task's in-memory sequence, in order, atomically.
    pub async fn upsert(&self, task: &Task) -> SchedulerResult<()> {
        let trigger_config = serde_json::to_string(&task.trigger_config)?;
        let mcp_arguments = task
            .mcp_arguments
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, trigger_type, trigger_config, mcp_server, mcp_tool,
                mcp_arguments, agent_prompt, enabled, status, created_at, updated_at,
                last_run, last_status, last_message, next_run)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                trigger_type = excluded.trigger_type,
                trigger_config = excluded.trigger_config,
                mcp_server = excluded.mcp_server,
                mcp_tool = excluded.mcp_tool,
                mcp_arguments = excluded.mcp_arguments,
                agent_prompt = excluded.agent_prompt,
                enabled = excluded.enabled,
                status = excluded.status,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                last_run = excluded.last_run,
                last_status = excluded.last_status,
                last_message = excluded.last_message,
                next_run = excluded.next_run
            "#,
        )
        .bind(&task.id)
        .bind(task.trigger_type.as_str())
        .bind(&trigger_config)
        .bind(&task.mcp_server)
        .bind(&task.mcp_tool)
        .bind(&mcp_arguments)
        .bind(&task.agent_prompt)
        .bind(task.enabled)
        .bind(task.status.as_str())
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.last_run)
        .bind(task.last_status.map(|s| s.as_str()))
        .bind(&task.last_message)
        .bind(task.next_run)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM task_history WHERE task_id = ?")
            .bind(&task.id)
            .execute(&mut *tx)
            .await?;

        for entry in &task.history {
            sqlx::query(
                "INSERT INTO task_history (task_id, run_at, status, message) VALUES (?, ?, ?, ?)",
            )
            .bind(&task.id)
            .bind(entry.run_at)
            .bind(entry.status.as_str())
            .bind(&entry.message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let history = sqlx::query(
            "SELECT run_at, status, message FROM task_history WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(row_to_history_entry)
        .collect::<SchedulerResult<Vec<_>>>()?;

        Ok(Some(row_to_task(row, history)?))
    }

    /// All tasks, hydrated with history, ordered by creation time.
    pub async fn list(&self) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        let history_rows = sqlx::query(
            "SELECT task_id, run_at, status, message FROM task_history ORDER BY task_id, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut histories: HashMap<String, Vec<HistoryEntry>> = HashMap::new();
        for row in history_rows {
            let task_id: String = row.get("task_id");
            histories
                .entry(task_id)
                .or_default()
                .push(row_to_history_entry(row)?);
        }

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let history = histories.remove(&id).unwrap_or_default();
            tasks.push(row_to_task(row, history)?);
        }
        Ok(tasks)
    }

    /// Deletes the task row; history cascades. Returns whether a row
    /// existed.
    pub async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        let affected = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Applies a partial update of the last-fire fields. Only present
    /// fields are written; `updated_at` is always touched.
    pub async fn update_status(&self, id: &str, patch: StatusPatch) -> SchedulerResult<()> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("UPDATE tasks SET updated_at = ");
        builder.push_bind(time::now());

        if let Some(last_run) = patch.last_run {
            builder.push(", last_run = ");
            builder.push_bind(last_run);
        }
        if let Some(last_status) = patch.last_status {
            builder.push(", last_status = ");
            builder.push_bind(last_status.map(|s| s.as_str()));
        }
        if let Some(last_message) = patch.last_message {
            builder.push(", last_message = ");
            builder.push_bind(last_message);
        }
        if let Some(next_run) = patch.next_run {
            builder.push(", next_run = ");
            builder.push_bind(next_run);
        }

        builder.push(" WHERE id = ");
        builder.push_bind(id);

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Removes all history rows and clears the last-fire fields.
    pub async fn clear_history(&self, id: &str) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM task_history WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE tasks SET last_run = NULL, last_status = NULL, last_message = NULL, \
             updated_at = ? WHERE id = ?",
        )
        .bind(time::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> SchedulerResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn row_to_task(row: SqliteRow, history: Vec<HistoryEntry>) -> SchedulerResult<Task> {
    let trigger_type = TriggerType::from_str(&row.get::<String, _>("trigger_type"))?;
    let status = TaskStatus::from_str(&row.get::<String, _>("status"))?;
    let last_status = row
        .get::<Option<String>, _>("last_status")
        .map(|s| RunStatus::from_str(&s))
        .transpose()?;
    let trigger_config: Value = serde_json::from_str(&row.get::<String, _>("trigger_config"))?;
    let mcp_arguments = row
        .get::<Option<String>, _>("mcp_arguments")
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(Task {
        id: row.get("id"),
        name: None,
        trigger_type,
        trigger_config,
        agent_prompt: row.get("agent_prompt"),
        mcp_server: row.get("mcp_server"),
        mcp_tool: row.get("mcp_tool"),
        mcp_arguments,
        enabled: row.get("enabled"),
        status,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_run: row.get("last_run"),
        last_status,
        last_message: row.get("last_message"),
        next_run: row.get("next_run"),
        history,
    })
}

fn row_to_history_entry(row: SqliteRow) -> SchedulerResult<HistoryEntry> {
    let status = HistoryStatus::from_str(&row.get::<String, _>("status"))?;
    Ok(HistoryEntry {
        run_at: row.get("run_at"),
        status,
        message: row.get("message"),
    })
}
