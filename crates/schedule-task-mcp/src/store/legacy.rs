//! One-shot import of the legacy free-form task file.
//!
//! Runs only against an empty `tasks` table. Each legacy record is coerced
//! into the current task shape; records that fail to parse are logged and
//! skipped, and a whole-file parse failure leaves the file untouched.
//! After a successful import the file is renamed with a `.bak` suffix so
//! the import never repeats.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::task::{self, HistoryEntry, HistoryStatus, RunStatus, Task, TaskStatus};
use crate::trigger::{Trigger, TriggerType};

use super::TaskStore;

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    trigger_type: String,
    trigger_config: Value,
    #[serde(default)]
    agent_prompt: Option<String>,
    #[serde(default)]
    mcp_server: Option<String>,
    #[serde(default)]
    mcp_tool: Option<String>,
    #[serde(default)]
    mcp_arguments: Option<Value>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    last_status: Option<String>,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    history: Option<Vec<LegacyHistoryEntry>>,
}

#[derive(Debug, Deserialize)]
struct LegacyHistoryEntry {
    run_at: DateTime<Utc>,
    status: String,
    #[serde(default)]
    message: Option<String>,
}

/// Imports tasks from `path` into an empty store, then renames the file to
/// `<path>.bak`. Returns the number of imported tasks; `Ok(0)` when the
/// file does not exist.
pub async fn import_legacy(store: &TaskStore, path: &Path) -> SchedulerResult<usize> {
    if !path.exists() {
        return Ok(0);
    }

    let raw = tokio::fs::read_to_string(path).await?;
    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(error) => {
            warn!("legacy task file {} is not valid JSON: {error}", path.display());
            return Ok(0);
        }
    };

    let records = match &parsed {
        Value::Array(items) => items.clone(),
        Value::Object(object) => match object.get("tasks").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => {
                warn!(
                    "legacy task file {} has no recognizable task list",
                    path.display()
                );
                return Ok(0);
            }
        },
        _ => {
            warn!(
                "legacy task file {} has no recognizable task list",
                path.display()
            );
            return Ok(0);
        }
    };

    let now = crate::time::now();
    let mut imported = 0usize;
    for (index, record) in records.into_iter().enumerate() {
        match coerce_record(record, now) {
            Ok(task) => {
                store.upsert(&task).await?;
                imported += 1;
            }
            Err(error) => {
                warn!("skipping legacy task record #{index}: {error}");
            }
        }
    }

    let mut backup = path.as_os_str().to_owned();
    backup.push(".bak");
    tokio::fs::rename(path, &backup).await?;
    info!(
        "imported {imported} legacy task(s) from {}; original renamed to {}",
        path.display(),
        Path::new(&backup).display()
    );

    Ok(imported)
}

fn coerce_record(value: Value, now: DateTime<Utc>) -> SchedulerResult<Task> {
    let record: LegacyRecord = serde_json::from_value(value)
        .map_err(|e| SchedulerError::validation(format!("unreadable record: {e}")))?;

    let trigger_type = TriggerType::from_str(&record.trigger_type)?;
    // already-materialized configs pass through; relative date configs are
    // materialized against the import instant
    let trigger = Trigger::from_stored(trigger_type, &record.trigger_config)
        .or_else(|_| Trigger::from_config(trigger_type, &record.trigger_config, now))?;

    let status = record
        .status
        .as_deref()
        .map(TaskStatus::from_str)
        .transpose()?
        .unwrap_or(TaskStatus::Scheduled);
    let last_status = record
        .last_status
        .as_deref()
        .map(RunStatus::from_str)
        .transpose()?;

    let history = record
        .history
        .unwrap_or_default()
        .into_iter()
        .map(|entry| {
            Ok(HistoryEntry {
                run_at: entry.run_at,
                status: HistoryStatus::from_str(&entry.status)?,
                message: entry.message,
            })
        })
        .collect::<SchedulerResult<Vec<_>>>()?;

    let created_at = record.created_at.unwrap_or(now);
    let mut task = Task {
        id: record.id.unwrap_or_else(|| task::mint_task_id(now)),
        name: record.name,
        trigger_type,
        trigger_config: trigger.to_config()?,
        agent_prompt: record.agent_prompt,
        mcp_server: record.mcp_server,
        mcp_tool: record.mcp_tool,
        mcp_arguments: record.mcp_arguments,
        enabled: record.enabled.unwrap_or(true),
        status,
        created_at,
        updated_at: record.updated_at.unwrap_or(created_at),
        last_run: record.last_run,
        last_status,
        last_message: record.last_message,
        next_run: record.next_run,
        history,
    };
    task.history.truncate(task::MAX_HISTORY_ENTRIES);
    Ok(task)
}
