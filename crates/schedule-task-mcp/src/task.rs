use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{SchedulerError, SchedulerResult};
use crate::time::format_local;
use crate::trigger::{self, Trigger, TriggerType};

/// History entries kept per task; older entries are dropped on insertion.
pub const MAX_HISTORY_ENTRIES: usize = 10;

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Paused,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "error" => Ok(TaskStatus::Error),
            other => Err(SchedulerError::validation(format!(
                "unknown task status {other:?}"
            ))),
        }
    }
}

/// Observable outcome of the most recent fire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Running,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Running => "running",
        }
    }
}

impl FromStr for RunStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "running" => Ok(RunStatus::Running),
            other => Err(SchedulerError::validation(format!(
                "unknown run status {other:?}"
            ))),
        }
    }
}

/// Outcome recorded in a history entry. A fire either succeeded or failed;
/// in-progress fires never reach history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Error,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Success => "success",
            HistoryStatus::Error => "error",
        }
    }
}

impl FromStr for HistoryStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(HistoryStatus::Success),
            "error" => Ok(HistoryStatus::Error),
            other => Err(SchedulerError::validation(format!(
                "unknown history status {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_at: DateTime<Utc>,
    pub status: HistoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A scheduled task and its bounded history, newest entry first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Display name. Not persisted (the tasks relation carries no name
    /// column), so it survives only as long as the process does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub trigger_type: TriggerType,
    pub trigger_config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_prompt: Option<String>,
    /// Legacy fields, retained but inert.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_arguments: Option<Value>,
    pub enabled: bool,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub last_message: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub history: Vec<HistoryEntry>,
}

impl Task {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn trigger(&self) -> SchedulerResult<Trigger> {
        Trigger::from_stored(self.trigger_type, &self.trigger_config)
    }

    pub fn has_legacy_tool_config(&self) -> bool {
        self.mcp_server.is_some() || self.mcp_tool.is_some()
    }

    /// Prepends a history entry and enforces the bound.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.insert(0, entry);
        self.history.truncate(MAX_HISTORY_ENTRIES);
    }

    pub fn latest_history_success(&self) -> bool {
        self.history
            .first()
            .map(|entry| entry.status == HistoryStatus::Success)
            .unwrap_or(false)
    }
}

/// Mints a fresh task id: `task-<unix-millis>-<7-char-random-alphanum>`.
pub fn mint_task_id(now: DateTime<Utc>) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect();
    format!("task-{}-{}", now.timestamp_millis(), suffix)
}

/// Derives `status` and `next_run` from stored fields and the current
/// instant, enforcing the lifecycle invariants.
///
/// `fire_in_progress` tells whether a fire currently holds this task's
/// execution lock; a persisted `running` status without one (e.g. after a
/// restart) is recomputed like any other terminal state.
pub fn normalize(task: &mut Task, now: DateTime<Utc>, tz: Tz, fire_in_progress: bool) {
    task.history.truncate(MAX_HISTORY_ENTRIES);

    let trigger = task.trigger().ok();

    let date_spent = task.trigger_type == TriggerType::Date
        && (task.latest_history_success()
            || matches!(&trigger, Some(Trigger::Date { run_date }) if *run_date <= now));

    task.status = if !task.enabled {
        if task.status == TaskStatus::Completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Paused
        }
    } else if fire_in_progress && task.status == TaskStatus::Running {
        TaskStatus::Running
    } else if date_spent {
        TaskStatus::Completed
    } else if task.last_status == Some(RunStatus::Error) {
        TaskStatus::Error
    } else {
        TaskStatus::Scheduled
    };

    if task.trigger_type == TriggerType::Date && task.status == TaskStatus::Completed {
        task.enabled = false;
    }

    task.next_run = if task.enabled && task.status != TaskStatus::Completed {
        trigger.and_then(|trigger| trigger::next_fire(&trigger, now, tz, task.next_run))
    } else {
        None
    };
}

/// Human-facing summary of a trigger, matching the service's localized
/// presentation strings.
pub fn trigger_summary(task: &Task, tz: Tz) -> String {
    match task.trigger() {
        Ok(Trigger::Interval(spec)) => {
            let mut parts = String::new();
            for (value, unit) in [
                (spec.days, "天"),
                (spec.hours, "小时"),
                (spec.minutes, "分钟"),
                (spec.seconds, "秒"),
            ] {
                if let Some(value) = value {
                    parts.push_str(&format_amount(value));
                    parts.push_str(unit);
                }
            }
            format!("每{parts}")
        }
        Ok(Trigger::Cron(spec)) => format!("Cron: {}", spec.expression),
        Ok(Trigger::Date { run_date }) => {
            format!("一次性 @ {}", format_local(run_date, tz))
        }
        Err(_) => task.trigger_type.as_str().to_string(),
    }
}

fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Projects a task to its presentation shape: the stored fields plus
/// `trigger_summary`, zone-adjusted `*_local` mirrors, and per-entry
/// `run_at_local` on history.
pub fn describe(task: &Task, tz: Tz) -> SchedulerResult<Value> {
    let mut value = serde_json::to_value(task)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| SchedulerError::Execution("task did not serialize to an object".into()))?;

    object.insert("trigger_summary".into(), json!(trigger_summary(task, tz)));
    object.insert(
        "created_at_local".into(),
        json!(format_local(task.created_at, tz)),
    );
    object.insert(
        "updated_at_local".into(),
        json!(format_local(task.updated_at, tz)),
    );
    if let Some(next_run) = task.next_run {
        object.insert("next_run_local".into(), json!(format_local(next_run, tz)));
    }
    if let Some(last_run) = task.last_run {
        object.insert("last_run_local".into(), json!(format_local(last_run, tz)));
    }

    if let Some(entries) = object
        .get_mut("history")
        .and_then(|history| history.as_array_mut())
    {
        for (entry_value, entry) in entries.iter_mut().zip(&task.history) {
            if let Some(entry_object) = entry_value.as_object_mut() {
                entry_object.insert("run_at_local".into(), json!(format_local(entry.run_at, tz)));
            }
        }
    }

    if let Ok(Trigger::Date { run_date }) = task.trigger() {
        object.insert(
            "trigger_config_local".into(),
            json!({ "run_date_local": format_local(run_date, tz) }),
        );
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn base_task(trigger_type: TriggerType, trigger_config: Value) -> Task {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        Task {
            id: "task-1-abcdefg".to_string(),
            name: Some("demo".to_string()),
            trigger_type,
            trigger_config,
            agent_prompt: None,
            mcp_server: None,
            mcp_tool: None,
            mcp_arguments: None,
            enabled: true,
            status: TaskStatus::Scheduled,
            created_at: created,
            updated_at: created,
            last_run: None,
            last_status: None,
            last_message: None,
            next_run: None,
            history: Vec::new(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn normalize_disabled_task_is_paused() {
        let mut task = base_task(TriggerType::Interval, json!({"seconds": 30}));
        task.enabled = false;
        normalize(&mut task, now(), chrono_tz::UTC, false);
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(task.next_run, None);
    }

    #[test]
    fn normalize_keeps_completed_when_disabled() {
        let mut task = base_task(TriggerType::Date, json!({"run_date": "2025-01-01T00:00:00Z"}));
        task.enabled = false;
        task.status = TaskStatus::Completed;
        normalize(&mut task, now(), chrono_tz::UTC, false);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn normalize_enabled_interval_gets_future_next_run() {
        let mut task = base_task(TriggerType::Interval, json!({"seconds": 30}));
        normalize(&mut task, now(), chrono_tz::UTC, false);
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.next_run, Some(now() + ChronoDuration::seconds(30)));
    }

    #[test]
    fn normalize_preserves_future_planned_next_run() {
        let mut task = base_task(TriggerType::Interval, json!({"seconds": 30}));
        let planned = now() + ChronoDuration::seconds(7);
        task.next_run = Some(planned);
        normalize(&mut task, now(), chrono_tz::UTC, false);
        assert_eq!(task.next_run, Some(planned));
    }

    #[test]
    fn normalize_completes_date_task_after_successful_fire() {
        let mut task = base_task(
            TriggerType::Date,
            json!({"run_date": "2030-01-01T00:00:00Z"}),
        );
        task.push_history(HistoryEntry {
            run_at: now(),
            status: HistoryStatus::Success,
            message: None,
        });
        normalize(&mut task, now(), chrono_tz::UTC, false);
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(!task.enabled);
        assert_eq!(task.next_run, None);
    }

    #[test]
    fn normalize_completes_date_task_with_spent_run_date() {
        let mut task = base_task(
            TriggerType::Date,
            json!({"run_date": "2025-01-01T00:00:00Z"}),
        );
        normalize(&mut task, now(), chrono_tz::UTC, false);
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(!task.enabled);
    }

    #[test]
    fn normalize_surfaces_error_outcome() {
        let mut task = base_task(TriggerType::Interval, json!({"seconds": 30}));
        task.last_status = Some(RunStatus::Error);
        normalize(&mut task, now(), chrono_tz::UTC, false);
        assert_eq!(task.status, TaskStatus::Error);
        // the trigger keeps scheduling despite the error
        assert!(task.next_run.is_some());
    }

    #[test]
    fn normalize_recovers_stale_running_status() {
        let mut task = base_task(TriggerType::Interval, json!({"seconds": 30}));
        task.status = TaskStatus::Running;
        task.last_status = Some(RunStatus::Running);
        normalize(&mut task, now(), chrono_tz::UTC, false);
        assert_eq!(task.status, TaskStatus::Scheduled);
    }

    #[test]
    fn normalize_keeps_running_while_fire_in_progress() {
        let mut task = base_task(TriggerType::Interval, json!({"seconds": 30}));
        task.status = TaskStatus::Running;
        normalize(&mut task, now(), chrono_tz::UTC, true);
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let mut task = base_task(TriggerType::Interval, json!({"seconds": 1}));
        for i in 0..15 {
            task.push_history(HistoryEntry {
                run_at: now() + ChronoDuration::seconds(i),
                status: HistoryStatus::Success,
                message: Some(format!("run {i}")),
            });
        }
        assert_eq!(task.history.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(task.history[0].message.as_deref(), Some("run 14"));
        assert!(task
            .history
            .windows(2)
            .all(|pair| pair[0].run_at >= pair[1].run_at));
    }

    #[test]
    fn trigger_summaries_are_localized() {
        let interval = base_task(TriggerType::Interval, json!({"minutes": 30}));
        assert_eq!(trigger_summary(&interval, chrono_tz::UTC), "每30分钟");

        let mixed = base_task(TriggerType::Interval, json!({"hours": 1, "minutes": 30}));
        assert_eq!(trigger_summary(&mixed, chrono_tz::UTC), "每1小时30分钟");

        let cron = base_task(TriggerType::Cron, json!({"expression": "0 9 * * *"}));
        assert_eq!(trigger_summary(&cron, chrono_tz::UTC), "Cron: 0 9 * * *");

        let date = base_task(
            TriggerType::Date,
            json!({"run_date": "2025-10-09T14:00:00Z"}),
        );
        assert_eq!(
            trigger_summary(&date, chrono_tz::UTC),
            "一次性 @ 2025-10-09 14:00:00"
        );
    }

    #[test]
    fn describe_adds_local_projections() {
        let mut task = base_task(
            TriggerType::Date,
            json!({"run_date": "2025-10-09T06:00:00Z"}),
        );
        task.next_run = Some(Utc.with_ymd_and_hms(2025, 10, 9, 6, 0, 0).unwrap());
        task.push_history(HistoryEntry {
            run_at: Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap(),
            status: HistoryStatus::Success,
            message: Some("ok".into()),
        });

        let described = describe(&task, chrono_tz::Asia::Shanghai).unwrap();
        assert_eq!(
            described["trigger_config_local"]["run_date_local"],
            json!("2025-10-09 14:00:00")
        );
        assert_eq!(described["next_run_local"], json!("2025-10-09 14:00:00"));
        assert_eq!(described["created_at_local"], json!("2025-06-01 08:00:00"));
        assert_eq!(
            described["history"][0]["run_at_local"],
            json!("2025-06-01 09:00:00")
        );
        assert_eq!(described["trigger_summary"], json!("一次性 @ 2025-10-09 14:00:00"));
    }
}
