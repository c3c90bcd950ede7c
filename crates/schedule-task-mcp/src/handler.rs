//! Dispatches `tools/call` requests to the scheduler and shapes the
//! results: every tool returns a single text content block holding a JSON
//! document with a `success` flag.

use std::sync::Arc;

use schedule_mcp_transport::schema::CallToolResult;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{CreateTaskInput, TaskScheduler};
use crate::task::Task;
use crate::time;
use crate::tools::{
    GetCurrentTimeArgs, ListTasksArgs, TaskIdArgs, TimeFormat, UpdateTaskArgs,
};

pub struct ToolDispatcher {
    scheduler: Arc<TaskScheduler>,
}

impl ToolDispatcher {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }

    /// Runs one tool call. Errors become the standard error envelope and
    /// are flagged as errors at the RPC layer; they never escape.
    pub async fn call(&self, name: &str, arguments: Option<Value>) -> CallToolResult {
        debug!("tool call: {name}");
        match self.dispatch(name, arguments).await {
            Ok(payload) => CallToolResult::text_content(pretty(&payload)),
            Err(error) => {
                let payload = json!({
                    "success": false,
                    "error": error.to_string(),
                });
                CallToolResult::error(pretty(&payload))
            }
        }
    }

    async fn dispatch(&self, name: &str, arguments: Option<Value>) -> SchedulerResult<Value> {
        match name {
            "create_task" => {
                let input: CreateTaskInput = parse_args(arguments)?;
                let task = self.scheduler.create(input).await?;
                self.task_payload(&task, None)
            }
            "list_tasks" => {
                let args: ListTasksArgs = parse_args(arguments)?;
                let mut tasks = self.scheduler.list().await?;
                if let Some(status) = args.status {
                    tasks.retain(|task| task.status == status);
                }
                let described = tasks
                    .iter()
                    .map(|task| self.scheduler.describe(task))
                    .collect::<SchedulerResult<Vec<_>>>()?;
                Ok(json!({
                    "success": true,
                    "count": described.len(),
                    "tasks": described,
                }))
            }
            "get_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let task = self
                    .scheduler
                    .get(&args.task_id)
                    .await?
                    .ok_or(SchedulerError::TaskNotFound(args.task_id))?;
                self.task_payload(&task, None)
            }
            "update_task" => {
                let args: UpdateTaskArgs = parse_args(arguments)?;
                let task = self.scheduler.update(&args.task_id, args.patch).await?;
                self.task_payload(&task, Some("Task updated"))
            }
            "delete_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                if !self.scheduler.delete(&args.task_id).await? {
                    return Err(SchedulerError::TaskNotFound(args.task_id));
                }
                Ok(json!({
                    "success": true,
                    "message": format!("Task {} deleted", args.task_id),
                }))
            }
            "pause_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let task = self.scheduler.pause(&args.task_id).await?;
                self.task_payload(&task, Some("Task paused"))
            }
            "resume_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let task = self.scheduler.resume(&args.task_id).await?;
                self.task_payload(&task, Some("Task resumed"))
            }
            "execute_task" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let message = self.scheduler.execute(&args.task_id).await?;
                Ok(json!({
                    "success": true,
                    "message": message,
                }))
            }
            "clear_task_history" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let task = self.scheduler.clear_history(&args.task_id).await?;
                self.task_payload(&task, Some("Task history cleared"))
            }
            "get_current_time" => {
                let args: GetCurrentTimeArgs = parse_args(arguments)?;
                let tz = self.scheduler.timezone();
                let now = time::now();
                let rendered = match args.format {
                    TimeFormat::Iso => now.with_timezone(&tz).to_rfc3339(),
                    TimeFormat::Readable => {
                        format!("{} ({})", time::format_local(now, tz), tz.name())
                    }
                };
                Ok(json!({
                    "success": true,
                    "time": rendered,
                    "timezone": tz.name(),
                }))
            }
            other => Err(SchedulerError::validation(format!(
                "unknown tool: {other}"
            ))),
        }
    }

    fn task_payload(&self, task: &Task, message: Option<&str>) -> SchedulerResult<Value> {
        let mut payload = json!({
            "success": true,
            "task": self.scheduler.describe(task)?,
        });
        if let Some(message) = message {
            payload["message"] = json!(message);
        }
        Ok(payload)
    }
}

/// Parses tool arguments; an absent or null arguments object is treated as
/// empty, so optional-only tools work bare and required fields produce a
/// clear validation message.
fn parse_args<T: serde::de::DeserializeOwned>(arguments: Option<Value>) -> SchedulerResult<T> {
    let arguments = match arguments {
        None | Some(Value::Null) => json!({}),
        Some(value) => value,
    };
    serde_json::from_value(arguments)
        .map_err(|e| SchedulerError::validation(format!("invalid arguments: {e}")))
}

fn pretty(payload: &Value) -> String {
    serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
}
