//! The fixed tool catalogue and the argument shapes tools accept.

use schedule_mcp_transport::schema::Tool;
use serde::Deserialize;
use serde_json::json;

use crate::scheduler::UpdateTaskInput;
use crate::task::TaskStatus;

#[derive(Debug, Deserialize)]
pub struct TaskIdArgs {
    pub task_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksArgs {
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskArgs {
    pub task_id: String,
    #[serde(flatten)]
    pub patch: UpdateTaskInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    #[default]
    Iso,
    Readable,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetCurrentTimeArgs {
    #[serde(default)]
    pub format: TimeFormat,
}

fn task_id_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "task_id": {
                "type": "string",
                "description": "Identifier of the task"
            }
        },
        "required": ["task_id"]
    })
}

/// The fixed tool catalogue advertised by `tools/list`.
pub fn catalogue() -> Vec<Tool> {
    vec![
        Tool {
            name: "create_task".into(),
            description: "Create a scheduled task with an interval, cron or date trigger. \
                          When agent_prompt is set, each fire asks the client to execute the \
                          prompt via sampling."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Human-readable task name"
                    },
                    "trigger_type": {
                        "type": "string",
                        "enum": ["interval", "cron", "date"],
                        "description": "Trigger family governing when the task fires"
                    },
                    "trigger_config": {
                        "type": "object",
                        "description": "Trigger settings. interval: any of seconds/minutes/hours/days (positive numbers). cron: {expression} with a five-field cron expression. date: {run_date} (ISO-8601) and/or delay_seconds/delay_minutes/delay_hours/delay_days."
                    },
                    "agent_prompt": {
                        "type": "string",
                        "description": "Instruction sent back to the client via sampling/createMessage on each fire"
                    },
                    "mcp_server": {
                        "type": "string",
                        "description": "Legacy field, retained but no longer invoked"
                    },
                    "mcp_tool": {
                        "type": "string",
                        "description": "Legacy field, retained but no longer invoked"
                    },
                    "mcp_arguments": {
                        "type": "object",
                        "description": "Legacy field, retained but no longer invoked"
                    }
                },
                "required": ["name", "trigger_type", "trigger_config"]
            }),
        },
        Tool {
            name: "list_tasks".into(),
            description: "List all scheduled tasks, optionally filtered by status.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "enum": ["scheduled", "running", "paused", "completed", "error"],
                        "description": "Only return tasks with this status"
                    }
                }
            }),
        },
        Tool {
            name: "get_task".into(),
            description: "Get one task by id, including its recent run history.".into(),
            input_schema: task_id_schema(),
        },
        Tool {
            name: "update_task".into(),
            description: "Update a task's name, trigger or prompt. Changing trigger_type \
                          requires a matching trigger_config."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": {
                        "type": "string",
                        "description": "Identifier of the task"
                    },
                    "name": { "type": "string" },
                    "trigger_type": {
                        "type": "string",
                        "enum": ["interval", "cron", "date"]
                    },
                    "trigger_config": { "type": "object" },
                    "agent_prompt": { "type": "string" },
                    "mcp_server": { "type": "string" },
                    "mcp_tool": { "type": "string" },
                    "mcp_arguments": { "type": "object" }
                },
                "required": ["task_id"]
            }),
        },
        Tool {
            name: "delete_task".into(),
            description: "Delete a task and its history.".into(),
            input_schema: task_id_schema(),
        },
        Tool {
            name: "pause_task".into(),
            description: "Disable a task's schedule without deleting it.".into(),
            input_schema: task_id_schema(),
        },
        Tool {
            name: "resume_task".into(),
            description: "Re-enable a paused task.".into(),
            input_schema: task_id_schema(),
        },
        Tool {
            name: "execute_task".into(),
            description: "Run a task once, immediately, regardless of its schedule.".into(),
            input_schema: task_id_schema(),
        },
        Tool {
            name: "clear_task_history".into(),
            description: "Remove a task's run history and last-run fields.".into(),
            input_schema: task_id_schema(),
        },
        Tool {
            name: "get_current_time".into(),
            description: "The server's current time in its configured timezone.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "format": {
                        "type": "string",
                        "enum": ["iso", "readable"],
                        "description": "Rendering of the timestamp; defaults to iso"
                    }
                }
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_is_complete_and_well_formed() {
        let tools = catalogue();
        let names: Vec<_> = tools.iter().map(|tool| tool.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "create_task",
                "list_tasks",
                "get_task",
                "update_task",
                "delete_task",
                "pause_task",
                "resume_task",
                "execute_task",
                "clear_task_history",
                "get_current_time",
            ]
        );
        for tool in &tools {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
            assert!(!tool.description.is_empty());
        }
    }

    #[test]
    fn update_args_flatten_patch_fields() {
        let args: UpdateTaskArgs = serde_json::from_value(json!({
            "task_id": "task-1-abc",
            "trigger_type": "cron",
            "trigger_config": {"expression": "0 9 * * *"}
        }))
        .unwrap();
        assert_eq!(args.task_id, "task-1-abc");
        assert!(args.patch.trigger_config.is_some());
        assert!(args.patch.name.is_none());
        // enabled is not settable from the wire
        let sneaky: UpdateTaskArgs = serde_json::from_value(json!({
            "task_id": "task-1-abc",
            "enabled": false
        }))
        .unwrap();
        assert_eq!(sneaky.patch.enabled, None);
    }
}
