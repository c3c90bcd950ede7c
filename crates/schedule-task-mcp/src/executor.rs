//! Per-fire lifecycle: mark the task running, perform the configured
//! action, and persist the outcome with a bounded history trail.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use schedule_mcp_transport::schema::{
    ContentBlock, CreateMessageRequestParams, Role, SamplingMessage,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::peer::SamplingPeer;
use crate::store::TaskStore;
use crate::task::{HistoryEntry, HistoryStatus, RunStatus, Task, TaskStatus};
use crate::time;
use crate::trigger::{self, TriggerType};

/// Token budget requested from the peer per sampling call.
const SAMPLING_MAX_TOKENS: i64 = 2000;

/// Drives individual fires and enforces the per-task serialization rule:
/// one fire at a time per task, scheduled ticks coalesce against a fire in
/// progress, manual fires wait their turn.
pub struct ExecutionDriver {
    store: Arc<TaskStore>,
    tz: Tz,
    sampling_timeout: Duration,
    peer: RwLock<Option<Arc<dyn SamplingPeer>>>,
    fire_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Display names live here rather than in the store; they last for the
    /// lifetime of the process only.
    names: std::sync::RwLock<HashMap<String, String>>,
}

impl ExecutionDriver {
    pub fn new(store: Arc<TaskStore>, tz: Tz, sampling_timeout: Duration) -> Self {
        Self {
            store,
            tz,
            sampling_timeout,
            peer: RwLock::new(None),
            fire_locks: Mutex::new(HashMap::new()),
            names: std::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn remember_name(&self, task_id: &str, name: &str) {
        if let Ok(mut names) = self.names.write() {
            names.insert(task_id.to_string(), name.to_string());
        }
    }

    pub fn name_of(&self, task_id: &str) -> Option<String> {
        self.names
            .read()
            .ok()
            .and_then(|names| names.get(task_id).cloned())
    }

    /// Installs the reverse-RPC channel once a sampling-capable client has
    /// completed the handshake.
    pub async fn set_peer(&self, peer: Arc<dyn SamplingPeer>) {
        let mut slot = self.peer.write().await;
        *slot = Some(peer);
    }

    async fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.fire_locks.lock().await;
        locks.entry(task_id.to_string()).or_default().clone()
    }

    /// Drops the lock and name entries of a deleted task.
    pub async fn forget(&self, task_id: &str) {
        let mut locks = self.fire_locks.lock().await;
        locks.remove(task_id);
        drop(locks);
        if let Ok(mut names) = self.names.write() {
            names.remove(task_id);
        }
    }

    /// Whether a fire currently holds this task's lock.
    pub async fn is_firing(&self, task_id: &str) -> bool {
        let lock = self.lock_for(task_id).await;
        let result = lock.try_lock().is_err();
        result
    }

    /// Entry point for timer ticks. A tick that finds the previous fire
    /// still in progress is dropped; the schedule resumes from the next
    /// tick.
    pub async fn run_scheduled_fire(&self, task_id: &str) {
        let lock = self.lock_for(task_id).await;
        let guard = lock.try_lock();
        match guard {
            Ok(_guard) => {
                if let Err(error) = self.fire(task_id).await {
                    warn!("scheduled fire for {task_id} failed: {error}");
                }
            }
            Err(_) => {
                warn!("tick for {task_id} coalesced: previous fire still in progress");
            }
        }
    }

    /// Entry point for `execute_task`. Waits for any in-flight fire of the
    /// same task before starting.
    pub async fn run_manual_fire(&self, task_id: &str) -> SchedulerResult<String> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;
        self.fire(task_id).await
    }

    /// One fire, start to finish. Must only be called with the task's lock
    /// held.
    async fn fire(&self, task_id: &str) -> SchedulerResult<String> {
        let run_at = time::now();
        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        task.name = self.name_of(task_id);

        task.status = TaskStatus::Running;
        task.last_run = Some(run_at);
        task.last_status = Some(RunStatus::Running);
        task.last_message = None;
        task.updated_at = run_at;
        self.store.upsert(&task).await?;

        let outcome = self.perform(&task).await;
        let completion = time::now();

        match &outcome {
            Ok(message) => {
                task.last_status = Some(RunStatus::Success);
                task.last_message = Some(message.clone());
                task.push_history(HistoryEntry {
                    run_at,
                    status: HistoryStatus::Success,
                    message: Some(message.clone()),
                });
                if task.trigger_type == TriggerType::Date {
                    task.status = TaskStatus::Completed;
                    task.enabled = false;
                    task.next_run = None;
                } else {
                    task.status = TaskStatus::Scheduled;
                    task.next_run = self.reschedule(&task, completion);
                }
            }
            Err(error) => {
                let message = error.to_string();
                task.last_status = Some(RunStatus::Error);
                task.last_message = Some(message.clone());
                task.status = TaskStatus::Error;
                task.push_history(HistoryEntry {
                    run_at,
                    status: HistoryStatus::Error,
                    message: Some(message),
                });
                // interval and cron keep scheduling; a date trigger is
                // spent either way
                task.next_run = if task.trigger_type == TriggerType::Date {
                    None
                } else {
                    self.reschedule(&task, completion)
                };
            }
        }
        task.updated_at = completion;

        // best-effort persistence: the task may have been deleted while the
        // fire was in flight
        if self.store.get(task_id).await?.is_some() {
            self.store.upsert(&task).await?;
        } else {
            debug!("task {task_id} disappeared mid-fire; dropping outcome");
        }

        outcome
    }

    fn reschedule(
        &self,
        task: &Task,
        completion: chrono::DateTime<chrono::Utc>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        let trigger = task.trigger().ok()?;
        trigger::next_fire(&trigger, completion, self.tz, None)
    }

    /// Steps 2–4 of a fire: sampling when a prompt is configured and the
    /// reverse channel is up, otherwise a recorded no-op.
    async fn perform(&self, task: &Task) -> SchedulerResult<String> {
        if let Some(prompt) = task
            .agent_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
        {
            let peer = self.peer.read().await.clone();
            if let Some(peer) = peer {
                let params = CreateMessageRequestParams {
                    messages: vec![SamplingMessage {
                        role: Role::User,
                        content: ContentBlock::text(prompt),
                    }],
                    include_context: Some("allServers".to_string()),
                    max_tokens: SAMPLING_MAX_TOKENS,
                };
                let result = peer.create_message(params, self.sampling_timeout).await?;
                return Ok(format!("Sampling response: {}", result.content_text()));
            }
            debug!(
                "task {} has an agent_prompt but no sampling channel is available",
                task.id
            );
        }

        if task.has_legacy_tool_config() {
            let tool = task.mcp_tool.as_deref().unwrap_or("unknown");
            let server = task.mcp_server.as_deref().unwrap_or("unknown");
            warn!(
                "task {} carries a legacy MCP tool configuration ({server}/{tool}); \
                 legacy tools are no longer invoked",
                task.id
            );
            return Ok(format!(
                "Task executed: {} (legacy MCP tool configuration {server}/{tool} noted; \
                 no action taken)",
                task.display_name()
            ));
        }

        Ok(format!(
            "Task executed: {} (no action configured)",
            task.display_name()
        ))
    }
}
