//! Scheduler core: owns the timer registries, mints task ids, and applies
//! the lifecycle verbs on top of the durable store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::ExecutionDriver;
use crate::peer::SamplingPeer;
use crate::store::TaskStore;
use crate::task::{self, Task, TaskStatus};
use crate::time;
use crate::trigger::{self, Trigger, TriggerType};

/// Input of `create_task`.
#[derive(Debug, Deserialize)]
pub struct CreateTaskInput {
    pub name: String,
    pub trigger_type: TriggerType,
    pub trigger_config: Value,
    #[serde(default)]
    pub agent_prompt: Option<String>,
    #[serde(default)]
    pub mcp_server: Option<String>,
    #[serde(default)]
    pub mcp_tool: Option<String>,
    #[serde(default)]
    pub mcp_arguments: Option<Value>,
}

/// Patch applied by `update_task`; absent fields stay untouched. `enabled`
/// is reserved for pause/resume and cannot arrive from the wire.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateTaskInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub trigger_config: Option<Value>,
    #[serde(default)]
    pub agent_prompt: Option<String>,
    #[serde(default)]
    pub mcp_server: Option<String>,
    #[serde(default)]
    pub mcp_tool: Option<String>,
    #[serde(default)]
    pub mcp_arguments: Option<Value>,
    #[serde(skip)]
    pub enabled: Option<bool>,
}

/// Owns per-task timers and coordinates store, trigger evaluation and the
/// execution driver. Two disjoint registries (cron vs one-shot/interval)
/// keep unarming simple; every mutation goes unarm-then-arm so a timer can
/// never leak past its task's latest state.
pub struct TaskScheduler {
    store: Arc<TaskStore>,
    tz: Tz,
    driver: Arc<ExecutionDriver>,
    cron_timers: Mutex<HashMap<String, AbortHandle>>,
    oneshot_timers: Mutex<HashMap<String, AbortHandle>>,
}

impl TaskScheduler {
    pub fn new(store: Arc<TaskStore>, tz: Tz, sampling_timeout: Duration) -> Arc<Self> {
        let driver = Arc::new(ExecutionDriver::new(Arc::clone(&store), tz, sampling_timeout));
        Arc::new(Self {
            store,
            tz,
            driver,
            cron_timers: Mutex::new(HashMap::new()),
            oneshot_timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub async fn set_sampling_peer(&self, peer: Arc<dyn SamplingPeer>) {
        self.driver.set_peer(peer).await;
    }

    /// Hydrates every stored task, re-derives its state, and arms timers
    /// for the live ones.
    pub async fn initialize(self: &Arc<Self>) -> SchedulerResult<usize> {
        let now = time::now();
        let tasks = self.store.list().await?;
        let total = tasks.len();

        for mut task in tasks {
            task::normalize(&mut task, now, self.tz, false);
            self.store.upsert(&task).await?;
            if task.enabled && task.status != TaskStatus::Completed {
                self.arm(&task).await;
            }
            info!(
                "hydrated task {} ({}, status {})",
                task.id,
                task.trigger_type.as_str(),
                task.status.as_str()
            );
        }

        Ok(total)
    }

    pub async fn create(self: &Arc<Self>, input: CreateTaskInput) -> SchedulerResult<Task> {
        if input.name.trim().is_empty() {
            return Err(SchedulerError::validation("name must be a non-empty string"));
        }
        if matches!(&input.agent_prompt, Some(prompt) if prompt.trim().is_empty()) {
            return Err(SchedulerError::validation(
                "agent_prompt must be a non-empty string when provided",
            ));
        }

        let now = time::now();
        let trigger = Trigger::from_config(input.trigger_type, &input.trigger_config, now)?;

        let mut task = Task {
            id: task::mint_task_id(now),
            name: Some(input.name),
            trigger_type: input.trigger_type,
            trigger_config: trigger.to_config()?,
            agent_prompt: input.agent_prompt,
            mcp_server: input.mcp_server,
            mcp_tool: input.mcp_tool,
            mcp_arguments: input.mcp_arguments,
            enabled: true,
            status: TaskStatus::Scheduled,
            created_at: now,
            updated_at: now,
            last_run: None,
            last_status: None,
            last_message: None,
            next_run: trigger::next_fire(&trigger, now, self.tz, None),
            history: Vec::new(),
        };

        self.store.upsert(&task).await?;
        if let Some(name) = &task.name {
            self.driver.remember_name(&task.id, name);
        }
        if task.enabled && task.status != TaskStatus::Completed {
            self.arm(&task).await;
        }
        debug!("created task {}", task.id);
        // surface the stored shape
        task::normalize(&mut task, now, self.tz, false);
        Ok(task)
    }

    /// Merges a patch, re-derives state, and re-arms the task's timer.
    pub async fn update(
        self: &Arc<Self>,
        task_id: &str,
        patch: UpdateTaskInput,
    ) -> SchedulerResult<Task> {
        let now = time::now();
        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        task.name = self.driver.name_of(task_id);

        let trigger_type_changed =
            matches!(patch.trigger_type, Some(new_type) if new_type != task.trigger_type);
        if trigger_type_changed && patch.trigger_config.is_none() {
            return Err(SchedulerError::validation(
                "changing trigger_type requires a matching trigger_config",
            ));
        }
        if matches!(&patch.agent_prompt, Some(prompt) if prompt.trim().is_empty()) {
            return Err(SchedulerError::validation(
                "agent_prompt must be a non-empty string when provided",
            ));
        }
        if matches!(&patch.name, Some(name) if name.trim().is_empty()) {
            return Err(SchedulerError::validation("name must be a non-empty string"));
        }

        if let Some(new_type) = patch.trigger_type {
            task.trigger_type = new_type;
        }
        if let Some(config) = &patch.trigger_config {
            let trigger = Trigger::from_config(task.trigger_type, config, now)?;
            task.trigger_config = trigger.to_config()?;
            // the old plan belongs to the old trigger
            task.next_run = None;
        }
        if let Some(name) = patch.name {
            self.driver.remember_name(task_id, &name);
            task.name = Some(name);
        }
        if let Some(agent_prompt) = patch.agent_prompt {
            task.agent_prompt = Some(agent_prompt);
        }
        if let Some(mcp_server) = patch.mcp_server {
            task.mcp_server = Some(mcp_server);
        }
        if let Some(mcp_tool) = patch.mcp_tool {
            task.mcp_tool = Some(mcp_tool);
        }
        if let Some(mcp_arguments) = patch.mcp_arguments {
            task.mcp_arguments = Some(mcp_arguments);
        }
        if let Some(enabled) = patch.enabled {
            task.enabled = enabled;
        }

        task.updated_at = now;
        let fire_in_progress = self.driver.is_firing(task_id).await;
        task::normalize(&mut task, now, self.tz, fire_in_progress);

        self.store.upsert(&task).await?;

        self.unarm(task_id).await;
        if task.enabled && task.status != TaskStatus::Completed {
            self.arm(&task).await;
        }
        Ok(task)
    }

    pub async fn pause(self: &Arc<Self>, task_id: &str) -> SchedulerResult<Task> {
        self.update(
            task_id,
            UpdateTaskInput {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn resume(self: &Arc<Self>, task_id: &str) -> SchedulerResult<Task> {
        self.update(
            task_id,
            UpdateTaskInput {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Unarms and deletes. A fire already in progress runs to completion;
    /// its persistence is dropped once the row is gone.
    pub async fn delete(&self, task_id: &str) -> SchedulerResult<bool> {
        self.unarm(task_id).await;
        let existed = self.store.delete(task_id).await?;
        self.driver.forget(task_id).await;
        Ok(existed)
    }

    /// Runs a fire immediately, regardless of schedule. Timers are not
    /// affected.
    pub async fn execute(&self, task_id: &str) -> SchedulerResult<String> {
        self.driver.run_manual_fire(task_id).await
    }

    pub async fn clear_history(&self, task_id: &str) -> SchedulerResult<Task> {
        // existence check first so the caller gets the not-found error
        let _ = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        self.store.clear_history(task_id).await?;
        self.get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))
    }

    /// A single task, normalized for presentation.
    pub async fn get(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        let Some(mut task) = self.store.get(task_id).await? else {
            return Ok(None);
        };
        task.name = self.driver.name_of(task_id);
        let fire_in_progress = self.driver.is_firing(task_id).await;
        task::normalize(&mut task, time::now(), self.tz, fire_in_progress);
        Ok(Some(task))
    }

    /// All tasks ordered by creation time, normalized for presentation.
    pub async fn list(&self) -> SchedulerResult<Vec<Task>> {
        let now = time::now();
        let mut tasks = self.store.list().await?;
        for task in &mut tasks {
            task.name = self.driver.name_of(&task.id);
            let fire_in_progress = self.driver.is_firing(&task.id).await;
            task::normalize(task, now, self.tz, fire_in_progress);
        }
        Ok(tasks)
    }

    pub fn describe(&self, task: &Task) -> SchedulerResult<Value> {
        task::describe(task, self.tz)
    }

    /// Unarms every timer. In-flight fires are not cancelled; their
    /// persistence is best-effort.
    pub async fn shutdown(&self) {
        let mut cron_timers = self.cron_timers.lock().await;
        for (_, handle) in cron_timers.drain() {
            handle.abort();
        }
        let mut oneshot_timers = self.oneshot_timers.lock().await;
        for (_, handle) in oneshot_timers.drain() {
            handle.abort();
        }
        debug!("all timers unarmed");
    }

    async fn arm(self: &Arc<Self>, task: &Task) {
        let trigger = match task.trigger() {
            Ok(trigger) => trigger,
            Err(error) => {
                warn!("not arming task {}: {error}", task.id);
                return;
            }
        };

        match trigger {
            Trigger::Interval(spec) => {
                let period = match trigger::interval_duration(&spec)
                    .map(|delta| delta.to_std().unwrap_or(Duration::from_millis(1)))
                {
                    Ok(period) => period,
                    Err(error) => {
                        warn!("not arming task {}: {error}", task.id);
                        return;
                    }
                };
                let driver = Arc::clone(&self.driver);
                let task_id = task.id.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(period).await;
                        driver.run_scheduled_fire(&task_id).await;
                    }
                });
                let mut timers = self.oneshot_timers.lock().await;
                timers.insert(task.id.clone(), handle.abort_handle());
            }
            Trigger::Cron(spec) => {
                let schedule = match trigger::parse_cron(&spec.expression) {
                    Ok(schedule) => schedule,
                    Err(error) => {
                        warn!("not arming task {}: {error}", task.id);
                        return;
                    }
                };
                let tz = self.tz;
                let driver = Arc::clone(&self.driver);
                let task_id = task.id.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        let now = time::now();
                        let Some(next) = schedule.after(&now.with_timezone(&tz)).next() else {
                            break;
                        };
                        let wait = (next.with_timezone(&Utc) - now)
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        tokio::time::sleep(wait).await;
                        driver.run_scheduled_fire(&task_id).await;
                    }
                    debug!("cron schedule for {task_id} exhausted");
                });
                let mut timers = self.cron_timers.lock().await;
                timers.insert(task.id.clone(), handle.abort_handle());
            }
            Trigger::Date { run_date } => {
                let driver = Arc::clone(&self.driver);
                let scheduler = Arc::clone(self);
                let task_id = task.id.clone();
                let handle = tokio::spawn(async move {
                    let wait = wait_until(run_date);
                    tokio::time::sleep(wait).await;
                    {
                        let mut timers = scheduler.oneshot_timers.lock().await;
                        timers.remove(&task_id);
                    }
                    driver.run_scheduled_fire(&task_id).await;
                });
                let mut timers = self.oneshot_timers.lock().await;
                timers.insert(task.id.clone(), handle.abort_handle());
            }
        }
    }

    async fn unarm(&self, task_id: &str) {
        let mut cron_timers = self.cron_timers.lock().await;
        if let Some(handle) = cron_timers.remove(task_id) {
            handle.abort();
        }
        drop(cron_timers);

        let mut oneshot_timers = self.oneshot_timers.lock().await;
        if let Some(handle) = oneshot_timers.remove(task_id) {
            handle.abort();
        }
    }
}

fn wait_until(instant: DateTime<Utc>) -> Duration {
    (instant - time::now()).to_std().unwrap_or(Duration::ZERO)
}
