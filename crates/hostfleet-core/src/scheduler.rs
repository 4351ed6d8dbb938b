// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cooperative task scheduler.
//!
//! Every tick evaluates the known tasks and spawns the ones that are due.
//! A task never runs twice at the same time. Each execution is recorded as
//! a [`ScheduledTaskRun`]. Per-task overrides live in the `task.<key>`
//! setting.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::domain::{ScheduledTaskRun, TaskRunStatus};
use crate::error::{Error, Result};
use crate::settings::SettingsReader;
use crate::store::ScheduledTaskRunRepository;

/// Keys of the built-in tasks.
pub mod task_keys {
    pub const VPS_REFRESH: &str = "vps_refresh";
    pub const ORDER_PROVISION_WATCHDOG: &str = "order_provision_watchdog";
    pub const RESIZE_TASK_RUNNER: &str = "resize_task_runner";
    pub const EXPIRE_REMINDER: &str = "expire_reminder";
    pub const VPS_EXPIRE_CLEANUP: &str = "vps_expire_cleanup";
    pub const VPS_EXPIRE_LOCK: &str = "vps_expire_lock";
    pub const PLUGIN_SCHEDULE: &str = "plugin_schedule";
    pub const USER_TIER_EXPIRE_RECONCILE: &str = "user_tier_expire_reconcile";
    pub const INTEGRATION_INVENTORY_SYNC: &str = "integration_inventory_sync";
    pub const LOG_RETENTION_CLEANUP: &str = "log_retention_cleanup";
}

/// Fallback spacing for interval tasks configured with a non-positive interval.
const FALLBACK_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStrategy {
    Interval,
    Daily,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub key: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub strategy: TaskStrategy,
    pub interval_sec: i64,
    /// `HH:MM`, server local time.
    pub daily_at: String,
}

impl TaskDefinition {
    pub fn interval(key: &str, name: &str, description: &str, interval_sec: i64) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            enabled: true,
            strategy: TaskStrategy::Interval,
            interval_sec,
            daily_at: String::new(),
        }
    }

    pub fn daily(key: &str, name: &str, description: &str, daily_at: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            enabled: true,
            strategy: TaskStrategy::Daily,
            interval_sec: 0,
            daily_at: daily_at.to_string(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn apply(&mut self, update: &TaskUpdate) {
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(strategy) = update.strategy {
            self.strategy = strategy;
        }
        if let Some(interval) = update.interval_sec {
            self.interval_sec = interval;
        }
        if let Some(daily_at) = &update.daily_at {
            self.daily_at = daily_at.trim().to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        match self.strategy {
            TaskStrategy::Interval if self.interval_sec <= 0 => {
                Err(Error::invalid("interval_sec must be positive"))
            }
            TaskStrategy::Daily if parse_daily_at(&self.daily_at).is_none() => {
                Err(Error::invalid("daily_at must be HH:MM"))
            }
            _ => Ok(()),
        }
    }
}

/// Built-in tasks with their default schedule.
pub fn default_tasks() -> Vec<TaskDefinition> {
    use task_keys::*;
    vec![
        TaskDefinition::interval(VPS_REFRESH, "VPS refresh", "Refresh status, expiry and access info from automation.", 300),
        TaskDefinition::interval(ORDER_PROVISION_WATCHDOG, "Provision watchdog", "Poll provision jobs and advance order status.", 5),
        TaskDefinition::interval(RESIZE_TASK_RUNNER, "Resize runner", "Process pending resize tasks.", 30),
        TaskDefinition::daily(EXPIRE_REMINDER, "Expiry reminders", "Notify owners of instances about to expire.", "09:00"),
        TaskDefinition::daily(VPS_EXPIRE_CLEANUP, "Expired cleanup", "Delete instances expired longer than the grace period.", "03:00"),
        TaskDefinition::interval(VPS_EXPIRE_LOCK, "Expiry lock", "Lock instances past their expiry.", 300),
        TaskDefinition::interval(PLUGIN_SCHEDULE, "Plugin schedule", "Poll pending real-name verifications.", 20),
        TaskDefinition::interval(USER_TIER_EXPIRE_RECONCILE, "Tier reconcile", "Re-evaluate expired tier memberships.", 60),
        TaskDefinition::interval(INTEGRATION_INVENTORY_SYNC, "Inventory sync", "Sync catalog inventory from automation.", 300).disabled(),
        TaskDefinition::daily(LOG_RETENTION_CLEANUP, "Log retention", "Purge log rows older than their retention.", "03:30"),
    ]
}

/// Partial change of a task's schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub strategy: Option<TaskStrategy>,
    #[serde(default)]
    pub interval_sec: Option<i64>,
    #[serde(default)]
    pub daily_at: Option<String>,
}

/// Task definition with its live state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    #[serde(flatten)]
    pub task: TaskDefinition,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub last_status: Option<TaskRunStatus>,
    pub last_error: String,
    pub last_elapsed_sec: f64,
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Work behind a task key. The returned string is stored as the run message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self) -> Result<String>;
}

#[async_trait]
impl<F> TaskHandler for F
where
    F: Fn() -> TaskFuture + Send + Sync,
{
    async fn run(&self) -> Result<String> {
        (self)().await
    }
}

#[derive(Debug, Clone, Default)]
struct TaskRuntime {
    last_run: Option<DateTime<Utc>>,
    running: bool,
    last_status: Option<TaskRunStatus>,
    last_error: String,
    last_elapsed: f64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
        }
    }
}

struct Inner {
    settings: SettingsReader,
    runs: Arc<dyn ScheduledTaskRunRepository>,
    definitions: RwLock<Vec<TaskDefinition>>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    runtime: Mutex<HashMap<String, TaskRuntime>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

pub fn setting_key(task_key: &str) -> String {
    format!("task.{task_key}")
}

impl Scheduler {
    pub fn new(settings: SettingsReader, runs: Arc<dyn ScheduledTaskRunRepository>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                runs,
                definitions: RwLock::new(default_tasks()),
                handlers: RwLock::new(HashMap::new()),
                runtime: Mutex::new(HashMap::new()),
            }),
            config: SchedulerConfig::default(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the handler of a task key. Tasks without a handler never run.
    pub fn with_handler(self, key: &str, handler: Arc<dyn TaskHandler>) -> Self {
        self.inner.handlers.write().insert(key.to_string(), handler);
        self
    }

    /// Add a task that is not built in.
    pub fn with_task(self, task: TaskDefinition, handler: Arc<dyn TaskHandler>) -> Self {
        self.inner
            .handlers
            .write()
            .insert(task.key.clone(), handler);
        let mut defs = self.inner.definitions.write();
        defs.retain(|d| d.key != task.key);
        defs.push(task);
        drop(defs);
        self
    }

    fn handler(&self, key: &str) -> Option<Arc<dyn TaskHandler>> {
        self.inner.handlers.read().get(key).cloned()
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn definition(&self, key: &str) -> Result<TaskDefinition> {
        self.inner
            .definitions
            .read()
            .iter()
            .find(|d| d.key == key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("task {key}")))
    }

    fn definitions(&self) -> Vec<TaskDefinition> {
        self.inner.definitions.read().clone()
    }

    /// Default definition merged with the stored override.
    async fn load(&self, def: &TaskDefinition) -> TaskDefinition {
        let mut task = def.clone();
        match self
            .inner
            .settings
            .get_json::<TaskUpdate>(&setting_key(&def.key))
            .await
        {
            Ok(Some(update)) => task.apply(&update),
            Ok(None) => {}
            Err(e) => debug!(task = %def.key, error = %e, "Ignoring unreadable task override"),
        }
        task
    }

    pub async fn list_tasks(&self) -> Vec<TaskStatus> {
        let now = Utc::now();
        let defs = self.definitions();
        let mut out = Vec::with_capacity(defs.len());
        for def in &defs {
            let task = self.load(def).await;
            let rt = self
                .inner
                .runtime
                .lock()
                .get(&task.key)
                .cloned()
                .unwrap_or_default();
            let next_run_at = next_run(&task, rt.last_run, now);
            out.push(TaskStatus {
                task,
                last_run_at: rt.last_run,
                next_run_at,
                running: rt.running,
                last_status: rt.last_status,
                last_error: rt.last_error,
                last_elapsed_sec: rt.last_elapsed,
            });
        }
        out
    }

    /// Validate and persist a schedule change.
    pub async fn update_task(&self, key: &str, update: TaskUpdate) -> Result<TaskDefinition> {
        let def = self.definition(key)?;
        let mut task = self.load(&def).await;
        task.apply(&update);
        task.validate()?;
        let stored = TaskUpdate {
            enabled: Some(task.enabled),
            strategy: Some(task.strategy),
            interval_sec: Some(task.interval_sec),
            daily_at: Some(task.daily_at.clone()),
        };
        self.inner
            .settings
            .set(&setting_key(key), &serde_json::to_string(&stored)?)
            .await?;
        info!(task = key, enabled = task.enabled, strategy = ?task.strategy, "Scheduled task updated");
        Ok(task)
    }

    pub async fn list_runs(&self, key: &str, limit: i64) -> Result<Vec<ScheduledTaskRun>> {
        let limit = if limit <= 0 { 50 } else { limit };
        self.inner.runs.list_task_runs(key, limit).await
    }

    /// Run a task now and wait for it. `Conflict` while it is running.
    pub async fn run_now(&self, key: &str) -> Result<ScheduledTaskRun> {
        self.definition(key)?;
        let handler = self
            .handler(key)
            .ok_or_else(|| Error::NotSupported(format!("task {key} has no handler")))?;
        if !self.try_mark_running(key) {
            return Err(Error::conflict(format!("task {key} is running")));
        }
        Ok(execute(self.inner.clone(), key.to_string(), handler).await)
    }

    fn try_mark_running(&self, key: &str) -> bool {
        let mut runtime = self.inner.runtime.lock();
        let rt = runtime.entry(key.to_string()).or_default();
        if rt.running {
            return false;
        }
        rt.running = true;
        true
    }

    /// Spawn every due task. Returns the keys started.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut started = Vec::new();
        for def in &self.definitions() {
            let Some(handler) = self.handler(&def.key) else {
                continue;
            };
            let task = self.load(def).await;
            if !task.enabled {
                continue;
            }
            let last = self
                .inner
                .runtime
                .lock()
                .get(&task.key)
                .and_then(|rt| rt.last_run);
            if !is_due(&task, last, now) || !self.try_mark_running(&task.key) {
                continue;
            }
            let inner = self.inner.clone();
            let key = task.key.clone();
            tokio::spawn(async move {
                execute(inner, key, handler).await;
            });
            started.push(task.key);
        }
        started
    }

    /// Tick until shutdown. Tasks already running finish on their own.
    pub async fn run(self) {
        info!(
            tick_secs = self.config.tick.as_secs(),
            tasks = self.inner.handlers.read().len(),
            "Scheduler started"
        );
        loop {
            self.tick_at(Utc::now()).await;
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.tick) => {}
            }
        }
    }
}

/// Run the handler and record the outcome. The caller has already marked
/// the task running.
async fn execute(inner: Arc<Inner>, key: String, handler: Arc<dyn TaskHandler>) -> ScheduledTaskRun {
    let started_at = Utc::now();
    let record = match inner.runs.create_task_run(&key, started_at).await {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(task = %key, error = %e, "Failed to record task start");
            None
        }
    };
    debug!(task = %key, "Scheduled task started");

    // A panicking handler must still release the task.
    let outcome = match tokio::spawn(async move { handler.run().await }).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(Error::Internal(format!("task {key} panicked"))),
        Err(e) => Err(Error::Internal(format!("task {key} aborted: {e}"))),
    };
    let finished_at = Utc::now();
    let elapsed = (finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let (status, message) = match outcome {
        Ok(msg) => (TaskRunStatus::Success, msg),
        Err(e) => {
            error!(task = %key, error = %e, "Scheduled task failed");
            (TaskRunStatus::Failed, e.to_string())
        }
    };

    {
        let mut runtime = inner.runtime.lock();
        let rt = runtime.entry(key.clone()).or_default();
        rt.running = false;
        rt.last_run = Some(finished_at);
        rt.last_status = Some(status);
        rt.last_error = if status == TaskRunStatus::Failed {
            message.clone()
        } else {
            String::new()
        };
        rt.last_elapsed = elapsed;
    }

    let id = record.as_ref().map(|r| r.id).unwrap_or_default();
    if record.is_some() {
        if let Err(e) = inner
            .runs
            .finish_task_run(id, status, &message, finished_at, elapsed)
            .await
        {
            warn!(task = %key, error = %e, "Failed to record task finish");
        }
    }
    ScheduledTaskRun {
        id,
        task_key: key,
        started_at,
        finished_at: Some(finished_at),
        status,
        message,
        duration_sec: elapsed,
    }
}

fn parse_daily_at(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

fn interval_of(task: &TaskDefinition) -> chrono::Duration {
    let secs = if task.interval_sec > 0 {
        task.interval_sec
    } else {
        FALLBACK_INTERVAL_SECS
    };
    chrono::Duration::seconds(secs)
}

/// Whether a daily task runs at local time `now`, given its last local run.
pub fn should_run_daily(now: NaiveDateTime, last_run: Option<NaiveDateTime>, daily_at: &str) -> bool {
    let Some(at) = parse_daily_at(daily_at) else {
        return false;
    };
    let target = now.date().and_time(at);
    if now < target {
        return false;
    }
    last_run.is_none_or(|last| last < target)
}

/// Next local run of a daily task.
pub fn next_daily_run(now: NaiveDateTime, last_run: Option<NaiveDateTime>, daily_at: &str) -> Option<NaiveDateTime> {
    let at = parse_daily_at(daily_at)?;
    let target = now.date().and_time(at);
    let tomorrow = target + chrono::Duration::days(1);
    if now < target {
        return Some(target);
    }
    match last_run {
        Some(last) if last >= target => Some(tomorrow),
        // Due now; the next tick picks it up.
        _ => Some(now),
    }
}

fn to_local(t: DateTime<Utc>) -> NaiveDateTime {
    t.with_timezone(&Local).naive_local()
}

fn from_local(t: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&t)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

pub fn is_due(task: &TaskDefinition, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match task.strategy {
        TaskStrategy::Daily => should_run_daily(to_local(now), last_run.map(to_local), &task.daily_at),
        TaskStrategy::Interval => last_run.is_none_or(|last| now - last >= interval_of(task)),
    }
}

fn next_run(task: &TaskDefinition, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !task.enabled {
        return None;
    }
    match task.strategy {
        TaskStrategy::Daily => {
            next_daily_run(to_local(now), last_run.map(to_local), &task.daily_at).and_then(from_local)
        }
        TaskStrategy::Interval => Some(last_run.map_or(now, |last| last + interval_of(task))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .and_then(|d| d.and_hms_opt(h, m, 0))
            .unwrap()
    }

    #[test]
    fn test_daily_strategy() {
        assert!(!should_run_daily(at(8, 59), None, "09:00"));
        assert!(should_run_daily(at(9, 0), None, "09:00"));
        assert!(should_run_daily(at(10, 0), Some(at(8, 0)), "09:00"));
        assert!(!should_run_daily(at(10, 0), Some(at(9, 1)), "09:00"));
        assert!(!should_run_daily(at(10, 0), None, "9am"));

        assert_eq!(next_daily_run(at(8, 0), None, "09:00"), Some(at(9, 0)));
        assert_eq!(
            next_daily_run(at(10, 0), Some(at(9, 0)), "09:00"),
            Some(at(9, 0) + chrono::Duration::days(1))
        );
    }

    #[test]
    fn test_interval_strategy() {
        let task = TaskDefinition::interval("t", "t", "", 300);
        let now = Utc::now();
        assert!(is_due(&task, None, now));
        assert!(!is_due(&task, Some(now - chrono::Duration::seconds(299)), now));
        assert!(is_due(&task, Some(now - chrono::Duration::seconds(300)), now));

        let mut broken = task.clone();
        broken.interval_sec = 0;
        assert!(!is_due(&broken, Some(now - chrono::Duration::seconds(59)), now));
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn TaskHandler> {
        Arc::new(move || -> TaskFuture {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("done".to_string())
            })
        })
    }

    fn scheduler(store: &Arc<MemoryStore>) -> Scheduler {
        Scheduler::new(SettingsReader::new(store.clone()), store.clone())
    }

    #[tokio::test]
    async fn test_run_now_records_history() {
        let store = Arc::new(MemoryStore::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let failing: Arc<dyn TaskHandler> =
            Arc::new(|| -> TaskFuture { Box::pin(async { Err(Error::Unavailable("automation".into())) }) });
        let s = scheduler(&store)
            .with_handler(task_keys::VPS_REFRESH, counting(counter.clone()))
            .with_handler(task_keys::VPS_EXPIRE_LOCK, failing);

        let run = s.run_now(task_keys::VPS_REFRESH).await.unwrap();
        assert_eq!(run.status, TaskRunStatus::Success);
        assert_eq!(run.message, "done");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let failed = s.run_now(task_keys::VPS_EXPIRE_LOCK).await.unwrap();
        assert_eq!(failed.status, TaskRunStatus::Failed);

        let runs = s.list_runs(task_keys::VPS_REFRESH, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, TaskRunStatus::Success);

        let status = s
            .list_tasks()
            .await
            .into_iter()
            .find(|t| t.task.key == task_keys::VPS_EXPIRE_LOCK)
            .unwrap();
        assert_eq!(status.last_status, Some(TaskRunStatus::Failed));
        assert!(status.last_error.contains("automation"));
        assert!(!status.running);

        assert!(matches!(
            s.run_now(task_keys::EXPIRE_REMINDER).await,
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(s.run_now("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_running_task_is_not_reentered() {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(Notify::new());
        let wait = gate.clone();
        let slow: Arc<dyn TaskHandler> = Arc::new(move || -> TaskFuture {
            let wait = wait.clone();
            Box::pin(async move {
                wait.notified().await;
                Ok(String::new())
            })
        });
        let s = scheduler(&store).with_handler(task_keys::RESIZE_TASK_RUNNER, slow);

        let started = s.tick_at(Utc::now()).await;
        assert_eq!(started, vec![task_keys::RESIZE_TASK_RUNNER.to_string()]);
        assert!(s.tick_at(Utc::now() + chrono::Duration::hours(1)).await.is_empty());
        assert!(matches!(
            s.run_now(task_keys::RESIZE_TASK_RUNNER).await,
            Err(Error::Conflict(_))
        ));
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_panicking_task_is_released() {
        let store = Arc::new(MemoryStore::new());
        let panicking: Arc<dyn TaskHandler> =
            Arc::new(|| -> TaskFuture { Box::pin(async { panic!("refresh exploded") }) });
        let s = scheduler(&store).with_handler(task_keys::VPS_REFRESH, panicking);

        let run = s.run_now(task_keys::VPS_REFRESH).await.unwrap();
        assert_eq!(run.status, TaskRunStatus::Failed);
        assert!(run.message.contains("panicked"));

        let status = s
            .list_tasks()
            .await
            .into_iter()
            .find(|t| t.task.key == task_keys::VPS_REFRESH)
            .unwrap();
        assert!(!status.running);
        assert_eq!(status.last_status, Some(TaskRunStatus::Failed));

        let runs = s.list_runs(task_keys::VPS_REFRESH, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, TaskRunStatus::Failed);

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(s.tick_at(later).await, vec![task_keys::VPS_REFRESH.to_string()]);
    }

    #[tokio::test]
    async fn test_overrides_persist_and_validate() {
        let store = Arc::new(MemoryStore::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let s = scheduler(&store).with_handler(task_keys::VPS_REFRESH, counting(counter));

        assert!(matches!(
            s.update_task(
                task_keys::VPS_REFRESH,
                TaskUpdate {
                    strategy: Some(TaskStrategy::Daily),
                    daily_at: Some("25:00".into()),
                    ..Default::default()
                }
            )
            .await,
            Err(Error::InvalidInput(_))
        ));

        s.update_task(
            task_keys::VPS_REFRESH,
            TaskUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(s.tick_at(Utc::now()).await.is_empty());
        let raw = SettingsReader::new(store.clone())
            .get_raw("task.vps_refresh")
            .await
            .unwrap()
            .unwrap();
        assert!(raw.contains("\"enabled\":false"));

        let listed = s.list_tasks().await;
        assert_eq!(listed.len(), default_tasks().len());
        let inventory = listed
            .iter()
            .find(|t| t.task.key == task_keys::INTEGRATION_INVENTORY_SYNC)
            .unwrap();
        assert!(!inventory.task.enabled);
        assert!(inventory.next_run_at.is_none());
    }
}
