//! Keyed distributed queue: the transport between the core and action
//! workers.
//!
//! [`KeyedQueue`] is the capability seam; [`MemoryQueue`] is the in-process
//! implementation used by tests and single-node deployments. A distributed
//! backend (redis-style keyed blocking lists plus one hash for worker
//! heartbeats) plugs in behind the same trait.
//!
//! [`ActionEventQueue`] is the engine-facing wrapper: it serializes
//! [`ActionInput`]s onto per-action-class queues, skips cold-queued inputs,
//! optionally scans for duplicate dids before enqueueing, consumes the
//! worker event stream, and tracks long-running task heartbeats.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{CoreError, Result};
use crate::types::{ActionEvent, ActionInput};

/// Queue key the core consumes worker result events from.
pub const ACTION_EVENTS_KEY: &str = "conveyor-action-events";
/// Hash key holding worker heartbeat records for in-flight tasks.
pub const LONG_RUNNING_TASKS_KEY: &str = "conveyor-long-running-tasks";
/// A heartbeat older than this marks the task record as stale.
pub const HEARTBEAT_STALE_SECS: i64 = 30;

#[async_trait]
pub trait KeyedQueue: Send + Sync {
    async fn put(&self, key: &str, value: String) -> Result<()>;

    /// Block until an item is available on `key`, then pop it (FIFO).
    async fn take(&self, key: &str) -> Result<String>;

    async fn size(&self, key: &str) -> Result<usize>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// True if any queued item on `key` contains `needle` as a substring.
    async fn contains_matching(&self, key: &str, needle: &str) -> Result<bool>;

    async fn set_hash_field(&self, key: &str, field: &str, value: String) -> Result<()>;

    async fn hash_fields(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn remove_hash_field(&self, key: &str, field: &str) -> Result<()>;
}

pub type SharedQueue = Arc<dyn KeyedQueue>;

#[derive(Default)]
struct MemoryList {
    items: VecDeque<String>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct MemoryInner {
    queues: HashMap<String, MemoryList>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// In-process queue backed by per-key FIFO lists.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryInner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedQueue for MemoryQueue {
    async fn put(&self, key: &str, value: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let list = inner.queues.entry(key.to_string()).or_default();
        list.items.push_back(value);
        list.notify.notify_one();
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<String> {
        loop {
            let notify = {
                let mut inner = self.inner.lock().await;
                let list = inner.queues.entry(key.to_string()).or_default();
                if let Some(item) = list.items.pop_front() {
                    return Ok(item);
                }
                Arc::clone(&list.notify)
            };
            notify.notified().await;
        }
    }

    async fn size(&self, key: &str) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.queues.get(key).map(|l| l.items.len()).unwrap_or(0))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<String> = inner
            .queues
            .iter()
            .filter(|(_, l)| !l.items.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn contains_matching(&self, key: &str, needle: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queues
            .get(key)
            .map(|l| l.items.iter().any(|item| item.contains(needle)))
            .unwrap_or(false))
    }

    async fn set_hash_field(&self, key: &str, field: &str, value: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_fields(&self, key: &str) -> Result<HashMap<String, String>> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn remove_hash_field(&self, key: &str, field: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }
}

/// Heartbeat record a worker refreshes while running a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeartbeat {
    pub start_time: DateTime<Utc>,
    pub heartbeat_time: DateTime<Utc>,
    pub app_name: String,
}

#[derive(Debug, Clone)]
pub struct LongRunningTask {
    pub action_class: String,
    pub action: String,
    pub did: Uuid,
    pub heartbeat: TaskHeartbeat,
}

/// Engine-facing queue API.
#[derive(Clone)]
pub struct ActionEventQueue {
    queue: SharedQueue,
}

impl ActionEventQueue {
    pub fn new(queue: SharedQueue) -> Self {
        Self { queue }
    }

    pub fn backend(&self) -> SharedQueue {
        Arc::clone(&self.queue)
    }

    /// Push work items onto their per-class queues. Cold-queued inputs are
    /// never enqueued here; they wait in the store for the drain loop.
    /// With `check_unique`, items whose did already appears on the target
    /// queue are skipped with a warning.
    pub async fn put_actions(&self, inputs: &[ActionInput], check_unique: bool) -> Result<()> {
        for input in inputs {
            if input.cold_queued {
                continue;
            }
            if check_unique
                && self
                    .queue
                    .contains_matching(&input.queue_name, &input.did.to_string())
                    .await?
            {
                warn!(
                    did = %input.did,
                    action = %input.action,
                    queue = %input.queue_name,
                    "skipping duplicate queue entry"
                );
                continue;
            }
            let payload = serde_json::to_string(input)
                .map_err(|e| CoreError::QueueUnavailable(format!("serialize action input: {e}")))?;
            self.queue.put(&input.queue_name, payload).await?;
            metrics::counter!("conveyor_actions_queued").increment(1);
        }
        Ok(())
    }

    /// Block for the next worker event. Malformed payloads are logged and
    /// skipped so one bad worker cannot wedge the dispatch loop.
    pub async fn take_event(&self) -> Result<ActionEvent> {
        loop {
            let raw = self.queue.take(ACTION_EVENTS_KEY).await?;
            match serde_json::from_str::<ActionEvent>(&raw) {
                Ok(event) => return Ok(event),
                Err(e) => {
                    warn!(error = %e, "discarding malformed action event");
                    metrics::counter!("conveyor_events_malformed").increment(1);
                }
            }
        }
    }

    /// Worker-side: report a result event back to the core.
    pub async fn put_event(&self, event: &ActionEvent) -> Result<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| CoreError::QueueUnavailable(format!("serialize event: {e}")))?;
        self.queue.put(ACTION_EVENTS_KEY, payload).await
    }

    pub async fn queue_size(&self, action_class: &str) -> Result<usize> {
        self.queue.size(action_class).await
    }

    pub async fn record_heartbeat(
        &self,
        action_class: &str,
        action: &str,
        did: Uuid,
        heartbeat: &TaskHeartbeat,
    ) -> Result<()> {
        let field = heartbeat_field(action_class, action, did);
        let value = serde_json::to_string(heartbeat)
            .map_err(|e| CoreError::QueueUnavailable(format!("serialize heartbeat: {e}")))?;
        self.queue
            .set_hash_field(LONG_RUNNING_TASKS_KEY, &field, value)
            .await
    }

    pub async fn remove_heartbeat(&self, action_class: &str, action: &str, did: Uuid) -> Result<()> {
        let field = heartbeat_field(action_class, action, did);
        self.queue
            .remove_hash_field(LONG_RUNNING_TASKS_KEY, &field)
            .await
    }

    /// Current non-stale long-running tasks. Malformed and stale records
    /// are removed from the hash as a side effect.
    pub async fn long_running_tasks(&self, now: DateTime<Utc>) -> Result<Vec<LongRunningTask>> {
        let fields = self.queue.hash_fields(LONG_RUNNING_TASKS_KEY).await?;
        let mut tasks = Vec::new();
        for (field, value) in fields {
            let parsed = parse_heartbeat_field(&field)
                .and_then(|ids| serde_json::from_str::<TaskHeartbeat>(&value).ok().map(|hb| (ids, hb)));
            match parsed {
                Some(((action_class, action, did), heartbeat)) => {
                    if now - heartbeat.heartbeat_time > Duration::seconds(HEARTBEAT_STALE_SECS) {
                        warn!(field = %field, "removing stale long-running task record");
                        self.queue
                            .remove_hash_field(LONG_RUNNING_TASKS_KEY, &field)
                            .await?;
                    } else {
                        tasks.push(LongRunningTask {
                            action_class,
                            action,
                            did,
                            heartbeat,
                        });
                    }
                }
                None => {
                    warn!(field = %field, "removing malformed long-running task record");
                    self.queue
                        .remove_hash_field(LONG_RUNNING_TASKS_KEY, &field)
                        .await?;
                }
            }
        }
        Ok(tasks)
    }
}

/// Periodic task reporting in-flight worker tasks and pruning stale
/// heartbeat records.
pub struct HeartbeatMonitor {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<AnyResult<()>>,
}

impl HeartbeatMonitor {
    pub fn start(queue: ActionEventQueue, clock: SharedClock, sweep_interval: StdDuration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(
                interval_ms = sweep_interval.as_millis() as u64,
                "starting heartbeat monitor"
            );
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.long_running_tasks(clock.now()).await {
                            Ok(tasks) => {
                                metrics::gauge!("conveyor_long_running_tasks").set(tasks.len() as f64);
                                for task in tasks {
                                    let running = clock.now() - task.heartbeat.start_time;
                                    warn!(
                                        did = %task.did,
                                        action = %task.action,
                                        app = %task.heartbeat.app_name,
                                        running_secs = running.num_seconds(),
                                        "long-running action task"
                                    );
                                }
                            }
                            Err(e) => warn!(error = %e, "heartbeat sweep failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("heartbeat monitor shutting down");
                            return Ok(());
                        }
                    }
                }
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> AnyResult<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("heartbeat monitor task panicked: {e}")),
        }
    }
}

fn heartbeat_field(action_class: &str, action: &str, did: Uuid) -> String {
    format!("{action_class}:{action}:{did}")
}

fn parse_heartbeat_field(field: &str) -> Option<(String, String, Uuid)> {
    let mut parts = field.rsplitn(3, ':');
    let did = Uuid::parse_str(parts.next()?).ok()?;
    let action = parts.next()?.to_string();
    let action_class = parts.next()?.to_string();
    Some((action_class, action, did))
}
