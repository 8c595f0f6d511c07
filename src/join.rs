//! Cross-process fan-in coordination.
//!
//! Sibling units arriving at a join action race to increment a shared
//! counter held in the join store. The store provides one atomic
//! create-or-increment-and-lock primitive; the [`JoinCoordinator`] wraps it
//! in a bounded retry loop and owns deadline resolution (the reaper) and
//! the orphan sweep. Resolution outcomes are applied through a
//! [`JoinResolver`], implemented by the event dispatcher.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{CoreError, Result};
use crate::store::JoinStore;
use crate::types::{ActionType, Stage};

/// Deterministic identity of one fan-in point. Units sharing a definition
/// accumulate on the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinDefinition {
    pub stage: Stage,
    pub flow: String,
    pub action_type: ActionType,
    pub action: String,
    /// Value of the configured metadata key, or "DEFAULT" when none.
    pub group: String,
}

impl JoinDefinition {
    pub const DEFAULT_GROUP: &'static str = "DEFAULT";

    pub fn key(&self) -> String {
        format!(
            "{:?}:{}:{:?}:{}:{}",
            self.stage, self.flow, self.action_type, self.action, self.group
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinEntry {
    pub id: Uuid,
    pub definition: JoinDefinition,
    pub deadline: DateTime<Utc>,
    pub min_num: Option<i32>,
    pub max_num: i32,
    pub count: i32,
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
}

impl JoinEntry {
    /// Arrival count reached `max_num`; resolve without waiting for the
    /// deadline.
    pub fn is_full(&self) -> bool {
        self.count >= self.max_num
    }

    /// At the deadline, the join fails iff fewer than `min_num` arrived.
    pub fn met_minimum(&self) -> bool {
        match self.min_num {
            Some(min) => self.count >= min,
            None => true,
        }
    }
}

/// Participant row linking a unit to its entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinEntryDid {
    pub id: Uuid,
    pub entry_id: Uuid,
    pub did: Uuid,
}

/// Applies a resolved join to the participating units.
#[async_trait]
pub trait JoinResolver: Send + Sync {
    /// Enough arrivals: merge the participants and queue the join action.
    async fn complete_join(&self, entry: &JoinEntry, dids: Vec<Uuid>) -> Result<()>;

    /// Deadline passed short of `min_num`: error every participant.
    async fn fail_join(&self, entry: &JoinEntry, dids: Vec<Uuid>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Total wall-clock budget for one lock acquisition.
    pub acquire_timeout: Duration,
    /// Sleep between lock attempts.
    pub retry_sleep: Duration,
    /// Locks held longer than this are force-released by the sweep.
    pub lock_max_duration: chrono::Duration,
    pub reap_interval: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            retry_sleep: Duration::from_millis(100),
            lock_max_duration: chrono::Duration::seconds(30),
            reap_interval: Duration::from_secs(5),
        }
    }
}

pub struct JoinCoordinator {
    store: Arc<dyn JoinStore>,
    clock: SharedClock,
    config: JoinConfig,
}

impl JoinCoordinator {
    pub fn new(store: Arc<dyn JoinStore>, clock: SharedClock, config: JoinConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Register `did` as an arrival on `definition`, acquiring the entry
    /// lock. Retries with a fixed sleep until the acquire timeout, then
    /// fails with `JoinTimeout`; callers must treat that as failure, never
    /// as a silent success.
    pub async fn upsert_and_lock(
        &self,
        definition: &JoinDefinition,
        deadline: DateTime<Utc>,
        min_num: Option<i32>,
        max_num: i32,
        did: Uuid,
    ) -> Result<JoinEntry> {
        let started = self.clock.now();
        loop {
            let now = self.clock.now();
            if let Some(mut entry) = self
                .store
                .upsert_and_lock(definition, deadline, min_num, max_num, now)
                .await?
            {
                self.store.add_did(entry.id, did).await?;
                entry.locked = true;
                return Ok(entry);
            }
            if self.clock.now() - started
                >= chrono::Duration::from_std(self.config.acquire_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(5))
            {
                metrics::counter!("conveyor_join_lock_timeouts").increment(1);
                return Err(CoreError::JoinTimeout(definition.key()));
            }
            sleep(self.config.retry_sleep).await;
        }
    }

    pub async fn unlock(&self, entry_id: Uuid) -> Result<()> {
        self.store.unlock(entry_id).await?;
        Ok(())
    }

    /// Apply an entry's outcome through the resolver, then delete the entry
    /// and its participant rows.
    pub async fn resolve(&self, entry: &JoinEntry, resolver: &dyn JoinResolver) -> Result<()> {
        let dids = self.store.entry_dids(entry.id).await?;
        if entry.met_minimum() {
            resolver.complete_join(entry, dids).await?;
        } else {
            warn!(
                key = %entry.definition.key(),
                arrived = entry.count,
                expected = ?entry.min_num,
                "join deadline passed below minimum arrivals"
            );
            resolver.fail_join(entry, dids).await?;
        }
        self.store.delete_entry(entry.id).await?;
        Ok(())
    }

    /// One reaper pass: resolve every entry past its deadline. Entries are
    /// locked one at a time so concurrent reapers never double-process.
    pub async fn reap_expired(&self, resolver: &dyn JoinResolver) -> Result<usize> {
        let mut resolved = 0;
        loop {
            let now = self.clock.now();
            let Some(entry) = self.store.lock_one_before(now, now).await? else {
                break;
            };
            if let Err(e) = self.resolve(&entry, resolver).await {
                error!(key = %entry.definition.key(), error = %e, "join resolution failed");
                self.store.unlock(entry.id).await?;
                return Err(e);
            }
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Force-release locks held past the max duration (crash recovery).
    pub async fn release_stuck_locks(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.config.lock_max_duration;
        let released = self.store.unlock_before(cutoff).await?;
        if released > 0 {
            warn!(released, "force-released join entry locks held past max duration");
        }
        Ok(released)
    }

    /// Remove participant rows whose entry vanished. Ids seen this pass are
    /// tracked so an unresolvable row cannot loop forever.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let mut processed: HashSet<Uuid> = HashSet::new();
        loop {
            let orphans = self.store.orphaned_dids(100).await?;
            let fresh: Vec<_> = orphans
                .into_iter()
                .filter(|o| !processed.contains(&o.id))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for orphan in fresh {
                warn!(did = %orphan.did, entry_id = %orphan.entry_id, "removing orphaned join participant");
                self.store.delete_did_row(orphan.id).await?;
                processed.insert(orphan.id);
            }
        }
        Ok(processed.len())
    }
}

/// Periodic task driving the reaper, stuck-lock release, and orphan sweep.
pub struct JoinReaper {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<AnyResult<()>>,
}

impl JoinReaper {
    pub fn start(coordinator: Arc<JoinCoordinator>, resolver: Arc<dyn JoinResolver>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let reap_interval = coordinator.config.reap_interval;
        let handle = tokio::spawn(async move {
            info!(interval_ms = reap_interval.as_millis() as u64, "starting join reaper");
            let mut ticker = interval(reap_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.release_stuck_locks().await {
                            error!(error = %e, "stuck-lock release failed");
                        }
                        if let Err(e) = coordinator.reap_expired(resolver.as_ref()).await {
                            error!(error = %e, "join reaper pass failed");
                        }
                        if let Err(e) = coordinator.sweep_orphans().await {
                            error!(error = %e, "join orphan sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("join reaper shutting down");
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
            Err(e) => Err(anyhow!("join reaper task panicked: {e}")),
        }
    }
}
