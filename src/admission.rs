//! Cold/warm queue admission tiering.
//!
//! Tracks a live-depth snapshot per configured action class and classifies
//! each as warm or cold. Producers consult [`QueueAdmission::cold_queue`]
//! before enqueueing; cold inserts are recorded durably on the unit
//! (COLD_QUEUED) and trickled back onto the live queue by the drain loop.
//!
//! Hysteresis keeps the tier from flapping: a class goes cold when its live
//! depth reaches the max, and only returns to warm when the depth falls to
//! 80% or less AND no durable cold-queued rows remain for it. A class with
//! durable cold rows is re-flagged cold even below the max, which catches
//! demand that was undercounted after a large split.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result as AnyResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::flows::FlowRegistry;
use crate::queue::ActionEventQueue;
use crate::store::UnitStore;
use crate::types::{ActionInput, ActionState, ActionType, FlowType};

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Live-queue depth at which a class goes cold.
    pub max_queue_size: u64,
    pub refresh_interval: Duration,
    pub drain_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 5000,
            refresh_interval: Duration::from_secs(2),
            drain_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct QueueState {
    size: u64,
    cold: bool,
}

pub struct QueueAdmission {
    state: Mutex<HashMap<String, QueueState>>,
    config: AdmissionConfig,
    queue: ActionEventQueue,
    store: Arc<dyn UnitStore>,
    registry: Arc<FlowRegistry>,
    clock: SharedClock,
}

impl QueueAdmission {
    pub fn new(
        config: AdmissionConfig,
        queue: ActionEventQueue,
        store: Arc<dyn UnitStore>,
        registry: Arc<FlowRegistry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            config,
            queue,
            store,
            registry,
            clock,
        }
    }

    fn warm_threshold(&self) -> u64 {
        self.config.max_queue_size * 8 / 10
    }

    fn drain_threshold(&self) -> u64 {
        self.config.max_queue_size * 9 / 10
    }

    /// Producer-side predicate: should an insert for `class` go cold given
    /// `pending` not-yet-added items this caller plans for it?
    pub fn cold_queue(&self, class: &str, pending: u64) -> bool {
        let state = self.state.lock().expect("admission state lock poisoned");
        match state.get(class) {
            Some(s) => s.cold || s.size + pending > self.config.max_queue_size,
            None => pending > self.config.max_queue_size,
        }
    }

    pub fn is_cold(&self, class: &str) -> bool {
        let state = self.state.lock().expect("admission state lock poisoned");
        state.get(class).map(|s| s.cold).unwrap_or(false)
    }

    /// Re-snapshot live depths for every configured class and apply the
    /// warm/cold transitions. Classes no longer configured are evicted.
    pub async fn refresh(&self) -> Result<()> {
        let configured = self.registry.configured_action_classes();
        let cold_counts = self.store.cold_queue_counts().await?;
        let mut sizes = HashMap::with_capacity(configured.len());
        for class in &configured {
            sizes.insert(class.clone(), self.queue.queue_size(class).await? as u64);
        }

        let mut state = self.state.lock().expect("admission state lock poisoned");
        state.retain(|class, _| configured.iter().any(|c| c == class));
        for class in &configured {
            let size = sizes.get(class).copied().unwrap_or(0);
            let cold_rows = cold_counts.get(class).copied().unwrap_or(0);
            let entry = state.entry(class.clone()).or_default();
            entry.size = size;
            if entry.cold {
                if size <= self.warm_threshold() && cold_rows == 0 {
                    entry.cold = false;
                    info!(class = %class, size, "queue returned to warm");
                }
            } else if size >= self.config.max_queue_size || cold_rows > 0 {
                entry.cold = true;
                info!(class = %class, size, cold_rows, "queue flagged cold");
            }
        }
        Ok(())
    }

    /// Move durable cold-queued work back onto the live queue, per class,
    /// when live depth has fallen under 90% of max. Pulls oldest first and
    /// never pushes the live depth past max in one pass.
    pub async fn drain(&self) -> Result<usize> {
        let cold_counts = self.store.cold_queue_counts().await?;
        let now = self.clock.now();
        let mut total = 0;

        for class in cold_counts.keys() {
            let live = self.queue.queue_size(class).await? as u64;
            if live >= self.drain_threshold() {
                continue;
            }
            let capacity = (self.config.max_queue_size - live) as usize;
            let mut units = self.store.cold_queued(class, capacity).await?;
            let mut drained = 0usize;

            for unit in units.iter_mut() {
                if drained >= capacity {
                    break;
                }
                let mut inputs: Vec<ActionInput> = Vec::new();
                for (flow, action) in unit.cold_queued_actions(class) {
                    if drained + inputs.len() >= capacity {
                        break;
                    }
                    match self.registry.action_config(&flow, &action) {
                        Some((config, action_type)) => {
                            unit.queue_action(
                                &flow,
                                flow_type_for(action_type),
                                &action,
                                action_type,
                                Some(class),
                                ActionState::Queued,
                                now,
                            );
                            inputs.push(ActionInput {
                                queue_name: config.action_class.clone(),
                                did: unit.did,
                                flow,
                                action,
                                action_created: now,
                                cold_queued: false,
                                parameters: config.parameters.clone(),
                                return_address: None,
                            });
                        }
                        None => {
                            warn!(did = %unit.did, flow = %flow, action = %action,
                                "cold-queued action no longer configured; recording error");
                            unit.error_action(
                                &flow,
                                &action,
                                "Action no longer configured in any running flow",
                                "",
                                now,
                            );
                        }
                    }
                }
                if inputs.is_empty() && unit.has_cold_queued_actions() {
                    continue;
                }
                match self.store.save(unit).await {
                    Ok(()) => {
                        drained += inputs.len();
                        if let Err(e) = self.queue.put_actions(&inputs, true).await {
                            warn!(did = %unit.did, error = %e, "cold drain enqueue failed; requeue sweep will recover");
                        }
                    }
                    Err(e) => {
                        // Another writer got there first; leave the rows
                        // for the next pass.
                        warn!(did = %unit.did, error = %e, "skipping cold drain for contended unit");
                    }
                }
            }
            total += drained;
        }
        if total > 0 {
            metrics::counter!("conveyor_cold_drained").increment(total as u64);
        }
        Ok(total)
    }
}

pub(crate) fn flow_type_for(action_type: ActionType) -> FlowType {
    match action_type {
        ActionType::Ingress | ActionType::Transform | ActionType::Load => FlowType::Ingress,
        ActionType::Domain | ActionType::Enrich => FlowType::Enrich,
        ActionType::Format | ActionType::Validate | ActionType::Egress => FlowType::Egress,
    }
}

/// Periodic task running the refresh and drain loops.
pub struct AdmissionMaintenance {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<AnyResult<()>>,
}

impl AdmissionMaintenance {
    pub fn start(admission: Arc<QueueAdmission>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(
                max_queue_size = admission.config.max_queue_size,
                "starting queue admission maintenance"
            );
            let mut refresh_ticker = interval(admission.config.refresh_interval);
            refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut drain_ticker = interval(admission.config.drain_interval);
            drain_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = refresh_ticker.tick() => {
                        if let Err(e) = admission.refresh().await {
                            error!(error = %e, "queue admission refresh failed");
                        }
                    }
                    _ = drain_ticker.tick() => {
                        if let Err(e) = admission.drain().await {
                            error!(error = %e, "cold queue drain failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("queue admission maintenance shutting down");
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
            Err(e) => Err(anyhow!("admission maintenance task panicked: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::flows::{ActionConfiguration, IngressFlow, LoadActionConfiguration};
    use crate::queue::MemoryQueue;
    use crate::store::{MemoryUnitStore, UnitStore};
    use crate::types::{DeltaFile, SourceInfo};
    use chrono::Utc;
    use uuid::Uuid;

    const LOAD_CLASS: &str = "org.example.Load";

    fn registry() -> Arc<FlowRegistry> {
        let registry = FlowRegistry::new();
        registry.set_ingress_flow(IngressFlow {
            name: "sample".to_string(),
            test_mode: false,
            transform_actions: vec![],
            load_action: LoadActionConfiguration {
                config: ActionConfiguration {
                    name: "LoadAction".to_string(),
                    action_class: LOAD_CLASS.to_string(),
                    parameters: serde_json::Value::Null,
                    join: None,
                },
            },
        });
        Arc::new(registry)
    }

    fn admission(
        max: u64,
        store: Arc<MemoryUnitStore>,
        registry: Arc<FlowRegistry>,
    ) -> (QueueAdmission, ActionEventQueue) {
        let queue = ActionEventQueue::new(Arc::new(MemoryQueue::new()));
        let admission = QueueAdmission::new(
            AdmissionConfig {
                max_queue_size: max,
                ..AdmissionConfig::default()
            },
            queue.clone(),
            store,
            registry,
            system_clock(),
        );
        (admission, queue)
    }

    async fn cold_unit(store: &MemoryUnitStore) -> DeltaFile {
        let mut unit = DeltaFile::new_ingress(
            Uuid::new_v4(),
            SourceInfo {
                filename: "f".to_string(),
                flow: "sample".to_string(),
                metadata: HashMap::new(),
            },
            vec![],
            vec![],
            Utc::now(),
        );
        unit.queue_action(
            "sample",
            FlowType::Ingress,
            "LoadAction",
            ActionType::Load,
            Some(LOAD_CLASS),
            ActionState::ColdQueued,
            Utc::now(),
        );
        store.save(&mut unit).await.unwrap();
        unit
    }

    async fn fill_queue(queue: &ActionEventQueue, n: usize) {
        for i in 0..n {
            queue
                .backend()
                .put(LOAD_CLASS, format!("item-{i}"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn queue_goes_cold_at_max_and_warms_under_hysteresis() {
        let store = Arc::new(MemoryUnitStore::new());
        let (admission, queue) = admission(10, Arc::clone(&store), registry());

        fill_queue(&queue, 10).await;
        admission.refresh().await.unwrap();
        assert!(admission.is_cold(LOAD_CLASS));

        // Depth at 90%: still cold (warm requires <= 80%).
        queue.backend().take(LOAD_CLASS).await.unwrap();
        admission.refresh().await.unwrap();
        assert!(admission.is_cold(LOAD_CLASS));

        queue.backend().take(LOAD_CLASS).await.unwrap();
        admission.refresh().await.unwrap();
        assert!(!admission.is_cold(LOAD_CLASS));
    }

    #[tokio::test]
    async fn cold_rows_keep_queue_cold_regardless_of_depth() {
        let store = Arc::new(MemoryUnitStore::new());
        let (admission, _queue) = admission(10, Arc::clone(&store), registry());
        cold_unit(&store).await;

        // Live depth is zero, but durable cold rows exist.
        admission.refresh().await.unwrap();
        assert!(admission.is_cold(LOAD_CLASS));
        admission.refresh().await.unwrap();
        assert!(admission.is_cold(LOAD_CLASS));
    }

    #[tokio::test]
    async fn cold_predicate_counts_planned_inserts() {
        let store = Arc::new(MemoryUnitStore::new());
        let (admission, queue) = admission(10, Arc::clone(&store), registry());
        fill_queue(&queue, 8).await;
        admission.refresh().await.unwrap();

        assert!(!admission.cold_queue(LOAD_CLASS, 2));
        assert!(admission.cold_queue(LOAD_CLASS, 3));
    }

    #[tokio::test]
    async fn unconfigured_classes_are_evicted() {
        let store = Arc::new(MemoryUnitStore::new());
        let (admission, _queue) = admission(10, Arc::clone(&store), registry());
        {
            let mut state = admission.state.lock().unwrap();
            state.insert(
                "org.example.Gone".to_string(),
                QueueState {
                    size: 99,
                    cold: true,
                },
            );
        }
        admission.refresh().await.unwrap();
        assert!(!admission.is_cold("org.example.Gone"));
        let state = admission.state.lock().unwrap();
        assert!(!state.contains_key("org.example.Gone"));
    }

    #[tokio::test]
    async fn drain_moves_cold_rows_back_to_live_queue() {
        let store = Arc::new(MemoryUnitStore::new());
        let (admission, queue) = admission(10, Arc::clone(&store), registry());
        let unit = cold_unit(&store).await;

        let drained = admission.drain().await.unwrap();
        assert_eq!(drained, 1);
        assert_eq!(queue.queue_size(LOAD_CLASS).await.unwrap(), 1);

        let stored = store.load(unit.did).await.unwrap().unwrap();
        assert_eq!(
            stored.action("sample", "LoadAction").unwrap().state,
            ActionState::Queued
        );
    }

    #[tokio::test]
    async fn drain_respects_ninety_percent_threshold() {
        let store = Arc::new(MemoryUnitStore::new());
        let (admission, queue) = admission(10, Arc::clone(&store), registry());
        cold_unit(&store).await;

        fill_queue(&queue, 9).await;
        let drained = admission.drain().await.unwrap();
        assert_eq!(drained, 0);
        assert_eq!(queue.queue_size(LOAD_CLASS).await.unwrap(), 9);
    }
}
