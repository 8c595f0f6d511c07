//! Recovery sweeps for lost queue writes and automatic resume.
//!
//! The dispatcher swallows enqueue failures after a successful save, so a
//! unit can sit with a QUEUED action that no worker will ever see. The
//! requeue sweep finds those actions past a staleness threshold and pushes
//! them again with a uniqueness check, which makes the sweep safe to run
//! against actions that are merely slow.
//!
//! The same task drives automatic resume: errored units whose
//! `next_auto_resume` stamp has passed are fed back through the
//! dispatcher's resume path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result as AnyResult};
use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::dispatcher::EventDispatcher;
use crate::error::{CoreError, Result};
use crate::flows::FlowRegistry;
use crate::queue::ActionEventQueue;
use crate::state_machine::{advance, never_cold};
use crate::store::{StoreError, UnitStore};
use crate::types::{ActionInput, ActionState, Stage};

#[derive(Debug, Clone)]
pub struct RequeueConfig {
    /// Queued actions older than this are considered lost.
    pub threshold: ChronoDuration,
    pub sweep_interval: Duration,
    pub auto_resume_interval: Duration,
    pub batch_size: usize,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            threshold: ChronoDuration::seconds(300),
            sweep_interval: Duration::from_secs(30),
            auto_resume_interval: Duration::from_secs(10),
            batch_size: 100,
        }
    }
}

pub struct Requeuer {
    store: Arc<dyn UnitStore>,
    registry: Arc<FlowRegistry>,
    queue: ActionEventQueue,
    dispatcher: Arc<EventDispatcher>,
    clock: SharedClock,
    config: RequeueConfig,
}

impl Requeuer {
    pub fn new(
        store: Arc<dyn UnitStore>,
        registry: Arc<FlowRegistry>,
        queue: ActionEventQueue,
        dispatcher: Arc<EventDispatcher>,
        clock: SharedClock,
        config: RequeueConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            dispatcher,
            clock,
            config,
        }
    }

    /// One requeue pass. Returns the number of actions pushed back onto
    /// the live queue.
    pub async fn requeue_pass(&self) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now - self.config.threshold;
        let units = self.store.stale_queued(cutoff, self.config.batch_size).await?;
        let mut requeued = 0;

        for mut unit in units {
            let stale: Vec<(String, String)> = unit
                .flows
                .iter()
                .flat_map(|f| {
                    f.actions
                        .iter()
                        .filter(|a| {
                            a.state == ActionState::Queued
                                && a.queued.map(|q| q <= cutoff).unwrap_or(false)
                        })
                        .map(|a| (f.name.clone(), a.name.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();
            if stale.is_empty() {
                continue;
            }

            let mut inputs = Vec::new();
            for (flow, action) in stale {
                match self.registry.action_config(&flow, &action) {
                    Some((config, action_type)) => {
                        // Refresh the queued stamp so the next pass skips it.
                        unit.queue_action(
                            &flow,
                            crate::admission::flow_type_for(action_type),
                            &action,
                            action_type,
                            Some(&config.action_class),
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
                        warn!(did = %unit.did, flow = %flow, action = %action, "queued action no longer configured");
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
            // Settle the stage when every remaining action just errored.
            if let Err(e) = advance(&mut unit, &self.registry, now, &never_cold) {
                match e {
                    CoreError::MissingFlow(_) | CoreError::MissingEgressFlow(_) => {
                        unit.set_stage(Stage::Error);
                    }
                    other => return Err(other),
                }
            }

            match self.store.save(&mut unit).await {
                Ok(()) => {}
                Err(StoreError::VersionConflict(did)) => {
                    // Someone else touched the unit; it will be re-examined
                    // on the next pass if still stale.
                    warn!(did = %did, "requeue skipped on version conflict");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if let Err(e) = self.queue.put_actions(&inputs, true).await {
                warn!(did = %unit.did, error = %e, "requeue enqueue failed");
                continue;
            }
            requeued += inputs.len();
        }

        if requeued > 0 {
            info!(requeued, "requeued stale actions");
            metrics::counter!("conveyor_actions_requeued").increment(requeued as u64);
        }
        Ok(requeued)
    }

    /// One auto-resume pass: resume every errored unit whose stamp passed.
    pub async fn auto_resume_pass(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.store.auto_resume_due(now, self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }
        let dids: Vec<Uuid> = due.iter().map(|u| u.did).collect();
        let results = self.dispatcher.resume(&dids).await;
        let mut resumed = 0;
        for result in results {
            if result.success {
                resumed += 1;
            } else {
                warn!(
                    did = %result.did,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "automatic resume failed"
                );
            }
        }
        if resumed > 0 {
            info!(resumed, "auto-resumed errored units");
            metrics::counter!("conveyor_units_auto_resumed").increment(resumed as u64);
        }
        Ok(resumed)
    }
}

/// Periodic task running both sweeps on their own cadences.
pub struct RequeueSweep {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<AnyResult<()>>,
}

impl RequeueSweep {
    pub fn start(requeuer: Arc<Requeuer>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(
                threshold_secs = requeuer.config.threshold.num_seconds(),
                "starting requeue sweep"
            );
            let mut sweep_ticker = interval(requeuer.config.sweep_interval);
            sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut resume_ticker = interval(requeuer.config.auto_resume_interval);
            resume_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweep_ticker.tick() => {
                        if let Err(e) = requeuer.requeue_pass().await {
                            error!(error = %e, "requeue pass failed");
                        }
                    }
                    _ = resume_ticker.tick() => {
                        if let Err(e) = requeuer.auto_resume_pass().await {
                            error!(error = %e, "auto-resume pass failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("requeue sweep shutting down");
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
            Err(e) => Err(anyhow!("requeue sweep task panicked: {e}")),
        }
    }
}
