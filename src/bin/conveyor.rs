//! Conveyor runtime entrypoint: wires config, stores, queue, dispatcher,
//! and the maintenance tasks, then runs until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use conveyor::admission::{AdmissionMaintenance, QueueAdmission};
use conveyor::dispatcher::{DispatchLoop, EventDispatcher};
use conveyor::flows::{EgressFlow, EnrichFlow, IngressFlow};
use conveyor::join::{JoinCoordinator, JoinReaper, JoinResolver};
use conveyor::queue::{ActionEventQueue, HeartbeatMonitor, MemoryQueue};
use conveyor::requeue::{RequeueSweep, Requeuer};
use conveyor::store::{JoinStore, PostgresJoinStore, PostgresUnitStore, UnitStore};
use conveyor::{config, observability, system_clock, FlowRegistry};

/// Flow configurations installed at startup from `CONVEYOR_FLOWS_FILE`.
#[derive(Debug, Default, Deserialize)]
struct FlowPlan {
    #[serde(default)]
    ingress_flows: Vec<IngressFlow>,
    #[serde(default)]
    enrich_flows: Vec<EnrichFlow>,
    #[serde(default)]
    egress_flows: Vec<EgressFlow>,
}

fn install_flows(registry: &FlowRegistry, path: &str) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading flows file {path}"))?;
    let plan: FlowPlan =
        serde_json::from_str(&raw).with_context(|| format!("parsing flows file {path}"))?;
    let count = plan.ingress_flows.len() + plan.enrich_flows.len() + plan.egress_flows.len();
    for flow in plan.ingress_flows {
        registry.set_ingress_flow(flow);
    }
    for flow in plan.enrich_flows {
        registry.set_enrich_flow(flow);
    }
    for flow in plan.egress_flows {
        registry.set_egress_flow(flow);
    }
    Ok(count)
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init();
    let config = config::try_get_config()?;

    let unit_store = PostgresUnitStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    let join_store = PostgresJoinStore::new(unit_store.pool().clone());
    join_store
        .init_schema()
        .await
        .context("creating join schema")?;

    let store: Arc<dyn UnitStore> = Arc::new(unit_store);
    let join_store: Arc<dyn JoinStore> = Arc::new(join_store);
    let clock = system_clock();
    let queue = ActionEventQueue::new(Arc::new(MemoryQueue::new()));

    let registry = Arc::new(FlowRegistry::new());
    match &config.flows_file {
        Some(path) => {
            let installed = install_flows(&registry, path)?;
            info!(installed, path = %path, "installed flows");
        }
        None => warn!("no CONVEYOR_FLOWS_FILE set; starting with an empty flow registry"),
    }

    let admission = Arc::new(QueueAdmission::new(
        config.admission_config(),
        queue.clone(),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&clock),
    ));
    let coordinator = Arc::new(JoinCoordinator::new(
        join_store,
        Arc::clone(&clock),
        config.join_config(),
    ));
    let dispatcher = Arc::new(
        EventDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            queue.clone(),
            Arc::clone(&coordinator),
            Arc::clone(&clock),
            config.dispatcher_config(),
        )
        .with_admission(Arc::clone(&admission)),
    );
    let requeuer = Arc::new(Requeuer::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        queue.clone(),
        Arc::clone(&dispatcher),
        Arc::clone(&clock),
        config.requeue_config(),
    ));

    let dispatch_loop = DispatchLoop::start(Arc::clone(&dispatcher), queue.clone());
    let admission_task = AdmissionMaintenance::start(admission);
    let reaper = JoinReaper::start(coordinator, Arc::clone(&dispatcher) as Arc<dyn JoinResolver>);
    let sweep = RequeueSweep::start(requeuer);
    let heartbeats = HeartbeatMonitor::start(queue, Arc::clone(&clock), Duration::from_secs(10));

    info!(app = %config.app_name, "conveyor core running");
    shutdown_signal().await?;
    info!("shutdown signal received");

    dispatch_loop.shutdown().await?;
    sweep.shutdown().await?;
    reaper.shutdown().await?;
    admission_task.shutdown().await?;
    heartbeats.shutdown().await?;
    info!("conveyor core stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
    }
    Ok(())
}
