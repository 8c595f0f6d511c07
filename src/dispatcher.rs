//! The control loop: consume worker result events, mutate units, re-run
//! the state machine, persist, re-enqueue.
//!
//! Every mutation path here is a read-modify-write against one unit; the
//! store's version check is the concurrency boundary. Only event handling
//! auto-retries a version conflict (bounded attempts, no backoff); the
//! request-style batch operations (resume/replay/cancel/acknowledge)
//! surface the conflict in their per-item result instead.
//!
//! Queue writes after a successful save are logged and swallowed on
//! failure; the requeue sweep re-enqueues anything left behind.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::{flow_type_for, QueueAdmission};
use crate::backoff::ResumePolicies;
use crate::clock::SharedClock;
use crate::error::{CoreError, Result};
use crate::flows::FlowRegistry;
use crate::join::{JoinCoordinator, JoinDefinition, JoinEntry, JoinResolver};
use crate::queue::ActionEventQueue;
use crate::state_machine::{advance, never_cold, NextAction};
use crate::store::{StoreError, UnitStore};
use crate::types::{
    ActionEvent, ActionInput, ActionState, ActionType, ChildSpec, Content, DeltaFile, EventKind,
    FlowType, FormatPayload, FormattedData, SourceInfo, Stage,
};

/// Synthetic action recorded when a unit reaches EGRESS with no matching
/// egress flow.
pub const NO_EGRESS_FLOW_ACTION: &str = "NoEgressFlowConfiguredAction";
pub const NO_EGRESS_FLOW_CAUSE: &str = "No egress flow configured";
pub const MISSING_FLOW_ACTION: &str = "MissingRunningFlowAction";

const CONFLICT_RETRY_ATTEMPTS: usize = 10;

/// Run `op` until it succeeds or fails with anything other than an
/// optimistic-lock conflict. Conflicts are transient, so attempts are
/// bounded and there is no backoff between them.
pub async fn with_conflict_retry<T, F, Fut>(max_attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut conflicted = Uuid::nil();
    for _ in 0..max_attempts.max(1) {
        match op().await {
            Err(CoreError::OptimisticConflict(did)) => {
                metrics::counter!("conveyor_save_conflicts").increment(1);
                conflicted = did;
            }
            other => return other,
        }
    }
    Err(CoreError::OptimisticConflict(conflicted))
}

/// Per-item outcome of a batch operation.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub did: Uuid,
    pub success: bool,
    pub error: Option<String>,
}

impl BatchResult {
    fn ok(did: Uuid) -> Self {
        Self {
            did,
            success: true,
            error: None,
        }
    }

    fn err(did: Uuid, error: String) -> Self {
        Self {
            did,
            success: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngressInput {
    pub source: SourceInfo,
    pub content: Vec<Content>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    /// When set, units that land in COMPLETE are deleted instead of kept.
    pub delete_on_completion: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: num_cpus::get().max(1) * 2,
            delete_on_completion: false,
        }
    }
}

/// A join arrival deferred until after the owning unit was persisted.
#[derive(Debug, Clone)]
struct PendingJoin {
    did: Uuid,
    group: String,
    next: NextAction,
}

/// What one successful apply produced: live queue inserts plus join
/// arrivals to register.
#[derive(Debug, Default)]
struct ApplyOutcome {
    inputs: Vec<ActionInput>,
    joins: Vec<PendingJoin>,
}

pub struct EventDispatcher {
    store: Arc<dyn UnitStore>,
    registry: Arc<FlowRegistry>,
    queue: ActionEventQueue,
    join: Arc<JoinCoordinator>,
    admission: Option<Arc<QueueAdmission>>,
    policies: ResumePolicies,
    clock: SharedClock,
    config: DispatcherConfig,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<dyn UnitStore>,
        registry: Arc<FlowRegistry>,
        queue: ActionEventQueue,
        join: Arc<JoinCoordinator>,
        clock: SharedClock,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            join,
            admission: None,
            policies: ResumePolicies::default(),
            clock,
            config,
        }
    }

    pub fn with_admission(mut self, admission: Arc<QueueAdmission>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn with_policies(mut self, policies: ResumePolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Create a new unit and start it through the pipeline.
    pub async fn ingress(&self, input: IngressInput) -> Result<Uuid> {
        let flow = input.source.flow.clone();
        if self.registry.ingress_flow(&flow).is_none() {
            return Err(CoreError::MissingFlow(flow));
        }
        let now = self.clock.now();
        let did = Uuid::new_v4();
        let mut unit = DeltaFile::new_ingress(did, input.source, input.content, vec![], now);
        let next = self.advance_or_force(&mut unit)?;
        let outcome = self.partition_next(&unit, next);
        self.save_versioned(&mut unit).await?;
        info!(did = %did, flow = %flow, "ingressed new unit");
        metrics::counter!("conveyor_units_ingressed").increment(1);
        self.finish(outcome).await;
        Ok(did)
    }

    /// Apply one worker result event. Idempotent under duplicate delivery:
    /// events for actions no longer pending fail with `UnexpectedAction`
    /// without mutating the unit.
    pub async fn handle_event(&self, event: ActionEvent) -> Result<()> {
        let outcome = with_conflict_retry(CONFLICT_RETRY_ATTEMPTS, || {
            let event = event.clone();
            async move { self.apply_event(event).await }
        })
        .await?;
        metrics::counter!("conveyor_events_handled").increment(1);
        self.finish(outcome).await;
        Ok(())
    }

    async fn apply_event(&self, event: ActionEvent) -> Result<ApplyOutcome> {
        let mut unit = self
            .store
            .load(event.did)
            .await?
            .ok_or(CoreError::NotFound(event.did))?;

        if unit.stage == Stage::Cancelled {
            info!(did = %event.did, action = %event.action, "dropping event for cancelled unit");
            return Ok(ApplyOutcome::default());
        }
        if !unit.has_pending_action(&event.flow, &event.action) {
            return Err(CoreError::UnexpectedAction {
                did: event.did,
                action: event.action.clone(),
                pending: unit
                    .pending_actions()
                    .into_iter()
                    .map(|(f, a)| format!("{f}.{a}"))
                    .collect(),
            });
        }

        match event.kind.clone() {
            EventKind::Split { children } => self.apply_split(unit, &event, children).await,
            EventKind::FormatMany { formats } => {
                self.apply_format_many(unit, &event, formats).await
            }
            kind => {
                self.apply_simple(&mut unit, &event, kind);
                let next = self.advance_or_force(&mut unit)?;
                let outcome = self.partition_next(&unit, next);
                if self.config.delete_on_completion && unit.stage == Stage::Complete {
                    self.store.delete(&[unit.did]).await?;
                    return Ok(outcome);
                }
                self.save_versioned(&mut unit).await?;
                Ok(outcome)
            }
        }
    }

    /// Apply the payload of a non-splitting event kind and mark the action
    /// terminal.
    fn apply_simple(&self, unit: &mut DeltaFile, event: &ActionEvent, kind: EventKind) {
        let now = self.clock.now();
        let action_type = unit
            .action(&event.flow, &event.action)
            .map(|a| a.action_type)
            .unwrap_or(ActionType::Transform);

        match kind {
            EventKind::Transform { protocol_layer } => {
                if let Some(layer) = protocol_layer {
                    unit.protocol_stack.push(layer);
                }
                unit.complete_action(&event.flow, &event.action, event.start, event.stop, now);
            }
            EventKind::Load {
                protocol_layer,
                domains,
            } => {
                if let Some(layer) = protocol_layer {
                    unit.protocol_stack.push(layer);
                }
                for domain in domains {
                    unit.add_domain(&domain.name, &domain.value, &domain.media_type);
                }
                unit.complete_action(&event.flow, &event.action, event.start, event.stop, now);
            }
            EventKind::Domain { domains } => {
                for domain in domains {
                    unit.add_domain(&domain.name, &domain.value, &domain.media_type);
                }
                unit.complete_action(&event.flow, &event.action, event.start, event.stop, now);
            }
            EventKind::Enrich { enrichments } => {
                for enrichment in enrichments {
                    unit.add_enrichment(&enrichment.name, &enrichment.value, &enrichment.media_type);
                }
                unit.complete_action(&event.flow, &event.action, event.start, event.stop, now);
            }
            EventKind::Format { format } => {
                unit.formatted_data
                    .push(self.formatted_entry(&event.flow, &event.action, format));
                unit.complete_action(&event.flow, &event.action, event.start, event.stop, now);
            }
            EventKind::Validate => {
                unit.complete_action(&event.flow, &event.action, event.start, event.stop, now);
            }
            EventKind::Egress => {
                unit.egressed = true;
                unit.add_egress_flow(&event.flow);
                unit.complete_action(&event.flow, &event.action, event.start, event.stop, now);
            }
            EventKind::Error { cause, context } => {
                self.record_error(unit, &event.flow, &event.action, &cause, &context);
            }
            EventKind::Filter { message } => {
                if matches!(action_type, ActionType::Domain | ActionType::Enrich) {
                    // Filtering is illegal for these types; reclassify.
                    let cause = format!("Illegal filter from {action_type:?} action: {message}");
                    self.record_error(unit, &event.flow, &event.action, &cause, "");
                } else {
                    unit.filter_action(&event.flow, &event.action, &message, now);
                }
            }
            EventKind::Split { .. } | EventKind::FormatMany { .. } => {
                // Routed to the dedicated handlers before this match.
            }
        }
    }

    /// Record an errored attempt and, when a resume policy matches, stamp
    /// the unit for automatic resume.
    fn record_error(
        &self,
        unit: &mut DeltaFile,
        flow: &str,
        action: &str,
        cause: &str,
        context: &str,
    ) {
        let now = self.clock.now();
        let action_type = unit
            .action(flow, action)
            .map(|a| a.action_type)
            .unwrap_or(ActionType::Transform);
        unit.error_action(flow, action, cause, context, now);
        metrics::counter!("conveyor_action_errors").increment(1);

        let attempt = unit.action(flow, action).map(|a| a.attempt).unwrap_or(1);
        if let Some(policy) = self
            .policies
            .find_match(flow, action, action_type, attempt, cause)
        {
            unit.next_auto_resume = Some(policy.backoff.next_resume(attempt, now));
            unit.next_auto_resume_reason = Some(policy.name.clone());
        }
    }

    fn formatted_entry(&self, flow: &str, action: &str, payload: FormatPayload) -> FormattedData {
        let (egress_actions, validate_actions) = match self.registry.egress_flow(flow) {
            Some(f) => (
                vec![f.egress_action.config.name.clone()],
                f.validate_actions
                    .iter()
                    .map(|v| v.config.name.clone())
                    .collect(),
            ),
            None => {
                warn!(flow = %flow, "format result for unconfigured egress flow");
                (Vec::new(), Vec::new())
            }
        };
        FormattedData {
            filename: payload.filename,
            format_action: action.to_string(),
            metadata: payload.metadata,
            segment: payload.segment,
            egress_actions,
            validate_actions,
        }
    }

    /// Advance the unit, converting flow-assignment failures into a
    /// synthetic error action so the unit is never left stuck.
    fn advance_or_force(&self, unit: &mut DeltaFile) -> Result<Vec<NextAction>> {
        let now = self.clock.now();
        let result = match &self.admission {
            Some(admission) => {
                let admission = Arc::clone(admission);
                advance(unit, &self.registry, now, &move |class, pending| {
                    admission.cold_queue(class, pending)
                })
            }
            None => advance(unit, &self.registry, now, &never_cold),
        };
        match result {
            Ok(next) => Ok(next),
            Err(CoreError::MissingEgressFlow(_)) => {
                self.force_error(
                    unit,
                    NO_EGRESS_FLOW_ACTION,
                    ActionType::Egress,
                    NO_EGRESS_FLOW_CAUSE,
                );
                Ok(Vec::new())
            }
            Err(CoreError::MissingFlow(flow)) => {
                let cause = format!("Flow '{flow}' is not installed or not running");
                self.force_error(unit, MISSING_FLOW_ACTION, ActionType::Load, &cause);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn force_error(
        &self,
        unit: &mut DeltaFile,
        action: &str,
        action_type: ActionType,
        cause: &str,
    ) {
        let now = self.clock.now();
        let flow = unit.source.flow.clone();
        let flow_type = unit
            .flow(&flow)
            .map(|f| f.flow_type)
            .unwrap_or(FlowType::Ingress);
        unit.add_error_action(&flow, flow_type, action, action_type, cause, "", now);
        unit.set_stage(Stage::Error);
        unit.recalculate_total_bytes();
        warn!(did = %unit.did, action = %action, cause = %cause, "forced unit into ERROR");
    }

    /// Split the computed next actions into live queue inserts and join
    /// arrivals; joins are registered only after the unit is persisted.
    fn partition_next(&self, unit: &DeltaFile, next: Vec<NextAction>) -> ApplyOutcome {
        let now = self.clock.now();
        let mut outcome = ApplyOutcome::default();
        for na in next {
            if na.is_join() {
                let group = na
                    .config
                    .join
                    .as_ref()
                    .and_then(|spec| spec.metadata_key.as_ref())
                    .and_then(|key| unit.source.metadata.get(key).cloned())
                    .unwrap_or_else(|| JoinDefinition::DEFAULT_GROUP.to_string());
                outcome.joins.push(PendingJoin {
                    did: unit.did,
                    group,
                    next: na,
                });
            } else {
                outcome.inputs.push(ActionInput {
                    queue_name: na.config.action_class.clone(),
                    did: unit.did,
                    flow: na.flow.clone(),
                    action: na.config.name.clone(),
                    action_created: now,
                    cold_queued: na.cold,
                    parameters: na.config.parameters.clone(),
                    return_address: None,
                });
            }
        }
        outcome
    }

    /// Post-persist work: push live inserts (swallowing queue failures)
    /// and register join arrivals.
    async fn finish(&self, outcome: ApplyOutcome) {
        if !outcome.inputs.is_empty() {
            if let Err(e) = self.queue.put_actions(&outcome.inputs, false).await {
                warn!(error = %e, "enqueue failed; requeue sweep will recover");
            }
        }
        for pending in outcome.joins {
            if let Err(e) = self.register_join(&pending).await {
                error!(did = %pending.did, error = %e, "join registration failed");
            }
        }
    }

    /// Boxed to break the async type cycle through mutate_and_requeue.
    fn register_join<'a>(
        &'a self,
        pending: &'a PendingJoin,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        let Some(spec) = pending.next.config.join.as_ref() else {
            return Ok(());
        };
        let definition = JoinDefinition {
            stage: stage_for(pending.next.flow_type),
            flow: pending.next.flow.clone(),
            action_type: pending.next.action_type,
            action: pending.next.config.name.clone(),
            group: pending.group.clone(),
        };
        let deadline = self.clock.now() + ChronoDuration::seconds(spec.max_age_secs);
        let min_num = spec.min_num.map(|m| m as i32);

        match self
            .join
            .upsert_and_lock(&definition, deadline, min_num, spec.max_num as i32, pending.did)
            .await
        {
            Ok(entry) => {
                if entry.is_full() {
                    self.join.resolve(&entry, self).await?;
                } else {
                    self.join.unlock(entry.id).await?;
                }
                Ok(())
            }
            Err(CoreError::JoinTimeout(key)) => {
                warn!(did = %pending.did, key = %key, "join lock acquisition timed out");
                let flow = pending.next.flow.clone();
                let action = pending.next.config.name.clone();
                self.mutate_and_requeue(pending.did, move |unit, now| {
                    unit.error_action(
                        &flow,
                        &action,
                        "Timed out acquiring the join entry lock",
                        "",
                        now,
                    );
                    Ok(())
                })
                .await
            }
            Err(e) => Err(e),
        }
        })
    }

    /// Conflict-retried load-mutate-advance-save used by the join paths.
    async fn mutate_and_requeue<F>(&self, did: Uuid, mutate: F) -> Result<()>
    where
        F: Fn(&mut DeltaFile, DateTime<Utc>) -> Result<()>,
    {
        let outcome = with_conflict_retry(CONFLICT_RETRY_ATTEMPTS, || {
            let mutate = &mutate;
            async move {
                let mut unit = self
                    .store
                    .load(did)
                    .await?
                    .ok_or(CoreError::NotFound(did))?;
                mutate(&mut unit, self.clock.now())?;
                let next = self.advance_or_force(&mut unit)?;
                let outcome = self.partition_next(&unit, next);
                self.save_versioned(&mut unit).await?;
                Ok(outcome)
            }
        })
        .await?;
        self.finish(outcome).await;
        Ok(())
    }

    /// A split replaces the parent with freshly ingressed children. The
    /// whole event is atomic from the outside: the first bad child spec
    /// aborts it and no children are persisted.
    async fn apply_split(
        &self,
        mut unit: DeltaFile,
        event: &ActionEvent,
        children: Vec<ChildSpec>,
    ) -> Result<ApplyOutcome> {
        let now = self.clock.now();
        let expected_load = self
            .registry
            .ingress_flow(&unit.source.flow)
            .map(|f| f.load_action.config.name);
        if expected_load.as_deref() != Some(event.action.as_str()) {
            let cause = format!("Illegal split from action '{}'", event.action);
            self.record_error(&mut unit, &event.flow, &event.action, &cause, "");
            return self.settle_and_save(unit).await;
        }
        if children.is_empty() {
            self.record_error(
                &mut unit,
                &event.flow,
                &event.action,
                "Split event contained no children",
                "",
            );
            return self.settle_and_save(unit).await;
        }

        let mut built: Vec<DeltaFile> = Vec::new();
        let mut outcome = ApplyOutcome::default();
        let mut bad_child = None;
        for spec in children {
            if self.registry.ingress_flow(&spec.source.flow).is_none() {
                bad_child = Some(format!(
                    "Attempted to split to non-running flow '{}'",
                    spec.source.flow
                ));
                break;
            }
            let mut child = DeltaFile::new_ingress(
                Uuid::new_v4(),
                spec.source,
                spec.content,
                vec![unit.did],
                now,
            );
            let next = self.advance_or_force(&mut child)?;
            let child_outcome = self.partition_next(&child, next);
            outcome.inputs.extend(child_outcome.inputs);
            outcome.joins.extend(child_outcome.joins);
            built.push(child);
        }

        if let Some(cause) = bad_child {
            self.record_error(&mut unit, &event.flow, &event.action, &cause, "");
            return self.settle_and_save(unit).await;
        }

        unit.split_action(&event.flow, &event.action, now);
        unit.child_dids = built.iter().map(|c| c.did).collect();
        let parent_next = self.advance_or_force(&mut unit)?;
        let parent_outcome = self.partition_next(&unit, parent_next);
        outcome.inputs.extend(parent_outcome.inputs);
        outcome.joins.extend(parent_outcome.joins);

        self.save_versioned(&mut unit).await?;
        self.store.insert_batch(&mut built).await?;
        metrics::counter!("conveyor_units_split").increment(built.len() as u64);
        Ok(outcome)
    }

    /// One child per format result. Each child inherits the parent's
    /// history with the format action complete and its own formatted
    /// payload, then continues through validate and egress on its own.
    async fn apply_format_many(
        &self,
        mut unit: DeltaFile,
        event: &ActionEvent,
        formats: Vec<FormatPayload>,
    ) -> Result<ApplyOutcome> {
        let now = self.clock.now();
        let valid_trigger = self
            .registry
            .egress_flow(&event.flow)
            .map(|f| {
                f.format_action.config.name == event.action
                    && f.matches_ingress_flow(&unit.source.flow)
            })
            .unwrap_or(false);
        if !valid_trigger {
            let cause = format!("Illegal formatMany from action '{}'", event.action);
            self.record_error(&mut unit, &event.flow, &event.action, &cause, "");
            return self.settle_and_save(unit).await;
        }
        if formats.is_empty() {
            self.record_error(
                &mut unit,
                &event.flow,
                &event.action,
                "FormatMany event contained no formats",
                "",
            );
            return self.settle_and_save(unit).await;
        }

        let mut built: Vec<DeltaFile> = Vec::new();
        let mut outcome = ApplyOutcome::default();
        for payload in formats {
            let mut child = unit.clone();
            child.did = Uuid::new_v4();
            child.version = 0;
            child.parent_dids = vec![unit.did];
            child.child_dids = Vec::new();
            child.complete_action(&event.flow, &event.action, event.start, event.stop, now);
            child.formatted_data = vec![self.formatted_entry(&event.flow, &event.action, payload)];
            let next = self.advance_or_force(&mut child)?;
            let child_outcome = self.partition_next(&child, next);
            outcome.inputs.extend(child_outcome.inputs);
            outcome.joins.extend(child_outcome.joins);
            built.push(child);
        }

        unit.split_action(&event.flow, &event.action, now);
        unit.child_dids = built.iter().map(|c| c.did).collect();
        let parent_next = self.advance_or_force(&mut unit)?;
        let parent_outcome = self.partition_next(&unit, parent_next);
        outcome.inputs.extend(parent_outcome.inputs);
        outcome.joins.extend(parent_outcome.joins);

        self.save_versioned(&mut unit).await?;
        self.store.insert_batch(&mut built).await?;
        Ok(outcome)
    }

    async fn settle_and_save(&self, mut unit: DeltaFile) -> Result<ApplyOutcome> {
        let next = self.advance_or_force(&mut unit)?;
        let outcome = self.partition_next(&unit, next);
        self.save_versioned(&mut unit).await?;
        Ok(outcome)
    }

    /// Reset every errored action on each unit to a fresh QUEUED attempt
    /// and re-dispatch. Conflicts surface in the per-item result rather
    /// than retrying.
    pub async fn resume(&self, dids: &[Uuid]) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(dids.len());
        for &did in dids {
            let result = match self.resume_one(did).await {
                Ok(()) => BatchResult::ok(did),
                Err(e) => BatchResult::err(did, e.to_string()),
            };
            results.push(result);
        }
        results
    }

    async fn resume_one(&self, did: Uuid) -> Result<()> {
        let now = self.clock.now();
        let mut unit = self
            .store
            .load(did)
            .await?
            .ok_or(CoreError::NotFound(did))?;
        if let Some(reason) = unit.content_deleted_reason.clone() {
            return Err(CoreError::ContentGone { did, reason });
        }
        let resumed = unit.resume_errors(now);
        if resumed.is_empty() {
            return Err(CoreError::InvalidRequest(format!(
                "DeltaFile {did} has no errored actions to resume"
            )));
        }
        unit.error_acknowledged = None;
        unit.error_acknowledged_reason = None;
        unit.next_auto_resume = None;
        unit.next_auto_resume_reason = None;

        // Wind the stage back to the earliest resumed action's stage.
        let mut target = Stage::Complete;
        let mut inputs = Vec::new();
        for (flow, action) in &resumed {
            let action_type = unit
                .action(flow, action)
                .map(|a| a.action_type)
                .unwrap_or(ActionType::Transform);
            let stage = stage_for(flow_type_for(action_type));
            if stage_rank(stage) < stage_rank(target) {
                target = stage;
            }
            match self.registry.action_config(flow, action) {
                Some((config, _)) => inputs.push(ActionInput {
                    queue_name: config.action_class.clone(),
                    did,
                    flow: flow.clone(),
                    action: action.clone(),
                    action_created: now,
                    cold_queued: false,
                    parameters: config.parameters.clone(),
                    return_address: None,
                }),
                None => {
                    unit.error_action(
                        flow,
                        action,
                        "Action no longer configured in any running flow",
                        "",
                        now,
                    );
                }
            }
        }
        unit.stage = target;
        if unit.has_errored_action() && !unit.has_pending_actions() {
            unit.set_stage(Stage::Error);
        }
        self.save_versioned(&mut unit).await?;
        metrics::counter!("conveyor_units_resumed").increment(1);
        if let Err(e) = self.queue.put_actions(&inputs, true).await {
            warn!(did = %did, error = %e, "resume enqueue failed; requeue sweep will recover");
        }
        Ok(())
    }

    /// Create a replay child from each unit's original ingress content.
    /// A unit can be replayed once; the result carries the child's did.
    pub async fn replay(
        &self,
        dids: &[Uuid],
        metadata_overrides: &HashMap<String, String>,
    ) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(dids.len());
        for &did in dids {
            let result = match self.replay_one(did, metadata_overrides).await {
                Ok(child) => BatchResult::ok(child),
                Err(e) => BatchResult::err(did, e.to_string()),
            };
            results.push(result);
        }
        results
    }

    async fn replay_one(
        &self,
        did: Uuid,
        metadata_overrides: &HashMap<String, String>,
    ) -> Result<Uuid> {
        let now = self.clock.now();
        let mut unit = self
            .store
            .load(did)
            .await?
            .ok_or(CoreError::NotFound(did))?;
        if let Some(reason) = unit.content_deleted_reason.clone() {
            return Err(CoreError::ContentGone { did, reason });
        }
        if unit.replayed.is_some() {
            return Err(CoreError::InvalidRequest(format!(
                "DeltaFile {did} has already been replayed"
            )));
        }
        let content = unit
            .protocol_stack
            .first()
            .map(|layer| layer.content.clone())
            .unwrap_or_default();
        let mut source = unit.source.clone();
        for (key, value) in metadata_overrides {
            source.metadata.insert(key.clone(), value.clone());
        }

        let child_did = Uuid::new_v4();
        let mut child = DeltaFile::new_ingress(child_did, source, content, vec![did], now);
        let next = self.advance_or_force(&mut child)?;
        let outcome = self.partition_next(&child, next);

        unit.replayed = Some(now);
        unit.replay_did = Some(child_did);
        unit.child_dids.push(child_did);
        unit.modified = now;
        self.save_versioned(&mut unit).await?;
        self.store
            .insert_batch(std::slice::from_mut(&mut child))
            .await?;
        metrics::counter!("conveyor_units_replayed").increment(1);
        self.finish(outcome).await;
        Ok(child_did)
    }

    /// Cooperative cancel: the stage flips to CANCELLED and future events
    /// for the unit are dropped. In-flight workers are never interrupted.
    pub async fn cancel(&self, dids: &[Uuid]) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(dids.len());
        for &did in dids {
            let result = match self.cancel_one(did).await {
                Ok(()) => BatchResult::ok(did),
                Err(e) => BatchResult::err(did, e.to_string()),
            };
            results.push(result);
        }
        results
    }

    async fn cancel_one(&self, did: Uuid) -> Result<()> {
        let now = self.clock.now();
        let mut unit = self
            .store
            .load(did)
            .await?
            .ok_or(CoreError::NotFound(did))?;
        if unit.stage.is_terminal() {
            return Err(CoreError::InvalidRequest(format!(
                "DeltaFile {did} is already in terminal stage {:?}",
                unit.stage
            )));
        }
        unit.cancel(now);
        self.save_versioned(&mut unit).await?;
        metrics::counter!("conveyor_units_cancelled").increment(1);
        Ok(())
    }

    /// Record operator acknowledgement on errored units.
    pub async fn acknowledge(&self, dids: &[Uuid], reason: &str) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(dids.len());
        for &did in dids {
            let result = match self.acknowledge_one(did, reason).await {
                Ok(()) => BatchResult::ok(did),
                Err(e) => BatchResult::err(did, e.to_string()),
            };
            results.push(result);
        }
        results
    }

    async fn acknowledge_one(&self, did: Uuid, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let mut unit = self
            .store
            .load(did)
            .await?
            .ok_or(CoreError::NotFound(did))?;
        if unit.stage != Stage::Error {
            return Err(CoreError::InvalidRequest(format!(
                "DeltaFile {did} is not in the ERROR stage"
            )));
        }
        unit.error_acknowledged = Some(now);
        unit.error_acknowledged_reason = Some(reason.to_string());
        unit.next_auto_resume = None;
        unit.next_auto_resume_reason = None;
        unit.modified = now;
        self.save_versioned(&mut unit).await?;
        Ok(())
    }

    async fn save_versioned(&self, unit: &mut DeltaFile) -> Result<()> {
        match self.store.save(unit).await {
            Ok(()) => Ok(()),
            Err(StoreError::VersionConflict(did)) => Err(CoreError::OptimisticConflict(did)),
            Err(e) => Err(CoreError::Store(e)),
        }
    }
}

fn stage_for(flow_type: FlowType) -> Stage {
    match flow_type {
        FlowType::Ingress => Stage::Ingress,
        FlowType::Enrich => Stage::Enrich,
        FlowType::Egress => Stage::Egress,
    }
}

fn stage_rank(stage: Stage) -> u8 {
    match stage {
        Stage::Ingress => 0,
        Stage::Enrich => 1,
        Stage::Egress => 2,
        Stage::Complete | Stage::Error | Stage::Cancelled => 3,
    }
}

#[async_trait]
impl JoinResolver for EventDispatcher {
    /// Merge the participants into one aggregate child carrying the union
    /// of their latest content, queue the join action on it, and retire
    /// the participants.
    async fn complete_join(&self, entry: &JoinEntry, dids: Vec<Uuid>) -> Result<()> {
        let now = self.clock.now();
        let definition = &entry.definition;
        let Some((config, action_type)) = self
            .registry
            .action_config(&definition.flow, &definition.action)
        else {
            warn!(key = %definition.key(), "join action no longer configured; failing participants");
            return self.fail_join(entry, dids).await;
        };

        let mut content = Vec::new();
        let mut participants = Vec::new();
        for did in &dids {
            match self.store.load(*did).await? {
                Some(unit) => {
                    if let Some(layer) = unit.last_protocol_layer() {
                        content.extend(layer.content.iter().cloned());
                    }
                    participants.push(unit.did);
                }
                None => warn!(did = %did, "join participant no longer exists"),
            }
        }

        let child_did = Uuid::new_v4();
        let mut child = DeltaFile::new_ingress(
            child_did,
            SourceInfo {
                filename: format!("joined:{}", definition.action),
                flow: definition.flow.clone(),
                metadata: HashMap::new(),
            },
            content,
            participants.clone(),
            now,
        );
        child.set_stage(definition.stage);
        child.queue_action(
            &definition.flow,
            flow_type_for(action_type),
            &definition.action,
            action_type,
            Some(&config.action_class),
            ActionState::Queued,
            now,
        );
        self.store
            .insert_batch(std::slice::from_mut(&mut child))
            .await?;

        for did in participants {
            let flow = definition.flow.clone();
            let action = definition.action.clone();
            self.mutate_and_requeue(did, move |unit, now| {
                unit.split_action(&flow, &action, now);
                unit.child_dids.push(child_did);
                Ok(())
            })
            .await?;
        }

        let input = ActionInput {
            queue_name: config.action_class.clone(),
            did: child_did,
            flow: definition.flow.clone(),
            action: definition.action.clone(),
            action_created: now,
            cold_queued: false,
            parameters: config.parameters.clone(),
            return_address: None,
        };
        if let Err(e) = self.queue.put_actions(&[input], false).await {
            warn!(did = %child_did, error = %e, "join child enqueue failed; requeue sweep will recover");
        }
        info!(key = %definition.key(), child = %child_did, count = entry.count, "join completed");
        metrics::counter!("conveyor_joins_completed").increment(1);
        Ok(())
    }

    async fn fail_join(&self, entry: &JoinEntry, dids: Vec<Uuid>) -> Result<()> {
        let cause = format!(
            "Join incomplete: received {} of {} expected arrivals before the deadline",
            entry.count,
            entry.min_num.unwrap_or(1)
        );
        let definition = entry.definition.clone();
        for did in dids {
            let cause = cause.clone();
            let flow = definition.flow.clone();
            let action = definition.action.clone();
            let result = self
                .mutate_and_requeue(did, move |unit, now| {
                    unit.error_action(&flow, &action, &cause, "", now);
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                error!(did = %did, error = %e, "failed to record join failure");
            }
        }
        metrics::counter!("conveyor_joins_failed").increment(1);
        Ok(())
    }
}

///// The queue-consume loop: blocking-take events and dispatch each on a
/// spawned task gated by a semaphore.
pub struct DispatchLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<AnyResult<()>>,
}

impl DispatchLoop {
    pub fn start(dispatcher: Arc<EventDispatcher>, queue: ActionEventQueue) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let max_concurrent = dispatcher.config.max_concurrent.max(1);
        let handle = tokio::spawn(async move {
            info!(max_concurrent, "starting event dispatch loop");
            let semaphore = Arc::new(Semaphore::new(max_concurrent));
            loop {
                tokio::select! {
                    event = queue.take_event() => {
                        let event = match event {
                            Ok(event) => event,
                            Err(e) => {
                                error!(error = %e, "event take failed");
                                continue;
                            }
                        };
                        let permit = match Arc::clone(&semaphore).acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return Ok(()),
                        };
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = dispatcher.handle_event(event).await {
                                match e {
                                    CoreError::NotFound(_) | CoreError::UnexpectedAction { .. } => {
                                        warn!(error = %e, "dropped action event");
                                    }
                                    _ => error!(error = %e, "action event handling failed"),
                                }
                            }
                        });
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("event dispatch loop shutting down");
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
            Err(e) => Err(anyhow!("dispatch loop task panicked: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::flows::{
        ActionConfiguration, EgressActionConfiguration, EgressFlow, FormatActionConfiguration,
        IngressFlow, JoinSpec, LoadActionConfiguration, TransformActionConfiguration,
        ValidateActionConfiguration,
    };
    use crate::join::JoinConfig;
    use crate::queue::MemoryQueue;
    use crate::store::{MemoryJoinStore, MemoryUnitStore};
    use crate::types::{ProtocolLayer, Segment};
    use serde_json::Value;

    fn action(name: &str) -> ActionConfiguration {
        ActionConfiguration {
            name: name.to_string(),
            action_class: format!("org.example.{name}"),
            parameters: Value::Null,
            join: None,
        }
    }

    fn sample_ingress_flow() -> IngressFlow {
        IngressFlow {
            name: "sample".to_string(),
            test_mode: false,
            transform_actions: vec![TransformActionConfiguration {
                config: action("SampleTransform"),
            }],
            load_action: LoadActionConfiguration {
                config: action("SampleLoad"),
            },
        }
    }

    fn sample_egress_flow() -> EgressFlow {
        EgressFlow {
            name: "sampleEgress".to_string(),
            test_mode: false,
            format_action: FormatActionConfiguration {
                config: action("SampleFormat"),
                requires_domains: vec![],
                requires_enrichments: vec![],
            },
            validate_actions: vec![ValidateActionConfiguration {
                config: action("SampleValidate"),
            }],
            egress_action: EgressActionConfiguration {
                config: action("SampleEgress"),
            },
            include_ingress_flows: vec![],
            exclude_ingress_flows: vec![],
        }
    }

    struct Harness {
        dispatcher: EventDispatcher,
        store: Arc<MemoryUnitStore>,
        registry: Arc<FlowRegistry>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryUnitStore::new());
        let registry = Arc::new(FlowRegistry::new());
        registry.set_ingress_flow(sample_ingress_flow());
        registry.set_egress_flow(sample_egress_flow());
        let queue = ActionEventQueue::new(Arc::new(MemoryQueue::new()));
        let join = Arc::new(JoinCoordinator::new(
            Arc::new(MemoryJoinStore::new()),
            system_clock(),
            JoinConfig::default(),
        ));
        let dispatcher = EventDispatcher::new(
            Arc::clone(&store) as Arc<dyn UnitStore>,
            Arc::clone(&registry),
            queue,
            join,
            system_clock(),
            DispatcherConfig::default(),
        );
        Harness {
            dispatcher,
            store,
            registry,
        }
    }

    fn ingress_input(flow: &str) -> IngressInput {
        IngressInput {
            source: SourceInfo {
                filename: "input.bin".to_string(),
                flow: flow.to_string(),
                metadata: HashMap::new(),
            },
            content: vec![Content {
                name: None,
                media_type: "application/octet-stream".to_string(),
                segment: Segment {
                    id: Uuid::new_v4(),
                    offset: 0,
                    size: 64,
                },
            }],
        }
    }

    fn event(did: Uuid, flow: &str, action: &str, kind: EventKind) -> ActionEvent {
        ActionEvent {
            did,
            flow: flow.to_string(),
            action: action.to_string(),
            start: Some(Utc::now()),
            stop: Some(Utc::now()),
            kind,
        }
    }

    fn layer(action: &str) -> ProtocolLayer {
        ProtocolLayer {
            action: action.to_string(),
            content: vec![Content {
                name: None,
                media_type: "application/json".to_string(),
                segment: Segment {
                    id: Uuid::new_v4(),
                    offset: 0,
                    size: 32,
                },
            }],
            metadata: HashMap::new(),
        }
    }

    fn format_payload() -> FormatPayload {
        FormatPayload {
            filename: "out.bin".to_string(),
            metadata: HashMap::new(),
            segment: Segment {
                id: Uuid::new_v4(),
                offset: 0,
                size: 48,
            },
        }
    }

    #[tokio::test]
    async fn full_pipeline_runs_to_completion() {
        let h = harness();
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();

        let unit = h.store.load(did).await.unwrap().unwrap();
        assert!(unit.has_pending_action("sample", "SampleTransform"));

        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Transform {
                    protocol_layer: Some(layer("SampleTransform")),
                },
            ))
            .await
            .unwrap();
        let unit = h.store.load(did).await.unwrap().unwrap();
        assert!(unit.has_pending_action("sample", "SampleLoad"));

        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleLoad",
                EventKind::Load {
                    protocol_layer: Some(layer("SampleLoad")),
                    domains: vec![],
                },
            ))
            .await
            .unwrap();
        let unit = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Egress);
        assert!(unit.has_pending_action("sampleEgress", "SampleFormat"));

        h.dispatcher
            .handle_event(event(
                did,
                "sampleEgress",
                "SampleFormat",
                EventKind::Format {
                    format: format_payload(),
                },
            ))
            .await
            .unwrap();
        let unit = h.store.load(did).await.unwrap().unwrap();
        assert!(unit.has_pending_action("sampleEgress", "SampleValidate"));
        assert_eq!(unit.formatted_data.len(), 1);
        assert_eq!(unit.formatted_data[0].egress_actions, vec!["SampleEgress"]);

        h.dispatcher
            .handle_event(event(did, "sampleEgress", "SampleValidate", EventKind::Validate))
            .await
            .unwrap();
        h.dispatcher
            .handle_event(event(did, "sampleEgress", "SampleEgress", EventKind::Egress))
            .await
            .unwrap();

        let unit = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Complete);
        assert!(unit.egressed);
        assert_eq!(unit.egress_flows, vec!["sampleEgress"]);
    }

    #[tokio::test]
    async fn duplicate_event_is_rejected_without_mutation() {
        let h = harness();
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();
        let transform = event(
            did,
            "sample",
            "SampleTransform",
            EventKind::Transform {
                protocol_layer: None,
            },
        );
        h.dispatcher.handle_event(transform.clone()).await.unwrap();
        let before = h.store.load(did).await.unwrap().unwrap();

        let err = h.dispatcher.handle_event(transform).await.unwrap_err();
        assert!(matches!(err, CoreError::UnexpectedAction { .. }));
        let after = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(after.version, before.version);
    }

    #[tokio::test]
    async fn events_for_cancelled_units_are_dropped() {
        let h = harness();
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();
        let results = h.dispatcher.cancel(&[did]).await;
        assert!(results[0].success);

        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Transform {
                    protocol_layer: None,
                },
            ))
            .await
            .unwrap();
        let unit = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Cancelled);

        let again = h.dispatcher.cancel(&[did]).await;
        assert!(!again[0].success);
    }

    #[tokio::test]
    async fn split_fails_fast_and_persists_no_children() {
        let h = harness();
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Transform {
                    protocol_layer: None,
                },
            ))
            .await
            .unwrap();

        let children = vec![
            ChildSpec {
                source: SourceInfo {
                    filename: "a".to_string(),
                    flow: "sample".to_string(),
                    metadata: HashMap::new(),
                },
                content: vec![],
            },
            ChildSpec {
                source: SourceInfo {
                    filename: "b".to_string(),
                    flow: "not-running".to_string(),
                    metadata: HashMap::new(),
                },
                content: vec![],
            },
        ];
        h.dispatcher
            .handle_event(event(did, "sample", "SampleLoad", EventKind::Split { children }))
            .await
            .unwrap();

        let unit = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Error);
        assert!(unit.child_dids.is_empty());
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn split_creates_children_and_retires_the_parent() {
        let h = harness();
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Transform {
                    protocol_layer: None,
                },
            ))
            .await
            .unwrap();

        let child = |name: &str| ChildSpec {
            source: SourceInfo {
                filename: name.to_string(),
                flow: "sample".to_string(),
                metadata: HashMap::new(),
            },
            content: vec![],
        };
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleLoad",
                EventKind::Split {
                    children: vec![child("a"), child("b")],
                },
            ))
            .await
            .unwrap();

        let parent = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(parent.stage, Stage::Complete);
        assert_eq!(parent.child_dids.len(), 2);
        assert_eq!(h.store.len().await, 3);
        for child_did in &parent.child_dids {
            let child = h.store.load(*child_did).await.unwrap().unwrap();
            assert_eq!(child.parent_dids, vec![did]);
            assert!(child.has_pending_action("sample", "SampleTransform"));
        }
    }

    #[tokio::test]
    async fn format_many_forks_one_child_per_payload() {
        let h = harness();
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Transform {
                    protocol_layer: None,
                },
            ))
            .await
            .unwrap();
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleLoad",
                EventKind::Load {
                    protocol_layer: Some(layer("SampleLoad")),
                    domains: vec![],
                },
            ))
            .await
            .unwrap();

        h.dispatcher
            .handle_event(event(
                did,
                "sampleEgress",
                "SampleFormat",
                EventKind::FormatMany {
                    formats: vec![format_payload(), format_payload()],
                },
            ))
            .await
            .unwrap();

        let parent = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(parent.stage, Stage::Complete);
        assert_eq!(parent.child_dids.len(), 2);
        for child_did in &parent.child_dids {
            let child = h.store.load(*child_did).await.unwrap().unwrap();
            assert_eq!(child.formatted_data.len(), 1);
            assert!(child.has_pending_action("sampleEgress", "SampleValidate"));
        }
    }

    #[tokio::test]
    async fn error_then_resume_requeues_the_action() {
        let h = harness();
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Error {
                    cause: "boom".to_string(),
                    context: "stack".to_string(),
                },
            ))
            .await
            .unwrap();
        let unit = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Error);
        assert!(unit.next_auto_resume.is_none());

        let results = h.dispatcher.resume(&[did]).await;
        assert!(results[0].success);
        let unit = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Ingress);
        assert!(unit.has_pending_action("sample", "SampleTransform"));
        let action = unit.action("sample", "SampleTransform").unwrap();
        assert_eq!(action.attempt, 2);

        let rerun = h.dispatcher.resume(&[did]).await;
        assert!(!rerun[0].success);
    }

    #[tokio::test]
    async fn matching_policy_stamps_auto_resume() {
        use crate::backoff::{BackoffSpec, ResumePolicy};
        let h = harness();
        let dispatcher = h.dispatcher.with_policies(ResumePolicies::new(vec![ResumePolicy {
            name: "transient".to_string(),
            error_substring: Some("timeout".to_string()),
            flow: None,
            action: None,
            action_type: None,
            max_attempts: 5,
            backoff: BackoffSpec {
                delay_secs: 60,
                multiplier: None,
                max_delay_secs: None,
                random: false,
            },
        }]));
        let did = dispatcher.ingress(ingress_input("sample")).await.unwrap();
        dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Error {
                    cause: "connection timeout".to_string(),
                    context: String::new(),
                },
            ))
            .await
            .unwrap();

        let unit = h.store.load(did).await.unwrap().unwrap();
        assert!(unit.next_auto_resume.is_some());
        assert_eq!(unit.next_auto_resume_reason.as_deref(), Some("transient"));
    }

    #[tokio::test]
    async fn acknowledge_requires_error_stage() {
        let h = harness();
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();
        let denied = h.dispatcher.acknowledge(&[did], "noise").await;
        assert!(!denied[0].success);

        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Error {
                    cause: "boom".to_string(),
                    context: String::new(),
                },
            ))
            .await
            .unwrap();
        let results = h.dispatcher.acknowledge(&[did], "known noise").await;
        assert!(results[0].success);
        let unit = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.error_acknowledged_reason.as_deref(), Some("known noise"));
    }

    #[tokio::test]
    async fn replay_creates_a_child_once() {
        let h = harness();
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("replayReason".to_string(), "ops".to_string());
        let results = h.dispatcher.replay(&[did], &overrides).await;
        assert!(results[0].success);
        let child_did = results[0].did;
        assert_ne!(child_did, did);

        let parent = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(parent.replay_did, Some(child_did));
        let child = h.store.load(child_did).await.unwrap().unwrap();
        assert_eq!(child.parent_dids, vec![did]);
        assert_eq!(
            child.source.metadata.get("replayReason").map(String::as_str),
            Some("ops")
        );

        let again = h.dispatcher.replay(&[did], &HashMap::new()).await;
        assert!(!again[0].success);
    }

    #[tokio::test]
    async fn filter_from_domain_action_becomes_an_error() {
        use crate::flows::{DomainActionConfiguration, EnrichFlow};
        let h = harness();
        h.registry.set_enrich_flow(EnrichFlow {
            name: "sampleEnrich".to_string(),
            domain_actions: vec![DomainActionConfiguration {
                config: action("SampleDomain"),
                requires_domains: vec![],
            }],
            enrich_actions: vec![],
        });

        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Transform {
                    protocol_layer: None,
                },
            ))
            .await
            .unwrap();
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleLoad",
                EventKind::Load {
                    protocol_layer: None,
                    domains: vec![],
                },
            ))
            .await
            .unwrap();
        let unit = h.store.load(did).await.unwrap().unwrap();
        assert!(unit.has_pending_action("sampleEnrich", "SampleDomain"));

        h.dispatcher
            .handle_event(event(
                did,
                "sampleEnrich",
                "SampleDomain",
                EventKind::Filter {
                    message: "not for me".to_string(),
                },
            ))
            .await
            .unwrap();
        let unit = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Error);
        assert!(!unit.filtered);
        let domain = unit.action("sampleEnrich", "SampleDomain").unwrap();
        assert!(domain
            .error_cause
            .as_deref()
            .unwrap()
            .contains("Illegal filter"));
    }

    #[tokio::test]
    async fn join_resolves_when_max_arrivals_reached() {
        let h = harness();
        let mut load = action("JoinLoad");
        load.join = Some(JoinSpec {
            max_age_secs: 60,
            min_num: None,
            max_num: 2,
            metadata_key: None,
        });
        h.registry.set_ingress_flow(IngressFlow {
            name: "joiner".to_string(),
            test_mode: false,
            transform_actions: vec![],
            load_action: LoadActionConfiguration { config: load },
        });

        let first = h.dispatcher.ingress(ingress_input("joiner")).await.unwrap();
        let unit = h.store.load(first).await.unwrap().unwrap();
        assert_eq!(
            unit.action("joiner", "JoinLoad").unwrap().state,
            ActionState::Joining
        );

        let second = h.dispatcher.ingress(ingress_input("joiner")).await.unwrap();

        // Both participants were retired in favor of the aggregate child.
        assert_eq!(h.store.len().await, 3);
        for did in [first, second] {
            let unit = h.store.load(did).await.unwrap().unwrap();
            assert_eq!(unit.stage, Stage::Complete);
            assert_eq!(
                unit.action("joiner", "JoinLoad").unwrap().state,
                ActionState::Split
            );
            assert_eq!(unit.child_dids.len(), 1);
        }

        let child_did = h
            .store
            .load(first)
            .await
            .unwrap()
            .unwrap()
            .child_dids[0];
        let child = h.store.load(child_did).await.unwrap().unwrap();
        assert_eq!(child.parent_dids.len(), 2);
        assert!(child.has_pending_action("joiner", "JoinLoad"));
    }

    #[tokio::test]
    async fn missing_egress_flow_forces_error() {
        let h = harness();
        h.registry.remove_egress_flow("sampleEgress");
        let did = h.dispatcher.ingress(ingress_input("sample")).await.unwrap();
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleTransform",
                EventKind::Transform {
                    protocol_layer: None,
                },
            ))
            .await
            .unwrap();
        h.dispatcher
            .handle_event(event(
                did,
                "sample",
                "SampleLoad",
                EventKind::Load {
                    protocol_layer: None,
                    domains: vec![],
                },
            ))
            .await
            .unwrap();

        let unit = h.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Error);
        assert!(unit
            .action("sample", NO_EGRESS_FLOW_ACTION)
            .is_some());
    }
}
