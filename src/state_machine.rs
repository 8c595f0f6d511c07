//! Pure stage-advancement logic.
//!
//! `advance` inspects a unit's action history against the flow registry and
//! decides what runs next. It mutates only the unit (action records, stage,
//! derived totals) and returns the queue work for the caller to dispatch.
//! It never touches the store, the queue, or the join coordinator: a
//! [`NextAction`] carrying a join spec is returned flagged and the event
//! dispatcher routes it through the coordinator.
//!
//! Stage fallthrough is an explicit loop: a stage handler that finds no
//! work reports `Proceed` and the next handler runs in the same call, so a
//! unit never stalls waiting for an event that will not come.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{CoreError, Result};
use crate::flows::{
    ActionConfiguration, EgressFlow, EnrichActionConfiguration, FlowRegistry, IngressFlow,
};
use crate::types::{
    ActionState, ActionType, DeltaFile, FlowType, Stage, SYNTHETIC_EGRESS_FOR_TEST_EGRESS,
    SYNTHETIC_EGRESS_FOR_TEST_INGRESS,
};

/// Decides whether a would-be queue insert should be cold-queued instead.
/// Receives the action class and the number of inserts this call has
/// already planned for that class.
pub type ColdPredicate<'a> = &'a dyn Fn(&str, u64) -> bool;

/// Always-warm predicate for callers without an admission tier.
pub fn never_cold(_class: &str, _pending: u64) -> bool {
    false
}

#[derive(Debug, Clone)]
pub struct NextAction {
    pub flow: String,
    pub flow_type: FlowType,
    pub action_type: ActionType,
    pub config: ActionConfiguration,
    pub cold: bool,
}

impl NextAction {
    pub fn is_join(&self) -> bool {
        self.config.join.is_some()
    }
}

enum StageOutcome {
    /// Work queued or in flight; wait for events.
    Stop,
    /// Nothing to do at this stage; evaluate the next one in the same call.
    Proceed,
}

struct AdvanceContext<'a> {
    registry: &'a FlowRegistry,
    cold: ColdPredicate<'a>,
    now: DateTime<Utc>,
    next: Vec<NextAction>,
    class_counts: HashMap<String, u64>,
}

impl<'a> AdvanceContext<'a> {
    fn enqueue(
        &mut self,
        unit: &mut DeltaFile,
        flow: &str,
        flow_type: FlowType,
        action_type: ActionType,
        config: &ActionConfiguration,
    ) {
        let pending = self
            .class_counts
            .entry(config.action_class.clone())
            .or_insert(0);
        *pending += 1;
        let state = if config.join.is_some() {
            ActionState::Joining
        } else if (self.cold)(&config.action_class, *pending) {
            ActionState::ColdQueued
        } else {
            ActionState::Queued
        };
        unit.queue_action(
            flow,
            flow_type,
            &config.name,
            action_type,
            Some(&config.action_class),
            state,
            self.now,
        );
        self.next.push(NextAction {
            flow: flow.to_string(),
            flow_type,
            action_type,
            config: config.clone(),
            cold: state == ActionState::ColdQueued,
        });
    }
}

/// Advance the unit as far as its history allows. Returns the next actions
/// to dispatch; the unit's action records, stage, and total-bytes are
/// updated in place.
pub fn advance(
    unit: &mut DeltaFile,
    registry: &FlowRegistry,
    now: DateTime<Utc>,
    cold: ColdPredicate<'_>,
) -> Result<Vec<NextAction>> {
    let mut ctx = AdvanceContext {
        registry,
        cold,
        now,
        next: Vec::new(),
        class_counts: HashMap::new(),
    };

    loop {
        let outcome = match unit.stage {
            Stage::Ingress => ingress_stage(unit, &mut ctx)?,
            Stage::Enrich => enrich_stage(unit, &mut ctx),
            Stage::Egress => egress_stage(unit, &mut ctx)?,
            Stage::Complete | Stage::Error | Stage::Cancelled => StageOutcome::Stop,
        };
        match outcome {
            StageOutcome::Stop => break,
            StageOutcome::Proceed => match unit.stage {
                Stage::Ingress => unit.set_stage(Stage::Enrich),
                Stage::Enrich => unit.set_stage(Stage::Egress),
                _ => break,
            },
        }
    }

    if !unit.stage.is_terminal() && !unit.has_pending_actions() {
        let terminal = if unit.has_errored_action() {
            Stage::Error
        } else {
            Stage::Complete
        };
        unit.set_stage(terminal);
        unit.modified = now;
    }
    unit.recalculate_total_bytes();
    Ok(ctx.next)
}

fn ingress_stage(unit: &mut DeltaFile, ctx: &mut AdvanceContext<'_>) -> Result<StageOutcome> {
    if unit.has_errored_action() || unit.has_filtered_action() || unit.has_split_action() {
        return Ok(StageOutcome::Stop);
    }
    let source_flow = unit.source.flow.clone();
    let flow: IngressFlow = ctx
        .registry
        .ingress_flow(&source_flow)
        .ok_or_else(|| CoreError::MissingFlow(source_flow.clone()))?;

    // Transforms run one at a time, in declared order.
    for transform in &flow.transform_actions {
        if unit.has_terminal_action(&source_flow, &transform.config.name) {
            continue;
        }
        if unit.is_new_action(&source_flow, &transform.config.name) {
            ctx.enqueue(
                unit,
                &source_flow,
                FlowType::Ingress,
                ActionType::Transform,
                &transform.config,
            );
        }
        return Ok(StageOutcome::Stop);
    }

    let load = &flow.load_action.config;
    if unit.has_completed_action(&source_flow, &load.name) {
        return Ok(StageOutcome::Proceed);
    }
    if unit.is_new_action(&source_flow, &load.name) {
        ctx.enqueue(unit, &source_flow, FlowType::Ingress, ActionType::Load, load);
    }
    Ok(StageOutcome::Stop)
}

fn enrich_stage(unit: &mut DeltaFile, ctx: &mut AdvanceContext<'_>) -> StageOutcome {
    if unit.has_errored_action() {
        return StageOutcome::Stop;
    }
    let flows = ctx.registry.enrich_flows();

    // Domain actions fan out first; enrich actions wait for them.
    let mut domain_pending = false;
    for flow in &flows {
        for domain in &flow.domain_actions {
            if unit.has_terminal_action(&flow.name, &domain.config.name) {
                continue;
            }
            if !unit.has_domains(&domain.requires_domains) {
                continue;
            }
            if unit.is_new_action(&flow.name, &domain.config.name) {
                ctx.enqueue(
                    unit,
                    &flow.name,
                    FlowType::Enrich,
                    ActionType::Domain,
                    &domain.config,
                );
            }
            domain_pending = true;
        }
    }
    if domain_pending {
        return StageOutcome::Stop;
    }

    let mut enrich_pending = false;
    for flow in &flows {
        for enrich in &flow.enrich_actions {
            if unit.has_terminal_action(&flow.name, &enrich.config.name) {
                continue;
            }
            if !enrich_ready(unit, enrich) {
                continue;
            }
            if unit.is_new_action(&flow.name, &enrich.config.name) {
                ctx.enqueue(
                    unit,
                    &flow.name,
                    FlowType::Enrich,
                    ActionType::Enrich,
                    &enrich.config,
                );
            }
            enrich_pending = true;
        }
    }
    if enrich_pending {
        StageOutcome::Stop
    } else {
        StageOutcome::Proceed
    }
}

fn enrich_ready(unit: &DeltaFile, config: &EnrichActionConfiguration) -> bool {
    if !unit.has_domains(&config.requires_domains) {
        return false;
    }
    if !unit.has_enrichments(&config.requires_enrichments) {
        return false;
    }
    config
        .requires_metadata
        .iter()
        .all(|(key, value)| metadata_value(unit, key).as_deref() == Some(value.as_str()))
}

/// Metadata lookup: last protocol layer first, source metadata as fallback.
fn metadata_value(unit: &DeltaFile, key: &str) -> Option<String> {
    unit.last_protocol_layer()
        .and_then(|layer| layer.metadata.get(key).cloned())
        .or_else(|| unit.source.metadata.get(key).cloned())
}

fn egress_stage(unit: &mut DeltaFile, ctx: &mut AdvanceContext<'_>) -> Result<StageOutcome> {
    let source_flow = unit.source.flow.clone();
    let flows = ctx.registry.matching_egress_flows(&source_flow);
    if flows.is_empty() {
        return Err(CoreError::MissingEgressFlow(unit.did));
    }
    let ingress_test_mode = ctx
        .registry
        .ingress_flow(&source_flow)
        .map(|f| f.test_mode)
        .unwrap_or(false);

    for flow in &flows {
        egress_flow_actions(unit, ctx, flow, ingress_test_mode);
    }
    Ok(StageOutcome::Stop)
}

/// Readiness order within one egress flow: format, then validates, then
/// egress once everything before it is complete.
fn egress_flow_actions(
    unit: &mut DeltaFile,
    ctx: &mut AdvanceContext<'_>,
    flow: &EgressFlow,
    ingress_test_mode: bool,
) {
    let format = &flow.format_action;
    if !unit.has_domains(&format.requires_domains)
        || !unit.has_enrichments(&format.requires_enrichments)
    {
        return;
    }
    unit.add_egress_flow(&flow.name);

    if !unit.has_terminal_action(&flow.name, &format.config.name) {
        if unit.is_new_action(&flow.name, &format.config.name) {
            ctx.enqueue(
                unit,
                &flow.name,
                FlowType::Egress,
                ActionType::Format,
                &format.config,
            );
        }
        return;
    }
    if !unit.has_completed_action(&flow.name, &format.config.name) {
        // Format reached a terminal non-complete state; nothing further.
        return;
    }

    let mut validate_pending = false;
    for validate in &flow.validate_actions {
        if unit.has_terminal_action(&flow.name, &validate.config.name) {
            continue;
        }
        if unit.is_new_action(&flow.name, &validate.config.name) {
            ctx.enqueue(
                unit,
                &flow.name,
                FlowType::Egress,
                ActionType::Validate,
                &validate.config,
            );
        }
        validate_pending = true;
    }
    if validate_pending {
        return;
    }
    let validate_names: Vec<String> = flow
        .validate_actions
        .iter()
        .map(|v| v.config.name.clone())
        .collect();
    if !unit.has_completed_actions(&flow.name, &validate_names) {
        return;
    }

    if flow.test_mode || ingress_test_mode {
        let (name, reason) = if flow.test_mode {
            (
                SYNTHETIC_EGRESS_FOR_TEST_EGRESS,
                format!("Egress flow '{}' in test mode", flow.name),
            )
        } else {
            (
                SYNTHETIC_EGRESS_FOR_TEST_INGRESS,
                format!("Ingress flow '{}' in test mode", unit.source.flow),
            )
        };
        unit.add_complete_action(&flow.name, FlowType::Egress, name, ActionType::Egress, ctx.now);
        unit.test_mode_reason = Some(reason);
        return;
    }

    let egress = &flow.egress_action.config;
    if !unit.has_terminal_action(&flow.name, &egress.name) && unit.is_new_action(&flow.name, &egress.name)
    {
        ctx.enqueue(unit, &flow.name, FlowType::Egress, ActionType::Egress, egress);
    }
}
