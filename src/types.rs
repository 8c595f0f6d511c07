//! Core data model for the orchestration engine.
//!
//! A [`DeltaFile`] is one unit of data moving through the pipeline. It keeps
//! the full history of every action that touched it, grouped per flow, plus
//! the accumulated protocol layers, domains, enrichments and formatted
//! output produced along the way. Everything here is serde-serializable:
//! the durable store persists the whole unit as one JSON document and the
//! queue ships [`ActionInput`]/[`ActionEvent`] as JSON payloads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the synthetic action recorded COMPLETE when a unit is ingressed.
pub const INGRESS_ACTION: &str = "IngressAction";
/// Synthetic terminal egress recorded when the egress flow is in test mode.
pub const SYNTHETIC_EGRESS_FOR_TEST_EGRESS: &str = "SyntheticEgressForTestEgress";
/// Synthetic terminal egress recorded when the ingress flow is in test mode.
pub const SYNTHETIC_EGRESS_FOR_TEST_INGRESS: &str = "SyntheticEgressForTestIngress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Ingress,
    Enrich,
    Egress,
    Complete,
    Error,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error | Stage::Cancelled)
    }

    /// Position in the forward pipeline; terminal stages share the top slot.
    fn rank(self) -> u8 {
        match self {
            Stage::Ingress => 0,
            Stage::Enrich => 1,
            Stage::Egress => 2,
            Stage::Complete | Stage::Error | Stage::Cancelled => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    Ingress,
    Enrich,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Ingress,
    Transform,
    Load,
    Domain,
    Enrich,
    Format,
    Validate,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Queued,
    /// Durably recorded but deliberately kept off the live queue; drained
    /// back by the admission tier.
    ColdQueued,
    /// Parked awaiting fan-in resolution; pending, but never requeued by
    /// the sweep.
    Joining,
    Complete,
    Error,
    Filtered,
    Split,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Complete | ActionState::Error | ActionState::Filtered | ActionState::Split
        )
    }

    pub fn is_pending(self) -> bool {
        !self.is_terminal()
    }
}

/// One named processing step with its own state and attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Implementation class the action was queued under; `None` for
    /// synthetic actions that never hit the queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_class: Option<String>,
    pub state: ActionState,
    pub created: DateTime<Utc>,
    pub queued: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered_cause: Option<String>,
}

/// A flow's slice of a unit's action history, kept in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFlow {
    pub name: String,
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    pub actions: Vec<Action>,
}

/// A byte range in content storage. Ranges with the same id may overlap;
/// total-bytes accounting collapses them to one min-start/max-end span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub offset: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub media_type: String,
    pub segment: Segment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolLayer {
    pub action: String,
    pub content: Vec<Content>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEntry {
    pub name: String,
    pub value: String,
    pub media_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrichment {
    pub name: String,
    pub value: String,
    pub media_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattedData {
    pub filename: String,
    pub format_action: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub segment: Segment,
    pub egress_actions: Vec<String>,
    pub validate_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub filename: String,
    pub flow: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// One unit of data moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaFile {
    pub did: Uuid,
    /// Optimistic-concurrency token, bumped by the store on every save.
    pub version: i64,
    pub stage: Stage,
    pub source: SourceInfo,
    pub flows: Vec<UnitFlow>,
    pub protocol_stack: Vec<ProtocolLayer>,
    pub domains: Vec<DomainEntry>,
    pub enrichments: Vec<Enrichment>,
    pub formatted_data: Vec<FormattedData>,
    pub parent_dids: Vec<Uuid>,
    pub child_dids: Vec<Uuid>,
    pub total_bytes: i64,
    pub egressed: bool,
    pub filtered: bool,
    pub egress_flows: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_mode_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_acknowledged: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_acknowledged_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_did: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_deleted: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_deleted_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_auto_resume: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_auto_resume_reason: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl DeltaFile {
    /// Build a freshly ingressed unit: synthetic ingress action already
    /// COMPLETE, first protocol layer holding the ingressed content.
    pub fn new_ingress(
        did: Uuid,
        source: SourceInfo,
        content: Vec<Content>,
        parent_dids: Vec<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        let flow = source.flow.clone();
        let ingress_action = Action {
            name: INGRESS_ACTION.to_string(),
            action_type: ActionType::Ingress,
            action_class: None,
            state: ActionState::Complete,
            created: now,
            queued: None,
            start: Some(now),
            stop: Some(now),
            modified: now,
            attempt: 1,
            error_cause: None,
            error_context: None,
            filtered_cause: None,
        };
        let mut unit = Self {
            did,
            version: 0,
            stage: Stage::Ingress,
            source,
            flows: vec![UnitFlow {
                name: flow,
                flow_type: FlowType::Ingress,
                actions: vec![ingress_action],
            }],
            protocol_stack: Vec::new(),
            domains: Vec::new(),
            enrichments: Vec::new(),
            formatted_data: Vec::new(),
            parent_dids,
            child_dids: Vec::new(),
            total_bytes: 0,
            egressed: false,
            filtered: false,
            egress_flows: Vec::new(),
            test_mode_reason: None,
            error_acknowledged: None,
            error_acknowledged_reason: None,
            replayed: None,
            replay_did: None,
            content_deleted: None,
            content_deleted_reason: None,
            next_auto_resume: None,
            next_auto_resume_reason: None,
            created: now,
            modified: now,
        };
        unit.protocol_stack.push(ProtocolLayer {
            action: INGRESS_ACTION.to_string(),
            content,
            metadata: HashMap::new(),
        });
        unit.recalculate_total_bytes();
        unit
    }

    /// Move the stage forward. Backward transitions are ignored: the stage
    /// is monotonic, with ERROR/CANCELLED reachable from any non-terminal
    /// stage.
    pub fn set_stage(&mut self, stage: Stage) {
        if self.stage.is_terminal() && !matches!(stage, Stage::Cancelled) {
            return;
        }
        if stage.rank() >= self.stage.rank() || stage.is_terminal() {
            self.stage = stage;
        }
    }

    pub fn flow(&self, name: &str) -> Option<&UnitFlow> {
        self.flows.iter().find(|f| f.name == name)
    }

    pub fn flow_mut(&mut self, name: &str, flow_type: FlowType) -> &mut UnitFlow {
        if let Some(idx) = self.flows.iter().position(|f| f.name == name) {
            return &mut self.flows[idx];
        }
        self.flows.push(UnitFlow {
            name: name.to_string(),
            flow_type,
            actions: Vec::new(),
        });
        self.flows.last_mut().expect("flow just pushed")
    }

    pub fn action(&self, flow: &str, name: &str) -> Option<&Action> {
        self.flow(flow)
            .and_then(|f| f.actions.iter().find(|a| a.name == name))
    }

    pub fn action_mut(&mut self, flow: &str, name: &str) -> Option<&mut Action> {
        self.flows
            .iter_mut()
            .find(|f| f.name == flow)
            .and_then(|f| f.actions.iter_mut().find(|a| a.name == name))
    }

    /// True when the action has never been recorded on this unit. Fan-out
    /// stages use this to avoid re-queueing an action the unit already
    /// carries in any state.
    pub fn is_new_action(&self, flow: &str, name: &str) -> bool {
        self.action(flow, name).is_none()
    }

    pub fn has_terminal_action(&self, flow: &str, name: &str) -> bool {
        self.action(flow, name)
            .map(|a| a.state.is_terminal())
            .unwrap_or(false)
    }

    pub fn has_completed_action(&self, flow: &str, name: &str) -> bool {
        self.action(flow, name)
            .map(|a| a.state == ActionState::Complete)
            .unwrap_or(false)
    }

    pub fn has_completed_actions(&self, flow: &str, names: &[String]) -> bool {
        names.iter().all(|n| self.has_completed_action(flow, n))
    }

    pub fn has_pending_actions(&self) -> bool {
        self.flows
            .iter()
            .any(|f| f.actions.iter().any(|a| a.state.is_pending()))
    }

    pub fn has_pending_action(&self, flow: &str, name: &str) -> bool {
        self.action(flow, name)
            .map(|a| a.state.is_pending())
            .unwrap_or(false)
    }

    /// `(flow, action)` pairs currently pending, for diagnostics.
    pub fn pending_actions(&self) -> Vec<(String, String)> {
        self.flows
            .iter()
            .flat_map(|f| {
                f.actions
                    .iter()
                    .filter(|a| a.state.is_pending())
                    .map(|a| (f.name.clone(), a.name.clone()))
            })
            .collect()
    }

    pub fn has_errored_action(&self) -> bool {
        self.any_action_in_state(ActionState::Error)
    }

    pub fn has_filtered_action(&self) -> bool {
        self.any_action_in_state(ActionState::Filtered)
    }

    pub fn has_split_action(&self) -> bool {
        self.any_action_in_state(ActionState::Split)
    }

    fn any_action_in_state(&self, state: ActionState) -> bool {
        self.flows
            .iter()
            .any(|f| f.actions.iter().any(|a| a.state == state))
    }

    /// Record a new pending action, or re-queue an existing non-terminal
    /// record. Terminal records are left alone; retries go through the
    /// resume path, which resets state and bumps the attempt counter.
    pub fn queue_action(
        &mut self,
        flow: &str,
        flow_type: FlowType,
        name: &str,
        action_type: ActionType,
        action_class: Option<&str>,
        state: ActionState,
        now: DateTime<Utc>,
    ) {
        debug_assert!(state.is_pending(), "queue_action takes a pending state");
        let unit_flow = self.flow_mut(flow, flow_type);
        if let Some(action) = unit_flow.actions.iter_mut().find(|a| a.name == name) {
            if !action.state.is_terminal() {
                action.state = state;
                action.queued = Some(now);
                action.modified = now;
            }
        } else {
            unit_flow.actions.push(Action {
                name: name.to_string(),
                action_type,
                action_class: action_class.map(str::to_string),
                state,
                created: now,
                queued: Some(now),
                start: None,
                stop: None,
                modified: now,
                attempt: 1,
                error_cause: None,
                error_context: None,
                filtered_cause: None,
            });
        }
        self.modified = now;
    }

    fn finish_action(
        &mut self,
        flow: &str,
        name: &str,
        state: ActionState,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let found = match self.action_mut(flow, name) {
            Some(action) if action.state.is_pending() => {
                action.state = state;
                action.start = start;
                action.stop = stop;
                action.modified = now;
                true
            }
            _ => false,
        };
        if found {
            self.modified = now;
        }
        found
    }

    pub fn complete_action(
        &mut self,
        flow: &str,
        name: &str,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        self.finish_action(flow, name, ActionState::Complete, start, stop, now)
    }

    pub fn error_action(
        &mut self,
        flow: &str,
        name: &str,
        cause: &str,
        context: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let done = self.finish_action(flow, name, ActionState::Error, None, Some(now), now);
        if done {
            if let Some(action) = self.action_mut(flow, name) {
                action.error_cause = Some(cause.to_string());
                action.error_context = Some(context.to_string());
            }
        }
        done
    }

    pub fn filter_action(&mut self, flow: &str, name: &str, message: &str, now: DateTime<Utc>) -> bool {
        let done = self.finish_action(flow, name, ActionState::Filtered, None, Some(now), now);
        if done {
            if let Some(action) = self.action_mut(flow, name) {
                action.filtered_cause = Some(message.to_string());
            }
            self.filtered = true;
        }
        done
    }

    pub fn split_action(&mut self, flow: &str, name: &str, now: DateTime<Utc>) -> bool {
        self.finish_action(flow, name, ActionState::Split, None, Some(now), now)
    }

    /// Append a synthetic action already in ERROR state. Used when the
    /// engine itself fails a unit (missing egress flow, bad split spec,
    /// vanished flow config, failed join).
    pub fn add_error_action(
        &mut self,
        flow: &str,
        flow_type: FlowType,
        name: &str,
        action_type: ActionType,
        cause: &str,
        context: &str,
        now: DateTime<Utc>,
    ) {
        let unit_flow = self.flow_mut(flow, flow_type);
        if let Some(action) = unit_flow.actions.iter_mut().find(|a| a.name == name) {
            if action.state.is_pending() {
                action.state = ActionState::Error;
                action.stop = Some(now);
                action.modified = now;
                action.error_cause = Some(cause.to_string());
                action.error_context = Some(context.to_string());
            }
        } else {
            unit_flow.actions.push(Action {
                name: name.to_string(),
                action_type,
                action_class: None,
                state: ActionState::Error,
                created: now,
                queued: None,
                start: Some(now),
                stop: Some(now),
                modified: now,
                attempt: 1,
                error_cause: Some(cause.to_string()),
                error_context: Some(context.to_string()),
                filtered_cause: None,
            });
        }
        self.modified = now;
    }

    /// Append a synthetic action already COMPLETE. Used for test-mode
    /// egress stand-ins.
    pub fn add_complete_action(
        &mut self,
        flow: &str,
        flow_type: FlowType,
        name: &str,
        action_type: ActionType,
        now: DateTime<Utc>,
    ) {
        let unit_flow = self.flow_mut(flow, flow_type);
        if unit_flow.actions.iter().any(|a| a.name == name) {
            return;
        }
        unit_flow.actions.push(Action {
            name: name.to_string(),
            action_type,
            action_class: None,
            state: ActionState::Complete,
            created: now,
            queued: None,
            start: Some(now),
            stop: Some(now),
            modified: now,
            attempt: 1,
            error_cause: None,
            error_context: None,
            filtered_cause: None,
        });
        self.modified = now;
    }

    /// `(flow, action)` pairs currently COLD_QUEUED under the given class.
    pub fn cold_queued_actions(&self, action_class: &str) -> Vec<(String, String)> {
        self.flows
            .iter()
            .flat_map(|f| {
                f.actions
                    .iter()
                    .filter(|a| {
                        a.state == ActionState::ColdQueued
                            && a.action_class.as_deref() == Some(action_class)
                    })
                    .map(|a| (f.name.clone(), a.name.clone()))
            })
            .collect()
    }

    pub fn has_cold_queued_actions(&self) -> bool {
        self.flows
            .iter()
            .any(|f| f.actions.iter().any(|a| a.state == ActionState::ColdQueued))
    }

    /// Reset every errored action to a fresh QUEUED attempt. Returns the
    /// `(flow, action)` pairs that were reset; empty means nothing to resume.
    pub fn resume_errors(&mut self, now: DateTime<Utc>) -> Vec<(String, String)> {
        let mut resumed = Vec::new();
        for flow in &mut self.flows {
            for action in &mut flow.actions {
                if action.state == ActionState::Error {
                    action.state = ActionState::Queued;
                    action.attempt += 1;
                    action.queued = Some(now);
                    action.start = None;
                    action.stop = None;
                    action.error_cause = None;
                    action.error_context = None;
                    action.modified = now;
                    resumed.push((flow.name.clone(), action.name.clone()));
                }
            }
        }
        if !resumed.is_empty() {
            self.modified = now;
        }
        resumed
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.stage = Stage::Cancelled;
        self.modified = now;
    }

    pub fn mark_content_deleted(&mut self, reason: &str, now: DateTime<Utc>) {
        self.content_deleted = Some(now);
        self.content_deleted_reason = Some(reason.to_string());
        self.modified = now;
    }

    pub fn add_domain(&mut self, name: &str, value: &str, media_type: &str) {
        if let Some(existing) = self.domains.iter_mut().find(|d| d.name == name) {
            existing.value = value.to_string();
            existing.media_type = media_type.to_string();
        } else {
            self.domains.push(DomainEntry {
                name: name.to_string(),
                value: value.to_string(),
                media_type: media_type.to_string(),
            });
        }
    }

    pub fn add_enrichment(&mut self, name: &str, value: &str, media_type: &str) {
        if let Some(existing) = self.enrichments.iter_mut().find(|e| e.name == name) {
            existing.value = value.to_string();
            existing.media_type = media_type.to_string();
        } else {
            self.enrichments.push(Enrichment {
                name: name.to_string(),
                value: value.to_string(),
                media_type: media_type.to_string(),
            });
        }
    }

    pub fn has_domains(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|r| self.domains.iter().any(|d| &d.name == r))
    }

    pub fn has_enrichments(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|r| self.enrichments.iter().any(|e| &e.name == r))
    }

    pub fn add_egress_flow(&mut self, flow: &str) {
        if !self.egress_flows.iter().any(|f| f == flow) {
            self.egress_flows.push(flow.to_string());
        }
    }

    pub fn last_protocol_layer(&self) -> Option<&ProtocolLayer> {
        self.protocol_stack.last()
    }

    /// Recompute `total_bytes`, deduplicating overlapping segment
    /// references: all references sharing an id collapse to one
    /// min-start/max-end span, counted once.
    pub fn recalculate_total_bytes(&mut self) {
        let mut spans: HashMap<Uuid, (i64, i64)> = HashMap::new();
        let segments = self
            .protocol_stack
            .iter()
            .flat_map(|layer| layer.content.iter().map(|c| c.segment))
            .chain(self.formatted_data.iter().map(|f| f.segment));
        for segment in segments {
            let start = segment.offset;
            let end = segment.offset + segment.size;
            spans
                .entry(segment.id)
                .and_modify(|(s, e)| {
                    *s = (*s).min(start);
                    *e = (*e).max(end);
                })
                .or_insert((start, end));
        }
        self.total_bytes = spans.values().map(|(s, e)| e - s).sum();
    }
}

/// Payload of a format or format-many result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatPayload {
    pub filename: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub segment: Segment,
}

/// Child specification carried by a split event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    pub source: SourceInfo,
    pub content: Vec<Content>,
}

/// A result event reported by an external action worker. Delivery is
/// at-least-once; the dispatcher's pending-action precheck makes handling
/// idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEvent {
    pub did: Uuid,
    pub flow: String,
    pub action: String,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Every event kind a worker can report. The match in the dispatcher is
/// exhaustive: adding a variant here will not compile until it is handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Transform {
        protocol_layer: Option<ProtocolLayer>,
    },
    Load {
        protocol_layer: Option<ProtocolLayer>,
        #[serde(default)]
        domains: Vec<DomainEntry>,
    },
    Domain {
        #[serde(default)]
        domains: Vec<DomainEntry>,
    },
    Enrich {
        #[serde(default)]
        enrichments: Vec<Enrichment>,
    },
    Format {
        format: FormatPayload,
    },
    Validate,
    Egress,
    Error {
        cause: String,
        #[serde(default)]
        context: String,
    },
    Filter {
        message: String,
    },
    Split {
        children: Vec<ChildSpec>,
    },
    FormatMany {
        formats: Vec<FormatPayload>,
    },
}

/// The work item pushed onto the action queue for external workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInput {
    /// Queue key: the action implementation class, optionally suffixed with
    /// a worker-group return address.
    pub queue_name: String,
    pub did: Uuid,
    pub flow: String,
    pub action: String,
    pub action_created: DateTime<Utc>,
    /// Cold-queued items exist only in durable storage and are never pushed
    /// to the live queue.
    pub cold_queued: bool,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: Uuid, offset: i64, size: i64) -> Segment {
        Segment { id, offset, size }
    }

    fn content(seg: Segment) -> Content {
        Content {
            name: None,
            media_type: "application/octet-stream".to_string(),
            segment: seg,
        }
    }

    fn base_unit() -> DeltaFile {
        DeltaFile::new_ingress(
            Uuid::new_v4(),
            SourceInfo {
                filename: "input.bin".to_string(),
                flow: "sample".to_string(),
                metadata: HashMap::new(),
            },
            vec![],
            vec![],
            Utc::now(),
        )
    }

    #[test]
    fn total_bytes_counts_overlapping_same_id_segments_once() {
        let mut unit = base_unit();
        let id = Uuid::new_v4();
        unit.protocol_stack[0].content = vec![
            content(segment(id, 0, 500)),
            content(segment(id, 400, 600)), // overlaps; union span is 0..1000
        ];
        unit.recalculate_total_bytes();
        assert_eq!(unit.total_bytes, 1000);
    }

    #[test]
    fn total_bytes_sums_distinct_ids() {
        let mut unit = base_unit();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        unit.protocol_stack[0].content =
            vec![content(segment(a, 0, 100)), content(segment(b, 0, 250))];
        unit.recalculate_total_bytes();
        assert_eq!(unit.total_bytes, 350);
    }

    #[test]
    fn stage_never_regresses() {
        let mut unit = base_unit();
        unit.set_stage(Stage::Egress);
        unit.set_stage(Stage::Ingress);
        assert_eq!(unit.stage, Stage::Egress);
        unit.set_stage(Stage::Complete);
        unit.set_stage(Stage::Enrich);
        assert_eq!(unit.stage, Stage::Complete);
    }

    #[test]
    fn error_reachable_from_any_non_terminal_stage() {
        let mut unit = base_unit();
        unit.set_stage(Stage::Enrich);
        unit.set_stage(Stage::Error);
        assert_eq!(unit.stage, Stage::Error);
    }

    #[test]
    fn terminal_action_state_is_not_reverted_by_queue() {
        let now = Utc::now();
        let mut unit = base_unit();
        unit.queue_action(
            "sample",
            FlowType::Ingress,
            "XformAction",
            ActionType::Transform,
            None,
            ActionState::Queued,
            now,
        );
        assert!(unit.complete_action("sample", "XformAction", None, None, now));
        unit.queue_action(
            "sample",
            FlowType::Ingress,
            "XformAction",
            ActionType::Transform,
            None,
            ActionState::Queued,
            now,
        );
        assert!(unit.has_terminal_action("sample", "XformAction"));
    }

    #[test]
    fn finish_on_non_pending_action_is_a_noop() {
        let now = Utc::now();
        let mut unit = base_unit();
        unit.queue_action(
            "sample",
            FlowType::Ingress,
            "LoadAction",
            ActionType::Load,
            None,
            ActionState::Queued,
            now,
        );
        assert!(unit.complete_action("sample", "LoadAction", None, None, now));
        // Duplicate delivery of the same completion must not apply twice.
        assert!(!unit.complete_action("sample", "LoadAction", None, None, now));
        assert!(!unit.error_action("sample", "LoadAction", "late error", "", now));
        assert_eq!(
            unit.action("sample", "LoadAction").unwrap().state,
            ActionState::Complete
        );
    }

    #[test]
    fn resume_bumps_attempt_and_requeues() {
        let now = Utc::now();
        let mut unit = base_unit();
        unit.queue_action(
            "sample",
            FlowType::Ingress,
            "LoadAction",
            ActionType::Load,
            None,
            ActionState::Queued,
            now,
        );
        unit.error_action("sample", "LoadAction", "boom", "", now);
        let resumed = unit.resume_errors(now);
        assert_eq!(resumed, vec![("sample".to_string(), "LoadAction".to_string())]);
        let action = unit.action("sample", "LoadAction").unwrap();
        assert_eq!(action.state, ActionState::Queued);
        assert_eq!(action.attempt, 2);
        assert!(action.error_cause.is_none());
    }

    #[test]
    fn event_kind_round_trips_through_json() {
        let event = ActionEvent {
            did: Uuid::new_v4(),
            flow: "sample".to_string(),
            action: "LoadAction".to_string(),
            start: None,
            stop: None,
            kind: EventKind::Error {
                cause: "bad input".to_string(),
                context: "line 3".to_string(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"ERROR\""));
        let back: ActionEvent = serde_json::from_str(&json).unwrap();
        match back.kind {
            EventKind::Error { cause, .. } => assert_eq!(cause, "bad input"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
