//! Flow configuration model and the registry the engine resolves it from.
//!
//! Flows are configuration, not state: they describe which actions run for
//! a given source flow and in what order. The registry is a snapshot-style
//! read store; flow CRUD and validation happen elsewhere and push complete
//! flow definitions in.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::types::ActionType;

/// Fan-in specification attached to an action configuration. When present,
/// queueing the action first routes the unit through the join coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Seconds a pending join may wait before the reaper resolves it.
    pub max_age_secs: i64,
    /// Minimum arrivals for the deadline path to succeed. Defaults to 1.
    pub min_num: Option<usize>,
    /// Arrival count that resolves the join immediately.
    pub max_num: usize,
    /// Source-metadata key whose value partitions the join into groups.
    pub metadata_key: Option<String>,
}

impl JoinSpec {
    pub fn min(&self) -> usize {
        self.min_num.unwrap_or(1).max(1)
    }
}

/// Common fields of every configured action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfiguration {
    pub name: String,
    /// Implementation class; doubles as the queue key workers listen on.
    pub action_class: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformActionConfiguration {
    #[serde(flatten)]
    pub config: ActionConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadActionConfiguration {
    #[serde(flatten)]
    pub config: ActionConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainActionConfiguration {
    #[serde(flatten)]
    pub config: ActionConfiguration,
    #[serde(default)]
    pub requires_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichActionConfiguration {
    #[serde(flatten)]
    pub config: ActionConfiguration,
    #[serde(default)]
    pub requires_domains: Vec<String>,
    #[serde(default)]
    pub requires_enrichments: Vec<String>,
    /// Key/value pairs that must all appear in the unit's latest metadata.
    #[serde(default)]
    pub requires_metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatActionConfiguration {
    #[serde(flatten)]
    pub config: ActionConfiguration,
    #[serde(default)]
    pub requires_domains: Vec<String>,
    #[serde(default)]
    pub requires_enrichments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateActionConfiguration {
    #[serde(flatten)]
    pub config: ActionConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressActionConfiguration {
    #[serde(flatten)]
    pub config: ActionConfiguration,
}

/// Entry flow: ordered transforms followed by a single load action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressFlow {
    pub name: String,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub transform_actions: Vec<TransformActionConfiguration>,
    pub load_action: LoadActionConfiguration,
}

/// Mid-pipeline flow: domain actions gate on domains; enrich actions gate
/// on domains, enrichments and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichFlow {
    pub name: String,
    #[serde(default)]
    pub domain_actions: Vec<DomainActionConfiguration>,
    #[serde(default)]
    pub enrich_actions: Vec<EnrichActionConfiguration>,
}

/// Exit flow: format, then validates, then egress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressFlow {
    pub name: String,
    #[serde(default)]
    pub test_mode: bool,
    pub format_action: FormatActionConfiguration,
    #[serde(default)]
    pub validate_actions: Vec<ValidateActionConfiguration>,
    pub egress_action: EgressActionConfiguration,
    /// Restrict which ingress flows feed this egress flow. Empty means all.
    #[serde(default)]
    pub include_ingress_flows: Vec<String>,
    #[serde(default)]
    pub exclude_ingress_flows: Vec<String>,
}

impl EgressFlow {
    pub fn matches_ingress_flow(&self, ingress_flow: &str) -> bool {
        if self
            .exclude_ingress_flows
            .iter()
            .any(|f| f == ingress_flow)
        {
            return false;
        }
        self.include_ingress_flows.is_empty()
            || self.include_ingress_flows.iter().any(|f| f == ingress_flow)
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    ingress: HashMap<String, IngressFlow>,
    enrich: HashMap<String, EnrichFlow>,
    egress: HashMap<String, EgressFlow>,
}

/// Read-mostly snapshot of all running flows. Lookups clone the config so
/// the engine never holds the lock across an await point.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    inner: RwLock<RegistryInner>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ingress_flow(&self, flow: IngressFlow) {
        self.write().ingress.insert(flow.name.clone(), flow);
    }

    pub fn set_enrich_flow(&self, flow: EnrichFlow) {
        self.write().enrich.insert(flow.name.clone(), flow);
    }

    pub fn set_egress_flow(&self, flow: EgressFlow) {
        self.write().egress.insert(flow.name.clone(), flow);
    }

    pub fn remove_ingress_flow(&self, name: &str) {
        self.write().ingress.remove(name);
    }

    pub fn remove_egress_flow(&self, name: &str) {
        self.write().egress.remove(name);
    }

    pub fn ingress_flow(&self, name: &str) -> Option<IngressFlow> {
        self.read().ingress.get(name).cloned()
    }

    pub fn enrich_flows(&self) -> Vec<EnrichFlow> {
        let mut flows: Vec<_> = self.read().enrich.values().cloned().collect();
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        flows
    }

    pub fn egress_flow(&self, name: &str) -> Option<EgressFlow> {
        self.read().egress.get(name).cloned()
    }

    /// Egress flows fed by the given ingress flow, in stable name order.
    pub fn matching_egress_flows(&self, ingress_flow: &str) -> Vec<EgressFlow> {
        let mut flows: Vec<_> = self
            .read()
            .egress
            .values()
            .filter(|f| f.matches_ingress_flow(ingress_flow))
            .cloned()
            .collect();
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        flows
    }

    /// Every action class configured anywhere; these are the queue keys the
    /// admission tier watches.
    pub fn configured_action_classes(&self) -> Vec<String> {
        let inner = self.read();
        let mut classes: Vec<String> = Vec::new();
        let mut push = |class: &str| {
            if !classes.iter().any(|c| c == class) {
                classes.push(class.to_string());
            }
        };
        for flow in inner.ingress.values() {
            for t in &flow.transform_actions {
                push(&t.config.action_class);
            }
            push(&flow.load_action.config.action_class);
        }
        for flow in inner.enrich.values() {
            for d in &flow.domain_actions {
                push(&d.config.action_class);
            }
            for e in &flow.enrich_actions {
                push(&e.config.action_class);
            }
        }
        for flow in inner.egress.values() {
            push(&flow.format_action.config.action_class);
            for v in &flow.validate_actions {
                push(&v.config.action_class);
            }
            push(&flow.egress_action.config.action_class);
        }
        classes.sort();
        classes
    }

    /// Resolve a single action configuration by flow and action name. Used
    /// by the requeue sweep to re-derive queue inputs; `None` means the
    /// flow changed underneath the unit and the action must be errored.
    pub fn action_config(&self, flow: &str, action: &str) -> Option<(ActionConfiguration, ActionType)> {
        let inner = self.read();
        if let Some(f) = inner.ingress.get(flow) {
            for t in &f.transform_actions {
                if t.config.name == action {
                    return Some((t.config.clone(), ActionType::Transform));
                }
            }
            if f.load_action.config.name == action {
                return Some((f.load_action.config.clone(), ActionType::Load));
            }
        }
        if let Some(f) = inner.enrich.get(flow) {
            for d in &f.domain_actions {
                if d.config.name == action {
                    return Some((d.config.clone(), ActionType::Domain));
                }
            }
            for e in &f.enrich_actions {
                if e.config.name == action {
                    return Some((e.config.clone(), ActionType::Enrich));
                }
            }
        }
        if let Some(f) = inner.egress.get(flow) {
            if f.format_action.config.name == action {
                return Some((f.format_action.config.clone(), ActionType::Format));
            }
            for v in &f.validate_actions {
                if v.config.name == action {
                    return Some((v.config.clone(), ActionType::Validate));
                }
            }
            if f.egress_action.config.name == action {
                return Some((f.egress_action.config.clone(), ActionType::Egress));
            }
        }
        None
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().expect("flow registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().expect("flow registry lock poisoned")
    }
}
