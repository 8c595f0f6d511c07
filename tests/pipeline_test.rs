//! End-to-end pipeline tests on the in-memory backends.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use conveyor::admission::{AdmissionConfig, QueueAdmission};
use conveyor::dispatcher::{DispatchLoop, DispatcherConfig, EventDispatcher, IngressInput};
use conveyor::flows::{
    ActionConfiguration, EgressActionConfiguration, EgressFlow, FormatActionConfiguration,
    IngressFlow, JoinSpec, LoadActionConfiguration, TransformActionConfiguration,
    ValidateActionConfiguration,
};
use conveyor::join::{JoinConfig, JoinCoordinator};
use conveyor::queue::{ActionEventQueue, MemoryQueue};
use conveyor::store::{MemoryJoinStore, MemoryUnitStore, UnitStore};
use conveyor::types::{
    ActionEvent, ActionState, ChildSpec, Content, EventKind, FormatPayload, ProtocolLayer, Segment,
    SourceInfo, Stage,
};
use conveyor::{system_clock, FixedClock, FlowRegistry, SharedClock};

fn action(name: &str) -> ActionConfiguration {
    ActionConfiguration {
        name: name.to_string(),
        action_class: format!("org.example.{name}"),
        parameters: serde_json::Value::Null,
        join: None,
    }
}

fn ingress_flow(name: &str) -> IngressFlow {
    IngressFlow {
        name: name.to_string(),
        test_mode: false,
        transform_actions: vec![TransformActionConfiguration {
            config: action("Transform"),
        }],
        load_action: LoadActionConfiguration {
            config: action("Load"),
        },
    }
}

fn egress_flow(name: &str) -> EgressFlow {
    EgressFlow {
        name: name.to_string(),
        test_mode: false,
        format_action: FormatActionConfiguration {
            config: action("Format"),
            requires_domains: vec![],
            requires_enrichments: vec![],
        },
        validate_actions: vec![ValidateActionConfiguration {
            config: action("Validate"),
        }],
        egress_action: EgressActionConfiguration {
            config: action("Egress"),
        },
        include_ingress_flows: vec![],
        exclude_ingress_flows: vec![],
    }
}

struct Pipeline {
    dispatcher: Arc<EventDispatcher>,
    coordinator: Arc<JoinCoordinator>,
    store: Arc<MemoryUnitStore>,
    registry: Arc<FlowRegistry>,
    queue: ActionEventQueue,
    clock: Arc<FixedClock>,
}

fn pipeline() -> Pipeline {
    let store = Arc::new(MemoryUnitStore::new());
    let registry = Arc::new(FlowRegistry::new());
    registry.set_ingress_flow(ingress_flow("intake"));
    registry.set_egress_flow(egress_flow("outbound"));
    let queue = ActionEventQueue::new(Arc::new(MemoryQueue::new()));
    let clock = Arc::new(FixedClock::at(Utc::now()));
    let coordinator = Arc::new(JoinCoordinator::new(
        Arc::new(MemoryJoinStore::new()),
        Arc::clone(&clock) as SharedClock,
        JoinConfig::default(),
    ));
    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::clone(&store) as Arc<dyn UnitStore>,
        Arc::clone(&registry),
        queue.clone(),
        Arc::clone(&coordinator),
        Arc::clone(&clock) as SharedClock,
        DispatcherConfig::default(),
    ));
    Pipeline {
        dispatcher,
        coordinator,
        store,
        registry,
        queue,
        clock,
    }
}

fn content() -> Content {
    Content {
        name: None,
        media_type: "application/octet-stream".to_string(),
        segment: Segment {
            id: Uuid::new_v4(),
            offset: 0,
            size: 128,
        },
    }
}

fn input(flow: &str) -> IngressInput {
    IngressInput {
        source: SourceInfo {
            filename: "payload.bin".to_string(),
            flow: flow.to_string(),
            metadata: HashMap::new(),
        },
        content: vec![content()],
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
        content: vec![content()],
        metadata: HashMap::new(),
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 5 seconds");
}

#[tokio::test]
async fn events_flow_through_the_dispatch_loop() {
    let p = pipeline();
    let dispatch = DispatchLoop::start(Arc::clone(&p.dispatcher), p.queue.clone());
    let did = p.dispatcher.ingress(input("intake")).await.unwrap();

    p.queue
        .put_event(&event(
            did,
            "intake",
            "Transform",
            EventKind::Transform {
                protocol_layer: Some(layer("Transform")),
            },
        ))
        .await
        .unwrap();
    wait_until(|| async {
        p.store
            .load(did)
            .await
            .unwrap()
            .map(|u| u.has_pending_action("intake", "Load"))
            .unwrap_or(false)
    })
    .await;

    p.queue
        .put_event(&event(
            did,
            "intake",
            "Load",
            EventKind::Load {
                protocol_layer: Some(layer("Load")),
                domains: vec![],
            },
        ))
        .await
        .unwrap();
    wait_until(|| async {
        p.store
            .load(did)
            .await
            .unwrap()
            .map(|u| u.has_pending_action("outbound", "Format"))
            .unwrap_or(false)
    })
    .await;

    p.queue
        .put_event(&event(
            did,
            "outbound",
            "Format",
            EventKind::Format {
                format: FormatPayload {
                    filename: "out.bin".to_string(),
                    metadata: HashMap::new(),
                    segment: Segment {
                        id: Uuid::new_v4(),
                        offset: 0,
                        size: 96,
                    },
                },
            },
        ))
        .await
        .unwrap();
    p.queue
        .put_event(&event(did, "outbound", "Validate", EventKind::Validate))
        .await
        .unwrap();
    p.queue
        .put_event(&event(did, "outbound", "Egress", EventKind::Egress))
        .await
        .unwrap();

    wait_until(|| async {
        p.store
            .load(did)
            .await
            .unwrap()
            .map(|u| u.stage == Stage::Complete)
            .unwrap_or(false)
    })
    .await;

    let unit = p.store.load(did).await.unwrap().unwrap();
    assert!(unit.egressed);
    assert_eq!(unit.egress_flows, vec!["outbound"]);
    assert!(unit.total_bytes > 0);

    dispatch.shutdown().await.unwrap();
}

#[tokio::test]
async fn unit_without_matching_egress_flow_errors() {
    let p = pipeline();
    p.registry.remove_egress_flow("outbound");
    let did = p.dispatcher.ingress(input("intake")).await.unwrap();

    p.dispatcher
        .handle_event(event(
            did,
            "intake",
            "Transform",
            EventKind::Transform {
                protocol_layer: None,
            },
        ))
        .await
        .unwrap();
    p.dispatcher
        .handle_event(event(
            did,
            "intake",
            "Load",
            EventKind::Load {
                protocol_layer: None,
                domains: vec![],
            },
        ))
        .await
        .unwrap();

    let unit = p.store.load(did).await.unwrap().unwrap();
    assert_eq!(unit.stage, Stage::Error);
    // No work was queued for the egress stage.
    assert_eq!(p.queue.queue_size("org.example.Format").await.unwrap(), 0);
}

#[tokio::test]
async fn failed_split_leaves_only_the_parent() {
    let p = pipeline();
    let did = p.dispatcher.ingress(input("intake")).await.unwrap();
    p.dispatcher
        .handle_event(event(
            did,
            "intake",
            "Transform",
            EventKind::Transform {
                protocol_layer: None,
            },
        ))
        .await
        .unwrap();

    let children = vec![
        ChildSpec {
            source: SourceInfo {
                filename: "ok".to_string(),
                flow: "intake".to_string(),
                metadata: HashMap::new(),
            },
            content: vec![content()],
        },
        ChildSpec {
            source: SourceInfo {
                filename: "bad".to_string(),
                flow: "unknown-flow".to_string(),
                metadata: HashMap::new(),
            },
            content: vec![content()],
        },
    ];
    p.dispatcher
        .handle_event(event(did, "intake", "Load", EventKind::Split { children }))
        .await
        .unwrap();

    assert_eq!(p.store.len().await, 1);
    let parent = p.store.load(did).await.unwrap().unwrap();
    assert_eq!(parent.stage, Stage::Error);
    let load = parent.action("intake", "Load").unwrap();
    assert_eq!(load.state, ActionState::Error);
    assert!(load
        .error_cause
        .as_deref()
        .unwrap()
        .contains("unknown-flow"));
    // The valid sibling's work never reached the queue.
    assert_eq!(
        p.queue.queue_size("org.example.Transform").await.unwrap(),
        1
    );
}

#[tokio::test]
async fn join_deadline_below_minimum_fails_participants() {
    let p = pipeline();
    let mut load = action("GroupLoad");
    load.join = Some(JoinSpec {
        max_age_secs: 5,
        min_num: Some(3),
        max_num: 5,
        metadata_key: None,
    });
    p.registry.set_ingress_flow(IngressFlow {
        name: "grouped".to_string(),
        test_mode: false,
        transform_actions: vec![],
        load_action: LoadActionConfiguration { config: load },
    });

    let first = p.dispatcher.ingress(input("grouped")).await.unwrap();
    let second = p.dispatcher.ingress(input("grouped")).await.unwrap();
    for did in [first, second] {
        let unit = p.store.load(did).await.unwrap().unwrap();
        assert_eq!(
            unit.action("grouped", "GroupLoad").unwrap().state,
            ActionState::Joining
        );
    }

    p.clock.advance(chrono::Duration::seconds(30));
    let resolved = p
        .coordinator
        .reap_expired(p.dispatcher.as_ref())
        .await
        .unwrap();
    assert_eq!(resolved, 1);

    for did in [first, second] {
        let unit = p.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Error);
        let cause = unit
            .action("grouped", "GroupLoad")
            .unwrap()
            .error_cause
            .clone()
            .unwrap();
        assert!(cause.contains("2 of 3"), "unexpected cause: {cause}");
    }
}

#[tokio::test]
async fn metadata_key_partitions_joins_into_groups() {
    let p = pipeline();
    let mut load = action("GroupLoad");
    load.join = Some(JoinSpec {
        max_age_secs: 60,
        min_num: None,
        max_num: 2,
        metadata_key: Some("batch".to_string()),
    });
    p.registry.set_ingress_flow(IngressFlow {
        name: "grouped".to_string(),
        test_mode: false,
        transform_actions: vec![],
        load_action: LoadActionConfiguration { config: load },
    });

    let tagged = |batch: &str| {
        let mut metadata = HashMap::new();
        metadata.insert("batch".to_string(), batch.to_string());
        IngressInput {
            source: SourceInfo {
                filename: "payload.bin".to_string(),
                flow: "grouped".to_string(),
                metadata,
            },
            content: vec![content()],
        }
    };

    let a1 = p.dispatcher.ingress(tagged("a")).await.unwrap();
    let b1 = p.dispatcher.ingress(tagged("b")).await.unwrap();
    // Different groups: neither join resolved yet.
    for did in [a1, b1] {
        let unit = p.store.load(did).await.unwrap().unwrap();
        assert_eq!(
            unit.action("grouped", "GroupLoad").unwrap().state,
            ActionState::Joining
        );
    }

    let a2 = p.dispatcher.ingress(tagged("a")).await.unwrap();
    // Group "a" hit max_num and resolved into an aggregate child.
    for did in [a1, a2] {
        let unit = p.store.load(did).await.unwrap().unwrap();
        assert_eq!(unit.stage, Stage::Complete);
    }
    let b_unit = p.store.load(b1).await.unwrap().unwrap();
    assert_eq!(
        b_unit.action("grouped", "GroupLoad").unwrap().state,
        ActionState::Joining
    );
}

#[tokio::test]
async fn overflow_is_cold_queued_and_drained() {
    let p = pipeline();
    // Flow with just a load action keeps the queue accounting simple.
    p.registry.set_ingress_flow(IngressFlow {
        name: "bulk".to_string(),
        test_mode: false,
        transform_actions: vec![],
        load_action: LoadActionConfiguration {
            config: action("BulkLoad"),
        },
    });
    let admission = Arc::new(QueueAdmission::new(
        AdmissionConfig {
            max_queue_size: 4,
            refresh_interval: Duration::from_millis(100),
            drain_interval: Duration::from_millis(100),
        },
        p.queue.clone(),
        Arc::clone(&p.store) as Arc<dyn UnitStore>,
        Arc::clone(&p.registry),
        system_clock(),
    ));
    let dispatcher = Arc::new(
        EventDispatcher::new(
            Arc::clone(&p.store) as Arc<dyn UnitStore>,
            Arc::clone(&p.registry),
            p.queue.clone(),
            Arc::clone(&p.coordinator),
            system_clock(),
            DispatcherConfig::default(),
        )
        .with_admission(Arc::clone(&admission)),
    );

    for _ in 0..4 {
        dispatcher.ingress(input("bulk")).await.unwrap();
    }
    assert_eq!(p.queue.queue_size("org.example.BulkLoad").await.unwrap(), 4);
    admission.refresh().await.unwrap();
    assert!(admission.is_cold("org.example.BulkLoad"));

    // Overflow lands in durable storage only.
    let overflow = dispatcher.ingress(input("bulk")).await.unwrap();
    assert_eq!(p.queue.queue_size("org.example.BulkLoad").await.unwrap(), 4);
    let unit = p.store.load(overflow).await.unwrap().unwrap();
    assert_eq!(
        unit.action("bulk", "BulkLoad").unwrap().state,
        ActionState::ColdQueued
    );

    // Workers catch up; the drain promotes the cold row back to the queue.
    for _ in 0..4 {
        p.queue
            .backend()
            .take("org.example.BulkLoad")
            .await
            .unwrap();
    }
    let drained = admission.drain().await.unwrap();
    assert_eq!(drained, 1);
    assert_eq!(p.queue.queue_size("org.example.BulkLoad").await.unwrap(), 1);
    let unit = p.store.load(overflow).await.unwrap().unwrap();
    assert_eq!(
        unit.action("bulk", "BulkLoad").unwrap().state,
        ActionState::Queued
    );
}
