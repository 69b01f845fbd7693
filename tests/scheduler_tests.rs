use chrono::Utc;
use dealscope::config::EngineConfig;
use dealscope::scheduler::{Batch, EventSource, PendingEvent, Scheduler, SchedulerHandle};
use dealscope::service::{Engine, ErrorCode, MemorySource};
use dealscope::store::StateStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn snapshot_event(org: &str) -> PendingEvent {
    PendingEvent { organization_id: org.to_string(), source: EventSource::Snapshot, received_at: Utc::now() }
}

fn start() -> (Arc<Engine>, SchedulerHandle) {
    let source = Arc::new(MemorySource::new());
    for org in ["acme", "globex"] {
        source.set(org, vec![json!({"id": "d1", "type": "deal", "value": 500}), json!({"id": "d2", "type": "deal"})]);
    }
    let engine = Arc::new(Engine::with_source(EngineConfig::default(), source));
    let handle = Scheduler::spawn(engine.clone(), Duration::from_secs(30));
    (engine, handle)
}

/// Let the worker run until every task is parked again.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn window_restarts_on_each_event() {
    let (engine, handle) = start();
    handle.submit(snapshot_event("acme")).unwrap();
    settle().await;
    assert_eq!(handle.status().queue_depth, 1);

    tokio::time::advance(Duration::from_secs(20)).await;
    handle.submit(snapshot_event("acme")).unwrap();
    settle().await;

    tokio::time::advance(Duration::from_secs(20)).await;
    settle().await;
    let status = handle.status();
    assert_eq!(status.queue_depth, 2);
    assert!(status.last_batch_at.is_none());
    assert!(engine.store().get("acme").is_none());

    tokio::time::advance(Duration::from_secs(15)).await;
    settle().await;
    settle().await;
    let status = handle.status();
    assert_eq!(status.queue_depth, 0);
    assert!(status.last_batch_at.is_some());
    assert_eq!(status.organizations, 1);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn flush_drains_without_waiting_for_the_window() {
    let (engine, handle) = start();
    handle.submit(snapshot_event("acme")).unwrap();
    handle.submit(snapshot_event("globex")).unwrap();
    handle.flush().await.unwrap();

    let status = handle.status();
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.organizations, 2);
    let acme = engine.store().get("acme").unwrap();
    assert_eq!(acme.snapshot.unwrap().workflows.len(), 2);
    assert_eq!(acme.learning.get("initial_analysis").unwrap().occurrences, 1);

    // nothing queued: flush returns straight away
    handle.flush().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trigger_is_validated_and_recorded() {
    let (engine, handle) = start();
    let err = handle.trigger("  ", "why").unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);

    let ack = handle.trigger(" acme ", "").unwrap();
    assert!(ack.accepted);
    assert_eq!(ack.organization_id, "acme");
    assert_eq!(ack.reason, "manual trigger");

    handle.flush().await.unwrap();
    let state = engine.store().get("acme").unwrap();
    assert_eq!(state.learning.get("manual_trigger").unwrap().occurrences, 1);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_then_refuses_work() {
    let (engine, handle) = start();
    handle.submit(snapshot_event("globex")).unwrap();
    handle.shutdown().await;
    assert!(engine.store().get("globex").is_some());

    let err = handle.submit(snapshot_event("acme")).unwrap_err();
    assert_eq!(err.code, ErrorCode::SchedulerUnavailable);
    assert_eq!(handle.trigger("acme", "late").unwrap_err().code, ErrorCode::SchedulerUnavailable);
    assert_eq!(handle.flush().await.unwrap_err().code, ErrorCode::SchedulerUnavailable);

    // status keeps answering from the engine
    assert_eq!(handle.status().organizations, 1);
    handle.shutdown().await;
}

#[test]
fn batch_groups_keep_arrival_order() {
    let now = Utc::now();
    let batch = Batch {
        events: vec![
            PendingEvent::manual("b", "1", now),
            PendingEvent::manual("a", "2", now),
            PendingEvent::manual("b", "3", now),
        ],
    };
    let groups = batch.by_organization();
    let orgs: Vec<&str> = groups.keys().map(String::as_str).collect();
    assert_eq!(orgs, vec!["a", "b"]);
    let reasons: Vec<String> = groups["b"]
        .iter()
        .map(|e| match &e.source {
            EventSource::Manual { reason } => reason.clone(),
            other => panic!("unexpected source {other:?}"),
        })
        .collect();
    assert_eq!(reasons, vec!["1", "3"]);
}
