use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dealscope::alerts::{AlertKind, ChannelSink, Delivery};
use dealscope::changes::ChangeKind;
use dealscope::config::EngineConfig;
use dealscope::recommend::RuleBasedRecommender;
use dealscope::scheduler::{Batch, EventSource, PendingEvent};
use dealscope::service::{Engine, ErrorCode, MemorySource, ServiceError, WorkflowSource};
use dealscope::store::{MemoryStore, StateStore};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
}

/// Open deals that have all gone quiet: pipeline health well under the floor.
fn stale_pipeline() -> Vec<Value> {
    (0..3)
        .map(|i| {
            json!({
                "id": format!("d{i}"),
                "type": "deal",
                "duration_days": 30 + i,
                "value": 10000 + 100 * i,
                "probability": 0.1,
                "last_activity_at": (now() - Duration::days(30)).to_rfc3339(),
            })
        })
        .collect()
}

fn manual(org: &str) -> PendingEvent {
    PendingEvent::manual(org, "check", now())
}

fn engine(config: EngineConfig, source: Arc<MemorySource>) -> (Engine, tokio::sync::mpsc::UnboundedReceiver<dealscope::alerts::AlertRecord>) {
    let (sink, rx) = ChannelSink::new();
    let engine = Engine::new(config, Arc::new(MemoryStore::new()), source, Arc::new(RuleBasedRecommender), Arc::new(sink));
    (engine, rx)
}

#[tokio::test]
async fn first_pass_analyses_and_alerts() {
    let source = Arc::new(MemorySource::new());
    source.set("acme", stale_pipeline());
    let (engine, mut alerts) = engine(EngineConfig::default(), source);

    let report = engine.process_organization("acme", &[], now()).await.unwrap();
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].kind, ChangeKind::InitialAnalysis);
    assert!(report.analyzed);
    assert_eq!(report.patterns, 1);
    assert!(report.health < 40.0);
    assert_eq!(report.alerts[0].kind, AlertKind::CriticalHealth);

    let delivered = alerts.try_recv().unwrap();
    assert_eq!(delivered.organization_id, "acme");
    assert_eq!(delivered.delivery, Delivery::Sent);

    let state = engine.store().get("acme").unwrap();
    assert!(state.snapshot.is_some());
    let rec = state.learning.get("initial_analysis").unwrap();
    assert_eq!(rec.occurrences, 1);
    assert!(rec.outcomes[0].alerted);
}

#[tokio::test]
async fn unchanged_second_pass_skips_analysis() {
    let source = Arc::new(MemorySource::new());
    source.set("acme", stale_pipeline());
    let (engine, _alerts) = engine(EngineConfig::default(), source);
    engine.process_organization("acme", &[], now()).await.unwrap();
    let again = engine.process_organization("acme", &[], now() + Duration::minutes(5)).await.unwrap();
    assert!(again.events.is_empty());
    assert!(!again.analyzed);
    assert!(again.alerts.is_empty());
}

#[tokio::test]
async fn daily_cap_holds_across_passes() {
    let source = Arc::new(MemorySource::new());
    source.set("acme", stale_pipeline());
    let mut config = EngineConfig::default();
    config.alerts.max_alerts_per_day = 2;
    let (engine, mut alerts) = engine(config, source);
    for i in 0..5 {
        engine.process_organization("acme", &[manual("acme")], now() + Duration::minutes(i)).await.unwrap();
    }
    let state = engine.store().get("acme").unwrap();
    assert_eq!(state.alerts.sent_on(now().date_naive()), 2);
    assert_eq!(state.alerts.records().len(), 5);
    let mut delivered = 0;
    while alerts.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 2);
    assert_eq!(state.learning.get("manual_trigger").unwrap().occurrences, 5);
}

#[tokio::test]
async fn failing_organization_is_isolated() {
    let source = Arc::new(MemorySource::new());
    source.set("good", stale_pipeline());
    let (engine, _alerts) = engine(EngineConfig::default(), source);
    let batch = Batch { events: vec![manual("good"), manual("missing"), manual("good")] };
    let report = engine.process_batch(batch).await;
    assert_eq!(report.processed.len(), 1);
    assert_eq!(report.processed[0].organization_id, "good");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].organization_id, "missing");
    assert_eq!(report.failed[0].error.code, ErrorCode::SourceFailure);
    // both manual events of the good organization became change events
    let manual_events = report.processed[0].events.iter().filter(|e| e.kind == ChangeKind::ManualTrigger).count();
    assert_eq!(manual_events, 2);
}

#[test]
fn service_error_serializes_with_stable_code() {
    let v = serde_json::to_value(ServiceError::invalid("bad org")).unwrap();
    assert_eq!(v, json!({"code": "INVALID_REQUEST", "message": "bad org"}));
    let v = serde_json::to_value(ServiceError::unavailable()).unwrap();
    assert_eq!(v["code"], "SCHEDULER_UNAVAILABLE");
}

/// Counts how many fetches overlap.
#[derive(Default)]
struct Overlap {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl WorkflowSource for Overlap {
    async fn fetch(&self, _org: &str) -> anyhow::Result<Vec<Value>> {
        let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(n, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(stale_pipeline())
    }
}

#[tokio::test(start_paused = true)]
async fn same_organization_passes_never_overlap() {
    let source = Arc::new(Overlap::default());
    let engine = Engine::with_source(EngineConfig::default(), source.clone());
    let (a, b) = tokio::join!(
        engine.process_organization("acme", &[], now()),
        engine.process_organization("acme", &[], now()),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(source.peak.load(Ordering::SeqCst), 1);

    let (a, b) = tokio::join!(
        engine.process_organization("acme", &[], now()),
        engine.process_organization("other", &[], now()),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(source.peak.load(Ordering::SeqCst), 2);
}

/// Never answers for "hang"; serves the stale pipeline otherwise.
struct Hanging;

#[async_trait]
impl WorkflowSource for Hanging {
    async fn fetch(&self, org: &str) -> anyhow::Result<Vec<Value>> {
        if org == "hang" {
            std::future::pending::<()>().await;
        }
        Ok(stale_pipeline())
    }
}

#[tokio::test(start_paused = true)]
async fn hung_source_times_out_without_stalling_the_batch() {
    let mut config = EngineConfig::default();
    config.scheduler.source_timeout_secs = 5;
    let engine = Engine::with_source(config, Arc::new(Hanging));

    let batch = Batch { events: vec![manual("good"), manual("hang")] };
    let report = tokio::time::timeout(std::time::Duration::from_secs(3600), engine.process_batch(batch))
        .await
        .expect("batch pass finishes");
    assert_eq!(report.processed.len(), 1);
    assert_eq!(report.processed[0].organization_id, "good");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].organization_id, "hang");
    assert_eq!(report.failed[0].error.code, ErrorCode::SourceFailure);

    // the lock was released, so the next pass fails the same way instead of waiting
    let err = tokio::time::timeout(std::time::Duration::from_secs(3600), engine.process_organization("hang", &[], now()))
        .await
        .expect("second pass finishes")
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SourceFailure);
}

#[tokio::test]
async fn maintenance_and_forced_reanalysis() {
    let source = Arc::new(MemorySource::new());
    source.set("acme", stale_pipeline());
    let (engine, _alerts) = engine(EngineConfig::default(), source);
    engine.process_organization("acme", &[], now()).await.unwrap();

    let m = engine.run_maintenance(now() + Duration::days(1)).await;
    assert_eq!(m.organizations, 1);
    assert_eq!(m.learning_records, 1);

    let report = engine.reanalyze_all(now()).await;
    assert_eq!(report.processed.len(), 1);
    assert!(report.processed[0].analyzed);
    assert!(report.processed[0].events.is_empty());

    let forced = PendingEvent { organization_id: "acme".into(), source: EventSource::Maintenance, received_at: now() };
    assert!(engine.process_organization("acme", &[forced], now()).await.unwrap().analyzed);
}

#[tokio::test]
async fn learning_state_persists_between_engines() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.state_path = Some(dir.path().join("state.json"));

    let source = Arc::new(MemorySource::new());
    source.set("acme", stale_pipeline());
    let (first, _a) = engine(config.clone(), source.clone());
    first.process_organization("acme", &[], now()).await.unwrap();
    first.persist().unwrap();

    let (second, _b) = engine(config, source);
    assert_eq!(second.restore(), 1);
    let status = second.status(0, None);
    assert_eq!(status.organizations, 1);
    assert_eq!(status.learned_patterns, 1);
    let report = second.process_organization("acme", &[], now() + Duration::minutes(1)).await.unwrap();
    assert!(report.events.is_empty());
}

#[test]
fn restore_without_state_path_is_a_no_op() {
    let engine = Engine::with_source(EngineConfig::default(), Arc::new(MemorySource::new()));
    assert_eq!(engine.restore(), 0);
    engine.persist().unwrap();
}
