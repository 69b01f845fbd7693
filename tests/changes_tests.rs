use chrono::{DateTime, Duration, TimeZone, Utc};
use dealscope::changes::{pipeline_health, ChangeDetector, ChangeKind, DetectionOptions, TrackedField};
use dealscope::workflow::{parse_workflows, Workflow};
use serde_json::{json, Value};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn days_ago(d: i64) -> String {
    (now() - Duration::days(d)).to_rfc3339()
}

fn parse(records: &[Value]) -> Vec<Workflow> {
    parse_workflows(records).0
}

fn pipeline() -> Vec<Value> {
    vec![
        json!({"id": "d1", "value": 1000, "probability": 0.4, "stages": [{"name": "Lead"}], "last_activity_at": days_ago(1)}),
        json!({"id": "d2", "value": 5000, "probability": 0.6, "stages": [{"name": "Demo"}], "last_activity_at": days_ago(2)}),
    ]
}

#[test]
fn first_observation_is_initial_analysis() {
    let detector = ChangeDetector::default();
    let snap = detector.capture(&parse(&pipeline()), now());
    let d = detector.detect("org", None, &snap);
    assert_eq!(d.events.len(), 1);
    assert_eq!(d.events[0].kind, ChangeKind::InitialAnalysis);
    assert_eq!(d.events[0].significance, 1.0);
}

#[test]
fn unchanged_snapshot_yields_nothing() {
    let detector = ChangeDetector::default();
    let wfs = parse(&pipeline());
    let first = detector.capture(&wfs, now());
    let second = detector.capture(&wfs, now() + Duration::hours(1));
    assert!(detector.detect("org", Some(&first), &second).events.is_empty());
    let third = detector.capture(&wfs, now() + Duration::hours(2));
    assert!(detector.detect("org", Some(&second), &third).events.is_empty());
}

#[test]
fn tracked_field_changes_in_id_then_field_order() {
    let detector = ChangeDetector::default();
    let before = detector.capture(&parse(&pipeline()), now());
    let mut changed = pipeline();
    changed[1]["stages"] = json!([{"name": "Demo"}, {"name": "Proposal"}]);
    changed[1]["value"] = json!(7000);
    changed[0]["probability"] = json!(0.5);
    changed.push(json!({"id": "d0", "last_activity_at": days_ago(0)}));
    let after = detector.capture(&parse(&changed), now());
    let d = detector.detect("org", Some(&before), &after);

    let labels: Vec<(&str, Option<&str>)> =
        d.events.iter().map(|e| (e.kind.label(), e.subject_id.as_deref())).collect();
    assert_eq!(
        labels,
        vec![
            ("created", Some("d0")),
            ("updated.probability", Some("d1")),
            ("updated.stage", Some("d2")),
            ("updated.value", Some("d2")),
        ]
    );
    match &d.events[2].kind {
        ChangeKind::Updated { field, previous, current } => {
            assert_eq!(*field, TrackedField::Stage);
            assert_eq!(previous.as_deref(), Some("demo"));
            assert_eq!(current.as_deref(), Some("proposal"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(d.events[2].significance, 0.9);
}

#[test]
fn stagnation_fires_once() {
    let detector = ChangeDetector::new(DetectionOptions { stagnation_days: 7.0, ..DetectionOptions::default() });
    let fresh = parse(&[json!({"id": "s1", "last_activity_at": days_ago(3)})]);
    let stale = parse(&[json!({"id": "s1", "last_activity_at": days_ago(45)})]);
    let first = detector.capture(&fresh, now());
    let second = detector.capture(&stale, now());
    let d = detector.detect("org", Some(&first), &second);
    let stagnant: Vec<_> = d.events.iter().filter(|e| matches!(e.kind, ChangeKind::Stagnant { .. })).collect();
    assert_eq!(stagnant.len(), 1);
    assert_eq!(stagnant[0].subject_id.as_deref(), Some("s1"));
    match stagnant[0].kind {
        ChangeKind::Stagnant { idle_days } => assert!((idle_days - 45.0).abs() < 1e-6),
        _ => unreachable!(),
    }

    let third = detector.capture(&stale, now() + Duration::hours(1));
    let again = detector.detect("org", Some(&second), &third);
    assert!(again.events.iter().all(|e| !matches!(e.kind, ChangeKind::Stagnant { .. })));
}

#[test]
fn closed_workflows_never_stagnate() {
    let detector = ChangeDetector::default();
    let prev = detector.capture(&parse(&[json!({"id": "w", "status": "open", "last_activity_at": days_ago(1)})]), now());
    let cur = detector.capture(&parse(&[json!({"id": "w", "status": "won", "last_activity_at": days_ago(60)})]), now());
    let d = detector.detect("org", Some(&prev), &cur);
    assert!(d.events.iter().all(|e| !matches!(e.kind, ChangeKind::Stagnant { .. })));
}

#[test]
fn health_swing_and_min_significance() {
    let opts = DetectionOptions { min_significance: 0.65, ..DetectionOptions::default() };
    let detector = ChangeDetector::new(opts);
    let healthy = parse(&[
        json!({"id": "a", "probability": 0.9, "last_activity_at": days_ago(1)}),
        json!({"id": "b", "probability": 0.9, "last_activity_at": days_ago(1)}),
    ]);
    let sick = parse(&[
        json!({"id": "a", "probability": 0.1, "last_activity_at": days_ago(30)}),
        json!({"id": "b", "probability": 0.1, "last_activity_at": days_ago(30)}),
    ]);
    let prev = detector.capture(&healthy, now());
    let cur = detector.capture(&sick, now());
    let d = detector.detect("org", Some(&prev), &cur);
    // probability updates (0.6) fall under the floor
    assert_eq!(d.discarded, 2);
    assert!(d.events.iter().all(|e| e.significance >= 0.65));
    assert!(d.events.iter().any(|e| matches!(e.kind, ChangeKind::HealthShift { .. })));
    assert_eq!(d.events.iter().filter(|e| matches!(e.kind, ChangeKind::Stagnant { .. })).count(), 2);
}

#[test]
fn health_score_bounds() {
    assert_eq!(pipeline_health(&[], now(), 7.0), 50.0);
    let all_won = parse(&[json!({"id": "a", "status": "won"}), json!({"id": "b", "status": "closedwon"})]);
    // no open workflows: fresh and probability neutral
    assert!((pipeline_health(&all_won, now(), 7.0) - 100.0 * (0.25 + 0.3 + 0.1)).abs() < 1e-9);
    let h = pipeline_health(&parse(&pipeline()), now(), 7.0);
    assert!((0.0..=100.0).contains(&h));
}
