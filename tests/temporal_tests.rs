use chrono::{Duration, TimeZone, Utc};
use dealscope::temporal::{activity_timeline, edge_timings, largest_gap, stage_at};
use dealscope::workflow::parse_workflow;
use serde_json::json;

#[test]
fn largest_gap_ignores_input_order() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let times = vec![start + Duration::days(12), start, start + Duration::days(2), start + Duration::days(3)];
    let gap = largest_gap(&times).unwrap();
    assert_eq!(gap.start_time, start + Duration::days(3));
    assert_eq!(gap.end_time, start + Duration::days(12));
    assert_eq!(gap.duration_days, 9.0);
    assert!(largest_gap(&[start]).is_none());
}

#[test]
fn timeline_and_stage_lookup() {
    let wf = parse_workflow(&json!({
        "id": "d1",
        "stages": [
            {"name": "lead", "entered_at": "2024-01-01T00:00:00Z"},
            {"name": "demo", "entered_at": "2024-01-05T00:00:00Z"},
            {"name": "proposal", "entered_at": "2024-01-15T12:00:00Z"}
        ],
        "activities": [
            {"type": "call", "timestamp": "2024-01-03T00:00:00Z"},
            {"type": "note"}
        ]
    }))
    .unwrap();

    let times = activity_timeline(&wf);
    assert_eq!(times.len(), 4);
    assert!(times.windows(2).all(|w| w[0] <= w[1]));

    let t = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
    assert_eq!(stage_at(&wf, t), Some("demo"));
    let before = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
    assert_eq!(stage_at(&wf, before), None);

    let edges = edge_timings(&wf);
    assert_eq!(edges.len(), 2);
    assert_eq!((edges[0].from.as_str(), edges[0].to.as_str()), ("lead", "demo"));
    assert_eq!(edges[0].days, 4.0);
    assert_eq!(edges[1].days, 10.5);
}

#[test]
fn edge_timing_falls_back_to_recorded_duration() {
    let wf = parse_workflow(&json!({
        "id": "d2",
        "stages": [
            {"name": "Lead", "duration_days": 6},
            {"name": "Demo"},
            {"name": "Proposal"}
        ]
    }))
    .unwrap();
    let edges = edge_timings(&wf);
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].from, "lead");
    assert_eq!(edges[0].to, "demo");
    assert_eq!(edges[0].days, 6.0);
}
