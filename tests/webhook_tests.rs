use chrono::{TimeZone, Utc};
use dealscope::scheduler::EventSource;
use dealscope::webhook::{parse_notification, WebhookError, WebhookFilter, WebhookOptions};
use serde_json::json;

#[test]
fn parses_both_timestamp_forms() {
    let a = parse_notification(&json!({
        "subscription_type": "deal.propertyChange",
        "object_id": 42,
        "property_name": "dealstage",
        "occurred_at": 1_700_000_000_000i64
    }))
    .unwrap();
    assert_eq!(a.object_id, "42");
    assert_eq!(a.occurred_at, Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());

    let b = parse_notification(&json!({
        "subscriptionType": "deal.creation",
        "objectId": "d-1",
        "occurredAt": "2024-03-01T10:00:00Z"
    }))
    .unwrap();
    assert_eq!(b.property_name, None);
    assert_eq!(b.occurred_at, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
}

#[test]
fn rejects_malformed_items() {
    assert_eq!(parse_notification(&json!([1])), Err(WebhookError::NotObject));
    assert_eq!(
        parse_notification(&json!({"object_id": 1, "occurred_at": 0})),
        Err(WebhookError::MissingField("subscription_type"))
    );
    assert!(matches!(
        parse_notification(&json!({"subscription_type": "deal.creation", "object_id": 1, "occurred_at": "yesterday"})),
        Err(WebhookError::BadTimestamp(_))
    ));
}

#[test]
fn ingest_filters_and_skips() {
    let filter = WebhookFilter::from(&WebhookOptions::default());
    let now = Utc::now();
    let batch = vec![
        json!({"subscription_type": "deal.propertyChange", "object_id": 1, "property_name": "amount", "occurred_at": 1}),
        json!({"subscription_type": "deal.propertyChange", "object_id": 2, "property_name": "hs_note", "occurred_at": 1}),
        json!({"subscription_type": "deal.propertyChange", "object_id": 3, "occurred_at": 1}),
        json!({"subscription_type": "contact.creation", "object_id": 4, "occurred_at": 1}),
        json!({"subscription_type": "deal.deletion", "object_id": 5, "occurred_at": 1}),
        json!("garbage"),
        json!({"subscription_type": "deal.creation"}),
    ];
    let out = filter.ingest("acme", &batch, now);
    assert_eq!(out.accepted.len(), 2);
    assert_eq!(out.dropped_irrelevant, 3);
    assert_eq!(out.skipped_malformed, 2);
    let ids: Vec<&str> = out
        .accepted
        .iter()
        .map(|e| match &e.source {
            EventSource::Webhook(n) => n.object_id.as_str(),
            other => panic!("unexpected source {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec!["1", "5"]);
    assert!(out.accepted.iter().all(|e| e.organization_id == "acme" && e.received_at == now));
}

#[test]
fn allow_lists_are_configurable() {
    let opts = WebhookOptions {
        subscription_types: vec!["contact.propertyChange".into()],
        property_names: vec!["lifecyclestage".into()],
    };
    let filter = WebhookFilter::from(&opts);
    let out = filter.ingest(
        "acme",
        &[json!({"subscription_type": "contact.propertyChange", "object_id": "c", "property_name": "lifecyclestage", "occurred_at": 5})],
        Utc::now(),
    );
    assert_eq!(out.accepted.len(), 1);
}
