use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

use crate::scheduler::{EventSource, PendingEvent};

#[derive(Debug, Error, PartialEq)]
pub enum WebhookError {
    #[error("notification is not a JSON object")]
    NotObject,
    #[error("notification is missing {0}")]
    MissingField(&'static str),
    #[error("unparsable occurred_at: {0}")]
    BadTimestamp(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookOptions {
    pub subscription_types: Vec<String>,
    pub property_names: Vec<String>,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            subscription_types: [
                "deal.creation",
                "deal.propertyChange",
                "deal.deletion",
                "ticket.creation",
                "ticket.propertyChange",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            property_names: [
                "dealstage",
                "amount",
                "hs_deal_stage_probability",
                "closedate",
                "hs_lastactivitydate",
                "hs_pipeline_stage",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subscription_type: String,
    pub object_id: String,
    pub property_name: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, snake: &str, camel: &str) -> Option<&'a Value> {
    obj.get(snake).or_else(|| obj.get(camel)).filter(|v| !v.is_null())
}

fn parse_time(v: &Value) -> Result<DateTime<Utc>, WebhookError> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|_| WebhookError::BadTimestamp(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| WebhookError::BadTimestamp(n.to_string())),
        other => Err(WebhookError::BadTimestamp(other.to_string())),
    }
}

/// Accepts snake_case or camelCase keys; `occurred_at` may be RFC 3339 or epoch milliseconds.
pub fn parse_notification(v: &Value) -> Result<Notification, WebhookError> {
    let obj = v.as_object().ok_or(WebhookError::NotObject)?;
    let subscription_type = field(obj, "subscription_type", "subscriptionType")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(WebhookError::MissingField("subscription_type"))?
        .to_string();
    let object_id = match field(obj, "object_id", "objectId") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(WebhookError::MissingField("object_id")),
    };
    let property_name = field(obj, "property_name", "propertyName").and_then(|v| v.as_str()).map(str::to_string);
    let occurred_at = parse_time(field(obj, "occurred_at", "occurredAt").ok_or(WebhookError::MissingField("occurred_at"))?)?;
    Ok(Notification { subscription_type, object_id, property_name, occurred_at })
}

#[derive(Debug, Clone, Default)]
pub struct Ingested {
    pub accepted: Vec<PendingEvent>,
    pub skipped_malformed: usize,
    pub dropped_irrelevant: usize,
}

#[derive(Debug, Clone)]
pub struct WebhookFilter {
    types: HashSet<String>,
    properties: HashSet<String>,
}

impl From<&WebhookOptions> for WebhookFilter {
    fn from(opts: &WebhookOptions) -> Self {
        Self {
            types: opts.subscription_types.iter().cloned().collect(),
            properties: opts.property_names.iter().cloned().collect(),
        }
    }
}

impl WebhookFilter {
    /// Allow-listed type, and for property changes an allow-listed property.
    pub fn is_relevant(&self, n: &Notification) -> bool {
        if !self.types.contains(&n.subscription_type) {
            return false;
        }
        match &n.property_name {
            Some(p) => self.properties.contains(p),
            None => !n.subscription_type.ends_with(".propertyChange"),
        }
    }

    pub fn ingest(&self, organization_id: &str, items: &[Value], now: DateTime<Utc>) -> Ingested {
        let mut out = Ingested::default();
        for (index, item) in items.iter().enumerate() {
            let n = match parse_notification(item) {
                Ok(n) => n,
                Err(e) => {
                    debug!(organization = %organization_id, index, error = %e, "skipping malformed notification");
                    out.skipped_malformed += 1;
                    continue;
                }
            };
            if !self.is_relevant(&n) {
                out.dropped_irrelevant += 1;
                continue;
            }
            out.accepted.push(PendingEvent {
                organization_id: organization_id.to_string(),
                source: EventSource::Webhook(n),
                received_at: now,
            });
        }
        out
    }
}
