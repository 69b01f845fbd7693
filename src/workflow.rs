use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("record is not a JSON object")]
    NotObject,
    #[error("record has no id")]
    MissingId,
    #[error("duplicate workflow id: {0}")]
    DuplicateId(String),
    #[error("invalid record: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Open,
    Won,
    Lost,
}

impl WorkflowStatus {
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim().to_ascii_lowercase().replace(|c: char| c == '-' || c == ' ', "_");
        match s.as_str() {
            "won" | "closedwon" | "closed_won" | "success" | "succeeded" | "completed" | "resolved" => WorkflowStatus::Won,
            "lost" | "closedlost" | "closed_lost" | "failed" | "cancelled" | "canceled" | "abandoned" => WorkflowStatus::Lost,
            _ => WorkflowStatus::Open,
        }
    }

    pub fn is_closed(self) -> bool {
        !matches!(self, WorkflowStatus::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub entered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_days: Option<f64>,
}

impl Stage {
    /// Days spent in this stage, from explicit duration or entry/exit times.
    pub fn days(&self) -> Option<f64> {
        if let Some(d) = self.duration_days {
            return Some(d.max(0.0));
        }
        match (self.entered_at, self.exited_at) {
            (Some(a), Some(b)) => Some(days_between(a, b).max(0.0)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(default = "unknown_kind", alias = "type")]
    pub kind: String,
    #[serde(default, alias = "timestamp")]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default = "unknown_kind", alias = "type")]
    pub kind: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub engagement: Option<f64>,
}

fn unknown_kind() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default, rename = "type")]
    pub workflow_type: Option<String>,
    #[serde(default)]
    pub duration_days: f64,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workflow_type: None,
            duration_days: 0.0,
            value: None,
            probability: None,
            status: WorkflowStatus::Open,
            stages: Vec::new(),
            activities: Vec::new(),
            participants: Vec::new(),
            last_activity_at: None,
        }
    }

    pub fn current_stage(&self) -> Option<&str> {
        self.stages.last().map(|s| s.name.as_str())
    }

    /// Explicit last-activity time, else the newest dated activity.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let newest = self.activities.iter().filter_map(|a| a.at).max();
        match (self.last_activity_at, newest) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    fn normalize(&mut self) {
        if !self.duration_days.is_finite() || self.duration_days < 0.0 {
            self.duration_days = 0.0;
        }
        if let Some(v) = self.value {
            if !v.is_finite() { self.value = None; }
        }
        if let Some(p) = self.probability {
            self.probability = if p.is_finite() { Some(p.clamp(0.0, 1.0)) } else { None };
        }
        for p in &mut self.participants {
            if let Some(e) = p.engagement {
                p.engagement = if e.is_finite() { Some(e.clamp(0.0, 1.0)) } else { None };
            }
        }
        // Dated stages in entry order; undated ones keep their relative order after them.
        self.stages.sort_by(|a, b| match (a.entered_at, b.entered_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordError {
    pub index: usize,
    pub id: Option<String>,
    pub message: String,
}

pub fn parse_workflow(record: &Value) -> Result<Workflow, WorkflowError> {
    let obj = record.as_object().ok_or(WorkflowError::NotObject)?;
    let id = match obj.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(WorkflowError::MissingId),
    };
    let mut fields = obj.clone();
    fields.insert("id".to_string(), Value::String(id.clone()));
    // Status arrives as free text from most sources.
    let status = fields.get("status").and_then(|v| v.as_str()).map(WorkflowStatus::parse);
    if let Some(status) = status {
        fields.insert("status".to_string(), serde_json::to_value(status)?);
    }
    retain_parsable::<Stage>(&mut fields, "stages", &id);
    retain_parsable::<Activity>(&mut fields, "activities", &id);
    retain_parsable::<Participant>(&mut fields, "participants", &id);
    let mut wf: Workflow = serde_json::from_value(Value::Object(fields))?;
    wf.normalize();
    Ok(wf)
}

/// Drop list entries that do not parse; the rest of the record still counts.
fn retain_parsable<T: DeserializeOwned>(fields: &mut Map<String, Value>, key: &str, id: &str) {
    let Some(Value::Array(items)) = fields.get_mut(key) else { return };
    let before = items.len();
    items.retain(|item| serde_json::from_value::<T>(item.clone()).is_ok());
    if items.len() < before {
        debug!(workflow = %id, field = key, dropped = before - items.len(), "dropped unparsable entries");
    }
}

/// Parse a batch of records, skipping (and reporting) the ones that cannot be used.
pub fn parse_workflows(records: &[Value]) -> (Vec<Workflow>, Vec<RecordError>) {
    let mut out = Vec::with_capacity(records.len());
    let mut errors = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for (index, record) in records.iter().enumerate() {
        let id_hint = record.get("id").and_then(|v| v.as_str()).map(str::to_string);
        match parse_workflow(record) {
            Ok(wf) => {
                if !seen.insert(wf.id.clone()) {
                    let err = WorkflowError::DuplicateId(wf.id.clone());
                    tracing::warn!(workflow = %wf.id, index, "skipping duplicate workflow record");
                    errors.push(RecordError { index, id: Some(wf.id), message: err.to_string() });
                    continue;
                }
                out.push(wf);
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "skipping malformed workflow record");
                errors.push(RecordError { index, id: id_hint, message: e.to_string() });
            }
        }
    }
    (out, errors)
}

pub fn days_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (b - a).num_seconds() as f64 / 86_400.0
}
