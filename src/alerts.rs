use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::changes::{ChangeEvent, ChangeKind};
use crate::recommend::{Recommendation, Roi};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertOptions {
    /// Events at or above this significance re-run pattern analysis.
    pub trigger_threshold: f64,
    /// Alerts delivered per organization per UTC calendar day.
    pub max_alerts_per_day: usize,
    /// Pipeline health below this raises a critical alert.
    pub critical_health: f64,
    /// Stagnation events in one batch that count as a burst.
    pub stagnation_burst: usize,
    pub history_days: i64,
    pub max_history: usize,
}

impl Default for AlertOptions {
    fn default() -> Self {
        Self {
            trigger_threshold: 0.8,
            max_alerts_per_day: 3,
            critical_health: 40.0,
            stagnation_burst: 3,
            history_days: 30,
            max_history: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CriticalHealth,
    StagnationBurst,
    HighRoiRecommendation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Sent,
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCandidate {
    pub kind: AlertKind,
    pub urgency: Urgency,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub kind: AlertKind,
    pub organization_id: String,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
    pub payload: serde_json::Value,
}

/// Append-only alert history of one organization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlertLog {
    records: Vec<AlertRecord>,
    #[serde(default)]
    next_seq: u64,
}

impl AlertLog {
    pub fn records(&self) -> &[AlertRecord] {
        &self.records
    }

    pub fn sent_on(&self, day: NaiveDate) -> usize {
        self.records
            .iter()
            .filter(|r| r.delivery == Delivery::Sent && r.created_at.date_naive() == day)
            .count()
    }

    /// Record a candidate as sent, or as suppressed once the day's cap is used up.
    pub fn submit(
        &mut self,
        organization_id: &str,
        candidate: AlertCandidate,
        now: DateTime<Utc>,
        opts: &AlertOptions,
    ) -> AlertRecord {
        let day = now.date_naive();
        let delivery = if self.sent_on(day) < opts.max_alerts_per_day { Delivery::Sent } else { Delivery::Suppressed };
        self.next_seq += 1;
        let record = AlertRecord {
            id: format!("{}-{}-{}", organization_id, day.format("%Y%m%d"), self.next_seq),
            kind: candidate.kind,
            organization_id: organization_id.to_string(),
            urgency: candidate.urgency,
            created_at: now,
            delivery,
            payload: candidate.payload,
        };
        if delivery == Delivery::Suppressed {
            warn!(organization = %organization_id, kind = ?record.kind, cap = opts.max_alerts_per_day, "daily alert cap reached; suppressing");
        }
        self.records.push(record.clone());
        self.trim(now, opts);
        record
    }

    /// Drop records past the retention window, then the oldest ones over
    /// `max_history`. Records from the current day are always kept so the
    /// daily cap stays enforceable.
    pub fn trim(&mut self, now: DateTime<Utc>, opts: &AlertOptions) {
        let cutoff = now - Duration::days(opts.history_days.max(1));
        self.records.retain(|r| r.created_at >= cutoff);
        let today = now.date_naive();
        let mut excess = self.records.len().saturating_sub(opts.max_history);
        if excess == 0 { return; }
        self.records.retain(|r| {
            if excess > 0 && r.created_at.date_naive() != today {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Alert candidates for one processed batch.
pub fn evaluate_rules(
    health: f64,
    events: &[ChangeEvent],
    recommendations: &[(String, Recommendation)],
    opts: &AlertOptions,
) -> Vec<AlertCandidate> {
    let mut out = Vec::new();
    if health < opts.critical_health {
        out.push(AlertCandidate {
            kind: AlertKind::CriticalHealth,
            urgency: Urgency::Critical,
            payload: json!({ "health": health, "floor": opts.critical_health }),
        });
    }
    let stagnant: Vec<&str> = events
        .iter()
        .filter(|e| matches!(e.kind, ChangeKind::Stagnant { .. }))
        .filter_map(|e| e.subject_id.as_deref())
        .collect();
    if opts.stagnation_burst > 0 && stagnant.len() >= opts.stagnation_burst {
        out.push(AlertCandidate {
            kind: AlertKind::StagnationBurst,
            urgency: Urgency::High,
            payload: json!({ "count": stagnant.len(), "workflows": stagnant }),
        });
    }
    for (pattern_id, rec) in recommendations.iter().filter(|(_, r)| r.roi == Roi::High) {
        out.push(AlertCandidate {
            kind: AlertKind::HighRoiRecommendation,
            urgency: Urgency::Medium,
            payload: json!({ "pattern": pattern_id, "title": rec.title, "rationale": rec.rationale }),
        });
    }
    out
}

/// Where delivered alerts go.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &AlertRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AlertSink for TracingSink {
    fn deliver(&self, alert: &AlertRecord) {
        info!(organization = %alert.organization_id, kind = ?alert.kind, urgency = ?alert.urgency, id = %alert.id, "alert");
    }
}

/// Forwards delivered alerts to a channel, e.g. for the CLI writer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AlertRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelSink {
    fn deliver(&self, alert: &AlertRecord) {
        if self.tx.send(alert.clone()).is_err() {
            warn!(id = %alert.id, "alert receiver dropped");
        }
    }
}
