use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::workflow::{days_between, Workflow, WorkflowStatus};

/// Per-change significance weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignificanceTable {
    pub stage: f64,
    pub value: f64,
    pub probability: f64,
    pub created: f64,
    pub stagnant: f64,
    pub health_shift: f64,
}

impl Default for SignificanceTable {
    fn default() -> Self {
        Self { stage: 0.9, value: 0.7, probability: 0.6, created: 0.6, stagnant: 0.85, health_shift: 0.9 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionOptions {
    pub stagnation_days: f64,
    /// Events below this are dropped before reaching the alert store.
    pub min_significance: f64,
    /// Health points the pipeline score must move between snapshots.
    pub health_delta: f64,
    pub significance: SignificanceTable,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self { stagnation_days: 7.0, min_significance: 0.5, health_delta: 15.0, significance: SignificanceTable::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Stage,
    Value,
    Probability,
}

impl TrackedField {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackedField::Stage => "stage",
            TrackedField::Value => "value",
            TrackedField::Probability => "probability",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    InitialAnalysis,
    Created,
    Updated { field: TrackedField, previous: Option<String>, current: Option<String> },
    Stagnant { idle_days: f64 },
    HealthShift { previous: f64, current: f64 },
    ManualTrigger,
}

impl ChangeKind {
    /// Stable key used to group occurrences for learning.
    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::InitialAnalysis => "initial_analysis",
            ChangeKind::Created => "created",
            ChangeKind::Updated { field: TrackedField::Stage, .. } => "updated.stage",
            ChangeKind::Updated { field: TrackedField::Value, .. } => "updated.value",
            ChangeKind::Updated { field: TrackedField::Probability, .. } => "updated.probability",
            ChangeKind::Stagnant { .. } => "stagnant",
            ChangeKind::HealthShift { .. } => "health_shift",
            ChangeKind::ManualTrigger => "manual_trigger",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub organization_id: String,
    pub subject_id: Option<String>,
    pub significance: f64,
    pub detected_at: DateTime<Utc>,
    pub reason: String,
}

impl ChangeEvent {
    pub fn manual(organization_id: &str, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            kind: ChangeKind::ManualTrigger,
            organization_id: organization_id.to_string(),
            subject_id: None,
            significance: 1.0,
            detected_at: now,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub stage: Option<String>,
    pub value: Option<f64>,
    pub probability: Option<f64>,
    pub status: WorkflowStatus,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Whether the workflow had crossed the stagnation threshold when captured.
    pub stagnant: bool,
}

/// What the detector remembers about an organization between passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub health: f64,
    pub workflows: BTreeMap<String, WorkflowState>,
}

fn idle_days(wf: &Workflow, now: DateTime<Utc>) -> Option<f64> {
    wf.last_activity().map(|t| days_between(t, now).max(0.0))
}

fn is_stagnant(wf: &Workflow, now: DateTime<Utc>, stagnation_days: f64) -> bool {
    !wf.is_closed() && idle_days(wf, now).map(|d| d > stagnation_days).unwrap_or(false)
}

impl Snapshot {
    pub fn capture(workflows: &[Workflow], now: DateTime<Utc>, opts: &DetectionOptions) -> Self {
        let states = workflows
            .iter()
            .map(|wf| {
                (
                    wf.id.clone(),
                    WorkflowState {
                        stage: wf.current_stage().map(|s| s.trim().to_ascii_lowercase()),
                        value: wf.value,
                        probability: wf.probability,
                        status: wf.status,
                        last_activity_at: wf.last_activity(),
                        stagnant: is_stagnant(wf, now, opts.stagnation_days),
                    },
                )
            })
            .collect();
        Self { taken_at: now, health: pipeline_health(workflows, now, opts.stagnation_days), workflows: states }
    }
}

/// Aggregate pipeline health on a 0-100 scale.
///
/// `100 * (0.5 * fresh_open + 0.3 * win_rate + 0.2 * avg_open_probability)`;
/// a component with no data counts as a neutral 0.5.
pub fn pipeline_health(workflows: &[Workflow], now: DateTime<Utc>, stagnation_days: f64) -> f64 {
    if workflows.is_empty() {
        return 50.0;
    }
    let open: Vec<&Workflow> = workflows.iter().filter(|w| !w.is_closed()).collect();
    let fresh = if open.is_empty() {
        0.5
    } else {
        open.iter().filter(|w| !is_stagnant(w, now, stagnation_days)).count() as f64 / open.len() as f64
    };
    let won = workflows.iter().filter(|w| w.status == WorkflowStatus::Won).count();
    let lost = workflows.iter().filter(|w| w.status == WorkflowStatus::Lost).count();
    let win_rate = if won + lost == 0 { 0.5 } else { won as f64 / (won + lost) as f64 };
    let probs: Vec<f64> = open.iter().filter_map(|w| w.probability).collect();
    let prob = if probs.is_empty() { 0.5 } else { probs.iter().sum::<f64>() / probs.len() as f64 };
    (100.0 * (0.5 * fresh + 0.3 * win_rate + 0.2 * prob)).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// Events at or above the minimum significance, in detection order.
    pub events: Vec<ChangeEvent>,
    pub discarded: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    opts: DetectionOptions,
}

fn fmt_num(v: Option<f64>) -> Option<String> {
    v.map(|x| format!("{x}"))
}

fn differs(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => (x - y).abs() > 1e-9,
        (None, None) => false,
        _ => true,
    }
}

impl ChangeDetector {
    pub fn new(opts: DetectionOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &DetectionOptions {
        &self.opts
    }

    pub fn capture(&self, workflows: &[Workflow], now: DateTime<Utc>) -> Snapshot {
        Snapshot::capture(workflows, now, &self.opts)
    }

    /// Diff `current` against the organization's previous snapshot.
    pub fn detect(&self, organization_id: &str, previous: Option<&Snapshot>, current: &Snapshot) -> Detection {
        let now = current.taken_at;
        let sig = &self.opts.significance;
        let event = |kind: ChangeKind, subject: Option<&str>, significance: f64, reason: String| ChangeEvent {
            kind,
            organization_id: organization_id.to_string(),
            subject_id: subject.map(str::to_string),
            significance: significance.clamp(0.0, 1.0),
            detected_at: now,
            reason,
        };

        let Some(prev) = previous else {
            return Detection {
                events: vec![event(
                    ChangeKind::InitialAnalysis,
                    None,
                    1.0,
                    format!("first snapshot with {} workflows", current.workflows.len()),
                )],
                discarded: 0,
            };
        };

        let mut candidates = Vec::new();
        for (id, cur) in &current.workflows {
            match prev.workflows.get(id) {
                None => candidates.push(event(ChangeKind::Created, Some(id.as_str()), sig.created, format!("new workflow {id}"))),
                Some(old) => {
                    if old.stage != cur.stage {
                        candidates.push(event(
                            ChangeKind::Updated { field: TrackedField::Stage, previous: old.stage.clone(), current: cur.stage.clone() },
                            Some(id.as_str()),
                            sig.stage,
                            format!(
                                "stage moved from {} to {}",
                                old.stage.as_deref().unwrap_or("none"),
                                cur.stage.as_deref().unwrap_or("none")
                            ),
                        ));
                    }
                    if differs(old.value, cur.value) {
                        candidates.push(event(
                            ChangeKind::Updated { field: TrackedField::Value, previous: fmt_num(old.value), current: fmt_num(cur.value) },
                            Some(id.as_str()),
                            sig.value,
                            "monetary value changed".to_string(),
                        ));
                    }
                    if differs(old.probability, cur.probability) {
                        candidates.push(event(
                            ChangeKind::Updated {
                                field: TrackedField::Probability,
                                previous: fmt_num(old.probability),
                                current: fmt_num(cur.probability),
                            },
                            Some(id.as_str()),
                            sig.probability,
                            "close probability changed".to_string(),
                        ));
                    }
                }
            }
            let was_stagnant = prev.workflows.get(id).map(|o| o.stagnant).unwrap_or(false);
            if cur.stagnant && !was_stagnant {
                let idle = cur.last_activity_at.map(|t| days_between(t, now).max(0.0)).unwrap_or(0.0);
                candidates.push(event(
                    ChangeKind::Stagnant { idle_days: idle },
                    Some(id.as_str()),
                    sig.stagnant,
                    format!("no activity for {:.0} days (threshold {:.0})", idle, self.opts.stagnation_days),
                ));
            }
        }

        if (current.health - prev.health).abs() >= self.opts.health_delta {
            candidates.push(event(
                ChangeKind::HealthShift { previous: prev.health, current: current.health },
                None,
                sig.health_shift,
                format!("pipeline health moved from {:.0} to {:.0}", prev.health, current.health),
            ));
        }

        let before = candidates.len();
        let events: Vec<ChangeEvent> =
            candidates.into_iter().filter(|e| e.significance >= self.opts.min_significance).collect();
        Detection { discarded: before - events.len(), events }
    }
}
