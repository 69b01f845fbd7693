use crate::workflow::{Workflow, WorkflowStatus};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static RE_SENIOR_ROLE: Lazy<Regex> = Lazy::new(|| {
    // Titles that usually carry buying authority
    Regex::new(r"(?i)\b(chief|c[etfoi]o|cxo|vp|svp|evp|vice[ -]president|president|head|director|founder|co-founder|owner|partner|executive)\b").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationBucket {
    Short,
    Medium,
    Long,
    Extended,
}

impl DurationBucket {
    pub fn from_days(days: f64) -> Self {
        match days {
            d if d < 14.0 => DurationBucket::Short,
            d if d < 45.0 => DurationBucket::Medium,
            d if d < 90.0 => DurationBucket::Long,
            _ => DurationBucket::Extended,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueTier {
    Small,
    Mid,
    Large,
    Enterprise,
}

impl ValueTier {
    pub fn from_amount(amount: f64) -> Self {
        match amount {
            a if a < 5_000.0 => ValueTier::Small,
            a if a < 50_000.0 => ValueTier::Mid,
            a if a < 250_000.0 => ValueTier::Large,
            _ => ValueTier::Enterprise,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActivityPattern {
    pub total: usize,
    pub density_per_day: f64,
    pub by_kind: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationProfile {
    pub total_days: f64,
    pub bucket: DurationBucket,
    pub avg_stage_days: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueProfile {
    pub amount: f64,
    pub tier: ValueTier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub count: usize,
    pub senior_count: usize,
    pub avg_engagement: Option<f64>,
}

/// Fixed-shape summary of one workflow. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub workflow_id: String,
    pub workflow_type: Option<String>,
    pub status: WorkflowStatus,
    pub activity_pattern: ActivityPattern,
    pub duration_profile: DurationProfile,
    pub value_profile: Option<ValueProfile>,
    pub participant_profile: Option<ParticipantProfile>,
    pub stage_sequence: Vec<String>,
}

pub fn is_senior_role(role: &str) -> bool {
    RE_SENIOR_ROLE.is_match(role)
}

pub fn extract_features(wf: &Workflow) -> FeatureVector {
    let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
    for a in &wf.activities {
        *by_kind.entry(a.kind.to_ascii_lowercase()).or_insert(0) += 1;
    }
    let total = wf.activities.len();
    let activity_pattern = ActivityPattern {
        total,
        density_per_day: total as f64 / wf.duration_days.max(1.0),
        by_kind,
    };

    let stage_days: Vec<f64> = wf.stages.iter().filter_map(|s| s.days()).collect();
    let avg_stage_days = if stage_days.is_empty() {
        None
    } else {
        Some(stage_days.iter().sum::<f64>() / stage_days.len() as f64)
    };
    let duration_profile = DurationProfile {
        total_days: wf.duration_days,
        bucket: DurationBucket::from_days(wf.duration_days),
        avg_stage_days,
    };

    let value_profile = wf
        .value
        .map(|amount| ValueProfile { amount: amount.max(0.0), tier: ValueTier::from_amount(amount) });

    let participant_profile = if wf.participants.is_empty() {
        None
    } else {
        let senior_count = wf
            .participants
            .iter()
            .filter(|p| p.role.as_deref().map(is_senior_role).unwrap_or(false))
            .count();
        let engagements: Vec<f64> = wf.participants.iter().filter_map(|p| p.engagement).collect();
        let avg_engagement = if engagements.is_empty() {
            None
        } else {
            Some(engagements.iter().sum::<f64>() / engagements.len() as f64)
        };
        Some(ParticipantProfile { count: wf.participants.len(), senior_count, avg_engagement })
    };

    FeatureVector {
        workflow_id: wf.id.clone(),
        workflow_type: wf.workflow_type.as_ref().map(|t| t.trim().to_ascii_lowercase()).filter(|t| !t.is_empty()),
        status: wf.status,
        activity_pattern,
        duration_profile,
        value_profile,
        participant_profile,
        stage_sequence: wf.stages.iter().map(|s| s.name.trim().to_ascii_lowercase()).collect(),
    }
}

/// Extract features for a batch in parallel; output order follows input order.
pub fn extract_all(workflows: &[Workflow]) -> Vec<FeatureVector> {
    workflows.par_iter().map(extract_features).collect()
}
