//! Per-organization frequency counters over change types.
//!
//! Confidence is `min(1, occurrences / saturation_occurrences)`: a plain
//! frequency count, not a trained model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::changes::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningOptions {
    /// Occurrences after which confidence stays at 1.0.
    pub saturation_occurrences: u64,
    /// Outcomes kept per record; the oldest are evicted first.
    pub outcome_capacity: usize,
}

impl Default for LearningOptions {
    fn default() -> Self {
        Self { saturation_occurrences: 10, outcome_capacity: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LearningKey {
    pub change_type: String,
    pub organization_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub at: DateTime<Utc>,
    pub significance: f64,
    pub alerted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub key: LearningKey,
    pub occurrences: u64,
    pub outcomes: VecDeque<Outcome>,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub fn confidence(occurrences: u64, saturation: u64) -> f64 {
    if saturation == 0 {
        return 1.0;
    }
    (occurrences as f64 / saturation as f64).min(1.0)
}

impl LearningRecord {
    pub fn new(key: LearningKey, now: DateTime<Utc>) -> Self {
        Self { key, occurrences: 0, outcomes: VecDeque::new(), confidence: 0.0, first_seen: now, last_seen: now }
    }

    pub fn observe(&mut self, significance: f64, alerted: bool, now: DateTime<Utc>, opts: &LearningOptions) {
        self.occurrences = self.occurrences.saturating_add(1);
        self.outcomes.push_back(Outcome { at: now, significance, alerted });
        self.last_seen = self.last_seen.max(now);
        self.recompute(opts);
    }

    /// Re-derive confidence and enforce the outcome capacity.
    pub fn recompute(&mut self, opts: &LearningOptions) {
        while self.outcomes.len() > opts.outcome_capacity {
            self.outcomes.pop_front();
        }
        self.confidence = confidence(self.occurrences, opts.saturation_occurrences);
    }

    /// Share of retained outcomes that ended in a delivered alert.
    pub fn alert_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.outcomes.iter().filter(|o| o.alerted).count() as f64 / self.outcomes.len() as f64
    }
}

/// All learning records of one organization, keyed by change type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LearningBook {
    records: BTreeMap<String, LearningRecord>,
}

impl LearningBook {
    pub fn observe(&mut self, event: &ChangeEvent, alerted: bool, now: DateTime<Utc>, opts: &LearningOptions) -> &LearningRecord {
        let change_type = event.kind.label();
        let record = self.records.entry(change_type.to_string()).or_insert_with(|| {
            LearningRecord::new(
                LearningKey { change_type: change_type.to_string(), organization_id: event.organization_id.clone() },
                now,
            )
        });
        record.observe(event.significance, alerted, now, opts);
        record
    }

    pub fn get(&self, change_type: &str) -> Option<&LearningRecord> {
        self.records.get(change_type)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LearningRecord> {
        self.records.values()
    }

    /// Daily maintenance: recompute every record under the current options.
    pub fn rollup(&mut self, opts: &LearningOptions) -> usize {
        for record in self.records.values_mut() {
            record.recompute(opts);
        }
        self.records.len()
    }
}
