use crate::features::{FeatureVector, ParticipantProfile};
use serde::{Deserialize, Serialize};

/// Weights of the sub-similarities. Must be non-negative and sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub type_match: f64,
    pub duration: f64,
    pub value: f64,
    pub activity: f64,
    pub participants: f64,
    pub stages: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            type_match: 0.25,
            duration: 0.20,
            value: 0.20,
            activity: 0.10,
            participants: 0.10,
            stages: 0.15,
        }
    }
}

impl SimilarityWeights {
    pub fn as_array(&self) -> [(&'static str, f64); 6] {
        [
            ("type_match", self.type_match),
            ("duration", self.duration),
            ("value", self.value),
            ("activity", self.activity),
            ("participants", self.participants),
            ("stages", self.stages),
        ]
    }

    pub fn total(&self) -> f64 {
        self.as_array().iter().map(|(_, w)| *w).sum()
    }
}

/// Outcome of comparing one sub-feature across two vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Sub {
    /// Absent on both sides: left out of the weighting.
    Skip,
    /// Present on exactly one side.
    Missing,
    Score(f64),
}

fn compare<T>(a: Option<T>, b: Option<T>, f: impl FnOnce(T, T) -> f64) -> Sub {
    match (a, b) {
        (Some(x), Some(y)) => Sub::Score(f(x, y).clamp(0.0, 1.0)),
        (None, None) => Sub::Skip,
        _ => Sub::Missing,
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityEngine {
    weights: SimilarityWeights,
}

impl SimilarityEngine {
    pub fn new(weights: SimilarityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &SimilarityWeights {
        &self.weights
    }

    /// Weighted similarity in [0,1]; symmetric in its arguments.
    pub fn similarity(&self, a: &FeatureVector, b: &FeatureVector) -> f64 {
        let w = &self.weights;
        let subs = [
            (w.type_match, compare(a.workflow_type.as_deref(), b.workflow_type.as_deref(), |x, y| if x == y { 1.0 } else { 0.0 })),
            (w.duration, Sub::Score(closeness(a.duration_profile.total_days, b.duration_profile.total_days))),
            (
                w.value,
                compare(a.value_profile.as_ref(), b.value_profile.as_ref(), |x, y| closeness(x.amount, y.amount)),
            ),
            (
                w.activity,
                compare(
                    Some(&a.activity_pattern).filter(|p| p.total > 0),
                    Some(&b.activity_pattern).filter(|p| p.total > 0),
                    |x, y| closeness(x.density_per_day, y.density_per_day),
                ),
            ),
            (
                w.participants,
                compare(a.participant_profile.as_ref(), b.participant_profile.as_ref(), participant_closeness),
            ),
            (
                w.stages,
                compare(
                    Some(&a.stage_sequence).filter(|s| !s.is_empty()),
                    Some(&b.stage_sequence).filter(|s| !s.is_empty()),
                    |x, y| sequence_alignment(x, y),
                ),
            ),
        ];

        let mut weighted = 0.0;
        let mut total = 0.0;
        let mut identical = true;
        for (weight, sub) in subs {
            match sub {
                Sub::Skip => {}
                Sub::Missing => {
                    total += weight;
                    identical = false;
                }
                Sub::Score(s) => {
                    weighted += weight * s;
                    total += weight;
                    identical &= s >= 1.0;
                }
            }
        }
        // No weighted evidence left: fall back to exact agreement.
        if total <= 0.0 {
            return if identical { 1.0 } else { 0.0 };
        }
        (weighted / total).clamp(0.0, 1.0)
    }
}

/// `1 - |x-y| / max(x,y)` for non-negative values; 1 when both are zero.
pub fn closeness(x: f64, y: f64) -> f64 {
    let (x, y) = (x.max(0.0), y.max(0.0));
    let hi = x.max(y);
    if hi <= 0.0 {
        return 1.0;
    }
    (1.0 - (x - y).abs() / hi).clamp(0.0, 1.0)
}

fn participant_closeness(a: &ParticipantProfile, b: &ParticipantProfile) -> f64 {
    let mut parts = vec![
        closeness(a.count as f64, b.count as f64),
        closeness(a.senior_count as f64, b.senior_count as f64),
    ];
    if let (Some(x), Some(y)) = (a.avg_engagement, b.avg_engagement) {
        parts.push(1.0 - (x - y).abs());
    }
    parts.iter().sum::<f64>() / parts.len() as f64
}

/// Longest common subsequence length over the longer sequence.
pub fn sequence_alignment(a: &[String], b: &[String]) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            cur[j + 1] = if x == y { prev[j] + 1 } else { prev[j + 1].max(cur[j]) };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()] as f64 / longest as f64
}
