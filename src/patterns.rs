use crate::features::FeatureVector;
use crate::similarity::SimilarityEngine;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    pub similarity_threshold: f64,
    pub min_pattern_size: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self { similarity_threshold: 0.68, min_pattern_size: 2 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Index of the seed workflow in the input slice.
    pub seed: usize,
    /// Input indices, ascending; the seed is always first.
    pub members: Vec<usize>,
    /// Mean pairwise similarity among members.
    pub avg_similarity: f64,
}

/// Greedy single-pass clustering over the input order.
///
/// Each still-unclustered workflow opens a cluster and absorbs every later
/// unclustered workflow whose similarity to the seed is strictly above the
/// threshold. Clusters smaller than `min_pattern_size` are dropped and their
/// members stay unclustered.
pub fn cluster_features(
    features: &[FeatureVector],
    engine: &SimilarityEngine,
    opts: &ClusterOptions,
) -> Vec<Cluster> {
    let n = features.len();
    let mut assigned = vec![false; n];
    let mut out = Vec::new();
    for seed in 0..n {
        if assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        let mut members = vec![seed];
        for candidate in (seed + 1)..n {
            if assigned[candidate] {
                continue;
            }
            if engine.similarity(&features[seed], &features[candidate]) > opts.similarity_threshold {
                assigned[candidate] = true;
                members.push(candidate);
            }
        }
        if members.len() < opts.min_pattern_size.max(1) {
            continue;
        }
        let avg_similarity = mean_pairwise(features, &members, engine);
        out.push(Cluster { seed, members, avg_similarity });
    }
    out
}

fn mean_pairwise(features: &[FeatureVector], members: &[usize], engine: &SimilarityEngine) -> f64 {
    if members.len() < 2 {
        return 1.0;
    }
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for (i, &a) in members.iter().enumerate() {
        for &b in &members[i + 1..] {
            sum += engine.similarity(&features[a], &features[b]);
            pairs += 1;
        }
    }
    sum / pairs as f64
}

/// Confidence from cohesion and size; size has diminishing returns.
pub fn pattern_confidence(size: usize, avg_similarity: f64) -> f64 {
    let n = size as f64;
    (0.6 * avg_similarity.clamp(0.0, 1.0) + 0.4 * (n / (n + 3.0))).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    StageDelay,
    ConversionDrop,
    ActivityGap,
}

/// Where a bottleneck sits: a stage transition, or a stage alone when `to` is absent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageEdge {
    pub from: String,
    pub to: Option<String>,
}

impl fmt::Display for StageEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.to {
            Some(to) => write!(f, "{} -> {}", self.from, to),
            None => f.write_str(&self.from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub location: StageEdge,
    pub issue: String,
    pub severity: Severity,
    pub affected_workflows: usize,
    /// Raw magnitude the severity was derived from (delay ratio, conversion drop, gap ratio).
    pub magnitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessFactor {
    pub factor: String,
    pub correlation: f64,
    pub insight: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Benchmarks {
    pub avg_cycle_days: f64,
    pub success_rate: f64,
    pub avg_value: f64,
    pub efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub pattern_type: String,
    pub workflow_ids: Vec<String>,
    pub confidence: f64,
    pub avg_similarity: f64,
    pub benchmarks: Benchmarks,
    pub bottlenecks: Vec<Bottleneck>,
    pub success_factors: Vec<SuccessFactor>,
}

impl Pattern {
    pub fn size(&self) -> usize {
        self.workflow_ids.len()
    }

    pub fn worst_severity(&self) -> Option<Severity> {
        self.bottlenecks.iter().map(|b| b.severity).max()
    }
}
