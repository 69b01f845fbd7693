//! Recommendation enrichment.
//!
//! The heavy recommender (usually a language model behind an HTTP call) is a
//! collaborator. The engine only needs a ranked list back, so any failure or
//! timeout degrades to the local rule-based list built here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::patterns::{BottleneckKind, Pattern, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Roi {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub rationale: String,
    pub roi: Roi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottleneck: Option<String>,
}

#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(&self, pattern: &Pattern) -> anyhow::Result<Vec<Recommendation>>;
}

/// Templated recommendations straight from bottlenecks and success factors.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedRecommender;

impl RuleBasedRecommender {
    pub fn build(pattern: &Pattern) -> Vec<Recommendation> {
        let mut out = Vec::new();
        for b in &pattern.bottlenecks {
            let roi = match b.severity {
                Severity::Critical | Severity::High => Roi::High,
                Severity::Medium => Roi::Medium,
                Severity::Low => Roi::Low,
            };
            let title = match b.kind {
                BottleneckKind::StageDelay => format!("Shorten the {} transition", b.location),
                BottleneckKind::ConversionDrop => format!("Recover drop-off at {}", b.location),
                BottleneckKind::ActivityGap => format!("Add follow-up cadence during {}", b.location),
            };
            out.push(Recommendation {
                title,
                rationale: b.issue.clone(),
                roi,
                bottleneck: Some(b.location.to_string()),
            });
        }
        for f in &pattern.success_factors {
            out.push(Recommendation {
                title: format!("Act on {}", f.factor.replace('_', " ")),
                rationale: f.insight.clone(),
                roi: if f.correlation.abs() >= 0.6 { Roi::Medium } else { Roi::Low },
                bottleneck: None,
            });
        }
        rank(&mut out);
        out
    }
}

#[async_trait]
impl Recommender for RuleBasedRecommender {
    async fn recommend(&self, pattern: &Pattern) -> anyhow::Result<Vec<Recommendation>> {
        Ok(Self::build(pattern))
    }
}

/// Highest ROI first; stable within a tier.
pub fn rank(recs: &mut [Recommendation]) {
    recs.sort_by(|a, b| b.roi.cmp(&a.roi));
}

/// Ask the recommender, bounded by `timeout`; fall back to local rules on error or timeout.
pub async fn recommend_with_timeout(
    recommender: &dyn Recommender,
    pattern: &Pattern,
    timeout: Duration,
) -> Vec<Recommendation> {
    match tokio::time::timeout(timeout, recommender.recommend(pattern)).await {
        Ok(Ok(mut recs)) => {
            rank(&mut recs);
            debug!(pattern = %pattern.id, count = recs.len(), "recommendations received");
            recs
        }
        Ok(Err(e)) => {
            warn!(pattern = %pattern.id, error = %e, "recommender failed; using local fallback");
            RuleBasedRecommender::build(pattern)
        }
        Err(_) => {
            warn!(pattern = %pattern.id, timeout_ms = timeout.as_millis() as u64, "recommender timed out; using local fallback");
            RuleBasedRecommender::build(pattern)
        }
    }
}
