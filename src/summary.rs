use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::analyzers::analyze_clusters;
use crate::config::EngineConfig;
use crate::features::extract_all;
use crate::patterns::{cluster_features, Pattern};
use crate::similarity::SimilarityEngine;
use crate::workflow::{parse_workflows, RecordError, Workflow};

const MAX_ERROR_SAMPLES: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub summary: Summary,
    pub patterns: Vec<Pattern>,
    pub errors: ErrorsOut,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total_records: usize,
    pub valid_workflows: usize,
    /// Workflows that ended up in a reported pattern.
    pub clustered: usize,
    pub unclustered: usize,
    pub patterns: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorsOut {
    pub total: usize,
    pub samples: Vec<RecordError>,
}

/// Extract, cluster and analyse one batch of workflows.
pub fn analyze_workflows(workflows: &[Workflow], config: &EngineConfig) -> Vec<Pattern> {
    if workflows.is_empty() {
        return Vec::new();
    }
    let features = extract_all(workflows);
    let engine = SimilarityEngine::new(config.similarity);
    let clusters = cluster_features(&features, &engine, &config.clustering);
    analyze_clusters(&clusters, workflows, &features, &config.analysis)
}

pub fn summarize_records(records: &[Value], config: &EngineConfig) -> AnalysisOutput {
    let (workflows, errors) = parse_workflows(records);
    let patterns = analyze_workflows(&workflows, config);
    let clustered: usize = patterns.iter().map(Pattern::size).sum();
    info!(
        records = records.len(),
        workflows = workflows.len(),
        patterns = patterns.len(),
        rejected = errors.len(),
        "analysis complete"
    );
    AnalysisOutput {
        summary: Summary {
            total_records: records.len(),
            valid_workflows: workflows.len(),
            clustered,
            unclustered: workflows.len() - clustered,
            patterns: patterns.len(),
        },
        errors: ErrorsOut { total: errors.len(), samples: errors.into_iter().take(MAX_ERROR_SAMPLES).collect() },
        patterns,
    }
}
