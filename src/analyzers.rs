use ahash::AHashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::correlation;
use crate::features::FeatureVector;
use crate::patterns::{
    pattern_confidence, Benchmarks, Bottleneck, BottleneckKind, Cluster, Pattern, Severity, StageEdge,
    SuccessFactor,
};
use crate::temporal;
use crate::workflow::{Workflow, WorkflowStatus};

/// Thresholds used by the pattern analyzers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// A transition is slow when it takes longer than the pattern mean times this.
    pub stage_delay_multiplier: f64,
    /// Absolute drop below the mean transition conversion that counts as a bottleneck.
    pub conversion_drop: f64,
    pub activity_gap_days: f64,
    /// Minimum |correlation| for a success factor to be reported.
    pub success_factor_floor: f64,
    /// Cycle time at which the velocity half of efficiency scores 0.5.
    pub benchmark_cycle_days: f64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            stage_delay_multiplier: 1.5,
            conversion_drop: 0.2,
            activity_gap_days: 14.0,
            success_factor_floor: 0.3,
            benchmark_cycle_days: 30.0,
        }
    }
}

/// Common data passed to all analyzers
#[derive(Debug, Clone)]
pub struct PatternContext<'a> {
    pub cluster: &'a Cluster,
    pub workflows: Vec<&'a Workflow>,
    pub features: Vec<&'a FeatureVector>,
}

impl<'a> PatternContext<'a> {
    pub fn new(cluster: &'a Cluster, workflows: &'a [Workflow], features: &'a [FeatureVector]) -> Self {
        Self {
            cluster,
            workflows: cluster.members.iter().map(|&i| &workflows[i]).collect(),
            features: cluster.members.iter().map(|&i| &features[i]).collect(),
        }
    }

    fn successes(&self) -> Vec<bool> {
        self.workflows.iter().map(|w| w.status == WorkflowStatus::Won).collect()
    }
}

/// Results from all analyzers combined
#[derive(Debug, Clone, Default)]
pub struct PatternAnalysis {
    pub benchmarks: Benchmarks,
    pub bottlenecks: Vec<Bottleneck>,
    pub success_factors: Vec<SuccessFactor>,
}

/// Trait that all analyzers must implement
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;
    fn analyze(&self, context: &PatternContext<'_>, opts: &AnalysisOptions) -> Box<dyn AnalysisResult>;
}

/// Base trait for analysis results
pub trait AnalysisResult: Send {
    fn merge_into(self: Box<Self>, results: &mut PatternAnalysis);
}

/// Aggregate cycle time, win rate, value and efficiency.
pub struct BenchmarkAnalyzer;

impl Analyzer for BenchmarkAnalyzer {
    fn name(&self) -> &'static str {
        "benchmark"
    }

    fn analyze(&self, context: &PatternContext<'_>, opts: &AnalysisOptions) -> Box<dyn AnalysisResult> {
        let n = context.workflows.len();
        if n == 0 {
            return Box::new(BenchmarkResult { benchmarks: Benchmarks::default() });
        }
        let durations: Vec<f64> = context.workflows.iter().map(|w| w.duration_days).collect();
        let values: Vec<f64> = context.workflows.iter().filter_map(|w| w.value).collect();
        let won = context.successes().iter().filter(|ok| **ok).count();

        let avg_cycle_days = correlation::mean(&durations).unwrap_or(0.0);
        let success_rate = won as f64 / n as f64;
        let avg_value = correlation::mean(&values).unwrap_or(0.0);
        let reference = opts.benchmark_cycle_days.max(1.0);
        let velocity = 1.0 / (1.0 + avg_cycle_days / reference);
        let efficiency = (0.5 * success_rate + 0.5 * velocity).clamp(0.0, 1.0);

        Box::new(BenchmarkResult { benchmarks: Benchmarks { avg_cycle_days, success_rate, avg_value, efficiency } })
    }
}

pub struct BenchmarkResult {
    benchmarks: Benchmarks,
}

impl AnalysisResult for BenchmarkResult {
    fn merge_into(self: Box<Self>, results: &mut PatternAnalysis) {
        results.benchmarks = self.benchmarks;
    }
}

/// Slow transitions, lossy transitions and long silences.
pub struct BottleneckAnalyzer;

fn delay_severity(ratio: f64) -> Severity {
    match ratio {
        r if r >= 3.0 => Severity::Critical,
        r if r >= 2.5 => Severity::High,
        r if r >= 2.0 => Severity::Medium,
        _ => Severity::Low,
    }
}

fn drop_severity(drop: f64) -> Severity {
    match drop {
        d if d >= 0.5 => Severity::Critical,
        d if d >= 0.4 => Severity::High,
        d if d >= 0.3 => Severity::Medium,
        _ => Severity::Low,
    }
}

fn gap_severity(ratio: f64) -> Severity {
    match ratio {
        r if r >= 4.0 => Severity::Critical,
        r if r >= 3.0 => Severity::High,
        r if r >= 2.0 => Severity::Medium,
        _ => Severity::Low,
    }
}

impl BottleneckAnalyzer {
    fn stage_delays(context: &PatternContext<'_>, opts: &AnalysisOptions) -> Vec<Bottleneck> {
        // (from, to) -> days per member that made the transition
        let mut edges: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
        for wf in &context.workflows {
            for t in temporal::edge_timings(wf) {
                edges.entry((t.from, t.to)).or_default().push(t.days);
            }
        }
        let mut out = Vec::new();
        for ((from, to), samples) in edges {
            if samples.len() < 2 { continue; }
            let Some(mean) = correlation::mean(&samples) else { continue };
            if mean <= 0.0 { continue; }
            let limit = mean * opts.stage_delay_multiplier;
            let slow: Vec<f64> = samples.iter().copied().filter(|d| *d > limit).collect();
            if slow.is_empty() { continue; }
            let worst = slow.iter().copied().fold(0.0, f64::max);
            let ratio = worst / mean;
            out.push(Bottleneck {
                kind: BottleneckKind::StageDelay,
                issue: format!(
                    "{} of {} workflows took up to {:.1} days to move from {} to {} (pattern average {:.1} days)",
                    slow.len(), samples.len(), worst, from, to, mean
                ),
                location: StageEdge { from, to: Some(to) },
                severity: delay_severity(ratio),
                affected_workflows: slow.len(),
                magnitude: ratio,
            });
        }
        out
    }

    fn conversion_drops(context: &PatternContext<'_>, opts: &AnalysisOptions) -> Vec<Bottleneck> {
        // Canonical order: first appearance across members
        let mut order: Vec<&str> = Vec::new();
        let mut reached: AHashMap<&str, usize> = AHashMap::new();
        for f in &context.features {
            let mut seen_here: Vec<&str> = Vec::new();
            for s in &f.stage_sequence {
                let s = s.as_str();
                if !order.contains(&s) {
                    order.push(s);
                }
                if !seen_here.contains(&s) {
                    seen_here.push(s);
                    *reached.entry(s).or_insert(0) += 1;
                }
            }
        }
        if order.len() < 2 { return Vec::new(); }

        let conversions: Vec<(&str, &str, usize, usize, f64)> = order
            .windows(2)
            .map(|w| {
                let a = reached.get(w[0]).copied().unwrap_or(0);
                let b = reached.get(w[1]).copied().unwrap_or(0);
                let rate = if a == 0 { 0.0 } else { (b as f64 / a as f64).min(1.0) };
                (w[0], w[1], a, b, rate)
            })
            .collect();
        let rates: Vec<f64> = conversions.iter().map(|c| c.4).collect();
        let baseline = correlation::mean(&rates).unwrap_or(1.0);

        let mut out = Vec::new();
        for (from, to, a, b, rate) in conversions {
            let drop = baseline - rate;
            if drop < opts.conversion_drop || drop <= 0.0 { continue; }
            out.push(Bottleneck {
                kind: BottleneckKind::ConversionDrop,
                location: StageEdge { from: from.to_string(), to: Some(to.to_string()) },
                issue: format!(
                    "only {:.0}% of workflows reaching {} continue to {} (pattern baseline {:.0}%)",
                    rate * 100.0, from, to, baseline * 100.0
                ),
                severity: drop_severity(drop),
                affected_workflows: a.saturating_sub(b),
                magnitude: drop,
            });
        }
        out
    }

    fn activity_gaps(context: &PatternContext<'_>, opts: &AnalysisOptions) -> Vec<Bottleneck> {
        let threshold = opts.activity_gap_days;
        if threshold <= 0.0 { return Vec::new(); }
        // stage -> (affected, worst gap days)
        let mut by_stage: BTreeMap<String, (usize, f64)> = BTreeMap::new();
        for wf in &context.workflows {
            let Some(gap) = temporal::largest_gap(&temporal::activity_timeline(wf)) else { continue };
            if gap.duration_days <= threshold { continue; }
            let stage = temporal::stage_at(wf, gap.start_time)
                .map(|s| s.trim().to_ascii_lowercase())
                .unwrap_or_else(|| "unstaged".to_string());
            let entry = by_stage.entry(stage).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 = entry.1.max(gap.duration_days);
        }
        by_stage
            .into_iter()
            .map(|(stage, (affected, worst))| {
                let ratio = worst / threshold;
                Bottleneck {
                    kind: BottleneckKind::ActivityGap,
                    issue: format!(
                        "{} workflows went silent for up to {:.0} days during {} (threshold {:.0} days)",
                        affected, worst, stage, threshold
                    ),
                    location: StageEdge { from: stage, to: None },
                    severity: gap_severity(ratio),
                    affected_workflows: affected,
                    magnitude: ratio,
                }
            })
            .collect()
    }
}

impl Analyzer for BottleneckAnalyzer {
    fn name(&self) -> &'static str {
        "bottleneck"
    }

    fn analyze(&self, context: &PatternContext<'_>, opts: &AnalysisOptions) -> Box<dyn AnalysisResult> {
        let mut found = Self::stage_delays(context, opts);
        found.extend(Self::conversion_drops(context, opts));
        found.extend(Self::activity_gaps(context, opts));
        found.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.affected_workflows.cmp(&a.affected_workflows))
                .then_with(|| a.location.cmp(&b.location))
        });
        Box::new(BottleneckResult { bottlenecks: found })
    }
}

pub struct BottleneckResult {
    bottlenecks: Vec<Bottleneck>,
}

impl AnalysisResult for BottleneckResult {
    fn merge_into(self: Box<Self>, results: &mut PatternAnalysis) {
        results.bottlenecks = self.bottlenecks;
    }
}

/// Attributes whose level tracks winning.
pub struct SuccessFactorAnalyzer;

const MIN_FACTOR_SAMPLES: usize = 3;

struct Candidate {
    name: &'static str,
    label: &'static str,
    more: &'static str,
    less: &'static str,
    extract: fn(&Workflow, &FeatureVector) -> Option<f64>,
}

const CANDIDATES: &[Candidate] = &[
    Candidate {
        name: "participant_count",
        label: "more participants",
        more: "bring additional stakeholders in early",
        less: "keep the buying group small and focused",
        extract: |_, f| Some(f.participant_profile.as_ref().map(|p| p.count as f64).unwrap_or(0.0)),
    },
    Candidate {
        name: "senior_stakeholders",
        label: "senior stakeholder involvement",
        more: "secure an executive sponsor before the proposal stage",
        less: "avoid escalating to executives prematurely",
        extract: |_, f| Some(f.participant_profile.as_ref().map(|p| p.senior_count as f64).unwrap_or(0.0)),
    },
    Candidate {
        name: "activity_density",
        label: "higher activity density",
        more: "keep a steady cadence of touchpoints",
        less: "reduce low-value touchpoints",
        extract: |_, f| Some(f.activity_pattern.density_per_day),
    },
    Candidate {
        name: "engagement",
        label: "stronger participant engagement",
        more: "prioritise re-engaging quiet contacts",
        less: "qualify out over-engaged but non-committal contacts",
        extract: |_, f| f.participant_profile.as_ref().and_then(|p| p.avg_engagement),
    },
    Candidate {
        name: "deal_value",
        label: "larger deal value",
        more: "focus effort on larger opportunities",
        less: "watch for scope creep on larger deals",
        extract: |w, _| w.value,
    },
];

impl Analyzer for SuccessFactorAnalyzer {
    fn name(&self) -> &'static str {
        "success_factor"
    }

    fn analyze(&self, context: &PatternContext<'_>, opts: &AnalysisOptions) -> Box<dyn AnalysisResult> {
        let successes = context.successes();
        let mut factors = Vec::new();
        for c in CANDIDATES {
            let mut values = Vec::new();
            let mut oks = Vec::new();
            for (i, (wf, f)) in context.workflows.iter().zip(&context.features).enumerate() {
                if let Some(v) = (c.extract)(wf, f) {
                    values.push(v);
                    oks.push(successes[i]);
                }
            }
            if values.len() < MIN_FACTOR_SAMPLES { continue; }
            let Some(strength) = correlation::outcome_split(&values, &oks) else { continue };
            if strength.abs() < opts.success_factor_floor { continue; }
            let insight = if strength > 0.0 {
                format!(
                    "Workflows with {} win {:.0}% more often; {}",
                    c.label, strength * 100.0, c.more
                )
            } else {
                format!(
                    "Workflows with {} win {:.0}% less often; {}",
                    c.label, strength.abs() * 100.0, c.less
                )
            };
            factors.push(SuccessFactor { factor: c.name.to_string(), correlation: strength, insight });
        }
        factors.sort_by(|a, b| {
            b.correlation
                .abs()
                .partial_cmp(&a.correlation.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.factor.cmp(&b.factor))
        });
        Box::new(SuccessFactorResult { factors })
    }
}

pub struct SuccessFactorResult {
    factors: Vec<SuccessFactor>,
}

impl AnalysisResult for SuccessFactorResult {
    fn merge_into(self: Box<Self>, results: &mut PatternAnalysis) {
        results.success_factors = self.factors;
    }
}

/// Main analyzer registry that manages all analyzers
pub struct AnalyzerRegistry {
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self {
            analyzers: vec![
                Box::new(BenchmarkAnalyzer),
                Box::new(BottleneckAnalyzer),
                Box::new(SuccessFactorAnalyzer),
            ],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.analyzers.iter().map(|a| a.name()).collect()
    }

    pub fn analyze(&self, context: &PatternContext<'_>, opts: &AnalysisOptions) -> PatternAnalysis {
        let mut results = PatternAnalysis::default();
        for analyzer in &self.analyzers {
            let analysis_result = analyzer.analyze(context, opts);
            analysis_result.merge_into(&mut results);
        }
        results
    }

    /// Turn one cluster into a fully analysed pattern.
    pub fn build_pattern(
        &self,
        cluster: &Cluster,
        workflows: &[Workflow],
        features: &[FeatureVector],
        opts: &AnalysisOptions,
    ) -> Pattern {
        let context = PatternContext::new(cluster, workflows, features);
        let analysis = self.analyze(&context, opts);
        let seed = &features[cluster.seed];
        let pattern_type = seed.workflow_type.clone().unwrap_or_else(|| "unknown".to_string());
        Pattern {
            id: format!("{}:{}", pattern_type, seed.workflow_id),
            pattern_type,
            workflow_ids: context.workflows.iter().map(|w| w.id.clone()).collect(),
            confidence: pattern_confidence(cluster.members.len(), cluster.avg_similarity),
            avg_similarity: cluster.avg_similarity,
            benchmarks: analysis.benchmarks,
            bottlenecks: analysis.bottlenecks,
            success_factors: analysis.success_factors,
        }
    }
}

/// Analyse every cluster in parallel; output keeps cluster order.
pub fn analyze_clusters(
    clusters: &[Cluster],
    workflows: &[Workflow],
    features: &[FeatureVector],
    opts: &AnalysisOptions,
) -> Vec<Pattern> {
    let registry = AnalyzerRegistry::new();
    clusters
        .par_iter()
        .map(|c| registry.build_pattern(c, workflows, features, opts))
        .collect()
}
