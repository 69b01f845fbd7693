//! The engine: change detection, pattern analysis and alerting for one
//! organization at a time, behind a per-organization lock.

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::alerts::{evaluate_rules, AlertRecord, AlertSink, Delivery, TracingSink};
use crate::changes::{ChangeDetector, ChangeEvent};
use crate::config::EngineConfig;
use crate::recommend::{recommend_with_timeout, Recommender, RuleBasedRecommender};
use crate::scheduler::{Batch, EventSource, PendingEvent};
use crate::store::{load_state, save_state, MemoryStore, StateStore};
use crate::summary::analyze_workflows;
use crate::workflow::parse_workflows;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    SchedulerUnavailable,
    SourceFailure,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::SchedulerUnavailable => "SCHEDULER_UNAVAILABLE",
            ErrorCode::SourceFailure => "SOURCE_FAILURE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned to callers of the trigger and status surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn unavailable() -> Self {
        Self::new(ErrorCode::SchedulerUnavailable, "scheduler is not running")
    }

    pub fn source(organization_id: &str, err: anyhow::Error) -> Self {
        Self::new(ErrorCode::SourceFailure, format!("fetching workflows for {organization_id}: {err:#}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

/// Supplies an organization's current workflow records.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn fetch(&self, organization_id: &str) -> anyhow::Result<Vec<Value>>;
}

/// Records pushed in by the caller, e.g. snapshot lines on stdin.
#[derive(Debug, Default)]
pub struct MemorySource {
    records: RwLock<AHashMap<String, Vec<Value>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, organization_id: &str, records: Vec<Value>) {
        self.records.write().insert(organization_id.to_string(), records);
    }
}

#[async_trait]
impl WorkflowSource for MemorySource {
    async fn fetch(&self, organization_id: &str) -> anyhow::Result<Vec<Value>> {
        self.records
            .read()
            .get(organization_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no workflow records for organization {organization_id}"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrgReport {
    pub organization_id: String,
    pub workflows: usize,
    pub rejected_records: usize,
    pub health: f64,
    pub events: Vec<ChangeEvent>,
    pub discarded_events: usize,
    /// Whether pattern analysis ran in this pass.
    pub analyzed: bool,
    pub patterns: usize,
    pub alerts: Vec<AlertRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrgFailure {
    pub organization_id: String,
    pub error: ServiceError,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: Vec<OrgReport>,
    pub failed: Vec<OrgFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub queue_depth: usize,
    pub organizations: usize,
    pub learned_patterns: usize,
    pub last_batch_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub organizations: usize,
    pub learning_records: usize,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    source: Arc<dyn WorkflowSource>,
    recommender: Arc<dyn Recommender>,
    sink: Arc<dyn AlertSink>,
    detector: ChangeDetector,
    locks: Mutex<AHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        source: Arc<dyn WorkflowSource>,
        recommender: Arc<dyn Recommender>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        let detector = ChangeDetector::new(config.detection);
        Self { config, store, source, recommender, sink, detector, locks: Mutex::new(AHashMap::new()) }
    }

    /// In-memory store, local recommendations, alerts to the log.
    pub fn with_source(config: EngineConfig, source: Arc<dyn WorkflowSource>) -> Self {
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            source,
            Arc::new(RuleBasedRecommender),
            Arc::new(TracingSink),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn lock_for(&self, organization_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(organization_id.to_string()).or_default().clone()
    }

    /// Process one drained batch. Organizations run concurrently; a failure
    /// in one is logged and reported without touching the others.
    pub async fn process_batch(&self, batch: Batch) -> BatchReport {
        let started_at = Utc::now();
        let groups = batch.by_organization();
        let results = join_all(groups.into_iter().map(|(org, events)| async move {
            let result = self.process_organization(&org, &events, started_at).await;
            (org, result)
        }))
        .await;

        let mut processed = Vec::new();
        let mut failed = Vec::new();
        for (org, result) in results {
            match result {
                Ok(report) => processed.push(report),
                Err(e) => {
                    error!(organization = %org, code = %e.code, error = %e.message, "organization pass failed");
                    failed.push(OrgFailure { organization_id: org, error: e });
                }
            }
        }
        let finished_at = Utc::now();
        info!(processed = processed.len(), failed = failed.len(), "batch finished");
        BatchReport { started_at, finished_at, processed, failed }
    }

    /// One detection pass for `organization_id`, holding its lock throughout.
    pub async fn process_organization(
        &self,
        organization_id: &str,
        pending: &[PendingEvent],
        now: DateTime<Utc>,
    ) -> Result<OrgReport, ServiceError> {
        let lock = self.lock_for(organization_id);
        let _guard = lock.lock().await;

        let limit = self.config.scheduler.source_timeout();
        let records = match tokio::time::timeout(limit, self.source.fetch(organization_id)).await {
            Ok(fetched) => fetched.map_err(|e| ServiceError::source(organization_id, e))?,
            Err(_) => {
                let err = anyhow::anyhow!("no answer within {}s", limit.as_secs());
                return Err(ServiceError::source(organization_id, err));
            }
        };
        let (workflows, rejected) = parse_workflows(&records);
        let workflow_count = workflows.len();
        let mut state = self.store.get(organization_id).unwrap_or_default();

        let current = self.detector.capture(&workflows, now);
        let detection = self.detector.detect(organization_id, state.snapshot.as_ref(), &current);
        let mut events = detection.events;
        let mut forced = false;
        for p in pending {
            match &p.source {
                EventSource::Manual { reason } => events.push(ChangeEvent::manual(organization_id, reason, now)),
                EventSource::Maintenance => forced = true,
                EventSource::Webhook(_) | EventSource::Snapshot => {}
            }
        }
        let health = current.health;
        state.snapshot = Some(current);

        let alert_opts = &self.config.alerts;
        let analyzed = forced || events.iter().any(|e| e.significance >= alert_opts.trigger_threshold);
        let mut patterns = 0;
        let mut alerts = Vec::new();
        if analyzed {
            let config = self.config.clone();
            let found = tokio::task::spawn_blocking(move || analyze_workflows(&workflows, &config))
                .await
                .map_err(|e| ServiceError::internal(format!("pattern analysis for {organization_id} failed: {e}")))?;
            patterns = found.len();
            let timeout = self.config.scheduler.recommendation_timeout();
            let mut recommendations = Vec::new();
            for pattern in &found {
                for rec in recommend_with_timeout(self.recommender.as_ref(), pattern, timeout).await {
                    recommendations.push((pattern.id.clone(), rec));
                }
            }
            for candidate in evaluate_rules(health, &events, &recommendations, alert_opts) {
                let record = state.alerts.submit(organization_id, candidate, now, alert_opts);
                if record.delivery == Delivery::Sent {
                    self.sink.deliver(&record);
                }
                alerts.push(record);
            }
        }

        let alerted = alerts.iter().any(|a| a.delivery == Delivery::Sent);
        for event in &events {
            state.learning.observe(event, alerted, now, &self.config.learning);
        }
        self.store.put(organization_id, state);

        debug!(
            organization = %organization_id,
            workflows = workflow_count,
            events = events.len(),
            analyzed,
            alerts = alerts.len(),
            "organization processed"
        );
        Ok(OrgReport {
            organization_id: organization_id.to_string(),
            workflows: workflow_count,
            rejected_records: rejected.len(),
            health,
            events,
            discarded_events: detection.discarded,
            analyzed,
            patterns,
            alerts,
        })
    }

    /// Daily rollup: recompute learning confidence and trim alert history.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for org in self.store.organizations() {
            let lock = self.lock_for(&org);
            let _guard = lock.lock().await;
            let Some(mut state) = self.store.get(&org) else { continue };
            report.learning_records += state.learning.rollup(&self.config.learning);
            state.alerts.trim(now, &self.config.alerts);
            self.store.put(&org, state);
            report.organizations += 1;
        }
        info!(organizations = report.organizations, records = report.learning_records, "learning rollup complete");
        report
    }

    /// Forced analysis of every known organization.
    pub async fn reanalyze_all(&self, now: DateTime<Utc>) -> BatchReport {
        let events = self
            .store
            .organizations()
            .into_iter()
            .map(|org| PendingEvent { organization_id: org, source: EventSource::Maintenance, received_at: now })
            .collect();
        self.process_batch(Batch { events }).await
    }

    pub fn status(&self, queue_depth: usize, last_batch_at: Option<DateTime<Utc>>) -> ServiceStatus {
        ServiceStatus {
            queue_depth,
            organizations: self.store.organizations().len(),
            learned_patterns: self.store.learned_patterns(),
            last_batch_at,
        }
    }

    /// Write learning state to the configured path, if any.
    pub fn persist(&self) -> Result<(), ServiceError> {
        let Some(path) = &self.config.state_path else {
            debug!("no state path configured; skipping persist");
            return Ok(());
        };
        save_state(path, &self.store.export(Utc::now())).map_err(|e| ServiceError::internal(e.to_string()))
    }

    /// Load persisted state; returns the number of organizations restored.
    pub fn restore(&self) -> usize {
        let Some(path) = &self.config.state_path else { return 0 };
        match load_state(path) {
            Some(state) => {
                let n = state.organizations.len();
                self.store.import(state);
                n
            }
            None => {
                warn!(path = %path.display(), "starting without learning state");
                0
            }
        }
    }
}
