//! Debounced batching of change events.
//!
//! [`Batcher`] is the synchronous state machine
//! (`Idle -> Accumulating -> Processing -> Idle`); [`Scheduler`] drives it
//! from a tokio task that owns the only copy, so a batch drain never overlaps
//! the next one.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::service::{Engine, ServiceError, ServiceStatus};
use crate::temporal::next_utc_midnight;
use crate::webhook::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Quiescence window before a batch is drained.
    pub debounce_secs: u64,
    /// Upper bound on one recommender call.
    pub recommendation_timeout_secs: u64,
    /// Upper bound on fetching one organization's records.
    pub source_timeout_secs: u64,
    pub reanalysis_interval_hours: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self { debounce_secs: 30, recommendation_timeout_secs: 10, source_timeout_secs: 30, reanalysis_interval_hours: 24 }
    }
}

impl SchedulerOptions {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn recommendation_timeout(&self) -> Duration {
        Duration::from_secs(self.recommendation_timeout_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }

    pub fn reanalysis_interval(&self) -> Duration {
        Duration::from_secs(self.reanalysis_interval_hours.max(1) * 3600)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EventSource {
    Webhook(Notification),
    /// Fresh records were pushed for the organization.
    Snapshot,
    Manual { reason: String },
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub organization_id: String,
    pub source: EventSource,
    pub received_at: DateTime<Utc>,
}

impl PendingEvent {
    pub fn manual(organization_id: &str, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            source: EventSource::Manual { reason: reason.to_string() },
            received_at: now,
        }
    }
}

/// Events drained together, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub events: Vec<PendingEvent>,
}

impl Batch {
    /// Events grouped per organization; arrival order is kept inside each group.
    pub fn by_organization(self) -> BTreeMap<String, Vec<PendingEvent>> {
        let mut out: BTreeMap<String, Vec<PendingEvent>> = BTreeMap::new();
        for e in self.events {
            out.entry(e.organization_id.clone()).or_default().push(e);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Accumulating { deadline: Instant },
    Processing,
}

#[derive(Debug)]
pub struct Batcher {
    debounce: Duration,
    state: BatchState,
    queue: Vec<PendingEvent>,
}

impl Batcher {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce, state: BatchState::Idle, queue: Vec::new() }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Queue an event. Outside of processing this (re)starts the window.
    pub fn enqueue(&mut self, event: PendingEvent, now: Instant) {
        self.queue.push(event);
        match self.state {
            BatchState::Idle | BatchState::Accumulating { .. } => {
                self.state = BatchState::Accumulating { deadline: now + self.debounce };
            }
            BatchState::Processing => {}
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            BatchState::Accumulating { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Pull the deadline forward to `now` (flush and shutdown).
    pub fn expedite(&mut self, now: Instant) {
        if let BatchState::Accumulating { deadline } = self.state {
            if deadline > now {
                self.state = BatchState::Accumulating { deadline: now };
            }
        }
    }

    /// Drain the queue once the window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Batch> {
        match self.state {
            BatchState::Accumulating { deadline } if now >= deadline => {
                self.state = BatchState::Processing;
                Some(Batch { events: mem::take(&mut self.queue) })
            }
            _ => None,
        }
    }

    /// Finish the in-flight batch; anything queued meanwhile opens a fresh window.
    pub fn complete(&mut self, now: Instant) {
        if self.state != BatchState::Processing {
            return;
        }
        self.state = if self.queue.is_empty() {
            BatchState::Idle
        } else {
            BatchState::Accumulating { deadline: now + self.debounce }
        };
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerAck {
    pub organization_id: String,
    pub reason: String,
    pub accepted: bool,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SchedulerStats {
    queue_depth: AtomicUsize,
    last_batch: Mutex<Option<DateTime<Utc>>>,
}

enum Command {
    Event(PendingEvent),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub struct Scheduler;

impl Scheduler {
    /// Spawn the batching worker on the current tokio runtime.
    pub fn spawn(engine: Arc<Engine>, debounce: Duration) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SchedulerStats::default());
        let task = tokio::spawn(worker(engine.clone(), rx, stats.clone(), debounce));
        info!(debounce_ms = debounce.as_millis() as u64, "scheduler started");
        SchedulerHandle { tx, stats, engine, task: Arc::new(Mutex::new(Some(task))) }
    }
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<SchedulerStats>,
    engine: Arc<Engine>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    pub fn submit(&self, event: PendingEvent) -> Result<(), ServiceError> {
        self.tx.send(Command::Event(event)).map_err(|_| ServiceError::unavailable())
    }

    /// Queue a manual trigger; it becomes one change event at significance 1.0.
    pub fn trigger(&self, organization_id: &str, reason: &str) -> Result<TriggerAck, ServiceError> {
        let org = organization_id.trim();
        if org.is_empty() {
            return Err(ServiceError::invalid("organization_id must not be empty"));
        }
        let reason = if reason.trim().is_empty() { "manual trigger" } else { reason.trim() };
        let now = Utc::now();
        self.submit(PendingEvent::manual(org, reason, now))?;
        Ok(TriggerAck { organization_id: org.to_string(), reason: reason.to_string(), accepted: true, queued_at: now })
    }

    pub fn status(&self) -> ServiceStatus {
        self.engine.status(self.stats.queue_depth.load(Ordering::Relaxed), *self.stats.last_batch.lock())
    }

    /// Drain everything queued so far and wait until it has been processed.
    pub async fn flush(&self) -> Result<(), ServiceError> {
        let (ack, done) = oneshot::channel();
        self.tx.send(Command::Flush(ack)).map_err(|_| ServiceError::unavailable())?;
        done.await.map_err(|_| ServiceError::unavailable())
    }

    /// Flush, then stop the worker. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task ended abnormally");
            }
        }
    }
}

async fn worker(
    engine: Arc<Engine>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    stats: Arc<SchedulerStats>,
    debounce: Duration,
) {
    let mut batcher = Batcher::new(debounce);
    let mut in_flight: Option<JoinHandle<DateTime<Utc>>> = None;
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut stopping: Option<Option<oneshot::Sender<()>>> = None;
    let mut closed = false;

    loop {
        if !waiters.is_empty() || stopping.is_some() {
            batcher.expedite(Instant::now());
        }
        if in_flight.is_none() && batcher.state() == BatchState::Idle {
            for w in waiters.drain(..) {
                let _ = w.send(());
            }
            if let Some(ack) = stopping.take() {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                break;
            }
        }
        stats.queue_depth.store(batcher.queue_depth(), Ordering::Relaxed);

        let deadline = batcher.deadline();
        tokio::select! {
            cmd = rx.recv(), if !closed => match cmd {
                Some(Command::Event(event)) => {
                    debug!(organization = %event.organization_id, "event queued");
                    batcher.enqueue(event, Instant::now());
                }
                Some(Command::Flush(ack)) => waiters.push(ack),
                Some(Command::Shutdown(ack)) => stopping = Some(Some(ack)),
                None => {
                    closed = true;
                    if stopping.is_none() {
                        stopping = Some(None);
                    }
                }
            },
            _ = async {
                match deadline {
                    Some(d) => sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            }, if deadline.is_some() && in_flight.is_none() => {
                if let Some(batch) = batcher.poll(Instant::now()) {
                    info!(events = batch.len(), "draining batch");
                    let engine = engine.clone();
                    in_flight = Some(tokio::spawn(async move {
                        let report = engine.process_batch(batch).await;
                        report.finished_at
                    }));
                }
            },
            done = async {
                match in_flight.as_mut() {
                    Some(h) => h.await,
                    None => std::future::pending().await,
                }
            }, if in_flight.is_some() => {
                in_flight = None;
                match done {
                    Ok(finished_at) => *stats.last_batch.lock() = Some(finished_at),
                    Err(e) => error!(error = %e, "batch task failed"),
                }
                batcher.complete(Instant::now());
            },
        }
    }
    info!("scheduler stopped");
}

/// Handle to the calendar-driven maintenance task.
pub struct MaintenanceHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "maintenance task ended abnormally");
        }
    }
}

/// Learning rollup at every UTC midnight plus a full re-analysis every `interval`.
/// Both go through the engine's per-organization lock.
pub fn spawn_maintenance(engine: Arc<Engine>, interval: Duration) -> MaintenanceHandle {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut reanalysis = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            let now = Utc::now();
            let until_midnight = (next_utc_midnight(now) - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(until_midnight) => {
                    engine.run_maintenance(Utc::now()).await;
                }
                _ = reanalysis.tick() => {
                    engine.reanalyze_all(Utc::now()).await;
                }
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("maintenance stopped");
    });
    MaintenanceHandle { stop, task }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(org: &str) -> PendingEvent {
        PendingEvent::manual(org, "test", Utc::now())
    }

    #[test]
    fn window_resets_on_enqueue() {
        let t0 = Instant::now();
        let mut b = Batcher::new(Duration::from_secs(30));
        b.enqueue(event("a"), t0);
        b.enqueue(event("a"), t0 + Duration::from_secs(20));
        assert!(b.poll(t0 + Duration::from_secs(31)).is_none());
        let batch = b.poll(t0 + Duration::from_secs(50)).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(b.state(), BatchState::Processing);
    }

    #[test]
    fn events_during_processing_wait() {
        let t0 = Instant::now();
        let mut b = Batcher::new(Duration::from_secs(1));
        b.enqueue(event("a"), t0);
        let first = b.poll(t0 + Duration::from_secs(1)).unwrap();
        b.enqueue(event("b"), t0 + Duration::from_secs(2));
        assert_eq!(b.state(), BatchState::Processing);
        assert!(b.poll(t0 + Duration::from_secs(10)).is_none());
        b.complete(t0 + Duration::from_secs(3));
        let second = b.poll(t0 + Duration::from_secs(4)).unwrap();
        assert_eq!(first.events[0].organization_id, "a");
        assert_eq!(second.events[0].organization_id, "b");
        b.complete(t0 + Duration::from_secs(5));
        assert_eq!(b.state(), BatchState::Idle);
    }
}
