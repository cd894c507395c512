//! Polling runner that drives the whole processing loop.
//!
//! A [`Runner`] owns one worker identity and wires the other components
//! together: every cycle it polls an [`ItemSource`] for new work,
//! validates and enqueues what it finds, then drains its queue through
//! an [`ItemHandler`] under the worker's [`StateMachine`] and the
//! [`ErrorTracker`]'s circuit breaker.
//!
//! # Failure routing
//!
//! A handler failure is classified into an [`ErrorRecord`] and recorded.
//! If the breaker still allows execution and the retry budget is not
//! exhausted, the item is put back at the head of its priority tier and
//! retried on the next cycle. Otherwise the item is marked failed,
//! archived, and the runner transitions to `Stopped` (quarantine) until
//! an operator calls [`Runner::manual_reset`].
//!
//! [`ErrorRecord`]: crate::tracker::ErrorRecord

pub mod metrics;

pub use metrics::RunnerMetrics;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::queue::{ItemKind, ItemState, PersistentQueue, Priority, QueueItem};
use crate::state::{StateMachine, WorkerState};
use crate::tracker::{ErrorClassifier, ErrorTracker, WorkerHealth};

// ============================================================================
// Collaborator traits
// ============================================================================

/// Where new work comes from.
///
/// Polled once per cycle. The source should return each piece of work
/// once; the runner additionally deduplicates by `source_id`, so a
/// source that re-reports items it already handed over is harmless.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Discover items that appeared since the last poll.
    async fn poll(&self) -> anyhow::Result<Vec<IncomingItem>>;
}

/// What to do with a dequeued item.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    /// Process one item. Any error is classified and fed into the
    /// tracker; the message text drives the classification.
    async fn handle(&self, item: &QueueItem) -> anyhow::Result<()>;
}

/// Routes items to one handler per [`ItemKind`].
///
/// Dispatch is an explicit match on the item's kind, so an item can
/// never fall through to the wrong handler on a typo'd tag.
pub struct KindRouter {
    message: Arc<dyn ItemHandler>,
    command: Arc<dyn ItemHandler>,
    event: Arc<dyn ItemHandler>,
}

impl KindRouter {
    /// Create a router with one handler per kind.
    #[must_use]
    pub fn new(
        message: Arc<dyn ItemHandler>,
        command: Arc<dyn ItemHandler>,
        event: Arc<dyn ItemHandler>,
    ) -> Self {
        Self {
            message,
            command,
            event,
        }
    }

    /// Route every kind to the same handler.
    #[must_use]
    pub fn uniform(handler: Arc<dyn ItemHandler>) -> Self {
        Self {
            message: Arc::clone(&handler),
            command: Arc::clone(&handler),
            event: handler,
        }
    }
}

#[async_trait]
impl ItemHandler for KindRouter {
    async fn handle(&self, item: &QueueItem) -> anyhow::Result<()> {
        let handler = match item.kind {
            ItemKind::Message => &self.message,
            ItemKind::Command => &self.command,
            ItemKind::Event => &self.event,
        };
        handler.handle(item).await
    }
}

// ============================================================================
// Incoming items
// ============================================================================

/// A discovered piece of work, not yet admitted to the queue.
#[derive(Debug, Clone)]
pub struct IncomingItem {
    /// Stable id assigned by the source; the dedup key.
    pub source_id: String,
    /// Owner namespace to enqueue under.
    pub owner_id: String,
    /// Opaque payload passed through to the handler.
    pub payload: serde_json::Value,
    /// Work kind, driving handler dispatch.
    pub kind: ItemKind,
    /// Insertion priority.
    pub priority: Priority,
}

impl IncomingItem {
    /// Create a normal-priority message item.
    pub fn new(
        source_id: impl Into<String>,
        owner_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            owner_id: owner_id.into(),
            payload,
            kind: ItemKind::Message,
            priority: Priority::Normal,
        }
    }

    /// Set the work kind.
    #[must_use]
    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Admission check. Malformed items are counted as failed and never
    /// enter the queue.
    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            return Err(RelayError::malformed("missing source id"));
        }
        if self.owner_id.trim().is_empty() {
            return Err(RelayError::malformed("missing owner id"));
        }
        if self.payload.is_null() {
            return Err(RelayError::malformed("null payload"));
        }
        Ok(())
    }
}

// ============================================================================
// Cycle outcome / status
// ============================================================================

/// What one call to [`Runner::run_cycle`] did.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    /// Items returned by the source this cycle.
    pub discovered: usize,
    /// Items admitted to the queue.
    pub enqueued: usize,
    /// Items handled successfully.
    pub processed: usize,
    /// Retries granted.
    pub retried: usize,
    /// Items rejected or permanently failed.
    pub failed: usize,
    /// Whether the runner is (now) quarantined.
    pub quarantined: bool,
}

/// Administrative snapshot of a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerStatus {
    /// Worker identity.
    pub worker_id: String,
    /// Current worker state.
    pub state: WorkerState,
    /// Whether the background polling loop is active.
    pub running: bool,
    /// Items awaiting processing.
    pub queued: usize,
    /// Breaker-derived health.
    pub health: WorkerHealth,
    /// Progress counters.
    pub metrics: RunnerMetrics,
}

// ============================================================================
// Runner
// ============================================================================

/// The processing loop for a single worker identity.
///
/// # Example
///
/// ```no_run
/// use std::sync::{Arc, Mutex};
/// use relay::config::RelayConfig;
/// use relay::queue::PersistentQueue;
/// use relay::runner::Runner;
/// use relay::tracker::ErrorTracker;
/// # use relay::runner::{IncomingItem, ItemHandler, ItemSource};
/// # use relay::queue::QueueItem;
/// # struct NoSource;
/// # #[async_trait::async_trait]
/// # impl ItemSource for NoSource {
/// #     async fn poll(&self) -> anyhow::Result<Vec<IncomingItem>> { Ok(vec![]) }
/// # }
/// # struct NoHandler;
/// # #[async_trait::async_trait]
/// # impl ItemHandler for NoHandler {
/// #     async fn handle(&self, _item: &QueueItem) -> anyhow::Result<()> { Ok(()) }
/// # }
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let config = RelayConfig::default();
/// let queue = Arc::new(PersistentQueue::from_config(&config)?);
/// let tracker = Arc::new(Mutex::new(ErrorTracker::new(&config)));
/// let runner = Arc::new(Runner::new(
///     "w1", config, queue, tracker,
///     Arc::new(NoSource), Arc::new(NoHandler),
/// ));
/// runner.start().await;
/// // ... later
/// runner.stop().await;
/// # Ok::<(), relay::RelayError>(())
/// # });
/// ```
pub struct Runner {
    worker_id: String,
    config: RelayConfig,
    queue: Arc<PersistentQueue>,
    tracker: Arc<Mutex<ErrorTracker>>,
    machine: StateMachine,
    source: Arc<dyn ItemSource>,
    handler: Arc<dyn ItemHandler>,
    classifier: ErrorClassifier,
    metrics: Mutex<RunnerMetrics>,
    metrics_path: PathBuf,
    /// Maps queued item ids back to the source ids they came from.
    sources_by_item: Mutex<HashMap<String, String>>,
    /// Retries granted since construction or the last manual reset.
    retries_granted: AtomicU32,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Runner {
    /// Create a runner, reloading any persisted metrics for this worker.
    #[must_use]
    pub fn new(
        worker_id: impl Into<String>,
        config: RelayConfig,
        queue: Arc<PersistentQueue>,
        tracker: Arc<Mutex<ErrorTracker>>,
        source: Arc<dyn ItemSource>,
        handler: Arc<dyn ItemHandler>,
    ) -> Self {
        let worker_id = worker_id.into();
        let metrics_path = RunnerMetrics::default_path(&config.data_dir, &worker_id);
        let metrics = RunnerMetrics::load_or_new(&metrics_path);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            worker_id,
            config,
            queue,
            tracker,
            machine: StateMachine::new(),
            source,
            handler,
            classifier: ErrorClassifier::new(),
            metrics: Mutex::new(metrics),
            metrics_path,
            sources_by_item: Mutex::new(HashMap::new()),
            retries_granted: AtomicU32::new(0),
            running: AtomicBool::new(false),
            shutdown_tx,
            task: AsyncMutex::new(None),
        }
    }

    /// This runner's worker identity.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The worker's state machine, for attaching observers.
    #[must_use]
    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Run one full cycle: poll, admit, drain, sweep, persist.
    ///
    /// Public so the loop can be driven deterministically (in tests or
    /// by an external scheduler); [`Runner::start`] calls this on an
    /// interval.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        if self.machine.current_state() == WorkerState::Stopped {
            outcome.quarantined = true;
            return Ok(outcome);
        }

        let incoming = match self.source.poll().await {
            Ok(items) => items,
            Err(e) => {
                warn!(worker = %self.worker_id, "source poll failed: {e:#}");
                Vec::new()
            }
        };
        outcome.discovered = incoming.len();

        for item in incoming {
            self.admit(item, &mut outcome);
        }

        self.drain(&mut outcome).await?;

        if let Err(e) = self.queue.cleanup_old(self.config.queue_max_age()) {
            warn!(worker = %self.worker_id, "queue cleanup sweep failed: {e}");
        }
        self.save_metrics();
        Ok(outcome)
    }

    /// Validate and enqueue one discovered item.
    fn admit(&self, item: IncomingItem, outcome: &mut CycleOutcome) {
        if self.with_metrics(|m| m.has_seen(&item.source_id)) {
            debug!(worker = %self.worker_id, source = %item.source_id, "skipping duplicate item");
            return;
        }

        if let Err(e) = item.validate() {
            warn!(
                worker = %self.worker_id,
                source = %item.source_id,
                "rejecting malformed item: {e}"
            );
            self.with_metrics(|m| m.mark_failed(&item.source_id));
            outcome.failed += 1;
            return;
        }

        match self
            .queue
            .enqueue_with_kind(&item.owner_id, item.payload, item.priority, item.kind)
        {
            Ok(item_id) => {
                self.with_metrics(|m| {
                    m.in_progress_ids.insert(item.source_id.clone());
                });
                self.sources_by_item
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(item_id, item.source_id);
                outcome.enqueued += 1;
            }
            Err(e) => {
                // Not marked failed: the source will report it again and
                // enqueue can be retried next cycle.
                warn!(worker = %self.worker_id, source = %item.source_id, "enqueue failed: {e}");
                let error = anyhow::Error::new(e);
                let record = self.classifier.record_for(&self.worker_id, &error);
                self.with_tracker(|t| t.record_error(record));
            }
        }
    }

    /// Drain the worker's queue until empty, a retry is scheduled, or
    /// the runner quarantines.
    async fn drain(&self, outcome: &mut CycleOutcome) -> Result<()> {
        while let Some(item) = self.queue.dequeue(&self.worker_id) {
            self.machine
                .transition_to(WorkerState::Processing, Some("handling item"))?;

            if item.state == ItemState::Pending {
                if let Err(e) = self
                    .queue
                    .update_state(&item.owner_id, &item.id, ItemState::Sent)
                {
                    warn!(worker = %self.worker_id, id = %item.id, "failed to mark item sent: {e}");
                }
            }
            let current = self.queue.get(&item.owner_id, &item.id).unwrap_or(item);

            match self.handler.handle(&current).await {
                Ok(()) => {
                    self.complete(&current)?;
                    outcome.processed += 1;
                }
                Err(e) => {
                    let retried = self.fail(&current, &e, outcome)?;
                    if retried {
                        // The retry runs on the next cycle, after backoff
                        // through the polling interval.
                        break;
                    }
                    outcome.quarantined = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Success path: finish the item's lifecycle and credit the breaker.
    fn complete(&self, item: &QueueItem) -> Result<()> {
        self.queue
            .update_state(&item.owner_id, &item.id, ItemState::Read)?;
        self.queue.archive(&item.owner_id, &item.id)?;

        let source_id = self.source_for(&item.id);
        self.with_metrics(|m| m.mark_processed(&source_id));
        self.with_tracker(|t| t.record_success(&self.worker_id));
        self.machine
            .transition_to(WorkerState::Idle, Some("item handled"))?;

        debug!(worker = %self.worker_id, id = %item.id, "item processed");
        Ok(())
    }

    /// Failure path: record the error, then either schedule a retry
    /// (returning `true`) or quarantine the runner (returning `false`).
    fn fail(
        &self,
        item: &QueueItem,
        error: &anyhow::Error,
        outcome: &mut CycleOutcome,
    ) -> Result<bool> {
        // Eligibility is judged against the breaker state going into this
        // attempt; the failure being recorded below may open it for the
        // next decision, not this one.
        let allowed = self.with_tracker(|t| t.can_execute(&self.worker_id));
        let budget_left = self.retries_granted.load(Ordering::SeqCst) < self.config.max_retries;

        let record = self
            .classifier
            .record_for(&self.worker_id, error)
            .with_context("item_id", &item.id);
        warn!(
            worker = %self.worker_id,
            id = %item.id,
            kind = %record.kind,
            severity = %record.severity,
            "handler failed: {error:#}"
        );
        self.with_tracker(|t| t.record_error(record));
        self.machine
            .transition_to(WorkerState::Error, Some("handler failed"))?;

        if allowed && budget_left {
            self.retries_granted.fetch_add(1, Ordering::SeqCst);
            self.with_metrics(|m| m.total_retries += 1);
            self.queue.requeue(&item.owner_id, &item.id)?;
            self.machine
                .transition_to(WorkerState::Idle, Some("retry scheduled"))?;
            outcome.retried += 1;
            return Ok(true);
        }

        let reason = if allowed {
            "retry budget exhausted"
        } else {
            "circuit breaker open"
        };
        warn!(worker = %self.worker_id, id = %item.id, reason, "quarantining runner");

        if let Err(e) = self
            .queue
            .update_state(&item.owner_id, &item.id, ItemState::Failed)
        {
            warn!(worker = %self.worker_id, id = %item.id, "failed to mark item failed: {e}");
        }
        if let Err(e) = self.queue.archive(&item.owner_id, &item.id) {
            warn!(worker = %self.worker_id, id = %item.id, "failed to archive failed item: {e}");
        }

        let source_id = self.source_for(&item.id);
        self.with_metrics(|m| m.mark_failed(&source_id));
        outcome.failed += 1;
        self.machine
            .transition_to(WorkerState::Stopped, Some(reason))?;
        Ok(false)
    }

    /// Start the background polling loop.
    ///
    /// Idempotent: calling it while the loop is running logs a warning
    /// and does nothing. The loop exits on [`Runner::stop`] or when the
    /// runner quarantines.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(worker = %self.worker_id, "runner already running");
            return;
        }
        let _ = self.shutdown_tx.send(false);

        let runner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            info!(worker = %runner.worker_id, "runner started");
            loop {
                if let Err(e) = runner.run_cycle().await {
                    warn!(worker = %runner.worker_id, "cycle failed: {e}");
                }
                if runner.machine.current_state() == WorkerState::Stopped {
                    warn!(worker = %runner.worker_id, "runner quarantined; polling halted");
                    break;
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    () = tokio::time::sleep(runner.config.check_interval()) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            runner.running.store(false, Ordering::SeqCst);
            info!(worker = %runner.worker_id, "runner loop exited");
        });
        *self.task.lock().await = Some(handle);
    }

    /// Stop the background polling loop and wait for it to exit.
    ///
    /// Idempotent: stopping a runner that is not running logs a warning.
    /// Durable queue records and metrics are untouched, so a later
    /// [`Runner::start`] resumes where this one left off.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            warn!(worker = %self.worker_id, "stop requested but runner is not running");
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(worker = %self.worker_id, "runner task join failed: {e}");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!(worker = %self.worker_id, "runner stopped");
    }

    /// Operator override: close the breaker, refresh the retry budget,
    /// and release the runner from quarantine.
    pub fn manual_reset(&self) -> Result<()> {
        self.with_tracker(|t| t.manual_reset(&self.worker_id));
        self.retries_granted.store(0, Ordering::SeqCst);
        if self.machine.current_state() == WorkerState::Stopped {
            self.machine
                .transition_to(WorkerState::Idle, Some("manual reset"))?;
        }
        info!(worker = %self.worker_id, "manual reset applied");
        Ok(())
    }

    /// Administrative snapshot: state, health, and progress counters.
    pub fn status(&self) -> RunnerStatus {
        RunnerStatus {
            worker_id: self.worker_id.clone(),
            state: self.machine.current_state(),
            running: self.running.load(Ordering::SeqCst),
            queued: self.queue.len(&self.worker_id),
            health: self.with_tracker(|t| t.worker_health(&self.worker_id)),
            metrics: self.with_metrics(|m| m.clone()),
        }
    }

    /// Look up (and release) the source id behind a queued item. Items
    /// recovered from disk have no mapping and fall back to their own id.
    fn source_for(&self, item_id: &str) -> String {
        self.sources_by_item
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item_id)
            .unwrap_or_else(|| item_id.to_string())
    }

    fn save_metrics(&self) {
        let snapshot = self.with_metrics(|m| m.clone());
        if let Err(e) = snapshot.save(&self.metrics_path) {
            warn!(worker = %self.worker_id, "failed to persist runner metrics: {e:#}");
        }
    }

    fn with_metrics<R>(&self, f: impl FnOnce(&mut RunnerMetrics) -> R) -> R {
        let mut guard = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn with_tracker<R>(&self, f: impl FnOnce(&mut ErrorTracker) -> R) -> R {
        let mut guard = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("worker_id", &self.worker_id)
            .field("state", &self.machine.current_state())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}
