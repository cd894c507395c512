//! End-to-end tests driving the runner cycle by cycle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use relay::breaker::CircuitState;
use relay::config::RelayConfig;
use relay::queue::{PersistentQueue, Priority, QueueItem};
use relay::runner::{IncomingItem, ItemHandler, ItemSource, Runner};
use relay::state::WorkerState;
use relay::tracker::ErrorTracker;

/// Source that hands out a fixed batch on the first poll only.
struct OneShotSource {
    items: Mutex<Vec<IncomingItem>>,
}

impl OneShotSource {
    fn new(items: Vec<IncomingItem>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
        })
    }
}

#[async_trait]
impl ItemSource for OneShotSource {
    async fn poll(&self) -> anyhow::Result<Vec<IncomingItem>> {
        Ok(self.items.lock().unwrap().drain(..).collect())
    }
}

/// Handler scripted with per-call outcomes. `Some(msg)` fails with that
/// message; once the script runs out every call succeeds. Handled
/// payloads are recorded in order.
struct ScriptedHandler {
    script: Mutex<VecDeque<Option<String>>>,
    handled: Mutex<Vec<serde_json::Value>>,
    calls: AtomicU32,
}

impl ScriptedHandler {
    fn new(script: Vec<Option<&str>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().map(|s| s.map(String::from)).collect()),
            handled: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn handled(&self) -> Vec<serde_json::Value> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemHandler for ScriptedHandler {
    async fn handle(&self, item: &QueueItem) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Some(msg)) => Err(anyhow::anyhow!(msg)),
            _ => {
                self.handled.lock().unwrap().push(item.payload.clone());
                Ok(())
            }
        }
    }
}

struct Harness {
    runner: Runner,
    queue: Arc<PersistentQueue>,
}

fn harness(
    temp_dir: &tempfile::TempDir,
    config: RelayConfig,
    source: Arc<dyn ItemSource>,
    handler: Arc<dyn ItemHandler>,
) -> Harness {
    let config = config.with_data_dir(temp_dir.path());
    let queue = Arc::new(PersistentQueue::from_config(&config).unwrap());
    let tracker = Arc::new(Mutex::new(ErrorTracker::new(&config)));
    let runner = Runner::new("w1", config, queue.clone(), tracker, source, handler);
    Harness { runner, queue }
}

#[tokio::test]
async fn repeated_failures_trip_the_breaker_and_quarantine() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = RelayConfig::default()
        .with_max_retries(2)
        .with_failure_threshold(2.0)
        .with_error_decay_rate(0.0);
    let source = OneShotSource::new(vec![IncomingItem::new("s1", "w1", json!({"task": "t"}))]);
    // "prompt" errors classify High, so every failure feeds the breaker.
    let handler = ScriptedHandler::new(vec![
        Some("prompt mangled"),
        Some("prompt mangled"),
        Some("prompt mangled"),
    ]);
    let h = harness(&temp_dir, config, source, handler.clone());

    // First failure: breaker at 1 of 2, retry granted.
    let first = h.runner.run_cycle().await.unwrap();
    assert_eq!(first.retried, 1);
    assert!(!first.quarantined);

    // Second failure trips the breaker, but the attempt itself was made
    // against a closed breaker, so one more retry is granted.
    let second = h.runner.run_cycle().await.unwrap();
    assert_eq!(second.retried, 1);
    assert!(!second.quarantined);
    assert_eq!(h.runner.status().health.circuit_state, CircuitState::Open);

    // Third failure: breaker open and budget spent; quarantine.
    let third = h.runner.run_cycle().await.unwrap();
    assert!(third.quarantined);
    assert_eq!(third.failed, 1);

    let status = h.runner.status();
    assert_eq!(status.state, WorkerState::Stopped);
    assert_eq!(status.health.circuit_state, CircuitState::Open);
    assert_eq!(status.metrics.total_failed, 1);
    assert_eq!(status.metrics.total_retries, 2);
    assert_eq!(status.metrics.total_processed, 0);
    assert_eq!(handler.calls(), 3);

    // The poisoned item left the active queue permanently.
    assert_eq!(status.queued, 0);

    // Quarantined cycles do nothing until an operator intervenes.
    let idle = h.runner.run_cycle().await.unwrap();
    assert!(idle.quarantined);
    assert_eq!(handler.calls(), 3);
}

#[tokio::test]
async fn manual_reset_releases_quarantine_and_resumes_processing() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = RelayConfig::default()
        .with_max_retries(0)
        .with_failure_threshold(1.0)
        .with_error_decay_rate(0.0);
    let source = OneShotSource::new(vec![IncomingItem::new("s1", "w1", json!(1))]);
    let handler = ScriptedHandler::new(vec![Some("prompt mangled")]);
    let h = harness(&temp_dir, config, source, handler.clone());

    let outcome = h.runner.run_cycle().await.unwrap();
    assert!(outcome.quarantined);
    assert_eq!(h.runner.status().state, WorkerState::Stopped);

    h.runner.manual_reset().unwrap();
    let status = h.runner.status();
    assert_eq!(status.state, WorkerState::Idle);
    assert_eq!(status.health.circuit_state, CircuitState::Closed);

    // A fresh item after the reset processes normally.
    h.queue.enqueue("w1", json!(2), Priority::Normal).unwrap();
    let resumed = h.runner.run_cycle().await.unwrap();
    assert_eq!(resumed.processed, 1);
    assert_eq!(h.runner.status().metrics.total_processed, 1);
}

#[tokio::test]
async fn transient_failure_recovers_without_quarantine() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = RelayConfig::default()
        .with_max_retries(2)
        .with_failure_threshold(5.0)
        .with_error_decay_rate(0.0);
    let source = OneShotSource::new(vec![IncomingItem::new("s1", "w1", json!({"n": 1}))]);
    let handler = ScriptedHandler::new(vec![Some("prompt hiccup")]);
    let h = harness(&temp_dir, config, source, handler.clone());

    let first = h.runner.run_cycle().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(first.processed, 0);

    let second = h.runner.run_cycle().await.unwrap();
    assert_eq!(second.processed, 1);

    let status = h.runner.status();
    assert_eq!(status.state, WorkerState::Idle);
    assert_eq!(status.health.circuit_state, CircuitState::Closed);
    assert_eq!(status.metrics.total_processed, 1);
    assert_eq!(status.metrics.total_retries, 1);
    assert_eq!(status.metrics.total_failed, 0);
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn high_priority_items_are_handled_first() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let source = OneShotSource::new(vec![
        IncomingItem::new("s1", "w1", json!("first-normal")),
        IncomingItem::new("s2", "w1", json!("urgent")).with_priority(Priority::High),
        IncomingItem::new("s3", "w1", json!("second-normal")),
    ]);
    let handler = ScriptedHandler::new(vec![]);
    let h = harness(&temp_dir, RelayConfig::default(), source, handler.clone());

    let outcome = h.runner.run_cycle().await.unwrap();
    assert_eq!(outcome.processed, 3);

    assert_eq!(
        handler.handled(),
        vec![json!("urgent"), json!("first-normal"), json!("second-normal")]
    );
}

#[tokio::test]
async fn recovered_items_are_processed_after_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = RelayConfig::default().with_data_dir(temp_dir.path());

    // A previous process enqueued work and died before handling it.
    {
        let queue = PersistentQueue::from_config(&config).unwrap();
        queue.enqueue("w1", json!("survivor"), Priority::Normal).unwrap();
    }

    let queue = Arc::new(PersistentQueue::from_config(&config).unwrap());
    let tracker = Arc::new(Mutex::new(ErrorTracker::new(&config)));
    let source = OneShotSource::new(vec![]);
    let handler = ScriptedHandler::new(vec![]);
    let runner = Runner::new("w1", config, queue, tracker, source, handler.clone());

    let outcome = runner.run_cycle().await.unwrap();
    assert_eq!(outcome.discovered, 0);
    assert_eq!(outcome.processed, 1);
    assert_eq!(handler.handled(), vec![json!("survivor")]);
}

#[tokio::test]
async fn background_loop_processes_and_stops_cleanly() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = RelayConfig::default()
        .with_data_dir(temp_dir.path())
        .with_check_interval_secs(3600);
    let queue = Arc::new(PersistentQueue::from_config(&config).unwrap());
    let tracker = Arc::new(Mutex::new(ErrorTracker::new(&config)));
    let source = OneShotSource::new(vec![IncomingItem::new("s1", "w1", json!(1))]);
    let handler = ScriptedHandler::new(vec![]);
    let runner = Arc::new(Runner::new(
        "w1",
        config,
        queue,
        tracker,
        source,
        handler.clone(),
    ));

    runner.start().await;

    // The first cycle runs immediately; wait for it to land.
    for _ in 0..100 {
        if runner.status().metrics.total_processed == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(runner.status().metrics.total_processed, 1);

    runner.stop().await;
    assert!(!runner.status().running);
    assert_eq!(handler.calls(), 1);
}
