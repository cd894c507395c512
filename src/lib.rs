//! Relay - Resilient Response-Processing Loop
//!
//! A polling loop for handing agent responses to fallible handlers
//! without losing work: per-worker circuit breaking with time-decayed
//! failure counts, a crash-safe priority queue, classified error
//! tracking, and a validated worker lifecycle.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`breaker`] - Circuit breaker with continuous failure-count decay
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`logging`] - Tracing subscriber setup
//! - [`queue`] - Crash-safe, per-owner priority queue
//! - [`retry`] - Backoff policies and the retry helper
//! - [`runner`] - The polling runner that ties everything together
//! - [`state`] - Worker lifecycle state machine
//! - [`tracker`] - Classified error tracking and the failure vault
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//! use relay::config::RelayConfig;
//! use relay::queue::PersistentQueue;
//! use relay::runner::Runner;
//! use relay::tracker::ErrorTracker;
//!
//! // Load configuration and open the durable stores.
//! let config = RelayConfig::load("relay.toml".as_ref())?;
//! let queue = Arc::new(PersistentQueue::from_config(&config)?);
//! let tracker = Arc::new(Mutex::new(ErrorTracker::new(&config)));
//!
//! // One runner per worker identity; source and handler are yours.
//! let runner = Arc::new(Runner::new(
//!     "worker-1", config, queue, tracker, my_source, my_handler,
//! ));
//! runner.start().await;
//! ```

pub mod breaker;
pub mod config;
pub mod error;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod state;
pub mod tracker;

// Re-export commonly used types
pub use error::{RelayError, Result};

// Re-export config types
pub use config::RelayConfig;

// Re-export breaker types
pub use breaker::{CircuitBreaker, CircuitState};

// Re-export queue types
pub use queue::{ItemKind, ItemState, PersistentQueue, Priority, QueueItem};

// Re-export state machine types
pub use state::{StateMachine, StateTransition, WorkerState};

// Re-export tracker types
pub use tracker::{
    ErrorClassifier, ErrorKind, ErrorRecord, ErrorSummary, ErrorTracker, FailureVault,
    HealthStatus, Severity, WorkerHealth,
};

// Re-export runner types
pub use runner::{
    CycleOutcome, IncomingItem, ItemHandler, ItemSource, KindRouter, Runner, RunnerMetrics,
    RunnerStatus,
};

// Re-export retry types
pub use retry::{retry_with_policy, RetryPolicy};

// Re-export logging setup
pub use logging::init_logging;
