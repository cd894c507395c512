//! Classified error tracking with per-worker circuit breakers.
//!
//! The [`ErrorTracker`] owns a bounded history of [`ErrorRecord`]s, one
//! [`CircuitBreaker`] per worker identity, and a durable failure vault
//! for unrecoverable errors. It is the single writer for all of them;
//! other components only call through its API.
//!
//! # Severity routing
//!
//! Severity drives two independent effects:
//! - `High`/`Critical` records forward a failure to the worker's breaker
//! - `Critical` records are additionally archived to the failure vault
//!
//! The tracker never raises on bad input: unknown worker ids get a fresh
//! closed breaker, and vault I/O failures are logged and swallowed.

pub mod classify;
pub mod vault;

pub use classify::ErrorClassifier;
pub use vault::FailureVault;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::RelayConfig;

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Classification of errors surfaced by item handlers and collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Archiving or moving a record failed
    Archive,
    /// Response/prompt had an unexpected shape
    PromptFormat,
    /// Agent stopped responding
    Inactivity,
    /// Devlog write failed
    DevlogWrite,
    /// Anything else
    Generic,
}

impl ErrorKind {
    /// Default severity assigned when the caller does not override it.
    #[must_use]
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Archive => Severity::Medium,
            Self::PromptFormat => Severity::High,
            Self::Inactivity => Severity::Medium,
            Self::DevlogWrite => Severity::Low,
            Self::Generic => Severity::Medium,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Archive => write!(f, "archive"),
            Self::PromptFormat => write!(f, "prompt_format"),
            Self::Inactivity => write!(f, "inactivity"),
            Self::DevlogWrite => write!(f, "devlog_write"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// How bad an error is. Ordered: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// ============================================================================
// Error Record
// ============================================================================

/// Immutable record of a single classified error.
///
/// # Example
///
/// ```
/// use relay::tracker::{ErrorKind, ErrorRecord, Severity};
///
/// let record = ErrorRecord::new("w1", ErrorKind::PromptFormat, "bad shape")
///     .with_context("item_id", "abc-123");
/// assert_eq!(record.severity, Severity::High);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// Worker identity the error belongs to.
    pub worker_id: String,
    /// Classified kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Severity; defaults from the kind.
    pub severity: Severity,
    /// Opaque key-value context for post-mortem analysis.
    pub context: HashMap<String, String>,
}

impl ErrorRecord {
    /// Create a record with the kind's default severity.
    pub fn new(
        worker_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            worker_id: worker_id.into(),
            kind,
            message: message.into(),
            severity: kind.default_severity(),
            context: HashMap::new(),
        }
    }

    /// Override the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Summary / Health
// ============================================================================

/// Aggregate counts over the tracked history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Total matching records.
    pub total: usize,
    /// Counts by kind.
    pub by_kind: HashMap<ErrorKind, usize>,
    /// Counts by severity.
    pub by_severity: HashMap<Severity, usize>,
}

/// Derived health status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Breaker closed with a sustained recovery streak.
    Healthy,
    /// Breaker half-open; recovery unconfirmed.
    Unstable,
    /// Breaker open, or closed without an established streak.
    Failing,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unstable => write!(f, "unstable"),
            Self::Failing => write!(f, "failing"),
        }
    }
}

/// Snapshot of a worker's health for the administrative surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Worker identity.
    pub worker_id: String,
    /// Derived status.
    pub status: HealthStatus,
    /// Current breaker state.
    pub circuit_state: CircuitState,
    /// Decayed failure count.
    pub failure_count: f64,
    /// Consecutive successes since the last failure.
    pub recovery_streak: u32,
    /// Error counts for this worker over the whole history.
    pub summary: ErrorSummary,
}

/// Recovery streak above which a closed breaker counts as healthy.
const HEALTHY_STREAK: u32 = 5;

// ============================================================================
// Error Tracker
// ============================================================================

/// Owner of all error history, breakers, and the failure vault.
pub struct ErrorTracker {
    config: RelayConfig,
    history: VecDeque<ErrorRecord>,
    breakers: HashMap<String, CircuitBreaker>,
    vault: Option<FailureVault>,
}

impl ErrorTracker {
    /// Create a tracker with a vault under `data_dir/vault`.
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        let vault = FailureVault::new(config.data_dir.join("vault"));
        Self {
            config: config.clone(),
            history: VecDeque::with_capacity(config.history_capacity.min(1024)),
            breakers: HashMap::new(),
            vault: Some(vault),
        }
    }

    /// Create a tracker without a durable vault (in-memory only).
    #[must_use]
    pub fn without_vault(config: &RelayConfig) -> Self {
        Self {
            config: config.clone(),
            history: VecDeque::with_capacity(config.history_capacity.min(1024)),
            breakers: HashMap::new(),
            vault: None,
        }
    }

    /// Record a classified error.
    ///
    /// Appends to the bounded history (evicting the oldest past
    /// capacity), forwards `High`/`Critical` severities to the worker's
    /// breaker, and archives `Critical` records to the vault. Vault
    /// failures are logged, never propagated; archiving is best-effort.
    pub fn record_error(&mut self, record: ErrorRecord) {
        debug!(
            worker = %record.worker_id,
            kind = %record.kind,
            severity = %record.severity,
            "recording error"
        );

        if record.severity >= Severity::High {
            let worker = record.worker_id.clone();
            self.breaker_mut(&worker).record_failure();
        }

        if record.severity == Severity::Critical {
            if let Some(vault) = &self.vault {
                if let Err(e) = vault.archive(&record) {
                    warn!(worker = %record.worker_id, "failed to archive error to vault: {e:#}");
                }
            }
        }

        self.history.push_back(record);
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
    }

    /// Record a success for the worker's breaker.
    pub fn record_success(&mut self, worker_id: &str) {
        self.breaker_mut(worker_id).record_success();
    }

    /// Check whether the worker's breaker allows execution.
    ///
    /// Unknown worker ids implicitly create a fresh closed breaker.
    pub fn can_execute(&mut self, worker_id: &str) -> bool {
        self.breaker_mut(worker_id).can_execute()
    }

    /// Aggregate error counts, optionally filtered by worker and age.
    #[must_use]
    pub fn error_summary(&self, worker_id: Option<&str>, window: Option<Duration>) -> ErrorSummary {
        let cutoff = window.and_then(|w| {
            chrono::Duration::from_std(w)
                .ok()
                .map(|w| Utc::now() - w)
        });

        let mut summary = ErrorSummary::default();
        for record in &self.history {
            if let Some(worker) = worker_id {
                if record.worker_id != worker {
                    continue;
                }
            }
            if let Some(cutoff) = cutoff {
                if record.timestamp < cutoff {
                    continue;
                }
            }
            summary.total += 1;
            *summary.by_kind.entry(record.kind).or_default() += 1;
            *summary.by_severity.entry(record.severity).or_default() += 1;
        }
        summary
    }

    /// Health snapshot for one worker.
    ///
    /// Status derivation: closed with a recovery streak above 5 is
    /// healthy, half-open is unstable, everything else is failing.
    pub fn worker_health(&mut self, worker_id: &str) -> WorkerHealth {
        let summary = self.error_summary(Some(worker_id), None);
        let breaker = self.breaker_mut(worker_id);
        let circuit_state = breaker.state();
        let failure_count = breaker.failure_count();
        let recovery_streak = breaker.recovery_streak();

        let status = match circuit_state {
            CircuitState::Closed if recovery_streak > HEALTHY_STREAK => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Unstable,
            _ => HealthStatus::Failing,
        };

        WorkerHealth {
            worker_id: worker_id.to_string(),
            status,
            circuit_state,
            failure_count,
            recovery_streak,
            summary,
        }
    }

    /// Drop history records, for one worker or all of them.
    pub fn clear_errors(&mut self, worker_id: Option<&str>) {
        match worker_id {
            Some(worker) => self.history.retain(|r| r.worker_id != worker),
            None => self.history.clear(),
        }
    }

    /// Operator override: force the worker's breaker closed.
    pub fn manual_reset(&mut self, worker_id: &str) {
        self.breaker_mut(worker_id).manual_reset();
    }

    /// Number of records currently held.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Most recent records, newest last.
    pub fn recent_errors(&self, limit: usize) -> impl Iterator<Item = &ErrorRecord> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip)
    }

    /// The vault, if this tracker has one.
    #[must_use]
    pub fn vault(&self) -> Option<&FailureVault> {
        self.vault.as_ref()
    }

    fn breaker_mut(&mut self, worker_id: &str) -> &mut CircuitBreaker {
        let config = &self.config;
        self.breakers
            .entry(worker_id.to_string())
            .or_insert_with(|| CircuitBreaker::from_config(config))
    }
}

impl std::fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("history_len", &self.history.len())
            .field("workers", &self.breakers.len())
            .field("has_vault", &self.vault.is_some())
            .finish()
    }
}
