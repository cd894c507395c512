//! Per-worker circuit breaker with a decaying failure count.
//!
//! # States
//! - Closed: normal operation, work passes through
//! - Open: worker assumed broken, work is gated off
//! - Half-Open: probing whether the worker recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold
//! Open → Half-Open: after reset_timeout since the last failure
//! Half-Open → Closed: a success, or half_open_timeout with no new failure
//! ```
//!
//! The failure count decays continuously toward zero at `error_decay_rate`
//! per second since the last failure, so sporadic failures spread over a
//! long window never trip the breaker. All methods are total: nothing here
//! returns an error or panics.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast; execution is gated off.
    Open,
    /// Probing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Compute a decayed failure count.
///
/// Pure so the decay property is testable without sleeping: the count is
/// reduced by `decay_rate` per elapsed second, floored at zero.
///
/// # Example
///
/// ```
/// use relay::breaker::decayed_count;
/// use std::time::Duration;
///
/// let decayed = decayed_count(3.0, 0.1, Duration::from_secs(10));
/// assert!((decayed - 2.0).abs() < 1e-9);
/// assert_eq!(decayed_count(1.0, 0.1, Duration::from_secs(60)), 0.0);
/// ```
#[must_use]
pub fn decayed_count(count: f64, decay_rate: f64, elapsed: Duration) -> f64 {
    (count - decay_rate * elapsed.as_secs_f64()).max(0.0)
}

/// Fault-isolation gate for a single worker identity.
///
/// Owned by the [`ErrorTracker`](crate::tracker::ErrorTracker), one per
/// worker id. Not shared across workers.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    /// Raw failure count as of `decay_anchor`; read through `failure_count()`.
    count: f64,
    /// Instant at which `count` was last written back.
    decay_anchor: Instant,
    failure_threshold: f64,
    reset_timeout: Duration,
    half_open_timeout: Duration,
    decay_rate: f64,
    recovery_streak: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    half_open_since: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a breaker with explicit parameters.
    #[must_use]
    pub fn new(
        failure_threshold: f64,
        reset_timeout: Duration,
        half_open_timeout: Duration,
        decay_rate: f64,
    ) -> Self {
        Self {
            state: CircuitState::Closed,
            count: 0.0,
            decay_anchor: Instant::now(),
            failure_threshold,
            reset_timeout,
            half_open_timeout,
            decay_rate,
            recovery_streak: 0,
            last_failure_at: None,
            last_success_at: None,
            half_open_since: None,
        }
    }

    /// Create a breaker from the shared configuration.
    #[must_use]
    pub fn from_config(config: &crate::config::RelayConfig) -> Self {
        Self::new(
            config.failure_threshold,
            config.reset_timeout(),
            config.half_open_timeout(),
            config.error_decay_rate,
        )
    }

    /// Current state without applying timeouts.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Current failure count with decay applied.
    #[must_use]
    pub fn failure_count(&self) -> f64 {
        decayed_count(self.count, self.decay_rate, self.decay_anchor.elapsed())
    }

    /// Consecutive successes since the last failure.
    #[must_use]
    pub fn recovery_streak(&self) -> u32 {
        self.recovery_streak
    }

    /// Instant of the most recent failure, if any.
    #[must_use]
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Instant of the most recent success, if any.
    #[must_use]
    pub fn last_success_at(&self) -> Option<Instant> {
        self.last_success_at
    }

    /// Record a failed operation. May open the circuit.
    pub fn record_failure(&mut self) {
        self.apply_decay();
        let now = Instant::now();
        self.count += 1.0;
        self.last_failure_at = Some(now);
        self.recovery_streak = 0;

        if self.count >= self.failure_threshold {
            self.state = CircuitState::Open;
            self.half_open_since = None;
        }
    }

    /// Record a successful operation.
    ///
    /// The only state change is `HalfOpen → Closed`; a success while
    /// closed just extends the recovery streak, and a success while open
    /// is recorded but does not reopen execution.
    pub fn record_success(&mut self) {
        let now = Instant::now();
        self.last_success_at = Some(now);
        self.recovery_streak = self.recovery_streak.saturating_add(1);

        if self.state == CircuitState::HalfOpen {
            self.close();
        }
    }

    /// Check whether execution is currently allowed.
    ///
    /// Applies decay, then evaluates the state: closed always allows,
    /// open allows only once `reset_timeout` has elapsed (moving to
    /// half-open), and half-open allows probes, closing after
    /// `half_open_timeout` passes without a new failure.
    pub fn can_execute(&mut self) -> bool {
        self.apply_decay();

        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= self.reset_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_since = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                let quiet = self
                    .half_open_since
                    .map_or(Duration::ZERO, |at| at.elapsed());
                if quiet >= self.half_open_timeout {
                    self.close();
                }
                true
            }
        }
    }

    /// Force the breaker closed with all counters cleared.
    ///
    /// Operator override for resuming a quarantined worker.
    pub fn manual_reset(&mut self) {
        self.state = CircuitState::Closed;
        self.count = 0.0;
        self.decay_anchor = Instant::now();
        self.recovery_streak = 0;
        self.last_failure_at = None;
        self.half_open_since = None;
    }

    /// Write the decayed count back and move the anchor.
    fn apply_decay(&mut self) {
        self.count = self.failure_count();
        self.decay_anchor = Instant::now();
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.count = 0.0;
        self.decay_anchor = Instant::now();
        self.half_open_since = None;
    }
}
