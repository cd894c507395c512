//! Worker lifecycle state machine.
//!
//! Every runner iteration is bracketed by transitions through this
//! machine. Transitions are validated against a static adjacency table;
//! anything outside the table fails without mutating state.
//!
//! # State Transitions
//!
//! - `Idle` -> `Processing` | `Error` | `Stopped`
//! - `Processing` -> `Idle` | `Error` | `Stopped`
//! - `Error` -> `Idle` | `Stopped`
//! - `Stopped` -> `Idle` (manual reset only)

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RelayError, Result};

// ============================================================================
// Worker State
// ============================================================================

/// Current state of a worker in the lifecycle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Waiting for work
    #[default]
    Idle,
    /// Handler is executing an item
    Processing,
    /// Last item failed; deciding between retry and quarantine
    Error,
    /// Quarantined; requires a manual reset to resume
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Processing => write!(f, "processing"),
            WorkerState::Error => write!(f, "error"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

impl WorkerState {
    /// Check if this state can transition to the target state.
    ///
    /// # Example
    ///
    /// ```
    /// use relay::state::WorkerState;
    ///
    /// assert!(WorkerState::Idle.can_transition_to(WorkerState::Processing));
    /// assert!(!WorkerState::Stopped.can_transition_to(WorkerState::Processing));
    /// ```
    #[must_use]
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::{Error, Idle, Processing, Stopped};
        matches!(
            (self, target),
            (Idle, Processing | Error | Stopped)
                | (Processing, Idle | Error | Stopped)
                | (Error, Idle | Stopped)
                | (Stopped, Idle)
        )
    }
}

// ============================================================================
// Transition History
// ============================================================================

/// Record of a single state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// State before the transition.
    pub from: WorkerState,
    /// State after the transition.
    pub to: WorkerState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Optional reason supplied by the caller.
    pub reason: Option<String>,
}

// ============================================================================
// State Machine
// ============================================================================

/// Token returned by handler registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Box<dyn Fn(WorkerState, WorkerState) + Send>;

struct Inner {
    current: WorkerState,
    history: Vec<StateTransition>,
    handlers: HashMap<WorkerState, Vec<(HandlerId, Handler)>>,
    next_handler_id: u64,
}

/// Validated state machine with per-state handlers.
///
/// All reads and writes are serialized by a single internal mutex:
/// transitions from concurrent callers are strictly ordered, never
/// interleaved. Handlers registered for the target state run
/// synchronously inside the transition, in registration order; a handler
/// panic is caught and logged but never rolls the transition back.
///
/// # Example
///
/// ```
/// use relay::state::{StateMachine, WorkerState};
///
/// let machine = StateMachine::new();
/// machine.transition_to(WorkerState::Processing, Some("picked up item")).unwrap();
/// assert_eq!(machine.current_state(), WorkerState::Processing);
/// ```
pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl StateMachine {
    /// Create a machine in the `Idle` state with an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: WorkerState::Idle,
                history: Vec::new(),
                handlers: HashMap::new(),
                next_handler_id: 0,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current_state(&self) -> WorkerState {
        self.lock().current
    }

    /// Snapshot of the append-only transition history.
    #[must_use]
    pub fn history(&self) -> Vec<StateTransition> {
        self.lock().history.clone()
    }

    /// Attempt a transition to `target`.
    ///
    /// On success the transition record is appended, the current state is
    /// updated, and every handler registered for `target` is invoked with
    /// `(old_state, new_state)`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidTransition`] if the adjacency table
    /// does not permit the transition; state and history are untouched.
    pub fn transition_to(&self, target: WorkerState, reason: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        let from = inner.current;

        if !from.can_transition_to(target) {
            return Err(RelayError::InvalidTransition { from, to: target });
        }

        inner.history.push(StateTransition {
            from,
            to: target,
            at: Utc::now(),
            reason: reason.map(String::from),
        });
        inner.current = target;
        debug!(%from, to = %target, reason, "state transition");

        if let Some(handlers) = inner.handlers.get(&target) {
            for (id, handler) in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(from, target))).is_err() {
                    warn!(handler = id.0, state = %target, "state handler panicked");
                }
            }
        }

        Ok(())
    }

    /// Register a handler invoked after every transition into `state`.
    ///
    /// Multiple handlers per state are allowed and run in registration
    /// order.
    pub fn add_state_handler<F>(&self, state: WorkerState, handler: F) -> HandlerId
    where
        F: Fn(WorkerState, WorkerState) + Send + 'static,
    {
        let mut inner = self.lock();
        let id = HandlerId(inner.next_handler_id);
        inner.next_handler_id += 1;
        inner
            .handlers
            .entry(state)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Remove a previously registered handler. Returns whether it existed.
    pub fn remove_state_handler(&self, state: WorkerState, id: HandlerId) -> bool {
        let mut inner = self.lock();
        if let Some(handlers) = inner.handlers.get_mut(&state) {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            return handlers.len() != before;
        }
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a handler panicked while we held the
        // lock; the state itself is still consistent, so keep going.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current_state())
            .finish_non_exhaustive()
    }
}
