//! Custom error types for Relay.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the crate.

use std::path::PathBuf;
use thiserror::Error;

use crate::queue::ItemState;
use crate::state::WorkerState;

/// Main error type for Relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    /// Worker state transition rejected by the adjacency table
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    // =========================================================================
    // Queue Errors
    // =========================================================================
    /// Queue item lifecycle change rejected by the validity table
    #[error("Invalid item state transition: {from} -> {to}")]
    InvalidItemTransition { from: ItemState, to: ItemState },

    /// Queue item lookup miss
    #[error("Queue item not found: {id} (owner: {owner})")]
    ItemNotFound { owner: String, id: String },

    /// Incoming item failed structural validation
    #[error("Malformed item: {reason}")]
    MalformedItem { reason: String },

    // =========================================================================
    // Runner Errors
    // =========================================================================
    /// Runner execution failed
    #[error("Runner error: {message}")]
    Runner { message: String },

    /// Runner is quarantined and needs a manual reset
    #[error("Runner for worker '{worker}' is stopped; manual reset required")]
    RunnerStopped { worker: String },

    /// Retry budget exhausted without recovery
    #[error("Retry budget exhausted after {attempts} attempts (max: {max})")]
    RetriesExhausted { attempts: u32, max: u32 },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid-configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a runner error
    pub fn runner(message: impl Into<String>) -> Self {
        Self::Runner {
            message: message.into(),
        }
    }

    /// Create a malformed-item error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedItem {
            reason: reason.into(),
        }
    }

    /// Create an item-not-found error
    pub fn item_not_found(owner: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ItemNotFound {
            owner: owner.into(),
            id: id.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is recoverable through a retry
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Runner { .. } | Self::Io(_) | Self::Other(_))
    }

    /// Check if this error requires operator intervention
    pub fn requires_manual_reset(&self) -> bool {
        matches!(
            self,
            Self::RunnerStopped { .. } | Self::RetriesExhausted { .. }
        )
    }
}

/// Type alias for Relay results
pub type Result<T> = std::result::Result<T, RelayError>;
