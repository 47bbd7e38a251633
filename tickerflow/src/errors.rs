//! Error types for the tickerflow orchestrator.
//!
//! Errors are split by the boundary they cross:
//! - [`StageError`] is returned by stage functions and never leaves the executor
//! - [`WorkflowError`] is raised at run level and ends the run
//! - [`StoreError`] comes from persistence backends
//! - [`DefinitionError`] is raised while assembling a workflow definition

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::core::StageId;
use crate::gates::GateAction;

/// Run-level error. Every variant terminates the run it was raised in.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A dependency stage did not complete.
    #[error("{0}")]
    DependencyUnmet(#[from] StageDependencyUnmet),

    /// A gate reported a systemic failure.
    #[error("{0}")]
    GateFailed(#[from] GateFailed),

    /// A persistence operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The run-scoped cancellation token fired.
    #[error("Workflow cancelled: {0}")]
    Cancelled(String),

    /// The request could not be executed as given.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Returns a stable classification string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DependencyUnmet(_) => "stage_dependency_unmet",
            Self::GateFailed(_) => "gate_failed",
            Self::Store(_) => "store",
            Self::Cancelled(_) => "cancelled",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "unexpected",
        }
    }

    /// Returns true if this is a declared gate abort.
    #[must_use]
    pub const fn is_gate_abort(&self) -> bool {
        matches!(self, Self::GateFailed(_))
    }

    /// Returns true if the failed run should leave a checkpoint behind.
    ///
    /// Gate aborts are declared outcomes and invalid requests cannot be
    /// resumed with the same parameters.
    #[must_use]
    pub const fn needs_checkpoint(&self) -> bool {
        !matches!(self, Self::GateFailed(_) | Self::InvalidRequest(_))
    }
}

/// Raised when a stage's dependency did not reach `completed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stage '{stage}' dependency '{dependency}' unmet: {detail}")]
pub struct StageDependencyUnmet {
    /// The stage that could not start.
    pub stage: StageId,
    /// The dependency that was not satisfied.
    pub dependency: StageId,
    /// Observed dependency state.
    pub detail: String,
}

impl StageDependencyUnmet {
    /// Creates a new dependency error.
    #[must_use]
    pub fn new(stage: StageId, dependency: StageId, detail: impl Into<String>) -> Self {
        Self {
            stage,
            dependency,
            detail: detail.into(),
        }
    }
}

/// A gate rejected a symbol after its stage function succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Gate '{gate_name}' failed for {symbol} ({action}): {reason}")]
pub struct GateFailed {
    /// Name of the rejecting gate.
    pub gate_name: String,
    /// Symbol that was checked.
    pub symbol: String,
    /// Why the gate rejected the symbol.
    pub reason: String,
    /// Remedial action the gate recommends.
    pub action: GateAction,
}

/// Error returned by a stage function for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// I/O, network, or rate-limit failure that may succeed on retry.
    #[error("Transient stage error: {0}")]
    Transient(String),

    /// Validation or business-rule failure that will not succeed on retry.
    #[error("Permanent stage error: {0}")]
    Permanent(String),

    /// The stage function exceeded its timeout.
    #[error("Stage timed out after {0:?}")]
    Timeout(Duration),

    /// The stage function panicked.
    #[error("Stage panicked: {0}")]
    Panicked(String),
}

impl StageError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Returns true if a retry may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Returns a stable classification string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Timeout(_) => "timeout",
            Self::Panicked(_) => "panicked",
        }
    }

    /// Classifies an arbitrary error raised by collaborator code.
    ///
    /// I/O errors and elapsed timeouts are transient; a wrapped `StageError`
    /// keeps its own class; everything else is permanent.
    #[must_use]
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(stage_err) = err.downcast_ref::<Self>() {
            return stage_err.clone();
        }
        let transient = err.chain().any(|cause| {
            cause.is::<std::io::Error>() || cause.is::<tokio::time::error::Elapsed>()
        });
        if transient {
            Self::Transient(format!("{err:#}"))
        } else {
            Self::Permanent(format!("{err:#}"))
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::classify(&err)
    }
}

/// Errors raised by persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced record does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A symbol state update would leave a terminal status.
    #[error("Invalid state transition for {key}: {from} -> {to}")]
    InvalidTransition {
        /// The (run, symbol, stage) key.
        key: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The run already reached a terminal status.
    #[error("Run '{0}' is already finalized")]
    AlreadyFinalized(String),

    /// A record with the same key already exists.
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// The backend itself failed.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Wraps a backend-specific error.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised when a workflow definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DefinitionError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<StageId>,
}

impl DefinitionError {
    /// Creates a new definition error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<StageId>) -> Self {
        self.stages = stages;
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("stages".to_string(), serde_json::json!(self.stages));
        map
    }
}
