//! Lifecycle events emitted by the orchestrator and executor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::core::StageId;
use crate::utils::{now_utc, Timestamp};

/// The lifecycle transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A workflow run was created.
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    /// A workflow run completed.
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    /// A workflow run failed.
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    /// A stage run started.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A stage run completed.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A stage run failed.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A symbol is about to be retried.
    #[serde(rename = "symbol.retrying")]
    SymbolRetrying,
    /// A symbol was dead-lettered.
    #[serde(rename = "symbol.failed")]
    SymbolFailed,
    /// A symbol completed a stage.
    #[serde(rename = "symbol.completed")]
    SymbolCompleted,
}

impl EventKind {
    /// Returns the dotted event name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::SymbolRetrying => "symbol.retrying",
            Self::SymbolFailed => "symbol.failed",
            Self::SymbolCompleted => "symbol.completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event about one run, optionally scoped to a stage and symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The run the event belongs to.
    pub run_id: String,
    /// Stage scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    /// Symbol scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// When the event occurred.
    pub timestamp: Timestamp,
    /// Additional payload.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl WorkflowEvent {
    /// Creates a run-scoped event.
    #[must_use]
    pub fn new(kind: EventKind, run_id: impl Into<String>) -> Self {
        Self {
            kind,
            run_id: run_id.into(),
            stage: None,
            symbol: None,
            timestamp: now_utc(),
            data: HashMap::new(),
        }
    }

    /// Scopes the event to a stage.
    #[must_use]
    pub const fn for_stage(mut self, stage: StageId) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Scopes the event to a symbol.
    #[must_use]
    pub fn for_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Adds a payload field.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}
