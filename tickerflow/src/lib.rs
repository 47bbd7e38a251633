//! # Tickerflow
//!
//! Workflow orchestration for multi-symbol market data pipelines.
//!
//! Tickerflow runs an ordered set of stages (ingestion, indicators,
//! financials, weekly aggregation, growth metrics, signals) over a set of
//! ticker symbols with:
//!
//! - **Per-symbol isolation**: a failing symbol is retried, then dead-lettered,
//!   without affecting the others
//! - **Quality gates**: post-stage checks that retry, skip, or abort
//! - **Idempotency**: every (run, symbol, stage) unit is tracked and a
//!   completed unit is never re-run
//! - **Checkpoints**: unexpected failures leave a resumable snapshot
//! - **Pluggable persistence**: in-memory and `SQLite` stores
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tickerflow::prelude::*;
//!
//! let definition = standard_pipeline(stages, ledger)?;
//! let orchestrator = Orchestrator::new(definition, Arc::new(InMemoryStore::new()))
//!     .with_config(OrchestratorConfig::load()?);
//!
//! let result = orchestrator
//!     .execute_workflow(RunKind::Scheduled, &["AAPL", "MSFT"], DataFrequency::Daily, false)
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod gates;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{LoggingConfig, OrchestratorConfig};
    pub use crate::core::{
        Checkpoint, DataFrequency, DeadLetterItem, RunKind, RunStatus, StageId, SymbolStatus,
        WorkflowResult,
    };
    pub use crate::errors::{StageError, StoreError, WorkflowError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::gates::{
        DataIngestionGate, Gate, GateAction, GateResult, IndicatorComputationGate,
        InMemoryValidationLedger, SignalGenerationGate, ValidationLedger,
    };
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        standard_pipeline, Orchestrator, RetryPolicy, StageDescriptor, StandardStages,
        WorkflowDefinition, WorkflowRequest,
    };
    pub use crate::stages::{AsyncFnStage, FnStage, StageFn, StageInput};
    pub use crate::store::{CheckpointStore, DeadLetterStore, InMemoryStore, WorkflowStore};
    #[cfg(feature = "sqlite")]
    pub use crate::store::SqliteStore;
}
