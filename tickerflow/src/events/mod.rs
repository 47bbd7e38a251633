//! Lifecycle events for observability.
//!
//! The orchestrator and executor report run, stage, and symbol transitions
//! to an [`EventSink`]. Emission never affects the outcome of a run.

mod event;
mod sink;

pub use event::{EventKind, WorkflowEvent};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
