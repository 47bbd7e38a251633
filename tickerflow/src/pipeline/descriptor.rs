//! Typed stage descriptors and the validated workflow definition.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::StageId;
use crate::errors::DefinitionError;
use crate::gates::{
    DataIngestionGate, Gate, IndicatorComputationGate, SignalGenerationGate, ValidationLedger,
};
use crate::stages::StageFn;

/// One stage of a workflow.
#[derive(Clone)]
pub struct StageDescriptor {
    /// The stage identifier.
    pub id: StageId,
    /// Stages that must complete before this one starts.
    pub depends_on: Vec<StageId>,
    /// Whether the stage is part of the pipeline's success criteria.
    ///
    /// Symbols failing an optional stage still count as succeeded.
    pub required: bool,
    /// The per-symbol work.
    pub runner: Arc<dyn StageFn>,
    /// Post-stage quality check.
    pub gate: Option<Arc<dyn Gate>>,
    /// Per-invocation timeout for the stage function and its gate.
    pub timeout: Option<Duration>,
}

impl StageDescriptor {
    /// Creates a required stage.
    #[must_use]
    pub fn required(id: StageId, runner: Arc<dyn StageFn>) -> Self {
        Self {
            id,
            depends_on: Vec::new(),
            required: true,
            runner,
            gate: None,
            timeout: None,
        }
    }

    /// Creates an optional, best-effort stage.
    #[must_use]
    pub fn optional(id: StageId, runner: Arc<dyn StageFn>) -> Self {
        Self {
            required: false,
            ..Self::required(id, runner)
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, dependency: StageId) -> Self {
        if !self.depends_on.contains(&dependency) {
            self.depends_on.push(dependency);
        }
        self
    }

    /// Attaches a gate.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<dyn Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sets the stage function timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates the descriptor in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage depends on itself.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.depends_on.contains(&self.id) {
            return Err(DefinitionError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.id
            ))
            .with_stages(vec![self.id]));
        }
        Ok(())
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("id", &self.id)
            .field("depends_on", &self.depends_on)
            .field("required", &self.required)
            .field("runner", &self.runner.name())
            .field("gate", &self.gate.as_ref().map(|g| g.name().to_string()))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Builder for a validated [`WorkflowDefinition`].
///
/// Stages are declared in execution order; a dependency must be declared
/// before the stage that uses it, so every definition is acyclic.
#[derive(Debug, Clone, Default)]
pub struct WorkflowBuilder {
    stages: Vec<StageDescriptor>,
}

impl WorkflowBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is a duplicate, depends on itself, or
    /// depends on a stage not declared before it.
    pub fn stage(mut self, descriptor: StageDescriptor) -> Result<Self, DefinitionError> {
        self.add_stage(descriptor)?;
        Ok(self)
    }

    /// Appends a stage in place.
    ///
    /// # Errors
    ///
    /// See [`WorkflowBuilder::stage`].
    pub fn add_stage(&mut self, descriptor: StageDescriptor) -> Result<(), DefinitionError> {
        descriptor.validate()?;

        if self.stages.iter().any(|s| s.id == descriptor.id) {
            return Err(
                DefinitionError::new(format!("Stage '{}' is declared twice", descriptor.id))
                    .with_stages(vec![descriptor.id]),
            );
        }

        for dep in &descriptor.depends_on {
            if !self.stages.iter().any(|s| s.id == *dep) {
                return Err(DefinitionError::new(format!(
                    "Stage '{}' depends on '{}' which is not declared before it",
                    descriptor.id, dep
                ))
                .with_stages(vec![descriptor.id, *dep]));
            }
        }

        self.stages.push(descriptor);
        Ok(())
    }

    /// Builds the definition.
    ///
    /// # Errors
    ///
    /// Returns an error if no stage was declared.
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        if self.stages.is_empty() {
            return Err(DefinitionError::new("Workflow has no stages"));
        }
        Ok(WorkflowDefinition {
            stages: self.stages,
        })
    }
}

/// An ordered, acyclic list of stage descriptors.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    stages: Vec<StageDescriptor>,
}

impl WorkflowDefinition {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    /// Returns the stages in declared order.
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Returns the stage identifiers in declared order.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id).collect()
    }

    /// Looks up a stage.
    #[must_use]
    pub fn get(&self, id: StageId) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Returns the stages to execute, in declared order.
    ///
    /// `None` selects every stage.
    ///
    /// # Errors
    ///
    /// Returns an error if a selected stage is not part of the definition.
    pub fn plan(&self, selection: Option<&[StageId]>) -> Result<Vec<&StageDescriptor>, DefinitionError> {
        let Some(selection) = selection else {
            return Ok(self.stages.iter().collect());
        };

        let unknown: Vec<StageId> = selection
            .iter()
            .copied()
            .filter(|id| self.get(*id).is_none())
            .collect();
        if !unknown.is_empty() {
            return Err(DefinitionError::new("Requested stages are not part of the workflow")
                .with_stages(unknown));
        }

        Ok(self
            .stages
            .iter()
            .filter(|s| selection.contains(&s.id))
            .collect())
    }
}

/// Stage functions of the standard market data pipeline.
#[derive(Debug, Clone)]
pub struct StandardStages {
    /// Fetch and upsert raw bars.
    pub ingestion: Arc<dyn StageFn>,
    /// Compute technical indicators.
    pub indicators: Arc<dyn StageFn>,
    /// Ingest financial statements.
    pub financials: Arc<dyn StageFn>,
    /// Aggregate daily bars into weekly bars.
    pub weekly_aggregation: Arc<dyn StageFn>,
    /// Compute growth metrics.
    pub growth_metrics: Arc<dyn StageFn>,
    /// Generate trading signals.
    pub signals: Arc<dyn StageFn>,
}

/// Builds the standard pipeline with ledger-backed gates.
///
/// ```text
/// ingestion ─┬─ indicators ── signals
///            ├─ financials
///            ├─ weekly_aggregation
///            └─ growth_metrics
/// ```
///
/// # Errors
///
/// Never fails in practice; the signature mirrors [`WorkflowBuilder::build`].
pub fn standard_pipeline(
    stages: StandardStages,
    ledger: Arc<dyn ValidationLedger>,
) -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::builder()
        .stage(
            StageDescriptor::required(StageId::Ingestion, stages.ingestion)
                .with_gate(Arc::new(DataIngestionGate::new(ledger.clone()))),
        )?
        .stage(
            StageDescriptor::required(StageId::Indicators, stages.indicators)
                .depends_on(StageId::Ingestion)
                .with_gate(Arc::new(IndicatorComputationGate::new(ledger.clone()))),
        )?
        .stage(
            StageDescriptor::optional(StageId::Financials, stages.financials)
                .depends_on(StageId::Ingestion),
        )?
        .stage(
            StageDescriptor::optional(StageId::WeeklyAggregation, stages.weekly_aggregation)
                .depends_on(StageId::Ingestion),
        )?
        .stage(
            StageDescriptor::optional(StageId::GrowthMetrics, stages.growth_metrics)
                .depends_on(StageId::Ingestion),
        )?
        .stage(
            StageDescriptor::required(StageId::Signals, stages.signals)
                .depends_on(StageId::Indicators)
                .with_gate(Arc::new(SignalGenerationGate::new(ledger))),
        )?
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::InMemoryValidationLedger;
    use crate::stages::NoOpStage;

    fn noop(name: &str) -> Arc<dyn StageFn> {
        Arc::new(NoOpStage::new(name))
    }

    fn standard() -> WorkflowDefinition {
        standard_pipeline(
            StandardStages {
                ingestion: noop("ingest"),
                indicators: noop("indicators"),
                financials: noop("financials"),
                weekly_aggregation: noop("weekly"),
                growth_metrics: noop("growth"),
                signals: noop("signals"),
            },
            Arc::new(InMemoryValidationLedger::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_standard_pipeline_shape() {
        let def = standard();
        assert_eq!(def.stage_ids(), StageId::ALL.to_vec());

        let signals = def.get(StageId::Signals).unwrap();
        assert!(signals.required);
        assert_eq!(signals.depends_on, vec![StageId::Indicators]);
        assert_eq!(signals.gate.as_ref().unwrap().name(), "signal_generation_gate");

        let financials = def.get(StageId::Financials).unwrap();
        assert!(!financials.required);
        assert!(financials.gate.is_none());
    }

    #[test]
    fn test_dependency_must_be_declared_first() {
        let err = WorkflowDefinition::builder()
            .stage(StageDescriptor::required(StageId::Signals, noop("s")).depends_on(StageId::Indicators))
            .unwrap_err();
        assert_eq!(err.stages, vec![StageId::Signals, StageId::Indicators]);
    }

    #[test]
    fn test_rejects_duplicates_and_self_dependency() {
        let builder = WorkflowDefinition::builder()
            .stage(StageDescriptor::required(StageId::Ingestion, noop("i")))
            .unwrap();
        assert!(builder
            .clone()
            .stage(StageDescriptor::optional(StageId::Ingestion, noop("i2")))
            .is_err());

        let err = builder
            .stage(StageDescriptor::required(StageId::Indicators, noop("x")).depends_on(StageId::Indicators))
            .unwrap_err();
        assert!(err.message.contains("itself"));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(WorkflowBuilder::new().build().is_err());
    }

    #[test]
    fn test_plan_keeps_declared_order() {
        let def = standard();
        let plan: Vec<StageId> = def
            .plan(Some(&[StageId::Signals, StageId::Indicators]))
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(plan, vec![StageId::Indicators, StageId::Signals]);
        assert_eq!(def.plan(None).unwrap().len(), 6);
    }

    #[test]
    fn test_plan_rejects_unknown_stage() {
        let def = WorkflowDefinition::builder()
            .stage(StageDescriptor::required(StageId::Ingestion, noop("i")))
            .unwrap()
            .build()
            .unwrap();
        let err = def.plan(Some(&[StageId::Signals])).unwrap_err();
        assert_eq!(err.stages, vec![StageId::Signals]);
    }
}
