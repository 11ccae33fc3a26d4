//! Workflow Execution State
//!
//! The mutable runtime record of one workflow run: status, per-step outcomes,
//! the shared context and failure details. The record is plain data; the
//! engine's scheduling loop is its only writer.
//!
//! Records are serializable so a host may persist them, but nothing in this
//! crate writes them to disk on its own.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{WorkflowDefinition, WorkflowStep};
use crate::agent::context::{AgentResult, DataMap};
use crate::error::{OrchestratorError, Result, WorkflowError};
use crate::monitoring::timeline::{EventType, ExecutionTimeline};

/// Lifecycle status of an execution.
///
/// ```text
/// Pending -> Running -> Completed | Failed | Cancelled | Paused
/// Paused  -> Running | Cancelled
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Completed, Failed and Cancelled never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of one step, after any orchestration-level retries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub step_id: String,
    pub agent_type: String,
    /// Result of the last invocation
    pub result: AgentResult,
    /// Orchestration-level re-invocations
    pub retry_count: u32,
    /// Set when the step failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// When each retry was started
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retried_at: Vec<DateTime<Utc>>,
}

impl StepOutcome {
    /// Creates an outcome spanning the result's own start and finish.
    pub fn new(
        step: &WorkflowStep,
        result: AgentResult,
        error: Option<WorkflowError>,
        retry_count: u32,
    ) -> Self {
        let started_at = result.started_at;
        let finished_at = result.finished_at;
        Self {
            step_id: step.step_id.clone(),
            agent_type: step.agent_type.clone(),
            result,
            retry_count,
            error,
            started_at,
            finished_at,
            duration_ms: elapsed_ms(started_at, finished_at),
            retried_at: Vec::new(),
        }
    }

    /// Overrides the step span (first attempt start to last attempt end).
    pub fn with_span(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.finished_at = finished_at;
        self.duration_ms = elapsed_ms(started_at, finished_at);
        self
    }

    pub fn with_retried_at(mut self, retried_at: Vec<DateTime<Utc>>) -> Self {
        self.retried_at = retried_at;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Error text for reports.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

/// Completion counters of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / total as f64
        };
        Self {
            completed,
            total,
            percent,
        }
    }
}

/// Read-only status snapshot returned by the status surface.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub current_step: Option<String>,
    pub progress: Progress,
    pub errors: Vec<String>,
    pub human_intervention_required: bool,
    pub pause_reason: Option<String>,
}

/// Runtime record of one workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// Step currently running, or the step a pause refers to
    pub current_step: Option<String>,
    /// Outcome of every executed step
    pub step_results: HashMap<String, StepOutcome>,
    /// Step IDs in the order their outcomes were recorded
    pub execution_order: Vec<String>,
    /// Initial parameters enriched by mapped step outputs
    pub global_context: DataMap,
    pub error_messages: Vec<String>,
    /// Error that ended the run, if any
    pub failure: Option<WorkflowError>,
    pub human_intervention_required: bool,
    pub pause_reason: Option<String>,
    /// Steps of the current group still awaiting review
    pub pending_reviews: Vec<String>,
    pub total_steps: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub timeline: ExecutionTimeline,
}

impl WorkflowExecution {
    /// Creates a pending execution seeded with `parameters`.
    pub fn new(definition: &WorkflowDefinition, parameters: DataMap) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            workflow_id: definition.workflow_id.clone(),
            status: ExecutionStatus::Pending,
            current_step: None,
            step_results: HashMap::new(),
            execution_order: Vec::new(),
            global_context: parameters,
            error_messages: Vec::new(),
            failure: None,
            human_intervention_required: false,
            pause_reason: None,
            pending_reviews: Vec::new(),
            total_steps: definition.len(),
            started_at: None,
            finished_at: None,
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        debug!(
            "Execution '{}': {} -> {}",
            self.execution_id, self.status, next
        );

        if self.started_at.is_none() && next == ExecutionStatus::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.current_step = None;
            self.pending_reviews.clear();
        }
        self.status = next;
        Ok(())
    }

    /// Pending -> Running.
    pub fn start(&mut self) -> Result<()> {
        self.transition(ExecutionStatus::Running)
    }

    /// Stores a step outcome and its timeline events.
    pub fn record_outcome(&mut self, outcome: StepOutcome) {
        if let Some(message) = outcome.error_message() {
            self.error_messages.push(message);
        }
        self.timeline.record_step(&outcome);
        if !self.step_results.contains_key(&outcome.step_id) {
            self.execution_order.push(outcome.step_id.clone());
        }
        self.step_results.insert(outcome.step_id.clone(), outcome);
    }

    /// Ends the run as FAILED with `error`.
    pub fn fail(&mut self, error: WorkflowError) -> Result<()> {
        self.transition(ExecutionStatus::Failed)?;
        self.set_failure(error);
        Ok(())
    }

    /// Ends the run as CANCELLED with `error`.
    pub fn cancel(&mut self, error: WorkflowError) -> Result<()> {
        self.transition(ExecutionStatus::Cancelled)?;
        self.human_intervention_required = false;
        self.set_failure(error);
        Ok(())
    }

    fn set_failure(&mut self, error: WorkflowError) {
        let message = error.to_string();
        if !self.error_messages.contains(&message) {
            self.error_messages.push(message);
        }
        self.failure = Some(error);
    }

    /// Ends the run as COMPLETED.
    pub fn complete(&mut self) -> Result<()> {
        self.transition(ExecutionStatus::Completed)
    }

    /// Running -> Paused, awaiting a decision about `step_id`.
    pub fn pause(&mut self, step_id: &str, reason: impl Into<String>) -> Result<()> {
        self.transition(ExecutionStatus::Paused)?;
        self.human_intervention_required = true;
        self.pause_reason = Some(reason.into());
        self.current_step = Some(step_id.to_string());
        self.timeline.add_event(step_id, EventType::Paused);
        Ok(())
    }

    /// Paused -> Running after approval.
    pub fn resume(&mut self) -> Result<()> {
        self.transition(ExecutionStatus::Running)?;
        if let Some(step_id) = self.current_step.take() {
            self.timeline.add_event(step_id, EventType::Resumed);
        }
        self.human_intervention_required = false;
        self.pause_reason = None;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn progress(&self) -> Progress {
        Progress::new(self.step_results.len(), self.total_steps)
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            current_step: self.current_step.clone(),
            progress: self.progress(),
            errors: self.error_messages.clone(),
            human_intervention_required: self.human_intervention_required,
            pause_reason: self.pause_reason.clone(),
        }
    }

    pub fn step_result(&self, step_id: &str) -> Option<&StepOutcome> {
        self.step_results.get(step_id)
    }

    /// IDs of failed steps, in execution order.
    pub fn failed_steps(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .filter(|id| self.step_results.get(*id).is_some_and(|o| !o.is_success()))
            .map(String::as_str)
            .collect()
    }

    /// Wall-clock duration of the run so far.
    pub fn duration_ms(&self) -> Option<i64> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::AgentErrorKind;
    use serde_json::json;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::from_steps(
            "wf",
            vec![
                WorkflowStep::new("a", "echo"),
                WorkflowStep::new("b", "echo").depends_on("a"),
            ],
        )
    }

    fn success(step: &WorkflowStep) -> StepOutcome {
        let mut data = DataMap::new();
        data.insert("x".to_string(), json!(1));
        StepOutcome::new(step, AgentResult::success(data, Utc::now()), None, 0)
    }

    #[test]
    fn test_new_execution() {
        let mut params = DataMap::new();
        params.insert("document".to_string(), json!("text"));
        let execution = WorkflowExecution::new(&definition(), params);

        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.global_context["document"], json!("text"));
        assert_eq!(execution.total_steps, 2);
        assert!(Uuid::parse_str(&execution.execution_id).is_ok());
        assert!(execution.started_at.is_none());
    }

    #[test]
    fn test_execution_ids_are_unique() {
        let a = WorkflowExecution::new(&definition(), DataMap::new());
        let b = WorkflowExecution::new(&definition(), DataMap::new());
        assert_ne!(a.execution_id, b.execution_id);
    }

    #[test]
    fn test_legal_transitions() {
        let mut execution = WorkflowExecution::new(&definition(), DataMap::new());
        execution.start().unwrap();
        assert!(execution.started_at.is_some());

        execution.pause("a", "review").unwrap();
        assert!(execution.human_intervention_required);
        assert_eq!(execution.current_step.as_deref(), Some("a"));

        execution.resume().unwrap();
        assert!(!execution.human_intervention_required);
        assert!(execution.pause_reason.is_none());

        execution.complete().unwrap();
        assert!(execution.is_terminal());
        assert!(execution.finished_at.is_some());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut execution = WorkflowExecution::new(&definition(), DataMap::new());
        assert!(matches!(
            execution.complete(),
            Err(OrchestratorError::InvalidTransition { .. })
        ));
        assert!(execution.pause("a", "x").is_err());

        execution.start().unwrap();
        execution.complete().unwrap();
        assert!(execution.start().is_err());
        assert!(execution.fail(WorkflowError::WorkflowCancelled).is_err());
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_paused_cannot_complete_directly() {
        assert!(!ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Completed));
        assert!(ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Cancelled));
        assert!(!ExecutionStatus::Failed.can_transition_to(ExecutionStatus::Running));
    }

    #[test]
    fn test_fail_records_error() {
        let mut execution = WorkflowExecution::new(&definition(), DataMap::new());
        let error = WorkflowError::CircularDependency {
            remaining: vec!["a".to_string()],
        };
        execution.fail(error.clone()).unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.failure, Some(error));
        assert_eq!(execution.error_messages.len(), 1);
    }

    #[test]
    fn test_record_outcome_and_progress() {
        let definition = definition();
        let mut execution = WorkflowExecution::new(&definition, DataMap::new());
        execution.start().unwrap();
        execution.record_outcome(success(&definition.steps[0]));

        let progress = execution.progress();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.total, 2);
        assert!((progress.percent - 50.0).abs() < f64::EPSILON);
        assert_eq!(execution.execution_order, vec!["a"]);
        assert_eq!(execution.timeline.get_events().len(), 2);
    }

    #[test]
    fn test_failed_outcome_is_reported() {
        let definition = definition();
        let mut execution = WorkflowExecution::new(&definition, DataMap::new());
        let result = AgentResult::failure(AgentErrorKind::Processing, "boom", Utc::now());
        let error = WorkflowError::StepFailed {
            step_id: "a".to_string(),
            message: "boom".to_string(),
        };
        execution.record_outcome(StepOutcome::new(&definition.steps[0], result, Some(error), 0));

        assert_eq!(execution.failed_steps(), vec!["a"]);
        assert_eq!(execution.error_messages, vec!["Step 'a' failed: boom"]);
    }

    #[test]
    fn test_status_report_snapshot() {
        let mut execution = WorkflowExecution::new(&definition(), DataMap::new());
        execution.start().unwrap();
        execution.pause("a", "Step 'a' requires review").unwrap();

        let report = execution.status_report();
        assert_eq!(report.status, ExecutionStatus::Paused);
        assert_eq!(report.pause_reason.as_deref(), Some("Step 'a' requires review"));
        assert!(report.human_intervention_required);
        assert_eq!(report, execution.status_report());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_value(ExecutionStatus::Cancelled).unwrap(), json!("CANCELLED"));
        assert_eq!(ExecutionStatus::Paused.to_string(), "PAUSED");
    }

    #[test]
    fn test_execution_serialization_roundtrip() {
        let definition = definition();
        let mut execution = WorkflowExecution::new(&definition, DataMap::new());
        execution.start().unwrap();
        execution.record_outcome(success(&definition.steps[0]));

        let json = serde_json::to_string(&execution).unwrap();
        let back: WorkflowExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, execution);
    }

    #[test]
    fn test_progress_of_empty_workflow() {
        let progress = Progress::new(0, 0);
        assert_eq!(progress.percent, 100.0);
    }
}
