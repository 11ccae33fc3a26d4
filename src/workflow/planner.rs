//! Execution Planner
//!
//! Manages workflow scheduling decisions:
//! - Dependency tracking (which steps have been executed)
//! - Ready-set computation in declaration order
//! - Partitioning into parallel groups and sequential steps
//! - Execution level previews for dry runs
//!
//! A step counts as executed once it has an outcome, successful or not, so
//! failed steps still unblock their dependents.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;

use super::model::{WorkflowDefinition, WorkflowStep};
use super::state::WorkflowExecution;

/// Steps selected by one scheduling iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleBatch {
    /// Parallel-eligible steps grouped by dependency signature,
    /// groups ordered by first appearance
    pub parallel_groups: Vec<Vec<WorkflowStep>>,
    /// Remaining ready steps, in declaration order
    pub sequential: Vec<WorkflowStep>,
}

impl ScheduleBatch {
    /// Returns true if nothing is ready.
    pub fn is_empty(&self) -> bool {
        self.parallel_groups.is_empty() && self.sequential.is_empty()
    }

    /// Number of steps in the batch.
    pub fn len(&self) -> usize {
        self.parallel_groups.iter().map(Vec::len).sum::<usize>() + self.sequential.len()
    }

    /// Step IDs in dispatch order: parallel groups first, then sequential.
    pub fn step_ids(&self) -> Vec<String> {
        self.parallel_groups
            .iter()
            .flatten()
            .chain(self.sequential.iter())
            .map(|s| s.step_id.clone())
            .collect()
    }
}

/// Tracks executed steps and selects what may run next.
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    /// The definition being executed
    definition: Arc<WorkflowDefinition>,
    /// Steps that have an outcome
    executed: HashSet<String>,
}

impl ExecutionPlanner {
    /// Creates a planner with nothing executed yet.
    pub fn new(definition: Arc<WorkflowDefinition>) -> Self {
        Self {
            definition,
            executed: HashSet::new(),
        }
    }

    /// Creates a planner that continues an existing execution.
    ///
    /// Every step with a recorded outcome counts as executed.
    pub fn from_execution(definition: Arc<WorkflowDefinition>, execution: &WorkflowExecution) -> Self {
        let mut planner = Self::new(definition);
        for step in &planner.definition.steps {
            if execution.step_results.contains_key(&step.step_id) {
                planner.executed.insert(step.step_id.clone());
            }
        }
        debug!(
            "Planner restored for execution '{}': {} steps already executed",
            execution.execution_id,
            planner.executed.len()
        );
        planner
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Returns steps that are ready to execute, in declaration order.
    ///
    /// A step is ready if it has not been executed and every step it
    /// depends on has.
    pub fn ready_steps(&self) -> Vec<&WorkflowStep> {
        self.definition
            .steps
            .iter()
            .filter(|step| !self.executed.contains(&step.step_id))
            .filter(|step| step.depends_on.iter().all(|dep| self.executed.contains(dep)))
            .collect()
    }

    /// Partitions the ready set into parallel groups and sequential steps.
    pub fn next_batch(&self) -> ScheduleBatch {
        let mut batch = ScheduleBatch::default();
        let mut signatures: Vec<Vec<String>> = Vec::new();

        for step in self.ready_steps() {
            if !step.parallel {
                batch.sequential.push(step.clone());
                continue;
            }

            let signature = step.dependency_signature();
            match signatures.iter().position(|s| *s == signature) {
                Some(index) => batch.parallel_groups[index].push(step.clone()),
                None => {
                    signatures.push(signature);
                    batch.parallel_groups.push(vec![step.clone()]);
                }
            }
        }

        debug!(
            "Next batch: {} parallel groups, {} sequential steps",
            batch.parallel_groups.len(),
            batch.sequential.len()
        );
        batch
    }

    /// Marks a step as executed.
    pub fn mark_executed(&mut self, step_id: &str) {
        self.executed.insert(step_id.to_string());
    }

    pub fn is_executed(&self, step_id: &str) -> bool {
        self.executed.contains(step_id)
    }

    /// Returns true if there are more steps to execute.
    pub fn has_work_remaining(&self) -> bool {
        self.executed.len() < self.definition.steps.len()
    }

    /// Unexecuted step IDs, in declaration order.
    pub fn remaining_steps(&self) -> Vec<String> {
        self.definition
            .steps
            .iter()
            .filter(|s| !self.executed.contains(&s.step_id))
            .map(|s| s.step_id.clone())
            .collect()
    }

    /// Returns the current progress as (executed, total).
    pub fn progress(&self) -> (usize, usize) {
        (self.executed.len(), self.definition.steps.len())
    }

    /// Simulates a full run where every step succeeds.
    ///
    /// Returns the batch of every scheduling iteration, or the stuck steps
    /// when the graph contains a cycle.
    pub fn preview(definition: Arc<WorkflowDefinition>) -> Result<Vec<ScheduleBatch>, Vec<String>> {
        let mut planner = Self::new(definition);
        let mut batches = Vec::new();

        while planner.has_work_remaining() {
            let batch = planner.next_batch();
            if batch.is_empty() {
                return Err(planner.remaining_steps());
            }
            for id in batch.step_ids() {
                planner.mark_executed(&id);
            }
            batches.push(batch);
        }

        Ok(batches)
    }

    /// Step IDs per scheduling iteration, for display.
    pub fn execution_levels(definition: Arc<WorkflowDefinition>) -> Result<Vec<Vec<String>>, Vec<String>> {
        Ok(Self::preview(definition)?
            .iter()
            .map(ScheduleBatch::step_ids)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::AgentResult;
    use crate::workflow::state::StepOutcome;

    fn fan_out_definition() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition::from_steps(
            "wf",
            vec![
                WorkflowStep::new("extract", "echo"),
                WorkflowStep::new("keywords", "echo").depends_on("extract").parallel(),
                WorkflowStep::new("mood", "echo").depends_on("extract").parallel(),
                WorkflowStep::new("audit", "echo").depends_on("extract"),
                WorkflowStep::new("report", "echo")
                    .depends_on("keywords")
                    .depends_on("mood")
                    .depends_on("audit"),
            ],
        ))
    }

    #[test]
    fn test_planner_creation() {
        let planner = ExecutionPlanner::new(fan_out_definition());
        assert_eq!(planner.progress(), (0, 5));
        assert!(planner.has_work_remaining());
    }

    #[test]
    fn test_planner_ready_steps() {
        let planner = ExecutionPlanner::new(fan_out_definition());

        let ready = planner.ready_steps();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].step_id, "extract");
    }

    #[test]
    fn test_planner_partitions_batch() {
        let mut planner = ExecutionPlanner::new(fan_out_definition());
        planner.mark_executed("extract");

        let batch = planner.next_batch();
        assert_eq!(batch.parallel_groups.len(), 1);
        let group: Vec<_> = batch.parallel_groups[0].iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(group, vec!["keywords", "mood"]);
        assert_eq!(batch.sequential.len(), 1);
        assert_eq!(batch.sequential[0].step_id, "audit");
        assert_eq!(batch.step_ids(), vec!["keywords", "mood", "audit"]);
    }

    #[test]
    fn test_planner_groups_by_dependency_signature() {
        let definition = Arc::new(WorkflowDefinition::from_steps(
            "wf",
            vec![
                WorkflowStep::new("a", "echo"),
                WorkflowStep::new("b", "echo"),
                WorkflowStep::new("p", "echo").depends_on("a").parallel(),
                WorkflowStep::new("q", "echo").depends_on("b").parallel(),
                WorkflowStep::new("r", "echo").depends_on("a").parallel(),
            ],
        ));
        let mut planner = ExecutionPlanner::new(definition);
        planner.mark_executed("a");
        planner.mark_executed("b");

        let batch = planner.next_batch();
        assert_eq!(batch.parallel_groups.len(), 2);
        assert_eq!(batch.parallel_groups[0].len(), 2);
        assert_eq!(batch.parallel_groups[0][1].step_id, "r");
        assert_eq!(batch.parallel_groups[1][0].step_id, "q");
    }

    #[test]
    fn test_planner_has_work_remaining() {
        let mut planner = ExecutionPlanner::new(fan_out_definition());
        for id in ["extract", "keywords", "mood", "audit"] {
            planner.mark_executed(id);
            assert!(planner.has_work_remaining());
        }
        assert_eq!(planner.remaining_steps(), vec!["report"]);

        planner.mark_executed("report");
        assert!(!planner.has_work_remaining());
        assert_eq!(planner.progress(), (5, 5));
    }

    #[test]
    fn test_planner_from_execution() {
        let definition = fan_out_definition();
        let mut execution = WorkflowExecution::new(&definition, Default::default());
        let step = definition.get_step("extract").unwrap();
        let result = AgentResult::success(Default::default(), chrono::Utc::now());
        execution.record_outcome(StepOutcome::new(step, result, None, 0));

        let planner = ExecutionPlanner::from_execution(definition, &execution);
        assert_eq!(planner.progress(), (1, 5));
        assert!(planner.is_executed("extract"));
        assert_eq!(planner.ready_steps().len(), 3);
    }

    #[test]
    fn test_preview_levels() {
        let levels = ExecutionPlanner::execution_levels(fan_out_definition()).unwrap();
        assert_eq!(
            levels,
            vec![
                vec!["extract".to_string()],
                vec!["keywords".to_string(), "mood".to_string(), "audit".to_string()],
                vec!["report".to_string()],
            ]
        );
    }

    #[test]
    fn test_preview_detects_cycle() {
        let definition = Arc::new(WorkflowDefinition::from_steps(
            "wf",
            vec![
                WorkflowStep::new("root", "echo"),
                WorkflowStep::new("a", "echo").depends_on("b"),
                WorkflowStep::new("b", "echo").depends_on("a"),
            ],
        ));
        assert_eq!(
            ExecutionPlanner::preview(definition).unwrap_err(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_empty_batch() {
        let batch = ScheduleBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }
}
