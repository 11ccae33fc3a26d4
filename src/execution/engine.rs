//! Workflow Orchestration Engine
//!
//! The core engine that drives workflow executions:
//! - Graph validation before anything runs
//! - The dependency-driven scheduling loop
//! - Parallel group fan-out bounded by a semaphore, sequential steps in order
//! - Output promotion into the shared context
//! - Human review pauses, awaited inline or detached until [`Orchestrator::resume`]
//! - Cooperative cancellation and the status surface
//!
//! Each execution record sits behind a `std::sync::RwLock` that is never held
//! across an `.await`; the scheduling loop of a run is its only writer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::Semaphore;

use crate::agent::context::{DataMap, DEFAULT_ENVIRONMENT};
use crate::agent::registry::AgentRegistry;
use crate::error::{OrchestratorError, Result, WorkflowError};
use crate::workflow::model::{WorkflowDefinition, WorkflowStep};
use crate::workflow::parser::load_workflow;
use crate::workflow::planner::{ExecutionPlanner, ScheduleBatch};
use crate::workflow::state::{ExecutionStatus, StatusReport, StepOutcome, WorkflowExecution};
use crate::workflow::validator::{topological_order, validate_definition};

use super::mapping::{apply_output, resolve_input};
use super::retry::Backoff;
use super::review::{HumanReviewer, ReviewDecision, ReviewRequest};
use super::step::{rejected_outcome, run_step, StepInvocation, StepSettings};

/// Default orchestration-level retry budget.
pub const DEFAULT_MAX_STEP_RETRIES: u32 = 3;

/// Default base delay between orchestration-level retries.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on the orchestration-level retry delay.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default base delay between agent-local retries.
pub const DEFAULT_AGENT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent steps per parallel group
    pub max_parallel: usize,
    /// Retries for `retry_on_failure` steps without their own `max_retries`
    pub max_step_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Agent-local retries for agents without a configured `max_retries`
    pub agent_max_retries: u32,
    pub agent_retry_base_delay: Duration,
    /// Environment tag handed to agents
    pub environment: String,
    /// Treat unresolved input references as step validation failures
    pub strict_input_mapping: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: num_cpus::get(),
            max_step_retries: DEFAULT_MAX_STEP_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            agent_max_retries: 0,
            agent_retry_base_delay: DEFAULT_AGENT_RETRY_BASE_DELAY,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            strict_input_mapping: false,
        }
    }
}

/// How the loop proceeds after absorbing outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The execution reached a terminal status
    Finished,
    /// Paused with no reviewer installed; the caller gets control back
    Detached,
}

/// Registry entry of one execution.
struct RunHandle {
    definition: Arc<WorkflowDefinition>,
    execution: RwLock<WorkflowExecution>,
    cancel_requested: AtomicBool,
    /// Set while a paused run waits for [`Orchestrator::resume`]
    detached: AtomicBool,
}

impl RunHandle {
    fn read(&self) -> RwLockReadGuard<'_, WorkflowExecution> {
        self.execution.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, WorkflowExecution> {
        self.execution.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> WorkflowExecution {
        self.read().clone()
    }

    fn status_report(&self) -> StatusReport {
        self.read().status_report()
    }
}

/// Steps of a group, either ready to spawn or already settled.
enum Dispatch {
    Settled(StepOutcome),
    Spawned(WorkflowStep, tokio::task::JoinHandle<StepOutcome>),
}

/// Workflow orchestration engine.
///
/// Holds the agent registry, engine settings, an optional reviewer and every
/// execution it started. Share it behind an `Arc` to drive several
/// executions concurrently.
///
/// Execution records are kept after they finish so that `get_status` and
/// `execution` keep answering for them. Long-lived engines should call
/// [`Orchestrator::forget`] or [`Orchestrator::prune_finished`] to release
/// them.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use agentrunner::agent::{register_builtin_agents, AgentRegistry, DataMap};
/// use agentrunner::execution::Orchestrator;
/// use agentrunner::load_workflow;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut registry = AgentRegistry::new();
///     register_builtin_agents(&mut registry);
///
///     let mut engine = Orchestrator::new(Arc::new(registry));
///     engine.set_max_parallel(4);
///
///     let definition = load_workflow("review.yaml")?;
///     let execution = engine.run(definition, DataMap::new()).await?;
///     println!("{}", execution.status);
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    config: EngineConfig,
    reviewer: Option<Arc<dyn HumanReviewer>>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl Orchestrator {
    /// Creates an engine with default settings and no reviewer.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            config: EngineConfig::default(),
            reviewer: None,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn HumanReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Sets the maximum number of concurrent steps in a parallel group.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.config.max_parallel = max.max(1);
    }

    /// Sets the default orchestration-level retry budget.
    pub fn set_max_step_retries(&mut self, retries: u32) {
        self.config.max_step_retries = retries;
    }

    /// Sets the orchestration-level backoff.
    pub fn set_retry_delays(&mut self, base: Duration, max: Duration) {
        self.config.retry_base_delay = base;
        self.config.retry_max_delay = max;
    }

    /// Sets the default agent-local retry budget and backoff base.
    pub fn set_agent_retries(&mut self, retries: u32, base_delay: Duration) {
        self.config.agent_max_retries = retries;
        self.config.agent_retry_base_delay = base_delay;
    }

    pub fn set_environment(&mut self, environment: impl Into<String>) {
        self.config.environment = environment.into();
    }

    pub fn set_strict_input_mapping(&mut self, strict: bool) {
        self.config.strict_input_mapping = strict;
    }

    /// Installs the reviewer consulted on review pauses.
    pub fn set_reviewer(&mut self, reviewer: Arc<dyn HumanReviewer>) {
        self.reviewer = Some(reviewer);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Validates `definition` and returns its scheduling iterations.
    ///
    /// Nothing is executed; used for dry runs.
    pub fn plan(&self, definition: &WorkflowDefinition) -> Result<Vec<ScheduleBatch>> {
        validate_definition(definition, Some(self.registry.as_ref()))?;
        ExecutionPlanner::preview(Arc::new(definition.clone())).map_err(|remaining| {
            OrchestratorError::InvalidDefinition(
                WorkflowError::CircularDependency { remaining }.to_string(),
            )
        })
    }

    /// Loads a workflow file and runs it.
    pub async fn run_file(&self, path: impl AsRef<Path>, parameters: DataMap) -> Result<WorkflowExecution> {
        let definition = load_workflow(path)?;
        self.run(definition, parameters).await
    }

    /// Executes a workflow.
    ///
    /// Structural problems are returned as errors and no execution is
    /// created. Everything that happens once the run starts (step failures,
    /// cycles, cancellation, pauses) is reported through the returned
    /// execution record.
    pub async fn run(&self, definition: WorkflowDefinition, parameters: DataMap) -> Result<WorkflowExecution> {
        validate_definition(&definition, Some(self.registry.as_ref()))?;

        let definition = Arc::new(definition);
        let execution = WorkflowExecution::new(&definition, parameters);
        let execution_id = execution.execution_id.clone();

        let handle = Arc::new(RunHandle {
            definition: Arc::clone(&definition),
            execution: RwLock::new(execution),
            cancel_requested: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        });
        self.runs_mut().insert(execution_id.clone(), Arc::clone(&handle));

        info!(
            "Starting execution '{}' of workflow '{}' ({} steps, max parallel: {})",
            execution_id,
            definition.workflow_id,
            definition.len(),
            self.config.max_parallel
        );

        let cycle = topological_order(&definition).err();
        {
            let mut execution = handle.write();
            execution.start()?;
            if let Some(remaining) = cycle {
                error!(
                    "Execution '{}': circular dependency between {:?}",
                    execution_id, remaining
                );
                execution.fail(WorkflowError::CircularDependency { remaining })?;
            }
        }
        let failed_early = handle.read().is_terminal();
        if failed_early {
            return Ok(handle.snapshot());
        }

        self.drive(&handle).await
    }

    /// Continues a detached PAUSED execution with a reviewer's decision.
    pub async fn resume(&self, execution_id: &str, decision: ReviewDecision) -> Result<WorkflowExecution> {
        let handle = self.lookup(execution_id)?;

        let status = handle.read().status;
        if status != ExecutionStatus::Paused
            || !handle.detached.swap(false, Ordering::SeqCst)
        {
            return Err(OrchestratorError::InvalidState {
                execution_id: execution_id.to_string(),
                status: status.to_string(),
                expected: "detached PAUSED".to_string(),
            });
        }

        info!(
            "Resuming execution '{}' ({})",
            execution_id,
            if decision.approved { "approved" } else { "rejected" }
        );

        if !self.apply_decision(&handle, decision)? {
            return Ok(handle.snapshot());
        }
        self.drive(&handle).await
    }

    /// Requests cancellation.
    ///
    /// A paused run is cancelled immediately; a running one stops at the
    /// next scheduling point while in-flight steps finish. Returns false for
    /// unknown or already terminal executions.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let Ok(handle) = self.lookup(execution_id) else {
            return false;
        };

        let mut execution = handle.write();
        if execution.is_terminal() {
            return false;
        }

        if execution.status == ExecutionStatus::Paused {
            handle.detached.store(false, Ordering::SeqCst);
            info!("Cancelling paused execution '{}'", execution_id);
            return execution.cancel(WorkflowError::WorkflowCancelled).is_ok();
        }

        info!("Cancellation requested for execution '{}'", execution_id);
        handle.cancel_requested.store(true, Ordering::SeqCst);
        true
    }

    /// Status snapshot of an execution.
    pub fn get_status(&self, execution_id: &str) -> Option<StatusReport> {
        self.lookup(execution_id).ok().map(|h| h.status_report())
    }

    /// Full snapshot of an execution.
    pub fn execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.lookup(execution_id).ok().map(|h| h.snapshot())
    }

    /// Known execution IDs, sorted.
    pub fn executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Discards a terminal execution record.
    pub fn forget(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let handle = self.lookup(execution_id)?;
        let snapshot = handle.snapshot();
        if !snapshot.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                execution_id: execution_id.to_string(),
                status: snapshot.status.to_string(),
                expected: "a terminal status".to_string(),
            });
        }
        self.runs_mut().remove(execution_id);
        Ok(snapshot)
    }

    /// Discards every terminal execution record and returns how many went.
    ///
    /// Running and paused executions are kept.
    pub fn prune_finished(&self) -> usize {
        let mut runs = self.runs_mut();
        let before = runs.len();
        runs.retain(|_, handle| !handle.read().is_terminal());
        let pruned = before - runs.len();
        if pruned > 0 {
            info!("Pruned {} finished execution(s)", pruned);
        }
        pruned
    }

    fn runs(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<RunHandle>>> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn runs_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<RunHandle>>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, execution_id: &str) -> Result<Arc<RunHandle>> {
        self.runs()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownExecution(execution_id.to_string()))
    }

    /// Main scheduling loop.
    async fn drive(&self, handle: &Arc<RunHandle>) -> Result<WorkflowExecution> {
        let definition = Arc::clone(&handle.definition);

        // Reviews left over from the group that paused a resumed run
        let flow = self.process_reviews(handle).await?;
        if flow != Flow::Continue {
            return self.finish(handle, flow);
        }

        let mut planner = ExecutionPlanner::from_execution(Arc::clone(&definition), &handle.read());

        loop {
            if self.observe_cancel(handle)? {
                return self.finish(handle, Flow::Finished);
            }

            if !planner.has_work_remaining() {
                handle.write().complete()?;
                return self.finish(handle, Flow::Finished);
            }

            let batch = planner.next_batch();
            if batch.is_empty() {
                let remaining = planner.remaining_steps();
                error!("No step is ready; stuck steps: {:?}", remaining);
                handle
                    .write()
                    .fail(WorkflowError::CircularDependency { remaining })?;
                return self.finish(handle, Flow::Finished);
            }

            for group in &batch.parallel_groups {
                if self.observe_cancel(handle)? {
                    return self.finish(handle, Flow::Finished);
                }
                let outcomes = self.run_group(handle, group).await;
                let flow = self.absorb(handle, &mut planner, group, outcomes).await?;
                if flow != Flow::Continue {
                    return self.finish(handle, flow);
                }
            }

            for step in &batch.sequential {
                if self.observe_cancel(handle)? {
                    return self.finish(handle, Flow::Finished);
                }
                let outcome = self.run_sequential(handle, step).await;
                let flow = self
                    .absorb(handle, &mut planner, std::slice::from_ref(step), vec![outcome])
                    .await?;
                if flow != Flow::Continue {
                    return self.finish(handle, flow);
                }
            }
        }
    }

    fn finish(&self, handle: &RunHandle, flow: Flow) -> Result<WorkflowExecution> {
        if flow == Flow::Detached {
            handle.detached.store(true, Ordering::SeqCst);
        }

        let snapshot = handle.snapshot();
        let progress = snapshot.progress();
        match snapshot.status {
            ExecutionStatus::Completed => info!(
                "Execution '{}' completed ({} steps, {} failed)",
                snapshot.execution_id,
                progress.completed,
                snapshot.failed_steps().len()
            ),
            ExecutionStatus::Paused => info!(
                "Execution '{}' paused: {}",
                snapshot.execution_id,
                snapshot.pause_reason.as_deref().unwrap_or("review required")
            ),
            status => warn!(
                "Execution '{}' ended as {} after {}/{} steps",
                snapshot.execution_id, status, progress.completed, progress.total
            ),
        }
        Ok(snapshot)
    }

    /// Turns a pending cancellation request into a CANCELLED execution.
    fn observe_cancel(&self, handle: &RunHandle) -> Result<bool> {
        if !handle.cancel_requested.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut execution = handle.write();
        if !execution.is_terminal() {
            execution.cancel(WorkflowError::WorkflowCancelled)?;
        }
        Ok(true)
    }

    /// Builds the invocation of `step`, or the outcome of a step that cannot run.
    fn prepare(
        &self,
        handle: &RunHandle,
        step: &WorkflowStep,
    ) -> std::result::Result<(StepInvocation, StepSettings), StepOutcome> {
        let (resolved, workflow_id, execution_id) = {
            let execution = handle.read();
            let resolved = resolve_input(
                &handle.definition,
                step,
                &execution.global_context,
                &execution.step_results,
            );
            (resolved, execution.workflow_id.clone(), execution.execution_id.clone())
        };

        if self.config.strict_input_mapping && !resolved.is_complete() {
            return Err(rejected_outcome(
                step,
                WorkflowError::Validation {
                    step_id: step.step_id.clone(),
                    message: format!(
                        "unresolved input references: {}",
                        resolved.unresolved.join(", ")
                    ),
                },
            ));
        }

        let mut agent_config = step.agent_config.clone();
        agent_config
            .retry_base_delay_ms
            .get_or_insert(self.config.agent_retry_base_delay.as_millis() as u64);

        let agent = match self.registry.create(&step.agent_type, &agent_config) {
            Ok(agent) => agent,
            Err(OrchestratorError::UnknownAgentType(agent_type)) => {
                return Err(rejected_outcome(
                    step,
                    WorkflowError::UnknownAgentType {
                        step_id: step.step_id.clone(),
                        agent_type,
                    },
                ))
            }
            Err(e) => {
                return Err(rejected_outcome(
                    step,
                    WorkflowError::Validation {
                        step_id: step.step_id.clone(),
                        message: e.to_string(),
                    },
                ))
            }
        };

        let settings = StepSettings {
            max_retries: if step.retry_on_failure {
                step.max_retries.unwrap_or(self.config.max_step_retries)
            } else {
                0
            },
            backoff: Backoff::new(self.config.retry_base_delay, self.config.retry_max_delay),
            agent_max_retries: agent_config.max_retries.unwrap_or(self.config.agent_max_retries),
            environment: self.config.environment.clone(),
        };

        let invocation = StepInvocation {
            workflow_id,
            execution_id,
            step: step.clone(),
            agent,
            input: resolved.input,
        };
        Ok((invocation, settings))
    }

    async fn run_sequential(&self, handle: &RunHandle, step: &WorkflowStep) -> StepOutcome {
        handle.write().current_step = Some(step.step_id.clone());
        match self.prepare(handle, step) {
            Ok((invocation, settings)) => run_step(invocation, &settings).await,
            Err(outcome) => outcome,
        }
    }

    /// Fans a parallel group out as tasks and waits for every member.
    async fn run_group(&self, handle: &RunHandle, group: &[WorkflowStep]) -> Vec<StepOutcome> {
        let ids: Vec<&str> = group.iter().map(|s| s.step_id.as_str()).collect();
        info!("Running parallel group: {}", ids.join(", "));
        handle.write().current_step = Some(ids.join(", "));

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut dispatched = Vec::with_capacity(group.len());

        for step in group {
            match self.prepare(handle, step) {
                Err(outcome) => dispatched.push(Dispatch::Settled(outcome)),
                Ok((invocation, settings)) => {
                    let semaphore = Arc::clone(&semaphore);
                    let task = tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        run_step(invocation, &settings).await
                    });
                    dispatched.push(Dispatch::Spawned(step.clone(), task));
                }
            }
        }

        let mut outcomes = Vec::with_capacity(dispatched.len());
        for entry in dispatched {
            let outcome = match entry {
                Dispatch::Settled(outcome) => outcome,
                Dispatch::Spawned(step, task) => match task.await {
                    Ok(outcome) => outcome,
                    Err(join_error) => {
                        error!("Task of step '{}' aborted: {}", step.step_id, join_error);
                        rejected_outcome(
                            &step,
                            WorkflowError::StepFailed {
                                step_id: step.step_id.clone(),
                                message: format!("task aborted: {}", join_error),
                            },
                        )
                    }
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Merges finished steps into the execution and handles review pauses.
    async fn absorb(
        &self,
        handle: &RunHandle,
        planner: &mut ExecutionPlanner,
        steps: &[WorkflowStep],
        outcomes: Vec<StepOutcome>,
    ) -> Result<Flow> {
        let definition = &handle.definition;
        {
            let mut execution = handle.write();
            let mut hard_failure = None;
            let mut reviews = Vec::new();

            for (step, outcome) in steps.iter().zip(outcomes) {
                apply_output(step, &outcome, &mut execution.global_context);

                if let Some(err) = &outcome.error {
                    let fatal = !step.retry_on_failure && !definition.error_handling.continue_on_failure;
                    if fatal && hard_failure.is_none() {
                        hard_failure = Some(err.clone());
                    }
                }

                if definition.review_required_after(step) {
                    reviews.push(step.step_id.clone());
                }
                planner.mark_executed(&step.step_id);
                execution.record_outcome(outcome);
            }

            if let Some(err) = hard_failure {
                error!("Workflow failed: {}", err);
                execution.fail(err)?;
                return Ok(Flow::Finished);
            }

            execution.current_step = None;
            execution.pending_reviews = reviews;
        }

        self.process_reviews(handle).await
    }

    /// Works through `pending_reviews` one step at a time.
    async fn process_reviews(&self, handle: &RunHandle) -> Result<Flow> {
        loop {
            if self.observe_cancel(handle)? {
                return Ok(Flow::Finished);
            }

            let request = {
                let mut execution = handle.write();
                let Some(step_id) = execution.pending_reviews.first().cloned() else {
                    return Ok(Flow::Continue);
                };
                let (Some(step), Some(outcome)) = (
                    handle.definition.get_step(&step_id).cloned(),
                    execution.step_results.get(&step_id).cloned(),
                ) else {
                    execution.pending_reviews.remove(0);
                    continue;
                };

                let reason = format!("Step '{}' requires human review", step_id);
                execution.pause(&step_id, reason.clone())?;
                ReviewRequest::new(execution.clone(), step, outcome, reason)
            };

            let Some(reviewer) = &self.reviewer else {
                return Ok(Flow::Detached);
            };

            let decision = reviewer.review(request).await;
            if !self.apply_decision(handle, decision)? {
                return Ok(Flow::Finished);
            }
        }
    }

    /// Applies a decision to the step at the head of `pending_reviews`.
    ///
    /// Returns true if the run may continue.
    fn apply_decision(&self, handle: &RunHandle, decision: ReviewDecision) -> Result<bool> {
        let mut execution = handle.write();

        // Cancelled while the reviewer was thinking
        if execution.is_terminal() {
            return Ok(false);
        }

        let step_id = if execution.pending_reviews.is_empty() {
            execution.current_step.clone().unwrap_or_default()
        } else {
            execution.pending_reviews.remove(0)
        };

        if decision.approved {
            info!("Review of step '{}' approved", step_id);
            execution.resume()?;
            Ok(true)
        } else {
            warn!(
                "Review of step '{}' rejected{}",
                step_id,
                decision
                    .comment
                    .as_ref()
                    .map(|c| format!(": {}", c))
                    .unwrap_or_default()
            );
            execution.cancel(WorkflowError::HumanRejected {
                step_id,
                comment: decision.comment,
            })?;
            Ok(false)
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("reviewer", &self.reviewer.is_some())
            .field("executions", &self.executions().len())
            .finish()
    }
}
