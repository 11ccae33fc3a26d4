//! Individual Step Execution
//!
//! Runs one workflow step through its agent:
//! - Per-invocation timeout (`tokio::time::timeout`)
//! - Orchestration-level retry with exponential backoff
//! - Conversion of every failure (error, timeout, panic) into a [`StepOutcome`]
//!
//! A step runner never touches the execution record; the scheduling loop
//! merges the returned outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use log::{debug, error, info, warn};

use crate::agent::base::{panic_message, Agent};
use crate::agent::context::{AgentContext, AgentErrorKind, AgentResult, DataMap};
use crate::error::WorkflowError;
use crate::workflow::model::WorkflowStep;
use crate::workflow::state::StepOutcome;

use super::retry::Backoff;

/// Engine-wide knobs applied to a step invocation.
#[derive(Debug, Clone)]
pub struct StepSettings {
    /// Orchestration-level retries allowed (0 unless `retry_on_failure`)
    pub max_retries: u32,
    /// Pacing between orchestration-level retries
    pub backoff: Backoff,
    /// Agent-local retry budget placed in the context
    pub agent_max_retries: u32,
    /// Environment tag placed in the context
    pub environment: String,
}

impl StepSettings {
    /// Settings for a step that is never retried.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO),
            agent_max_retries: 0,
            environment: crate::agent::context::DEFAULT_ENVIRONMENT.to_string(),
        }
    }
}

/// Everything needed to invoke one step, owned so it can move into a task.
pub struct StepInvocation {
    pub workflow_id: String,
    pub execution_id: String,
    pub step: WorkflowStep,
    pub agent: Arc<dyn Agent>,
    pub input: DataMap,
}

impl StepInvocation {
    fn context(&self, settings: &StepSettings) -> AgentContext {
        AgentContext::for_step(&self.workflow_id, &self.execution_id, &self.step.step_id)
            .with_timeout_secs(self.step.timeout_seconds)
            .with_max_retries(settings.agent_max_retries)
            .with_environment(settings.environment.clone())
    }
}

/// Executes a step, retrying retryable failures while the budget allows.
///
/// When at least one retry happened and the final error is still retryable,
/// it is reported as [`WorkflowError::StepExhaustedRetries`]. Other final
/// errors keep their own kind.
pub async fn run_step(invocation: StepInvocation, settings: &StepSettings) -> StepOutcome {
    let step_id = invocation.step.step_id.clone();
    let started_at = Utc::now();
    let mut retry_count = 0u32;
    let mut retried_at = Vec::new();

    info!(
        "Starting step '{}' (agent: {}, execution: {})",
        step_id, invocation.step.agent_type, invocation.execution_id
    );

    loop {
        let context = invocation.context(settings);
        let result = invoke(
            Arc::clone(&invocation.agent),
            invocation.input.clone(),
            context,
            invocation.step.timeout_seconds,
        )
        .await;

        let Some(err) = classify(&invocation.step, &result) else {
            info!(
                "Step '{}' completed successfully ({} retries)",
                step_id, retry_count
            );
            return StepOutcome::new(&invocation.step, result, None, retry_count)
                .with_span(started_at, Utc::now())
                .with_retried_at(retried_at);
        };

        if err.is_retryable() && retry_count < settings.max_retries {
            let delay = settings.backoff.delay(retry_count);
            warn!(
                "Step '{}' attempt {} failed: {}; retrying in {} ms",
                step_id,
                retry_count + 1,
                err,
                delay.as_millis()
            );
            settings.backoff.wait(retry_count).await;
            retry_count += 1;
            retried_at.push(Utc::now());
            continue;
        }

        let err = if retry_count > 0 && err.is_retryable() {
            WorkflowError::StepExhaustedRetries {
                step_id: step_id.clone(),
                attempts: retry_count + 1,
                last_error: err.to_string(),
            }
        } else {
            err
        };

        error!("Step '{}' failed: {}", step_id, err);
        return StepOutcome::new(&invocation.step, result, Some(err), retry_count)
            .with_span(started_at, Utc::now())
            .with_retried_at(retried_at);
    }
}

/// Builds the outcome of a step that was refused before invocation.
pub fn rejected_outcome(step: &WorkflowStep, error: WorkflowError) -> StepOutcome {
    let result = AgentResult::failure(AgentErrorKind::Validation, error.to_string(), Utc::now())
        .with_attempts(0);
    warn!("Step '{}' not invoked: {}", step.step_id, error);
    StepOutcome::new(step, result, Some(error), 0)
}

/// Runs the agent once under the step's time budget.
async fn invoke(
    agent: Arc<dyn Agent>,
    input: DataMap,
    context: AgentContext,
    timeout_secs: u64,
) -> AgentResult {
    let started_at = Utc::now();
    let call = AssertUnwindSafe(agent.execute(input, context)).catch_unwind();

    let outcome = if timeout_secs == 0 {
        Ok(call.await)
    } else {
        tokio::time::timeout(Duration::from_secs(timeout_secs), call).await
    };

    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let message = panic_message(panic);
            error!("Agent '{}' panicked outside its wrapper: {}", agent.agent_type(), message);
            AgentResult::failure(AgentErrorKind::Panicked, message, started_at)
        }
        Err(_) => {
            debug!("Agent '{}' exceeded {}s", agent.agent_type(), timeout_secs);
            AgentResult::failure(
                AgentErrorKind::Timeout,
                format!("timed out after {}s", timeout_secs),
                started_at,
            )
        }
    }
}

/// Maps a failed result onto the scheduler taxonomy.
fn classify(step: &WorkflowStep, result: &AgentResult) -> Option<WorkflowError> {
    if result.success {
        return None;
    }

    let step_id = step.step_id.clone();
    let message = result
        .error_message
        .clone()
        .unwrap_or_else(|| "agent reported failure without a message".to_string());

    Some(match result.error_kind {
        Some(AgentErrorKind::Validation) => WorkflowError::Validation { step_id, message },
        Some(AgentErrorKind::Timeout) => WorkflowError::StepTimeout {
            step_id,
            timeout_secs: step.timeout_seconds,
        },
        Some(AgentErrorKind::Processing) | Some(AgentErrorKind::Panicked) | None => {
            WorkflowError::StepFailed { step_id, message }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::base::{BaseAgent, ProcessError, Processor};
    use crate::agent::builtin::DelayProcessor;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then echoes its input.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Processor for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn process(&self, input: &DataMap, _context: &AgentContext) -> Result<DataMap, ProcessError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(format!("transient failure {}", call + 1).into());
            }
            Ok(input.clone())
        }
    }

    /// Fails processing once, then rejects its input on every later call.
    struct Degrading {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Processor for Degrading {
        fn name(&self) -> &str {
            "degrading"
        }

        fn validate(&self, _input: &DataMap) -> Result<(), String> {
            if self.calls.load(Ordering::SeqCst) > 0 {
                return Err("input went stale".to_string());
            }
            Ok(())
        }

        async fn process(&self, _input: &DataMap, _context: &AgentContext) -> Result<DataMap, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("transient".into())
        }
    }

    struct Panicky;

    #[async_trait]
    impl Agent for Panicky {
        fn agent_type(&self) -> &str {
            "panicky"
        }

        async fn execute(&self, _input: DataMap, _context: AgentContext) -> AgentResult {
            panic!("agent blew up")
        }
    }

    fn invocation(step: WorkflowStep, agent: Arc<dyn Agent>) -> StepInvocation {
        let mut input = DataMap::new();
        input.insert("text".to_string(), json!("hello"));
        StepInvocation {
            workflow_id: "wf".to_string(),
            execution_id: "exec-1".to_string(),
            step,
            agent,
            input,
        }
    }

    fn retrying(max_retries: u32) -> StepSettings {
        StepSettings {
            max_retries,
            ..StepSettings::no_retry()
        }
    }

    #[tokio::test]
    async fn test_successful_step() {
        let agent = Arc::new(BaseAgent::new(Flaky { failures: 0, calls: AtomicU32::new(0) }));
        let outcome = run_step(invocation(WorkflowStep::new("a", "flaky"), agent), &retrying(0)).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(outcome.result.data["text"], json!("hello"));
        assert_eq!(outcome.agent_type, "flaky");
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let agent = Arc::new(BaseAgent::new(Flaky { failures: 2, calls: AtomicU32::new(0) }));
        let step = WorkflowStep::new("a", "flaky").retry_on_failure();
        let outcome = run_step(invocation(step, agent.clone()), &retrying(3)).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(outcome.retried_at.len(), 2);
        assert_eq!(agent.processor().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let agent = Arc::new(BaseAgent::new(Flaky { failures: 10, calls: AtomicU32::new(0) }));
        let outcome = run_step(invocation(WorkflowStep::new("a", "flaky"), agent), &retrying(2)).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.retry_count, 2);
        match outcome.error {
            Some(WorkflowError::StepExhaustedRetries { attempts, last_error, .. }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("transient failure 3"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_without_retry_keeps_original_error() {
        let agent = Arc::new(BaseAgent::new(Flaky { failures: 1, calls: AtomicU32::new(0) }));
        let outcome = run_step(invocation(WorkflowStep::new("a", "flaky"), agent), &retrying(0)).await;

        assert!(matches!(outcome.error, Some(WorkflowError::StepFailed { .. })));
        assert_eq!(outcome.retry_count, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_recorded() {
        let agent = Arc::new(BaseAgent::new(DelayProcessor::new(Duration::from_secs(5))));
        let step = WorkflowStep::new("slow", "delay").with_timeout(1);
        let outcome = run_step(invocation(step, agent), &retrying(0)).await;

        assert_eq!(
            outcome.error,
            Some(WorkflowError::StepTimeout {
                step_id: "slow".to_string(),
                timeout_secs: 1
            })
        );
        assert_eq!(outcome.result.error_kind, Some(AgentErrorKind::Timeout));
        assert!(outcome.duration_ms < 5000);
    }

    #[tokio::test]
    async fn test_zero_timeout_disables_budget() {
        let agent = Arc::new(BaseAgent::new(DelayProcessor::new(Duration::from_millis(20))));
        let step = WorkflowStep::new("a", "delay").with_timeout(0);
        let outcome = run_step(invocation(step, agent), &retrying(0)).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_validation_failures_are_not_retried() {
        let agent = Arc::new(
            BaseAgent::new(Flaky { failures: 0, calls: AtomicU32::new(0) })
                .with_required_keys(vec!["absent".to_string()]),
        );
        let outcome = run_step(invocation(WorkflowStep::new("a", "flaky"), agent.clone()), &retrying(3)).await;

        assert!(matches!(outcome.error, Some(WorkflowError::Validation { .. })));
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(agent.processor().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_final_validation_failure_is_not_relabelled() {
        let agent = Arc::new(BaseAgent::new(Degrading { calls: AtomicU32::new(0) }));
        let step = WorkflowStep::new("a", "degrading").retry_on_failure();
        let outcome = run_step(invocation(step, agent), &retrying(3)).await;

        assert_eq!(outcome.retry_count, 1);
        match outcome.error {
            Some(WorkflowError::Validation { message, .. }) => assert!(message.contains("stale")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_agent_becomes_failure() {
        let outcome = run_step(invocation(WorkflowStep::new("p", "panicky"), Arc::new(Panicky)), &retrying(0)).await;

        assert_eq!(outcome.result.error_kind, Some(AgentErrorKind::Panicked));
        assert!(outcome.error_message().unwrap().contains("agent blew up"));
    }

    #[test]
    fn test_rejected_outcome() {
        let step = WorkflowStep::new("a", "echo");
        let outcome = rejected_outcome(
            &step,
            WorkflowError::Validation {
                step_id: "a".to_string(),
                message: "unresolved input".to_string(),
            },
        );
        assert!(!outcome.is_success());
        assert_eq!(outcome.result.attempts, 0);
    }
}
