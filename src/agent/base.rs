//! Agent Contract
//!
//! [`Agent`] is the single capability the scheduler knows about.
//! [`BaseAgent`] adapts any [`Processor`] to it and adds:
//! - Input validation (required keys, processor checks)
//! - Start/success/failure log lines
//! - Metric accumulation
//! - Agent-local retry with exponential backoff
//! - Conversion of every error and panic into a failed [`AgentResult`]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use log::{debug, error, info, warn};

use super::context::{AgentContext, AgentErrorKind, AgentMetrics, AgentResult, DataMap};
use crate::execution::retry::Backoff;
use crate::workflow::model::AgentConfig;

/// Error type processors may return.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// Default base delay between agent-local retries.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Cap on the agent-local retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Uniform capability contract consumed by the orchestrator.
///
/// Implementations must not panic or return early through errors: every
/// outcome, including failure, is an [`AgentResult`].
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry tag of this agent.
    fn agent_type(&self) -> &str;

    /// Runs the agent once for `input`.
    async fn execute(&self, input: DataMap, context: AgentContext) -> AgentResult;

    /// Snapshot of the agent's counters.
    fn metrics(&self) -> AgentMetrics {
        AgentMetrics::default()
    }
}

/// The work an agent actually performs.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Name used in log lines and as agent type.
    fn name(&self) -> &str;

    /// Keys that must be present (and non-null) in the input.
    fn required_keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// Additional input checks.
    fn validate(&self, _input: &DataMap) -> Result<(), String> {
        Ok(())
    }

    /// Number of records a successful call handled.
    fn records_processed(&self, _input: &DataMap, _output: &DataMap) -> u64 {
        1
    }

    async fn process(&self, input: &DataMap, context: &AgentContext) -> Result<DataMap, ProcessError>;
}

/// Wraps a [`Processor`] into an [`Agent`].
pub struct BaseAgent<P> {
    processor: P,
    extra_required_keys: Vec<String>,
    backoff: Backoff,
    metrics: Mutex<AgentMetrics>,
}

impl<P: Processor> BaseAgent<P> {
    /// Creates an agent with default retry pacing.
    pub fn new(processor: P) -> Self {
        Self {
            processor,
            extra_required_keys: Vec::new(),
            backoff: Backoff::new(DEFAULT_RETRY_BASE_DELAY, MAX_RETRY_DELAY),
            metrics: Mutex::new(AgentMetrics::default()),
        }
    }

    /// Creates an agent honouring the typed options of a step's config.
    pub fn from_config(processor: P, config: &AgentConfig) -> Self {
        let mut agent = Self::new(processor).with_required_keys(config.required_keys.clone());
        if let Some(delay_ms) = config.retry_base_delay_ms {
            agent = agent.with_retry_base_delay(Duration::from_millis(delay_ms));
        }
        agent
    }

    /// Adds keys the input must carry on top of the processor's own.
    pub fn with_required_keys(mut self, keys: Vec<String>) -> Self {
        self.extra_required_keys = keys;
        self
    }

    pub fn with_retry_base_delay(mut self, base: Duration) -> Self {
        self.backoff = Backoff::new(base, MAX_RETRY_DELAY);
        self
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    fn validate_input(&self, input: &DataMap) -> Result<(), String> {
        let missing: Vec<String> = self
            .processor
            .required_keys()
            .into_iter()
            .chain(self.extra_required_keys.iter().cloned())
            .filter(|key| input.get(key).map_or(true, |v| v.is_null()))
            .collect();

        if !missing.is_empty() {
            return Err(format!("missing required input keys: {}", missing.join(", ")));
        }

        self.processor.validate(input)
    }

    fn record(&self, elapsed: Duration, success: bool, records: u64) -> AgentMetrics {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        metrics.record(elapsed, success, records);
        metrics.clone()
    }
}

#[async_trait]
impl<P: Processor> Agent for BaseAgent<P> {
    fn agent_type(&self) -> &str {
        self.processor.name()
    }

    async fn execute(&self, input: DataMap, mut context: AgentContext) -> AgentResult {
        let name = self.processor.name();
        let step = context.step_id.clone().unwrap_or_else(|| "-".to_string());
        let started_at = Utc::now();
        let timer = Instant::now();

        info!(
            "agent={} step={} correlation_id={} event=started keys={}",
            name,
            step,
            context.correlation_id,
            input.len()
        );

        if let Err(message) = self.validate_input(&input) {
            warn!(
                "agent={} step={} correlation_id={} event=invalid_input error=\"{}\"",
                name, step, context.correlation_id, message
            );
            let metrics = self.record(timer.elapsed(), false, 0);
            return AgentResult::failure(AgentErrorKind::Validation, message, started_at)
                .with_metrics(metrics)
                .with_attempts(0);
        }

        loop {
            let attempt = context.retry_count + 1;
            let outcome = AssertUnwindSafe(self.processor.process(&input, &context))
                .catch_unwind()
                .await;

            let (kind, message) = match outcome {
                Ok(Ok(data)) => {
                    let records = self.processor.records_processed(&input, &data);
                    let elapsed = timer.elapsed();
                    let metrics = self.record(elapsed, true, records);
                    info!(
                        "agent={} step={} correlation_id={} event=succeeded attempts={} elapsed_ms={}",
                        name,
                        step,
                        context.correlation_id,
                        attempt,
                        elapsed.as_millis()
                    );
                    return AgentResult::success(data, started_at)
                        .with_metrics(metrics)
                        .with_attempts(attempt);
                }
                Ok(Err(err)) => (AgentErrorKind::Processing, err.to_string()),
                Err(panic) => (AgentErrorKind::Panicked, panic_message(panic)),
            };

            if !context.can_retry() {
                let elapsed = timer.elapsed();
                let metrics = self.record(elapsed, false, 0);
                error!(
                    "agent={} step={} correlation_id={} event=failed attempts={} elapsed_ms={} error=\"{}\"",
                    name,
                    step,
                    context.correlation_id,
                    attempt,
                    elapsed.as_millis(),
                    message
                );
                return AgentResult::failure(kind, message, started_at)
                    .with_metrics(metrics)
                    .with_attempts(attempt);
            }

            let delay = self.backoff.delay(context.retry_count);
            warn!(
                "agent={} step={} correlation_id={} event=retrying attempt={} delay_ms={} error=\"{}\"",
                name,
                step,
                context.correlation_id,
                attempt,
                delay.as_millis(),
                message
            );
            self.backoff.wait(context.retry_count).await;
            context.retry_count += 1;
        }
    }

    fn metrics(&self) -> AgentMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    debug!("captured panic: {}", detail);
    format!("agent panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Flaky {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl Processor for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn required_keys(&self) -> Vec<String> {
            vec!["text".to_string()]
        }

        async fn process(&self, input: &DataMap, _ctx: &AgentContext) -> Result<DataMap, ProcessError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(format!("transient failure #{}", call + 1).into());
            }
            let mut out = DataMap::new();
            out.insert("echo".to_string(), input["text"].clone());
            Ok(out)
        }
    }

    struct Panicky;

    #[async_trait]
    impl Processor for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn process(&self, _input: &DataMap, _ctx: &AgentContext) -> Result<DataMap, ProcessError> {
            panic!("boom");
        }
    }

    fn input(text: &str) -> DataMap {
        let mut map = DataMap::new();
        map.insert("text".to_string(), json!(text));
        map
    }

    fn flaky(failures: u32) -> BaseAgent<Flaky> {
        BaseAgent::new(Flaky {
            calls: AtomicU32::new(0),
            failures,
        })
        .with_retry_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_missing_required_key_is_validation_failure() {
        let agent = flaky(0);
        let result = agent.execute(DataMap::new(), AgentContext::new()).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(AgentErrorKind::Validation));
        assert!(result.error_message.unwrap().contains("text"));
        assert_eq!(agent.processor().calls.load(Ordering::SeqCst), 0);
        assert_eq!(agent.metrics().error_count, 1);
    }

    #[tokio::test]
    async fn test_null_required_key_is_rejected() {
        let agent = flaky(0);
        let mut map = DataMap::new();
        map.insert("text".to_string(), serde_json::Value::Null);

        let result = agent.execute(map, AgentContext::new()).await;
        assert_eq!(result.error_kind, Some(AgentErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_config_required_keys_are_enforced() {
        let config = AgentConfig {
            required_keys: vec!["lang".to_string()],
            ..AgentConfig::default()
        };
        let agent = BaseAgent::from_config(
            Flaky {
                calls: AtomicU32::new(0),
                failures: 0,
            },
            &config,
        );

        let result = agent.execute(input("hi"), AgentContext::new()).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("lang"));
    }

    #[tokio::test]
    async fn test_retries_until_success_within_budget() {
        let agent = flaky(2);
        let result = agent
            .execute(input("hello"), AgentContext::new().with_max_retries(3))
            .await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.get("echo"), Some(&json!("hello")));
        assert_eq!(result.metrics.success_count, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let agent = flaky(10);
        let result = agent
            .execute(input("hello"), AgentContext::new().with_max_retries(1))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(AgentErrorKind::Processing));
        assert_eq!(result.attempts, 2);
        assert_eq!(agent.processor().calls.load(Ordering::SeqCst), 2);
        assert!(result.error_message.unwrap().contains("transient failure #2"));
    }

    #[tokio::test]
    async fn test_panic_is_converted_to_failed_result() {
        let agent = BaseAgent::new(Panicky);
        let result = agent
            .execute(DataMap::new(), AgentContext::new().with_max_retries(0))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(AgentErrorKind::Panicked));
        assert!(result.error_message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_concurrent_calls_do_not_lose_metric_updates() {
        let agent = Arc::new(flaky(0));
        let mut handles = Vec::new();

        for i in 0..32 {
            let agent = Arc::clone(&agent);
            handles.push(tokio::spawn(async move {
                agent
                    .execute(input(&format!("msg-{}", i)), AgentContext::new())
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        let metrics = agent.metrics();
        assert_eq!(metrics.execution_count, 32);
        assert_eq!(metrics.success_count, 32);
        assert_eq!(metrics.records_processed, 32);
        assert!((metrics.success_rate() - 1.0).abs() < f64::EPSILON);
    }
}
