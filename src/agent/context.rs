//! Agent Execution Types
//!
//! Value objects exchanged between the scheduler and agents:
//! the per-attempt [`AgentContext`], the immutable [`AgentResult`], and the
//! [`AgentMetrics`] counters an agent instance accumulates.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Key/value payload passed into and out of agents.
pub type DataMap = serde_json::Map<String, Value>;

/// Default number of agent-local retries when a context is built by hand.
pub const DEFAULT_AGENT_MAX_RETRIES: u32 = 3;

/// Default environment tag.
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// Execution context handed to an agent for one invocation.
///
/// `retry_count` is the only field that changes between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    /// Id used to correlate log lines across one workflow run
    pub correlation_id: String,

    /// Workflow the invocation belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    /// Execution the invocation belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,

    /// Step being executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// Time budget for the invocation in seconds (None = unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Attempts already retried inside the agent
    #[serde(default)]
    pub retry_count: u32,

    /// Upper bound for agent-local retries
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Deployment environment tag
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: DataMap,
}

fn default_max_retries() -> u32 {
    DEFAULT_AGENT_MAX_RETRIES
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

impl AgentContext {
    /// Creates a context with a fresh correlation id.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            workflow_id: None,
            execution_id: None,
            step_id: None,
            timeout_secs: None,
            retry_count: 0,
            max_retries: DEFAULT_AGENT_MAX_RETRIES,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            metadata: DataMap::new(),
        }
    }

    /// Binds the context to a step of a running execution.
    ///
    /// The execution id doubles as correlation id so every step of one run
    /// can be grepped together.
    pub fn for_step(
        workflow_id: impl Into<String>,
        execution_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        let execution_id = execution_id.into();
        Self {
            correlation_id: execution_id.clone(),
            workflow_id: Some(workflow_id.into()),
            execution_id: Some(execution_id),
            step_id: Some(step_id.into()),
            ..Self::new()
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = if secs == 0 { None } else { Some(secs) };
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Time budget as a Duration.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Returns true while another agent-local retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters owned by an agent instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Number of `execute` calls
    pub execution_count: u64,
    /// Number of successful calls
    pub success_count: u64,
    /// Number of failed calls
    pub error_count: u64,
    /// Records handled by successful calls
    pub records_processed: u64,
    /// Accumulated wall time in milliseconds
    pub total_execution_time_ms: u64,
    /// Wall time of the most recent call in milliseconds
    pub last_execution_time_ms: u64,
}

impl AgentMetrics {
    /// Records one finished call.
    pub fn record(&mut self, elapsed: Duration, success: bool, records: u64) {
        let elapsed_ms = elapsed.as_millis().min(u64::MAX as u128) as u64;

        self.execution_count += 1;
        self.total_execution_time_ms = self.total_execution_time_ms.saturating_add(elapsed_ms);
        self.last_execution_time_ms = elapsed_ms;

        if success {
            self.success_count += 1;
            self.records_processed = self.records_processed.saturating_add(records);
        } else {
            self.error_count += 1;
        }
    }

    /// Fraction of successful calls in `[0, 1]`; 0 before the first call.
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.execution_count as f64
    }

    /// Average wall time per call in milliseconds.
    pub fn average_execution_time_ms(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.total_execution_time_ms as f64 / self.execution_count as f64
    }
}

/// Why an agent invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// Input was rejected before processing
    Validation,
    /// Processing returned an error
    Processing,
    /// Processing panicked
    Panicked,
    /// The invocation exceeded its time budget
    Timeout,
}

/// Result of one agent invocation.
///
/// Built once through [`AgentResult::success`] or [`AgentResult::failure`]
/// and the consuming `with_*` helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,

    #[serde(default)]
    pub data: DataMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<AgentErrorKind>,

    /// Metrics snapshot taken when the result was produced
    #[serde(default)]
    pub metrics: AgentMetrics,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Attempts made inside the agent (1 = no agent-local retry)
    #[serde(default)]
    pub attempts: u32,
}

impl AgentResult {
    /// Creates a successful result finishing now.
    pub fn success(data: DataMap, started_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            data,
            error_message: None,
            error_kind: None,
            metrics: AgentMetrics::default(),
            started_at,
            finished_at: Utc::now(),
            attempts: 1,
        }
    }

    /// Creates a failed result finishing now.
    pub fn failure(
        kind: AgentErrorKind,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            data: DataMap::new(),
            error_message: Some(message.into()),
            error_kind: Some(kind),
            metrics: AgentMetrics::default(),
            started_at,
            finished_at: Utc::now(),
            attempts: 1,
        }
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Looks up a value in the payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Duration between start and finish in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_defaults() {
        let ctx = AgentContext::new();
        assert_eq!(ctx.retry_count, 0);
        assert_eq!(ctx.max_retries, DEFAULT_AGENT_MAX_RETRIES);
        assert_eq!(ctx.environment, "development");
        assert!(ctx.timeout().is_none());
        assert!(ctx.can_retry());
    }

    #[test]
    fn test_context_for_step_uses_execution_as_correlation() {
        let ctx = AgentContext::for_step("wf", "exec-1", "fetch")
            .with_timeout_secs(30)
            .with_max_retries(0)
            .with_metadata("tenant", "acme");

        assert_eq!(ctx.correlation_id, "exec-1");
        assert_eq!(ctx.step_id.as_deref(), Some("fetch"));
        assert_eq!(ctx.timeout(), Some(Duration::from_secs(30)));
        assert!(!ctx.can_retry());
        assert_eq!(ctx.metadata["tenant"], json!("acme"));
    }

    #[test]
    fn test_zero_timeout_means_unbounded() {
        let ctx = AgentContext::new().with_timeout_secs(0);
        assert!(ctx.timeout().is_none());
    }

    #[test]
    fn test_metrics_record_and_rates() {
        let mut metrics = AgentMetrics::default();
        assert_eq!(metrics.success_rate(), 0.0);

        metrics.record(Duration::from_millis(40), true, 3);
        metrics.record(Duration::from_millis(20), false, 5);

        assert_eq!(metrics.execution_count, 2);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.records_processed, 3);
        assert_eq!(metrics.total_execution_time_ms, 60);
        assert_eq!(metrics.last_execution_time_ms, 20);
        assert!((metrics.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!((metrics.average_execution_time_ms() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_result_constructors() {
        let mut data = DataMap::new();
        data.insert("score".to_string(), json!(0.9));

        let ok = AgentResult::success(data, Utc::now()).with_attempts(2);
        assert!(ok.success);
        assert_eq!(ok.get("score"), Some(&json!(0.9)));
        assert_eq!(ok.attempts, 2);
        assert!(ok.duration_ms() >= 0);

        let failed = AgentResult::failure(AgentErrorKind::Validation, "missing 'text'", Utc::now());
        assert!(!failed.success);
        assert_eq!(failed.error_kind, Some(AgentErrorKind::Validation));
        assert_eq!(failed.error_message.as_deref(), Some("missing 'text'"));
        assert!(failed.data.is_empty());
    }
}
