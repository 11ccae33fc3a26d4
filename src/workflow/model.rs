//! Workflow Data Model
//!
//! Declarative description of a workflow: steps bound to agent types,
//! their dependencies and how data flows between them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workflow_id: content_review
//! name: Content review
//! global_config:
//!   language: en
//! steps:
//!   - step_id: extract
//!     agent_type: echo
//!     input_mapping:
//!       text: document
//!
//!   - step_id: keywords
//!     agent_type: keyword_scorer
//!     depends_on: extract
//!     parallel: true
//!     input_mapping:
//!       text: step.extract.text
//!     output_mapping:
//!       keywords: doc_keywords
//!
//!   - step_id: mood
//!     agent_type: mood_analyzer
//!     depends_on: [extract]
//!     parallel: true
//!     retry_on_failure: true
//!     timeout_seconds: 30
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::agent::context::DataMap;

/// Default per-step timeout in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Configuration handed to an agent constructor.
///
/// Well-known options are typed; everything else lands in `extra` and is
/// checked against the options the agent type declares at load time.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AgentConfig {
    /// Agent-local retry budget (overrides the engine default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Base delay of the agent-local backoff in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,

    /// Input keys the agent must receive
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_keys: Vec<String>,

    /// Agent specific options
    #[serde(flatten)]
    pub extra: DataMap,
}

impl AgentConfig {
    /// Sets an agent specific option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Looks up an agent specific option.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// Policy applied when a step ends in failure.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorHandling {
    /// Keep scheduling after any step failure.
    ///
    /// When false, a failed step with `retry_on_failure = false` fails the
    /// whole workflow; steps that exhausted their retries are recorded and
    /// still unblock their dependents.
    #[serde(default)]
    pub continue_on_failure: bool,
}

/// A single step in a workflow, bound to one agent invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    /// Unique identifier within the definition
    #[serde(alias = "id")]
    pub step_id: String,

    /// Registry tag of the agent to run
    #[serde(alias = "agent")]
    pub agent_type: String,

    /// Options passed to the agent constructor
    #[serde(default)]
    pub agent_config: AgentConfig,

    /// Input key -> source key (context key or `step.<id>.<key>`)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input_mapping: HashMap<String, String>,

    /// Result key -> context key
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output_mapping: HashMap<String, String>,

    /// IDs of steps that must be executed before this one
    #[serde(deserialize_with = "single_or_vec", default)]
    pub depends_on: Vec<String>,

    /// May run concurrently with siblings unlocked by the same prerequisites
    #[serde(default)]
    pub parallel: bool,

    /// Re-invoke the step when it fails
    #[serde(default)]
    pub retry_on_failure: bool,

    /// Per-invocation time budget; 0 disables the timeout
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Pause for a human decision after this step
    #[serde(default)]
    pub human_review_required: bool,

    /// Step-level retry budget (overrides the engine default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl WorkflowStep {
    /// Creates a sequential step with default settings.
    ///
    /// # Example
    ///
    /// ```
    /// use agentrunner::workflow::WorkflowStep;
    ///
    /// let step = WorkflowStep::new("score", "keyword_scorer")
    ///     .depends_on("extract")
    ///     .map_input("text", "step.extract.text")
    ///     .map_output("score", "keyword_score")
    ///     .parallel()
    ///     .with_timeout(30);
    /// ```
    pub fn new(step_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into().trim().to_string(),
            agent_type: agent_type.into().trim().to_string(),
            agent_config: AgentConfig::default(),
            input_mapping: HashMap::new(),
            output_mapping: HashMap::new(),
            depends_on: Vec::new(),
            parallel: false,
            retry_on_failure: false,
            timeout_seconds: DEFAULT_STEP_TIMEOUT_SECS,
            human_review_required: false,
            max_retries: None,
        }
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Maps input key `target` from `source`.
    pub fn map_input(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.input_mapping.insert(target.into(), source.into());
        self
    }

    /// Promotes result key `result_key` into the context as `context_key`.
    pub fn map_output(mut self, result_key: impl Into<String>, context_key: impl Into<String>) -> Self {
        self.output_mapping.insert(result_key.into(), context_key.into());
        self
    }

    /// Marks the step as parallel-eligible.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Enables orchestration-level retries.
    pub fn retry_on_failure(mut self) -> Self {
        self.retry_on_failure = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = config;
        self
    }

    /// Requests a human review after the step.
    pub fn requires_review(mut self) -> Self {
        self.human_review_required = true;
        self
    }

    /// Dependencies as a sorted, de-duplicated key.
    ///
    /// Parallel steps with equal signatures were unlocked by the same
    /// prerequisites and run in the same group.
    pub fn dependency_signature(&self) -> Vec<String> {
        let mut deps = self.depends_on.clone();
        deps.sort();
        deps.dedup();
        deps
    }
}

/// A complete workflow definition. Immutable once an execution starts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    /// Identifier of the workflow
    #[serde(alias = "id")]
    pub workflow_id: String,

    /// Human readable name
    #[serde(default)]
    pub name: String,

    /// Definition version
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Ordered list of steps
    pub steps: Vec<WorkflowStep>,

    /// Values merged first into every step's input
    #[serde(default)]
    pub global_config: DataMap,

    #[serde(default)]
    pub error_handling: ErrorHandling,

    /// Pause for a human decision after every step
    #[serde(default)]
    pub human_review_required: bool,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    pub fn new(workflow_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            name: name.into(),
            version: default_version(),
            description: String::new(),
            steps: Vec::new(),
            global_config: DataMap::new(),
            error_handling: ErrorHandling::default(),
            human_review_required: false,
        }
    }

    /// Creates a definition from a list of steps.
    pub fn from_steps(workflow_id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let workflow_id = workflow_id.into();
        let mut definition = Self::new(workflow_id.clone(), workflow_id);
        definition.steps = steps;
        definition
    }

    /// Adds a step to the workflow.
    pub fn add_step(&mut self, step: WorkflowStep) -> Result<(), String> {
        if self.steps.iter().any(|s| s.step_id == step.step_id) {
            return Err(format!("Step '{}' already exists", step.step_id));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn with_global(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.global_config.insert(key.into(), value.into());
        self
    }

    pub fn with_human_review(mut self) -> Self {
        self.human_review_required = true;
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.error_handling.continue_on_failure = true;
        self
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == id)
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&WorkflowStep> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Returns the steps that depend on `id`.
    pub fn dependents(&self, id: &str) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == id))
            .collect()
    }

    /// Returns steps nothing depends on (exit points).
    pub fn leaf_steps(&self) -> Vec<&WorkflowStep> {
        let referenced: HashSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
            .collect();
        self.steps
            .iter()
            .filter(|s| !referenced.contains(s.step_id.as_str()))
            .collect()
    }

    /// Unique agent types used, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let types: HashSet<_> = self.steps.iter().map(|s| s.agent_type.clone()).collect();
        let mut types: Vec<String> = types.into_iter().collect();
        types.sort();
        types
    }

    /// Returns true when `step` must be followed by a human review.
    pub fn review_required_after(&self, step: &WorkflowStep) -> bool {
        self.human_review_required || step.human_review_required
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
