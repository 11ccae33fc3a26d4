//! Workflow Validation
//!
//! Structural checks run before an execution is created:
//! - Step field validation
//! - Reference integrity checking (unknown steps, self-dependencies)
//! - Agent type registration
//! - Topological ordering (Kahn), which also detects cycles
//!
//! Cycles are deliberately *not* a structural error: the engine records them
//! on a failed execution so callers can inspect which steps were stuck.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};

use super::model::{WorkflowDefinition, WorkflowStep};
use crate::agent::registry::AgentRegistry;
use crate::error::{OrchestratorError, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyWorkflowId,
    DuplicateStepId(String),
    EmptyStepId,
    EmptyAgentType(String),
    InvalidReference { step: String, reference: String },
    SelfDependency(String),
    UnknownAgentType { step: String, agent_type: String },
    InvalidAgentConfig { step: String, message: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::EmptyWorkflowId => write!(f, "Workflow has empty or whitespace-only ID"),
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::EmptyStepId => write!(f, "Step has empty or whitespace-only ID"),
            Self::EmptyAgentType(step) => write!(f, "Step '{}' has no agent type specified", step),
            Self::InvalidReference { step, reference } => {
                write!(f, "Step '{}' references unknown step '{}'", step, reference)
            }
            Self::SelfDependency(step) => write!(f, "Step '{}' depends on itself", step),
            Self::UnknownAgentType { step, agent_type } => {
                write!(f, "Step '{}' uses unregistered agent type '{}'", step, agent_type)
            }
            Self::InvalidAgentConfig { step, message } => write!(f, "Step '{}': {}", step, message),
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &WorkflowStep) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.step_id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors; // Can't validate further without ID
    }

    if step.agent_type.trim().is_empty() {
        errors.push(ValidationError::EmptyAgentType(step.step_id.clone()));
    }

    if step.depends_on.iter().any(|d| d == &step.step_id) {
        errors.push(ValidationError::SelfDependency(step.step_id.clone()));
    }

    for (target, source) in &step.input_mapping {
        if source.trim().is_empty() {
            warn!(
                "Step '{}': input '{}' is mapped from an empty source",
                step.step_id, target
            );
        }
    }

    if step.depends_on.is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", step.step_id);
    }

    errors
}

/// Collects every structural problem of `definition`.
///
/// When `registry` is given, agent types are checked against it too.
pub fn collect_errors(
    definition: &WorkflowDefinition,
    registry: Option<&AgentRegistry>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if definition.workflow_id.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowId);
    }

    if definition.steps.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
        return errors;
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &definition.steps {
        if !step.step_id.trim().is_empty() && !seen_ids.insert(step.step_id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.step_id.clone()));
        }
    }

    for step in &definition.steps {
        errors.extend(validate_step(step));

        for dep in &step.depends_on {
            if dep != &step.step_id && !seen_ids.contains(dep.as_str()) {
                errors.push(ValidationError::InvalidReference {
                    step: step.step_id.clone(),
                    reference: dep.clone(),
                });
            }
        }

        if let Some(registry) = registry {
            if step.agent_type.trim().is_empty() {
                continue;
            }
            if !registry.contains(&step.agent_type) {
                errors.push(ValidationError::UnknownAgentType {
                    step: step.step_id.clone(),
                    agent_type: step.agent_type.clone(),
                });
            } else if let Err(e) = registry.create(&step.agent_type, &step.agent_config) {
                // Constructors reject bad option values
                errors.push(ValidationError::InvalidAgentConfig {
                    step: step.step_id.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    errors
}

/// Validates the definition structure.
///
/// Performs the following checks:
/// 1. Workflow is not empty and has an ID
/// 2. No duplicate or empty step IDs
/// 3. Every step names an agent type (registered, when `registry` is given,
///    and constructible from the step's `agent_config`)
/// 4. All references point to existing steps, none to the step itself
///
/// Undeclared agent options are logged as warnings and returned.
pub fn validate_definition(
    definition: &WorkflowDefinition,
    registry: Option<&AgentRegistry>,
) -> Result<Vec<String>> {
    info!(
        "Validating workflow '{}' with {} steps",
        definition.workflow_id,
        definition.steps.len()
    );

    let errors = collect_errors(definition, registry);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(OrchestratorError::InvalidDefinition(messages.join("\n")));
    }

    let mut warnings = Vec::new();
    if let Some(registry) = registry {
        for step in &definition.steps {
            for warning in registry.check_config(&step.agent_type, &step.agent_config)? {
                warn!("Step '{}': {}", step.step_id, warning);
                warnings.push(format!("step '{}': {}", step.step_id, warning));
            }
        }
    }

    info!("Workflow '{}' validated", definition.workflow_id);
    Ok(warnings)
}

/// Orders step IDs so dependencies come before dependents (Kahn's algorithm).
///
/// Ties keep declaration order. On a cycle, returns the IDs that could not be
/// ordered, in declaration order. Unknown references are ignored.
pub fn topological_order(definition: &WorkflowDefinition) -> std::result::Result<Vec<String>, Vec<String>> {
    let ids: HashSet<&str> = definition.steps.iter().map(|s| s.step_id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &definition.steps {
        let deps: HashSet<&str> = step
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|d| ids.contains(d))
            .collect();
        in_degree.insert(step.step_id.as_str(), deps.len());
        for dep in deps {
            successors.entry(dep).or_default().push(step.step_id.as_str());
        }
    }

    // Start with root nodes (in-degree = 0)
    let mut queue: VecDeque<&str> = definition
        .steps
        .iter()
        .map(|s| s.step_id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut sorted_order: Vec<String> = Vec::new();

    while let Some(current_id) = queue.pop_front() {
        sorted_order.push(current_id.to_string());

        for successor_id in successors.get(current_id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(successor_id) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor_id);
                }
            }
        }
    }

    if sorted_order.len() != definition.steps.len() {
        let ordered: HashSet<&str> = sorted_order.iter().map(String::as_str).collect();
        let remaining = definition
            .steps
            .iter()
            .map(|s| s.step_id.clone())
            .filter(|id| !ordered.contains(id.as_str()))
            .collect();
        return Err(remaining);
    }

    debug!("Topological order: {:?}", sorted_order);
    Ok(sorted_order)
}

/// Quick validation that returns a list of error messages.
///
/// Includes cycle detection, which [`validate_definition`] leaves to the engine.
pub fn quick_validate(definition: &WorkflowDefinition) -> Vec<String> {
    let mut errors: Vec<String> = collect_errors(definition, None)
        .iter()
        .map(|e| e.to_string())
        .collect();

    if errors.is_empty() {
        if let Err(remaining) = topological_order(definition) {
            errors.push(format!(
                "Workflow contains cyclic dependencies between: {}",
                remaining.join(", ")
            ));
        }
    }

    errors
}
