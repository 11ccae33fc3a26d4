//! Error Types
//!
//! Two layers of errors are used throughout the crate:
//!
//! - [`WorkflowError`]: scheduler-level failures recorded on a
//!   [`WorkflowExecution`](crate::workflow::WorkflowExecution). These are data,
//!   not control flow; they are cloned into step outcomes and status reports.
//! - [`OrchestratorError`]: API errors returned to the caller when a request
//!   cannot even produce an execution (bad document, unknown execution id).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures that end a step or a whole workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowError {
    #[error("Step '{step_id}' rejected its input: {message}")]
    Validation { step_id: String, message: String },

    #[error("Step '{step_id}' uses unregistered agent type '{agent_type}'")]
    UnknownAgentType { step_id: String, agent_type: String },

    #[error("Circular dependency detected; unresolved steps: {}", .remaining.join(", "))]
    CircularDependency { remaining: Vec<String> },

    #[error("Step '{step_id}' timed out after {timeout_secs}s")]
    StepTimeout { step_id: String, timeout_secs: u64 },

    #[error("Step '{step_id}' failed after {attempts} attempts: {last_error}")]
    StepExhaustedRetries {
        step_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("Human reviewer rejected step '{step_id}'{}", .comment.as_ref().map(|c| format!(": {}", c)).unwrap_or_default())]
    HumanRejected {
        step_id: String,
        comment: Option<String>,
    },

    #[error("Workflow execution was cancelled")]
    WorkflowCancelled,
}

impl WorkflowError {
    /// Step the failure belongs to, if it is step-scoped.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::Validation { step_id, .. }
            | Self::UnknownAgentType { step_id, .. }
            | Self::StepTimeout { step_id, .. }
            | Self::StepExhaustedRetries { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::HumanRejected { step_id, .. } => Some(step_id),
            Self::CircularDependency { .. } | Self::WorkflowCancelled => None,
        }
    }

    /// Returns true for failures a step-level retry may recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StepTimeout { .. } | Self::StepFailed { .. })
    }
}

/// Errors returned by the public API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Failed to read workflow file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse workflow JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown agent type: '{0}'")]
    UnknownAgentType(String),

    #[error("Invalid configuration for agent '{agent_type}': {message}")]
    InvalidAgentConfig { agent_type: String, message: String },

    #[error("Unknown execution: '{0}'")]
    UnknownExecution(String),

    #[error("Execution '{execution_id}' is {status}, expected {expected}")]
    InvalidState {
        execution_id: String,
        status: String,
        expected: String,
    },

    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_dependency_message_lists_steps() {
        let err = WorkflowError::CircularDependency {
            remaining: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Circular dependency detected; unresolved steps: a, b"
        );
        assert!(err.step_id().is_none());
    }

    #[test]
    fn test_human_rejected_message_with_and_without_comment() {
        let bare = WorkflowError::HumanRejected {
            step_id: "review".to_string(),
            comment: None,
        };
        assert_eq!(bare.to_string(), "Human reviewer rejected step 'review'");

        let with_comment = WorkflowError::HumanRejected {
            step_id: "review".to_string(),
            comment: Some("numbers look off".to_string()),
        };
        assert!(with_comment.to_string().ends_with(": numbers look off"));
    }

    #[test]
    fn test_retryable_kinds() {
        let timeout = WorkflowError::StepTimeout {
            step_id: "s".to_string(),
            timeout_secs: 1,
        };
        let validation = WorkflowError::Validation {
            step_id: "s".to_string(),
            message: "missing key".to_string(),
        };
        assert!(timeout.is_retryable());
        assert!(!validation.is_retryable());
        assert_eq!(timeout.step_id(), Some("s"));
    }

    #[test]
    fn test_workflow_error_serializes_with_kind_tag() {
        let err = WorkflowError::StepTimeout {
            step_id: "slow".to_string(),
            timeout_secs: 5,
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "step_timeout");
        assert_eq!(json["timeout_secs"], 5);
    }
}
