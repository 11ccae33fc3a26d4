//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating and tracking agent workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowStep, WorkflowDefinition)
//! - [`parser`]: YAML/JSON parsing and loading
//! - [`validator`]: Validation rules and dependency ordering
//! - [`planner`]: Ready-set computation and batch partitioning
//! - [`state`]: Runtime execution record and status machine

pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use model::{AgentConfig, ErrorHandling, WorkflowDefinition, WorkflowStep};
pub use parser::{load_workflow, parse_workflow_str, save_workflow, DocumentFormat};
pub use planner::{ExecutionPlanner, ScheduleBatch};
pub use state::{ExecutionStatus, Progress, StatusReport, StepOutcome, WorkflowExecution};
pub use validator::{quick_validate, topological_order, validate_definition};
