//! AgentRunner - Dependency-Driven Agent Workflow Engine
//!
//! Executes workflows of pluggable agents described as a dependency graph.
//! Steps run as soon as their dependencies have executed; steps sharing the
//! same dependencies can run as a parallel group. Failures are retried,
//! isolated or escalated according to the definition, and a run can pause
//! for human review at any step.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`agent`]: The agent contract, registry and builtin agents
//! - [`workflow`]: Definitions, parsing, validation, planning and run state
//! - [`execution`]: The orchestrator, step runner, mapping and review
//! - [`monitoring`]: Execution timeline
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentrunner::agent::{register_builtin_agents, AgentRegistry, DataMap};
//! use agentrunner::execution::{AutoApprove, Orchestrator};
//! use agentrunner::load_workflow;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Register the agents the workflow may use
//!     let mut registry = AgentRegistry::new();
//!     register_builtin_agents(&mut registry);
//!
//!     // Create the engine
//!     let mut engine = Orchestrator::new(Arc::new(registry)).with_reviewer(Arc::new(AutoApprove));
//!     engine.set_max_parallel(4);
//!
//!     // Load and execute a workflow
//!     let workflow = load_workflow("pipeline.yaml")?;
//!     let execution = engine.run(workflow, DataMap::new()).await?;
//!     println!("{}: {}", execution.execution_id, execution.status);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use agent::{Agent, AgentContext, AgentRegistry, AgentResult, BaseAgent, DataMap, Processor};
pub use error::{OrchestratorError, WorkflowError};
pub use execution::engine::{EngineConfig, Orchestrator};
pub use workflow::model::{WorkflowDefinition, WorkflowStep};
pub use workflow::parser::load_workflow;
pub use workflow::state::{ExecutionStatus, StatusReport, WorkflowExecution};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "AgentRunner";
