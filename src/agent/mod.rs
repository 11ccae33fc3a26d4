//! Agent Module
//!
//! The capability side of the engine: everything the scheduler needs to
//! invoke pluggable work units without knowing what they are.
//!
//! - [`context`]: Value types (AgentContext, AgentResult, AgentMetrics)
//! - [`base`]: The Agent contract and the BaseAgent wrapper
//! - [`registry`]: Agent-type to constructor mapping
//! - [`builtin`]: General-purpose agents shipped with the crate

pub mod base;
pub mod builtin;
pub mod context;
pub mod registry;

pub use base::{Agent, BaseAgent, ProcessError, Processor};
pub use builtin::register_builtin_agents;
pub use context::{AgentContext, AgentErrorKind, AgentMetrics, AgentResult, DataMap};
pub use registry::AgentRegistry;
