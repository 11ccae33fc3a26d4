//! Workflow Execution Module
//!
//! Runs workflow definitions against registered agents, including parallel
//! group scheduling, retries, input/output mapping and human review pauses.
//!
//! # Architecture
//!
//! - [`engine`]: The orchestrator and its scheduling loop
//! - [`step`]: Individual step execution (timeout, retry)
//! - [`retry`]: Exponential backoff
//! - [`mapping`]: Step input resolution and output promotion
//! - [`review`]: The human review boundary

pub mod engine;
pub mod mapping;
pub mod retry;
pub mod review;
pub mod step;

pub use engine::{EngineConfig, Orchestrator};
pub use retry::Backoff;
pub use review::{AutoApprove, AutoReject, ConsoleReviewer, HumanReviewer, ReviewDecision, ReviewRequest};
