//! Monitoring Module
//!
//! Execution timeline recorded on every run, with Gantt rendering.

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
