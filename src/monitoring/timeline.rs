//! Execution Timeline
//!
//! Tracks step start/end times, retries and review pauses for generating
//! execution reports and Gantt charts. Timestamps are wall-clock UTC so a
//! timeline survives serialization together with its execution record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::state::StepOutcome;

/// Type of timeline event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step was re-invoked after a failed attempt
    Retried,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
    /// Execution paused for review after the step
    Paused,
    /// Execution resumed after review
    Resumed,
}

/// A single event in the execution timeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    /// ID of the step
    pub step_id: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

/// Tracks the execution timeline of a workflow.
///
/// Records when each step starts, retries, completes, or fails,
/// enabling generation of Gantt charts and timing reports.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Utc::now(),
        }
    }

    /// Records an event for a step, happening now.
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.add_event_at(step_id, event_type, Utc::now());
    }

    /// Records an event for a step at a given time.
    pub fn add_event_at(
        &mut self,
        step_id: impl Into<String>,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp,
        });
    }

    /// Records the start, retries and end of a finished step.
    pub fn record_step(&mut self, outcome: &StepOutcome) {
        self.add_event_at(&outcome.step_id, EventType::Started, outcome.started_at);
        for retried_at in &outcome.retried_at {
            self.add_event_at(&outcome.step_id, EventType::Retried, *retried_at);
        }
        let end = if outcome.is_success() {
            EventType::Completed
        } else {
            EventType::Failed
        };
        self.add_event_at(&outcome.step_id, end, outcome.finished_at);
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Events of one type, in recording order.
    pub fn events_of(&self, event_type: EventType) -> impl Iterator<Item = &TimelineEvent> {
        self.events.iter().filter(move |e| e.event_type == event_type)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Time between the timeline start and its latest event.
    pub fn span_ms(&self) -> i64 {
        self.events
            .iter()
            .map(|e| self.offset_ms(e))
            .max()
            .unwrap_or(0)
    }

    fn offset_ms(&self, event: &TimelineEvent) -> i64 {
        (event.timestamp - self.start_time).num_milliseconds().max(0)
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.span_ms();

        if total_time == 0 && self.events.is_empty() {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time.max(1) as f64;

        let mut sorted_steps: Vec<_> = self.step_spans().into_iter().collect();
        sorted_steps.sort_by(|(a_id, (a_start, _)), (b_id, (b_start, _))| {
            a_start.cmp(b_start).then_with(|| a_id.cmp(b_id))
        });

        for (step_id, (start, end)) in sorted_steps {
            let start_pos = (start as f64 * scale) as usize;
            let duration = (((end - start) as f64 * scale).max(1.0)) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(duration));

            output.push_str(&format!(
                "{:12} |{}| ({} ms)\n",
                truncate(&step_id, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// (start, end) offsets in milliseconds for every finished step.
    fn step_spans(&self) -> HashMap<String, (i64, i64)> {
        let mut starts: HashMap<&str, i64> = HashMap::new();
        let mut spans: HashMap<String, (i64, i64)> = HashMap::new();

        for event in &self.events {
            let elapsed = self.offset_ms(event);

            match event.event_type {
                EventType::Started => {
                    starts.insert(event.step_id.as_str(), elapsed);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(event.step_id.as_str()) {
                        spans.insert(event.step_id.clone(), (*start, elapsed.max(*start)));
                    }
                }
                EventType::Retried | EventType::Paused | EventType::Resumed => {}
            }
        }

        spans
    }

    /// Returns step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        self.step_spans()
            .into_iter()
            .map(|(id, (start, end))| (id, end - start))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a string to a maximum length, padding shorter ones.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
