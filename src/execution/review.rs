//! Human Review
//!
//! The boundary between the scheduler and a human decision. When a step (or
//! the whole workflow) requires review, the engine builds a [`ReviewRequest`]
//! and either awaits an installed [`HumanReviewer`] or detaches the run
//! until [`Orchestrator::resume`](super::engine::Orchestrator::resume) is called.

use std::io::{self, Write};

use async_trait::async_trait;
use colored::Colorize;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::model::WorkflowStep;
use crate::workflow::state::{StepOutcome, WorkflowExecution};

/// What a reviewer is asked to decide on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReviewRequest {
    pub request_id: String,
    /// Snapshot of the paused execution
    pub execution: WorkflowExecution,
    /// The step that triggered the review
    pub step: WorkflowStep,
    /// Its recorded outcome
    pub outcome: StepOutcome,
    pub reason: String,
}

impl ReviewRequest {
    pub fn new(
        execution: WorkflowExecution,
        step: WorkflowStep,
        outcome: StepOutcome,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            execution,
            step,
            outcome,
            reason: reason.into(),
        }
    }
}

/// A reviewer's verdict.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            comment: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            approved: false,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Decides whether a paused execution may continue.
#[async_trait]
pub trait HumanReviewer: Send + Sync {
    async fn review(&self, request: ReviewRequest) -> ReviewDecision;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl HumanReviewer for AutoApprove {
    async fn review(&self, request: ReviewRequest) -> ReviewDecision {
        debug!("Auto-approving review of step '{}'", request.step.step_id);
        ReviewDecision::approve()
    }
}

/// Rejects everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoReject;

#[async_trait]
impl HumanReviewer for AutoReject {
    async fn review(&self, request: ReviewRequest) -> ReviewDecision {
        debug!("Auto-rejecting review of step '{}'", request.step.step_id);
        ReviewDecision::reject().with_comment("rejected automatically")
    }
}

/// Asks on the terminal.
///
/// Answers starting with `y` approve; anything else rejects. Text after a
/// colon becomes the comment, e.g. `n: totals do not add up`.
#[derive(Debug, Clone)]
pub struct ConsoleReviewer {
    colored_output: bool,
}

impl Default for ConsoleReviewer {
    fn default() -> Self {
        Self {
            colored_output: true,
        }
    }
}

impl ConsoleReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_color() -> Self {
        Self {
            colored_output: false,
        }
    }

    fn format_prompt(&self, request: &ReviewRequest) -> String {
        let header = "HUMAN REVIEW NEEDED";
        let mut prompt = if self.colored_output {
            format!("{}\n", header.bold().blue())
        } else {
            format!("{}\n", header)
        };
        prompt.push_str(&format!("{}\n", "-".repeat(50)));
        prompt.push_str(&format!("{}\n", request.reason));
        prompt.push_str(&format!(
            "Step: {} (agent: {})\n",
            request.step.step_id, request.step.agent_type
        ));

        match &request.outcome.error {
            None => {
                let keys: Vec<&str> = request.outcome.result.data.keys().map(String::as_str).collect();
                prompt.push_str(&format!("Result keys: {}\n", keys.join(", ")));
            }
            Some(err) if self.colored_output => {
                prompt.push_str(&format!("{} {}\n", "Failed:".red(), err));
            }
            Some(err) => prompt.push_str(&format!("Failed: {}\n", err)),
        }

        let progress = request.execution.progress();
        prompt.push_str(&format!(
            "Progress: {}/{} steps\n",
            progress.completed, progress.total
        ));
        prompt.push_str("Approve? [y/N] (optionally 'n: comment')");
        prompt
    }

    async fn read_line() -> io::Result<String> {
        tokio::task::spawn_blocking(|| {
            let mut input = String::new();
            io::stdin().read_line(&mut input).map(|_| input)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

/// Parses a console answer into a decision.
pub fn parse_answer(answer: &str) -> ReviewDecision {
    let (verdict, comment) = match answer.split_once(':') {
        Some((verdict, comment)) => (verdict.trim(), Some(comment.trim())),
        None => (answer.trim(), None),
    };

    let approved = verdict
        .chars()
        .next()
        .is_some_and(|c| c.eq_ignore_ascii_case(&'y'));

    let decision = if approved {
        ReviewDecision::approve()
    } else {
        ReviewDecision::reject()
    };

    match comment.filter(|c| !c.is_empty()) {
        Some(comment) => decision.with_comment(comment),
        None => decision,
    }
}

#[async_trait]
impl HumanReviewer for ConsoleReviewer {
    async fn review(&self, request: ReviewRequest) -> ReviewDecision {
        println!("\n{}\n", self.format_prompt(&request));
        if self.colored_output {
            print!("{} ", ">".green().bold());
        } else {
            print!("> ");
        }
        if let Err(e) = io::stdout().flush() {
            warn!("Failed to flush review prompt: {}", e);
        }

        match Self::read_line().await {
            Ok(answer) => parse_answer(&answer),
            Err(e) => {
                warn!("Failed to read review answer: {}", e);
                ReviewDecision::reject().with_comment(format!("no answer: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::{AgentResult, DataMap};
    use crate::workflow::model::WorkflowDefinition;
    use chrono::Utc;

    fn request() -> ReviewRequest {
        let step = WorkflowStep::new("draft", "echo").requires_review();
        let definition = WorkflowDefinition::from_steps("wf", vec![step.clone()]);
        let execution = WorkflowExecution::new(&definition, DataMap::new());
        let outcome = StepOutcome::new(&step, AgentResult::success(DataMap::new(), Utc::now()), None, 0);
        ReviewRequest::new(execution, step, outcome, "Step 'draft' requires human review")
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), ReviewDecision::approve());
        assert_eq!(parse_answer("YES"), ReviewDecision::approve());
        assert_eq!(parse_answer(""), ReviewDecision::reject());
        assert_eq!(
            parse_answer("n: totals do not add up"),
            ReviewDecision::reject().with_comment("totals do not add up")
        );
        assert_eq!(parse_answer("y:"), ReviewDecision::approve());
    }

    #[tokio::test]
    async fn test_auto_reviewers() {
        assert!(AutoApprove.review(request()).await.approved);

        let decision = AutoReject.review(request()).await;
        assert!(!decision.approved);
        assert!(decision.comment.is_some());
    }

    #[test]
    fn test_console_prompt_mentions_step() {
        let prompt = ConsoleReviewer::without_color().format_prompt(&request());
        assert!(prompt.contains("HUMAN REVIEW NEEDED"));
        assert!(prompt.contains("Step: draft (agent: echo)"));
        assert!(prompt.contains("Progress: 0/1 steps"));
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_value(ReviewDecision::approve()).unwrap();
        assert_eq!(json, serde_json::json!({"approved": true}));
    }
}
