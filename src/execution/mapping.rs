//! Step Input/Output Mapping
//!
//! Input for a step is merged, in order, from:
//! 1. the definition's `global_config`
//! 2. shared-context values addressed by `input_mapping` sources
//! 3. `step.<id>.<key>` sources, read from earlier step results
//!
//! Only successful results are promoted back into the shared context.

use std::collections::HashMap;

use log::{debug, warn};
use serde_json::Value;

use crate::agent::context::DataMap;
use crate::workflow::model::{WorkflowDefinition, WorkflowStep};
use crate::workflow::state::StepOutcome;

const STEP_REF_PREFIX: &str = "step.";

/// Where an input value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource<'a> {
    /// A key of the shared context
    Context(&'a str),
    /// A key of an earlier step's result payload
    StepOutput { step_id: &'a str, key: &'a str },
}

/// Parses an `input_mapping` source.
///
/// `step.<id>.<key>` splits at the first dot after the prefix, so keys may
/// contain dots but step IDs may not. Anything else is a context key.
pub fn parse_source(source: &str) -> InputSource<'_> {
    source
        .strip_prefix(STEP_REF_PREFIX)
        .and_then(|rest| rest.split_once('.'))
        .filter(|(step_id, key)| !step_id.is_empty() && !key.is_empty())
        .map(|(step_id, key)| InputSource::StepOutput { step_id, key })
        .unwrap_or(InputSource::Context(source))
}

/// Input assembled for one step invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInput {
    pub input: DataMap,
    /// `target <- source` descriptions of references that did not resolve
    pub unresolved: Vec<String>,
}

impl ResolvedInput {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Builds the input of `step` from the definition, context and prior results.
///
/// Unresolved references are left out and reported.
pub fn resolve_input(
    definition: &WorkflowDefinition,
    step: &WorkflowStep,
    context: &DataMap,
    step_results: &HashMap<String, StepOutcome>,
) -> ResolvedInput {
    let mut resolved = ResolvedInput {
        input: definition.global_config.clone(),
        unresolved: Vec::new(),
    };

    let mut mappings: Vec<(&String, &String)> = step.input_mapping.iter().collect();
    mappings.sort();

    let mut step_refs = Vec::new();
    for (target, source) in mappings {
        match parse_source(source) {
            InputSource::Context(key) => match context.get(key) {
                Some(value) => {
                    resolved.input.insert(target.clone(), value.clone());
                }
                None => resolved.unresolved.push(format!("{} <- {}", target, source)),
            },
            InputSource::StepOutput { step_id, key } => step_refs.push((target, source, step_id, key)),
        }
    }

    for (target, source, step_id, key) in step_refs {
        match lookup_step_output(step_results, step_id, key) {
            Some(value) => {
                resolved.input.insert(target.clone(), value.clone());
            }
            None => resolved.unresolved.push(format!("{} <- {}", target, source)),
        }
    }

    for missing in &resolved.unresolved {
        warn!(
            "Step '{}': unresolved input reference {}",
            step.step_id, missing
        );
    }

    resolved
}

fn lookup_step_output<'a>(
    step_results: &'a HashMap<String, StepOutcome>,
    step_id: &str,
    key: &str,
) -> Option<&'a Value> {
    step_results
        .get(step_id)
        .filter(|outcome| outcome.is_success())
        .and_then(|outcome| outcome.result.data.get(key))
}

/// Promotes a successful step's payload into `context`.
///
/// With an `output_mapping` only the listed keys are copied (renamed);
/// without one the whole payload merges. Returns the context keys written.
pub fn apply_output(step: &WorkflowStep, outcome: &StepOutcome, context: &mut DataMap) -> Vec<String> {
    if !outcome.is_success() {
        return Vec::new();
    }

    let data = &outcome.result.data;
    let mut written = Vec::new();

    if step.output_mapping.is_empty() {
        for (key, value) in data {
            context.insert(key.clone(), value.clone());
            written.push(key.clone());
        }
    } else {
        let mut mappings: Vec<(&String, &String)> = step.output_mapping.iter().collect();
        mappings.sort();
        for (result_key, context_key) in mappings {
            match data.get(result_key) {
                Some(value) => {
                    context.insert(context_key.clone(), value.clone());
                    written.push(context_key.clone());
                }
                None => debug!(
                    "Step '{}': result has no '{}' to map into '{}'",
                    step.step_id, result_key, context_key
                ),
            }
        }
    }

    written
}
