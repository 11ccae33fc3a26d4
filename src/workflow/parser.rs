//! Workflow Parser
//!
//! Loads workflow definitions from YAML or JSON documents. Documents are
//! accepted as a file path, a string, or an already parsed `serde_json::Value`.
//!
//! Parsing only checks the document shape; structural validation lives in
//! [`validator`](super::validator) and runs again when an execution starts.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde_json::Value;

use super::model::WorkflowDefinition;
use super::validator::validate_definition;
use crate::error::{OrchestratorError, Result};

/// Document format of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// Guesses the format from a file extension; anything unknown is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

impl WorkflowDefinition {
    /// Builds a definition from an already parsed document.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(OrchestratorError::InvalidDefinition(
                "workflow document must be an object".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Parses a workflow definition from a string.
///
/// YAML is a superset of JSON, so [`DocumentFormat::Yaml`] accepts both.
pub fn parse_workflow_str(content: &str, format: DocumentFormat) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = match format {
        DocumentFormat::Yaml => serde_yaml::from_str(content)?,
        DocumentFormat::Json => serde_json::from_str(content)?,
    };

    debug!(
        "Parsed workflow '{}' ({} steps)",
        definition.workflow_id,
        definition.steps.len()
    );
    Ok(definition)
}

/// Loads a workflow from a YAML or JSON file.
///
/// This function:
/// 1. Reads the file
/// 2. Parses it according to its extension (`.json`, otherwise YAML)
/// 3. Validates the workflow structure
///
/// # Example
///
/// ```rust,no_run
/// use agentrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_workflow("review.yaml")?;
///     println!("Loaded {} steps", definition.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| OrchestratorError::Io {
        path: path.display().to_string(),
        source,
    })?;

    debug!("Document loaded ({} bytes)", content.len());

    let definition = parse_workflow_str(&content, DocumentFormat::from_path(path))?;
    validate_definition(&definition, None)?;

    info!(
        "Loaded workflow '{}' v{} with {} steps",
        definition.workflow_id,
        definition.version,
        definition.len()
    );
    Ok(definition)
}

/// Saves a workflow to a YAML or JSON file, chosen by extension.
pub fn save_workflow(definition: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let content = match DocumentFormat::from_path(path) {
        DocumentFormat::Yaml => serde_yaml::to_string(definition)?,
        DocumentFormat::Json => serde_json::to_string_pretty(definition)?,
    };
    fs::write(path, content).map_err(|source| OrchestratorError::Io {
        path: path.display().to_string(),
        source,
    })?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
