//! Agent Registry
//!
//! Maps agent-type tags to constructors so the engine never names a concrete
//! agent. The registry is built by the hosting application, then shared
//! read-only (`Arc<AgentRegistry>`) across concurrently running executions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use super::base::Agent;
use crate::error::{OrchestratorError, Result};
use crate::workflow::model::AgentConfig;

/// Builds an agent instance from a step's configuration.
pub type AgentConstructor =
    Box<dyn Fn(&AgentConfig) -> std::result::Result<Arc<dyn Agent>, String> + Send + Sync>;

struct RegistryEntry {
    constructor: AgentConstructor,
    /// Extra options the agent understands; None accepts anything.
    known_options: Option<Vec<String>>,
}

/// Registry of agent constructors keyed by agent type.
#[derive(Default)]
pub struct AgentRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor that accepts any extra options.
    pub fn register<F>(&mut self, agent_type: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&AgentConfig) -> std::result::Result<Arc<dyn Agent>, String> + Send + Sync + 'static,
    {
        self.insert(agent_type.into(), Box::new(constructor), None)
    }

    /// Registers a constructor together with the extra options it understands.
    ///
    /// Options outside this list are reported by [`AgentRegistry::check_config`].
    pub fn register_with_options<F>(
        &mut self,
        agent_type: impl Into<String>,
        known_options: &[&str],
        constructor: F,
    ) -> &mut Self
    where
        F: Fn(&AgentConfig) -> std::result::Result<Arc<dyn Agent>, String> + Send + Sync + 'static,
    {
        let options = known_options.iter().map(|o| o.to_string()).collect();
        self.insert(agent_type.into(), Box::new(constructor), Some(options))
    }

    fn insert(
        &mut self,
        agent_type: String,
        constructor: AgentConstructor,
        known_options: Option<Vec<String>>,
    ) -> &mut Self {
        if self.entries.contains_key(&agent_type) {
            warn!("Agent type '{}' registered twice; replacing previous constructor", agent_type);
        }
        debug!("Registered agent type '{}'", agent_type);
        self.entries.insert(
            agent_type,
            RegistryEntry {
                constructor,
                known_options,
            },
        );
        self
    }

    /// Instantiates an agent of `agent_type`.
    pub fn create(&self, agent_type: &str, config: &AgentConfig) -> Result<Arc<dyn Agent>> {
        let entry = self
            .entries
            .get(agent_type)
            .ok_or_else(|| OrchestratorError::UnknownAgentType(agent_type.to_string()))?;

        (entry.constructor)(config).map_err(|message| OrchestratorError::InvalidAgentConfig {
            agent_type: agent_type.to_string(),
            message,
        })
    }

    /// Returns warnings for extra options `agent_type` does not declare.
    pub fn check_config(&self, agent_type: &str, config: &AgentConfig) -> Result<Vec<String>> {
        let entry = self
            .entries
            .get(agent_type)
            .ok_or_else(|| OrchestratorError::UnknownAgentType(agent_type.to_string()))?;

        let Some(known) = &entry.known_options else {
            return Ok(Vec::new());
        };

        Ok(config
            .extra
            .keys()
            .filter(|key| !known.contains(key))
            .map(|key| format!("agent '{}' does not declare option '{}'", agent_type, key))
            .collect())
    }

    /// Returns true if `agent_type` is registered.
    pub fn contains(&self, agent_type: &str) -> bool {
        self.entries.contains_key(agent_type)
    }

    /// Registered agent types, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agent_types", &self.agent_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::base::BaseAgent;
    use crate::agent::builtin::EchoProcessor;
    use serde_json::json;

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry.register_with_options("echo", &["fields"], |config| {
            Ok(Arc::new(BaseAgent::from_config(EchoProcessor::from_config(config)?, config)) as Arc<dyn Agent>)
        });
        registry.register("strict", |_| Err("always rejects its config".to_string()));
        registry
    }

    #[test]
    fn test_create_registered_type() {
        let registry = registry();
        let agent = registry.create("echo", &AgentConfig::default()).unwrap();
        assert_eq!(agent.agent_type(), "echo");
    }

    #[test]
    fn test_create_unknown_type_fails() {
        let registry = registry();
        let err = registry.create("sentiment", &AgentConfig::default()).err().unwrap();
        assert!(matches!(err, OrchestratorError::UnknownAgentType(t) if t == "sentiment"));
    }

    #[test]
    fn test_constructor_error_is_reported() {
        let registry = registry();
        let err = registry.create("strict", &AgentConfig::default()).err().unwrap();
        assert!(matches!(err, OrchestratorError::InvalidAgentConfig { .. }));
    }

    #[test]
    fn test_check_config_flags_undeclared_options() {
        let registry = registry();
        let mut config = AgentConfig::default();
        config.extra.insert("fields".to_string(), json!(["a"]));
        config.extra.insert("colour".to_string(), json!("blue"));

        let warnings = registry.check_config("echo", &config).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("colour"));

        // Without declared options anything goes
        assert!(registry.check_config("strict", &config).unwrap().is_empty());
    }

    #[test]
    fn test_agent_types_sorted() {
        let registry = registry();
        assert_eq!(registry.agent_types(), vec!["echo", "strict"]);
        assert!(registry.contains("echo"));
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
    }
}
