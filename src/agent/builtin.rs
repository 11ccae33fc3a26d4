//! Builtin Agents
//!
//! Small general-purpose agents used by the CLI and for wiring tests:
//!
//! | type       | options                  | behaviour                               |
//! |------------|--------------------------|-----------------------------------------|
//! | `echo`     | `fields`                 | returns its input (optionally filtered) |
//! | `constant` | `values`                 | returns the configured object           |
//! | `delay`    | `delay_ms`               | sleeps, then echoes its input           |
//! | `fail`     | `message`                | always fails                            |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::base::{Agent, BaseAgent, ProcessError, Processor};
use super::context::{AgentContext, DataMap};
use super::registry::AgentRegistry;
use crate::workflow::model::AgentConfig;

/// Returns its input, or only the configured `fields`.
#[derive(Debug, Clone, Default)]
pub struct EchoProcessor {
    fields: Option<Vec<String>>,
}

impl EchoProcessor {
    pub fn from_config(config: &AgentConfig) -> Result<Self, String> {
        let fields = match config.extra.get("fields") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| "'fields' must be a list of strings".to_string())
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Some(_) => return Err("'fields' must be a list of strings".to_string()),
        };
        Ok(Self { fields })
    }
}

#[async_trait]
impl Processor for EchoProcessor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn process(&self, input: &DataMap, _context: &AgentContext) -> Result<DataMap, ProcessError> {
        Ok(match &self.fields {
            None => input.clone(),
            Some(fields) => input
                .iter()
                .filter(|(k, _)| fields.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }
}

/// Emits a fixed object regardless of input.
#[derive(Debug, Clone, Default)]
pub struct ConstantProcessor {
    values: DataMap,
}

impl ConstantProcessor {
    pub fn from_config(config: &AgentConfig) -> Result<Self, String> {
        match config.extra.get("values") {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::Object(values)) => Ok(Self {
                values: values.clone(),
            }),
            Some(_) => Err("'values' must be an object".to_string()),
        }
    }
}

#[async_trait]
impl Processor for ConstantProcessor {
    fn name(&self) -> &str {
        "constant"
    }

    async fn process(&self, _input: &DataMap, _context: &AgentContext) -> Result<DataMap, ProcessError> {
        Ok(self.values.clone())
    }
}

/// Sleeps for `delay_ms`, then echoes its input.
#[derive(Debug, Clone)]
pub struct DelayProcessor {
    delay: Duration,
}

impl DelayProcessor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, String> {
        let delay_ms = match config.extra.get("delay_ms") {
            None => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| "'delay_ms' must be a non-negative integer".to_string())?,
        };
        Ok(Self::new(Duration::from_millis(delay_ms)))
    }
}

#[async_trait]
impl Processor for DelayProcessor {
    fn name(&self) -> &str {
        "delay"
    }

    async fn process(&self, input: &DataMap, _context: &AgentContext) -> Result<DataMap, ProcessError> {
        tokio::time::sleep(self.delay).await;
        Ok(input.clone())
    }
}

/// Always fails with `message`.
#[derive(Debug, Clone)]
pub struct FailProcessor {
    message: String,
}

impl FailProcessor {
    pub fn from_config(config: &AgentConfig) -> Result<Self, String> {
        let message = config
            .extra
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("configured to fail")
            .to_string();
        Ok(Self { message })
    }
}

#[async_trait]
impl Processor for FailProcessor {
    fn name(&self) -> &str {
        "fail"
    }

    async fn process(&self, _input: &DataMap, _context: &AgentContext) -> Result<DataMap, ProcessError> {
        Err(self.message.clone().into())
    }
}

fn wrap<P: Processor + 'static>(processor: P, config: &AgentConfig) -> Arc<dyn Agent> {
    Arc::new(BaseAgent::from_config(processor, config))
}

/// Installs the builtin agents into `registry`.
pub fn register_builtin_agents(registry: &mut AgentRegistry) {
    registry
        .register_with_options("echo", &["fields"], |config| {
            Ok(wrap(EchoProcessor::from_config(config)?, config))
        })
        .register_with_options("constant", &["values"], |config| {
            Ok(wrap(ConstantProcessor::from_config(config)?, config))
        })
        .register_with_options("delay", &["delay_ms"], |config| {
            Ok(wrap(DelayProcessor::from_config(config)?, config))
        })
        .register_with_options("fail", &["message"], |config| {
            Ok(wrap(FailProcessor::from_config(config)?, config))
        });
}
