//! Name -> backend table and the request-facing operations.
//!
//! The request layer hands over a tool name, a role, an optional resolved
//! path and the decoded options map. Everything else (option decoding,
//! dispatch) happens here.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::info;

use crate::backend::Backend;
use crate::config::AgentConfig;
use crate::error::EngineError;
use crate::model::{LaunchDescriptor, Role, SessionKey, TransferResult};
use crate::options::TransferOptions;
use crate::tool::TransferTool;
use crate::tools;

#[derive(Debug)]
pub struct Orchestrator {
    config: AgentConfig,
    backends: BTreeMap<&'static str, Backend>,
}

impl Orchestrator {
    /// Build an orchestrator with every built-in tool.
    pub fn new(config: AgentConfig) -> Self {
        Self::with_tools(config, tools::builtin())
    }

    /// Build an orchestrator from an explicit tool list.
    ///
    /// A later tool with the same name replaces an earlier one.
    pub fn with_tools(config: AgentConfig, tools: Vec<Box<dyn TransferTool>>) -> Self {
        let backends = tools
            .into_iter()
            .map(|tool| (tool.name(), Backend::new(tool, &config)))
            .collect();
        Orchestrator { config, backends }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Registered tool names, sorted.
    pub fn tools(&self) -> Vec<&'static str> {
        self.backends.keys().copied().collect()
    }

    pub fn backend(&self, tool: &str) -> Result<&Backend, EngineError> {
        self.backends.get(tool).ok_or_else(|| EngineError::UnknownTool {
            name: tool.to_string(),
        })
    }

    /// Start one end of a transfer.
    ///
    /// Receivers take their peer (or source directory) from the `address`
    /// key of the options map.
    pub fn create(
        &self,
        tool: &str,
        role: Role,
        file: Option<&Path>,
        options: &Map<String, Value>,
    ) -> Result<LaunchDescriptor, EngineError> {
        let backend = self.backend(tool)?;
        let decoded = TransferOptions::from_map(options)?;
        match role {
            Role::Sender => backend.run_sender(file, &decoded),
            Role::Receiver => {
                let address = options.get("address").and_then(Value::as_str);
                backend.run_receiver(address, file, &decoded)
            }
        }
    }

    pub fn poll(
        &self,
        tool: &str,
        role: Role,
        key: SessionKey,
        options: &Map<String, Value>,
    ) -> Result<TransferResult, EngineError> {
        let backend = self.backend(tool)?;
        let decoded = TransferOptions::from_map(options)?;
        backend.poll_progress(role, key, &decoded)
    }

    pub fn free_port(&self, tool: &str, key: SessionKey) -> Result<(), EngineError> {
        self.backend(tool)?.free_port(key)
    }

    pub fn cleanup(&self, tool: &str) -> Result<usize, EngineError> {
        Ok(self.backend(tool)?.cleanup())
    }

    /// Clean up every backend; returns the total number of sessions ended.
    pub fn cleanup_all(&self) -> usize {
        let total: usize = self.backends.values().map(Backend::cleanup).sum();
        info!(total, "cleaned up all backends");
        total
    }
}
