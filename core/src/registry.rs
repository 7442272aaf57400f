//! Tool Registry (§4.2): a static, in-process map from `tool_type` to a
//! registered tool body plus its declared capabilities. Modeled on the
//! teacher's `ToolRegistry` (`agent/runtime/impls/tool_registry.rs`) —
//! a `HashMap` behind a thin lookup API, minus the shell-command safety
//! checks that belonged to that tool's own domain.

use std::collections::HashMap;
use std::sync::Arc;

use crate::contracts::{ToolBody, ToolRegistration};
use crate::error::{CoreError, CoreResult};

/// Immutable registry of available tools, built once at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolBody>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under its own declared `tool_type`.
    pub fn register(&mut self, tool: Arc<dyn ToolBody>) {
        let tool_type = tool.registration().tool_type;
        self.tools.insert(tool_type, tool);
    }

    pub fn has_tool(&self, tool_type: &str) -> bool {
        self.tools.contains_key(tool_type)
    }

    pub fn get(&self, tool_type: &str) -> CoreResult<Arc<dyn ToolBody>> {
        self.tools
            .get(tool_type)
            .cloned()
            .ok_or_else(|| CoreError::UnknownTool {
                tool_type: tool_type.to_string(),
            })
    }

    pub fn registration(&self, tool_type: &str) -> CoreResult<ToolRegistration> {
        Ok(self.get(tool_type)?.registration())
    }

    pub fn available_tools(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}
