// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use tinyclaw_model::{ToolCallRequest, ToolSchema};

use crate::tool::{ResultDisposition, Tool, ToolCtx, ToolOutput};

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas for every registered tool, name-sorted for stable prompts.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_owner_only(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.owner_only()).unwrap_or(false)
    }

    pub fn is_self_gated(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.self_gated()).unwrap_or(false)
    }

    pub fn disposition(&self, name: &str) -> ResultDisposition {
        self.tools
            .get(name)
            .map(|t| t.disposition())
            .unwrap_or_default()
    }

    pub async fn execute(&self, call: &ToolCallRequest, ctx: &ToolCtx) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call, ctx).await,
            None => ToolOutput::err(format!("unknown tool: {}", call.name)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    struct EchoTool {
        name: &'static str,
        owner_only: bool,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its arguments"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn owner_only(&self) -> bool {
            self.owner_only
        }
        async fn execute(&self, call: &ToolCallRequest, _ctx: &ToolCtx) -> ToolOutput {
            ToolOutput::ok(format!("echo:{}", call.arguments))
        }
    }

    fn ctx() -> ToolCtx {
        ToolCtx { caller_id: "owner".into(), owner_id: "owner".into() }
    }

    #[tokio::test]
    async fn dispatch_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo", owner_only: false });

        let call = ToolCallRequest { id: "c1".into(), name: "echo".into(), arguments: json!({"x": 1}) };
        let out = reg.execute(&call, &ctx()).await;
        assert!(!out.is_error);
        assert!(out.content.contains("\"x\":1"));
    }

    #[tokio::test]
    async fn unknown_tool_is_error_output() {
        let reg = ToolRegistry::new();
        let call = ToolCallRequest { id: "c1".into(), name: "nope".into(), arguments: json!({}) };
        let out = reg.execute(&call, &ctx()).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[test]
    fn schemas_are_name_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta", owner_only: false });
        reg.register(EchoTool { name: "alpha", owner_only: true });

        let names: Vec<String> = reg.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(reg.is_owner_only("alpha"));
        assert!(!reg.is_owner_only("zeta"));
        assert!(!reg.is_owner_only("missing"));
    }
}
