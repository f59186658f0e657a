// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tinyclaw_model::ToolCallRequest;
use tinyclaw_sandbox::{ExecuteOptions, Sandbox};

use crate::tool::{optional_str, required_str, Tool, ToolCtx, ToolOutput};

/// Run untrusted JavaScript in the sandbox. Owner-only; the shield usually
/// additionally gates this behind an approval.
pub struct ExecuteCodeTool {
    sandbox: Arc<Sandbox>,
}

impl ExecuteCodeTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn name(&self) -> &str {
        "execute_code"
    }

    fn description(&self) -> &str {
        "Evaluate JavaScript in an isolated sandbox with no filesystem or network access."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string" },
                "input": { "type": "string", "description": "Optional data bound as `input`" },
                "timeout_ms": { "type": "integer", "minimum": 100, "maximum": 30000 }
            },
            "required": ["code"]
        })
    }

    fn owner_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCallRequest, _ctx: &ToolCtx) -> ToolOutput {
        let code = match required_str(&call.arguments, "code") {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(e),
        };
        let opts = ExecuteOptions {
            timeout_ms: call.arguments.get("timeout_ms").and_then(|v| v.as_u64()),
        };

        let result = match optional_str(&call.arguments, "input") {
            Some(input) => self.sandbox.execute_with_input(code, input, opts).await,
            None => self.sandbox.execute(code, opts).await,
        };

        if result.success {
            ToolOutput::ok(format!(
                "{} ({}ms)",
                result.output.unwrap_or_else(|| "undefined".into()),
                result.duration_ms
            ))
        } else {
            ToolOutput::err(result.error.unwrap_or_else(|| "execution failed".into()))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ExecuteCodeTool {
        ExecuteCodeTool::new(Arc::new(Sandbox::new(
            tinyclaw_config::SandboxConfig::default(),
        )))
    }

    fn ctx() -> ToolCtx {
        ToolCtx { caller_id: "owner".into(), owner_id: "owner".into() }
    }

    #[tokio::test]
    async fn evaluates_code_with_input() {
        let call = ToolCallRequest {
            id: "c1".into(),
            name: "execute_code".into(),
            arguments: json!({"code": "input.length", "input": "four"}),
        };
        let out = tool().execute(&call, &ctx()).await;
        assert!(!out.is_error);
        assert!(out.content.starts_with('4'));
    }

    #[tokio::test]
    async fn sandbox_errors_surface_as_tool_errors() {
        let call = ToolCallRequest {
            id: "c1".into(),
            name: "execute_code".into(),
            arguments: json!({"code": "nope("}),
        };
        let out = tool().execute(&call, &ctx()).await;
        assert!(out.is_error);
    }
}
