// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tinyclaw_agents::SubAgentManager;
use tinyclaw_model::ToolCallRequest;

use crate::tool::{ResultDisposition, Tool, ToolCtx, ToolOutput};

/// List the owner's sub-agents with status and performance, newest first.
pub struct ListSubAgentsTool {
    manager: Arc<SubAgentManager>,
}

impl ListSubAgentsTool {
    pub fn new(manager: Arc<SubAgentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for ListSubAgentsTool {
    fn name(&self) -> &str {
        "list_subagents"
    }

    fn description(&self) -> &str {
        "List existing sub-agents with their status and track record."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn owner_only(&self) -> bool {
        true
    }

    fn disposition(&self) -> ResultDisposition {
        ResultDisposition::Narrate
    }

    async fn execute(&self, _call: &ToolCallRequest, ctx: &ToolCtx) -> ToolOutput {
        match self.manager.list(&ctx.owner_id) {
            Ok(agents) if agents.is_empty() => ToolOutput::ok("No sub-agents yet."),
            Ok(agents) => {
                let mut out = String::new();
                for a in agents {
                    out.push_str(&format!(
                        "- {} [{}] {} ({}/{} tasks, score {:.2})\n",
                        a.role,
                        a.status.as_str(),
                        a.id,
                        a.successful_tasks,
                        a.total_tasks,
                        a.performance_score,
                    ));
                }
                ToolOutput::ok(out)
            }
            Err(e) => ToolOutput::err(format!("listing sub-agents: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
