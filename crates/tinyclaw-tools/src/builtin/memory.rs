// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tinyclaw_memory::{EventType, MemoryEngine};
use tinyclaw_model::ToolCallRequest;

use crate::tool::{optional_str, required_str, ResultDisposition, Tool, ToolCtx, ToolOutput};

/// Persist one fact, preference, or correction into episodic memory.
pub struct MemoryAddTool {
    memory: Arc<MemoryEngine>,
}

impl MemoryAddTool {
    pub fn new(memory: Arc<MemoryEngine>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryAddTool {
    fn name(&self) -> &str {
        "memory_add"
    }

    fn description(&self) -> &str {
        "Store a fact, preference, or correction in long-term memory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "What to remember" },
                "category": {
                    "type": "string",
                    "enum": ["facts", "preferences", "corrections"],
                    "description": "Kind of memory"
                },
                "importance": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, call: &ToolCallRequest, ctx: &ToolCtx) -> ToolOutput {
        let content = match required_str(&call.arguments, "content") {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(e),
        };
        let event_type = match optional_str(&call.arguments, "category") {
            Some("preferences") => EventType::PreferenceLearned,
            Some("corrections") => EventType::Correction,
            _ => EventType::FactStored,
        };
        let importance = call.arguments.get("importance").and_then(|v| v.as_f64());

        match self
            .memory
            .record_event(&ctx.caller_id, event_type, content, None, importance)
        {
            Ok(rec) => ToolOutput::ok(format!("Stored memory {}", rec.id)),
            Err(e) => ToolOutput::err(format!("memory write failed: {e:#}")),
        }
    }
}

/// Search episodic memory; results are narrated back by the model.
pub struct MemorySearchTool {
    memory: Arc<MemoryEngine>,
}

impl MemorySearchTool {
    pub fn new(memory: Arc<MemoryEngine>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory for relevant facts and preferences."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 20 }
            },
            "required": ["query"]
        })
    }

    fn disposition(&self) -> ResultDisposition {
        ResultDisposition::Narrate
    }

    async fn execute(&self, call: &ToolCallRequest, ctx: &ToolCtx) -> ToolOutput {
        let query = match required_str(&call.arguments, "query") {
            Ok(q) => q,
            Err(e) => return ToolOutput::err(e),
        };
        let limit = call
            .arguments
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(5) as usize;

        match self.memory.search(&ctx.caller_id, query, limit) {
            Ok(hits) if hits.is_empty() => ToolOutput::ok("No matching memories."),
            Ok(hits) => {
                let mut out = String::new();
                for hit in &hits {
                    out.push_str(&format!(
                        "- [{}] {}\n",
                        hit.record.event_type.as_str(),
                        hit.record.content
                    ));
                    let _ = self.memory.reinforce(&hit.record.id);
                }
                ToolOutput::ok(out)
            }
            Err(e) => ToolOutput::err(format!("memory search failed: {e:#}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tinyclaw_store::Store;

    fn tools() -> (MemoryAddTool, MemorySearchTool) {
        let memory = Arc::new(MemoryEngine::new(
            Arc::new(Store::open_in_memory().unwrap()),
            tinyclaw_config::MemoryConfig::default(),
        ));
        (MemoryAddTool::new(memory.clone()), MemorySearchTool::new(memory))
    }

    fn ctx(caller: &str) -> ToolCtx {
        ToolCtx { caller_id: caller.into(), owner_id: "owner".into() }
    }

    fn call(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest { id: "c1".into(), name: name.into(), arguments: args }
    }

    #[tokio::test]
    async fn add_then_search_round_trip() {
        let (add, search) = tools();
        let out = add
            .execute(
                &call("memory_add", json!({"content": "Owner lives in Manila", "category": "facts"})),
                &ctx("owner"),
            )
            .await;
        assert!(!out.is_error);

        let found = search
            .execute(&call("memory_search", json!({"query": "Manila"})), &ctx("owner"))
            .await;
        assert!(found.content.contains("Manila"));
    }

    #[tokio::test]
    async fn memories_are_scoped_to_caller() {
        let (add, search) = tools();
        add.execute(
            &call("memory_add", json!({"content": "guest secret"})),
            &ctx("friend:alice"),
        )
        .await;

        let owner_view = search
            .execute(&call("memory_search", json!({"query": "guest secret"})), &ctx("owner"))
            .await;
        assert_eq!(owner_view.content, "No matching memories.");
    }

    #[tokio::test]
    async fn missing_content_is_an_argument_error() {
        let (add, _) = tools();
        let out = add.execute(&call("memory_add", json!({})), &ctx("owner")).await;
        assert!(out.is_error);
        assert!(out.content.contains("content"));
    }
}
