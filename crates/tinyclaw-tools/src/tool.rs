// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

use tinyclaw_model::{ToolCallRequest, ToolSchema};

/// Who is asking. Built by the orchestrator per call.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    /// The calling principal (owner id or `friend:<name>`).
    pub caller_id: String,
    /// The instance's owner id.
    pub owner_id: String,
}

impl ToolCtx {
    pub fn is_owner(&self) -> bool {
        self.caller_id == self.owner_id
    }
}

/// Structured outcome of a delegation tool, so the orchestrator never has to
/// scrape ids out of prose (the regex fallback still exists for providers
/// that mangle tool results).
#[derive(Debug, Clone)]
pub struct DelegationOutcome {
    pub agent_id: String,
    pub task_id: Option<String>,
    pub background: bool,
}

/// What the orchestrator does with a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultDisposition {
    /// Feed the result back to the model and let it narrate
    /// (read/search/recall/list and delegation tools).
    Narrate,
    /// Return a short fixed human summary immediately.
    #[default]
    Summarize,
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    pub delegation: Option<DelegationOutcome>,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false, delegation: None }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self { content: format!("Error: {}", msg.into()), is_error: true, delegation: None }
    }

    pub fn delegated(content: impl Into<String>, outcome: DelegationOutcome) -> Self {
        Self { content: content.into(), is_error: false, delegation: Some(outcome) }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    /// Owner-only tools are refused for guests before any policy evaluation.
    fn owner_only(&self) -> bool {
        false
    }

    /// Self-gated tools manage their own confirmation flow: the shield's
    /// `require_approval` is skipped for them. `block` still applies.
    fn self_gated(&self) -> bool {
        false
    }

    fn disposition(&self) -> ResultDisposition {
        ResultDisposition::default()
    }

    async fn execute(&self, call: &ToolCallRequest, ctx: &ToolCtx) -> ToolOutput;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Extract a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing required argument: {key}"))
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}
