// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A single message in the conversation stream. Append-only once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool calls attached to an assistant message (structured branch).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Links a `tool` role message back to the call it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: text.into(), tool_calls: Vec::new(), tool_call_id: None }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into(), tool_calls: Vec::new(), tool_call_id: None }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into(), tool_calls: Vec::new(), tool_call_id: None }
    }
    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self { role: Role::Assistant, content: String::new(), tool_calls: calls, tool_call_id: None }
    }
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Rough token estimate: 4 characters per token.
    pub fn approx_tokens(&self) -> usize {
        self.content.len() / 4
            + self
                .tool_calls
                .iter()
                .map(|c| (c.name.len() + c.arguments.to_string().len()) / 4)
                .sum::<usize>()
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Opaque identifier (forwarded verbatim when the provider supplied one).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments. Untyped per-tool; validated at dispatch.
    pub arguments: Value,
}

/// What the model produced for one completion call.
#[derive(Debug, Clone)]
pub enum ProviderReply {
    Text(String),
    ToolCalls(Vec<ToolCallRequest>),
}

impl ProviderReply {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ProviderReply::Text(t) => Some(t),
            ProviderReply::ToolCalls(_) => None,
        }
    }
}

/// Tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Query complexity tier used for provider routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Simple,
    Moderate,
    Complex,
    Reasoning,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Simple => "simple",
            Tier::Moderate => "moderate",
            Tier::Complex => "complex",
            Tier::Reasoning => "reasoning",
        }
    }

    pub const ALL: [Tier; 4] = [Tier::Simple, Tier::Moderate, Tier::Complex, Tier::Reasoning];
}

impl std::str::FromStr for Tier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Tier::Simple),
            "moderate" => Ok(Tier::Moderate),
            "complex" => Ok(Tier::Complex),
            "reasoning" => Ok(Tier::Reasoning),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_tokens_counts_tool_call_payload() {
        let m = Message::assistant_tool_calls(vec![ToolCallRequest {
            id: "c1".into(),
            name: "memory_add".into(),
            arguments: serde_json::json!({"content": "abcdefgh"}),
        }]);
        assert!(m.approx_tokens() > 0);
    }

    #[test]
    fn tier_round_trips_through_str() {
        for t in Tier::ALL {
            assert_eq!(t.as_str().parse::<Tier>().unwrap(), t);
        }
    }

    #[test]
    fn tool_result_links_call_id() {
        let m = Message::tool_result("call-9", "ok");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-9"));
    }
}
