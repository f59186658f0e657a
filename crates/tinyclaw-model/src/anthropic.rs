// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages API backend.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{ChatProvider, Message, ProviderReply, Role, ToolCallRequest, ToolSchema};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    id: String,
    model: String,
    api_key: String,
    messages_url: String,
    models_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(id: &str, model: &str, api_key: String, base_url: &str, max_tokens: Option<u32>) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            id: id.to_string(),
            model: model.to_string(),
            api_key,
            messages_url: format!("{base}/v1/messages"),
            models_url: format!("{base}/v1/models"),
            max_tokens: max_tokens.unwrap_or(4096),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, messages: &[Message], tools: &[ToolSchema]) -> Value {
        // Anthropic takes the system prompt as a top-level field, not a message.
        let system: String = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let wire: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                Role::Tool => json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.as_deref().unwrap_or(""),
                        "content": m.content,
                    }]
                }),
                Role::Assistant if !m.tool_calls.is_empty() => json!({
                    "role": "assistant",
                    "content": m.tool_calls.iter().map(|c| json!({
                        "type": "tool_use",
                        "id": c.id,
                        "name": c.name,
                        "input": c.arguments,
                    })).collect::<Vec<_>>(),
                }),
                role => json!({
                    "role": role.as_str(),
                    "content": m.content,
                }),
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": wire,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolSchema]) -> anyhow::Result<ProviderReply> {
        let body = self.build_body(messages, tools);
        debug!(provider = %self.id, "anthropic chat request");

        let resp = self
            .client
            .post(&self.messages_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .context("provider request failed")?;
        let status = resp.status();
        let text = resp.text().await.context("reading provider response")?;
        if !status.is_success() {
            bail!("provider returned {status}: {text}");
        }

        let v: Value = serde_json::from_str(&text).context("parsing provider response")?;
        parse_reply(&v)
    }

    async fn is_available(&self) -> bool {
        let req = self
            .client
            .get(&self.models_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(Duration::from_secs(2));
        matches!(req.send().await, Ok(r) if r.status().is_success())
    }
}

fn parse_reply(v: &Value) -> anyhow::Result<ProviderReply> {
    let blocks = v
        .get("content")
        .and_then(|c| c.as_array())
        .context("response missing content array")?;

    let tool_calls: Vec<ToolCallRequest> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
        .filter_map(|b| {
            Some(ToolCallRequest {
                id: b.get("id")?.as_str()?.to_string(),
                name: b.get("name")?.as_str()?.to_string(),
                arguments: b.get("input").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();
    if !tool_calls.is_empty() {
        return Ok(ProviderReply::ToolCalls(tool_calls));
    }

    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");
    Ok(ProviderReply::Text(text))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
