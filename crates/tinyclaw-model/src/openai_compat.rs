// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible chat completion backend.
//!
//! Many hosted and local servers (OpenAI, OpenRouter, Groq, Ollama, vLLM,
//! LM Studio) speak the same `/chat/completions` wire format. One provider
//! type covers them all; only the base URL and key differ.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{ChatProvider, Message, ProviderReply, Role, ToolCallRequest, ToolSchema};

pub struct OpenAiCompatProvider {
    id: String,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    models_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: &str,
        model: &str,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            id: id.to_string(),
            model: model.to_string(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            models_url: format!("{base}/models"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.7),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, messages: &[Message], tools: &[ToolSchema]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": build_wire_messages(messages),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[Message], tools: &[ToolSchema]) -> anyhow::Result<ProviderReply> {
        let body = self.build_body(messages, tools);
        debug!(provider = %self.id, url = %self.chat_url, "chat request");

        let mut req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("provider request failed")?;
        let status = resp.status();
        let text = resp.text().await.context("reading provider response")?;
        if !status.is_success() {
            bail!("provider returned {status}: {text}");
        }

        let v: Value = serde_json::from_str(&text).context("parsing provider response")?;
        parse_reply(&v)
    }

    async fn is_available(&self) -> bool {
        let mut req = self
            .client
            .get(&self.models_url)
            .timeout(Duration::from_secs(2));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        matches!(req.send().await, Ok(r) if r.status().is_success())
    }
}

/// Map internal messages onto the OpenAI wire shape.
fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.as_deref().unwrap_or(""),
                "content": m.content,
            }),
            Role::Assistant if !m.tool_calls.is_empty() => json!({
                "role": "assistant",
                "content": m.content,
                "tool_calls": m.tool_calls.iter().map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": c.arguments.to_string(),
                    }
                })).collect::<Vec<_>>(),
            }),
            role => json!({
                "role": role.as_str(),
                "content": m.content,
            }),
        })
        .collect()
}

fn parse_reply(v: &Value) -> anyhow::Result<ProviderReply> {
    let message = v
        .pointer("/choices/0/message")
        .context("response missing choices[0].message")?;

    if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
        if !calls.is_empty() {
            let parsed: Vec<ToolCallRequest> = calls
                .iter()
                .filter_map(|c| {
                    let name = c.pointer("/function/name")?.as_str()?.to_string();
                    let raw_args = c.pointer("/function/arguments")?.as_str().unwrap_or("{}");
                    let arguments = serde_json::from_str(raw_args).unwrap_or(Value::Null);
                    Some(ToolCallRequest {
                        id: c.get("id").and_then(|i| i.as_str()).unwrap_or("").to_string(),
                        name,
                        arguments,
                    })
                })
                .collect();
            if !parsed.is_empty() {
                return Ok(ProviderReply::ToolCalls(parsed));
            }
        }
    }

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();
    Ok(ProviderReply::Text(content))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_map_tool_role() {
        let msgs = vec![Message::tool_result("c1", "done")];
        let wire = build_wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "c1");
    }

    #[test]
    fn wire_messages_serialize_tool_call_arguments_as_string() {
        let msgs = vec![Message::assistant_tool_calls(vec![ToolCallRequest {
            id: "c1".into(),
            name: "echo".into(),
            arguments: json!({"x": 1}),
        }])];
        let wire = build_wire_messages(&msgs);
        let args = wire[0]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        assert!(args.contains("\"x\":1"));
    }

    #[test]
    fn parse_reply_prefers_tool_calls() {
        let v = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "memory_add", "arguments": "{\"content\":\"hi\"}"}
                }]
            }}]
        });
        match parse_reply(&v).unwrap() {
            ProviderReply::ToolCalls(calls) => {
                assert_eq!(calls[0].name, "memory_add");
                assert_eq!(calls[0].arguments["content"], "hi");
            }
            ProviderReply::Text(_) => panic!("expected tool calls"),
        }
    }

    #[test]
    fn parse_reply_falls_back_to_text() {
        let v = json!({"choices": [{"message": {"content": "hello"}}]});
        match parse_reply(&v).unwrap() {
            ProviderReply::Text(t) => assert_eq!(t, "hello"),
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let p = OpenAiCompatProvider::new("x", "m", None, "http://host/v1/", None, None);
        assert_eq!(p.chat_url, "http://host/v1/chat/completions");
    }
}
