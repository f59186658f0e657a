// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{ChatProvider, Message, ProviderReply, Role, ToolSchema};

/// Deterministic mock provider. Echoes the last user message back as the
/// assistant response. Used as the zero-config fallback and in tests.
pub struct MockProvider {
    id: String,
}

impl MockProvider {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        "mock-model"
    }

    async fn chat(&self, messages: &[Message], _tools: &[ToolSchema]) -> anyhow::Result<ProviderReply> {
        let reply = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("[no input]");
        Ok(ProviderReply::Text(format!("MOCK: {reply}")))
    }

    async fn is_available(&self) -> bool {
        true
    }
}

/// A pre-scripted provider. Each `chat` call pops the next reply from the
/// front of the queue, so tests can specify exact sequences (including tool
/// calls) without network access.
pub struct ScriptedProvider {
    id: String,
    replies: Mutex<VecDeque<ProviderReply>>,
    available: AtomicBool,
    /// Every request seen by this provider, for assertion by tests.
    pub requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl ScriptedProvider {
    pub fn new(id: &str, replies: Vec<ProviderReply>) -> Self {
        Self {
            id: id.to_string(),
            replies: Mutex::new(replies.into()),
            available: AtomicBool::new(true),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of scripted replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        "scripted-model"
    }

    async fn chat(&self, messages: &[Message], _tools: &[ToolSchema]) -> anyhow::Result<ProviderReply> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted provider exhausted"))
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
