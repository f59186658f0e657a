// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{Message, ProviderReply, ToolSchema};

/// A language-model backend.
///
/// The orchestrator never branches on provider identity: everything it needs
/// is behind this trait. `chat` is a single request/response round; streaming
/// to the end user is handled above this layer by the event sink.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stable id used in the tier map and config (e.g. `"anthropic_main"`).
    fn id(&self) -> &str;

    /// Human-readable name for status display.
    fn name(&self) -> &str;

    /// Send the conversation and the available tool schemas, returning either
    /// free text or a batch of tool calls.
    async fn chat(&self, messages: &[Message], tools: &[ToolSchema]) -> anyhow::Result<ProviderReply>;

    /// Cheap liveness probe used by health-aware routing. A `false` here only
    /// influences routing; the actual call is still allowed to proceed and
    /// fail with a useful error.
    async fn is_available(&self) -> bool;
}
