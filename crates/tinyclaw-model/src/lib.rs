// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod anthropic;
mod classifier;
mod mock;
mod openai_compat;
mod provider;
mod registry;
mod sanitize;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};

pub use classifier::{classify, Classification};
pub use mock::{MockProvider, ScriptedProvider};
pub use openai_compat::OpenAiCompatProvider;
pub use anthropic::AnthropicProvider;
pub use provider::ChatProvider;
pub use registry::{ProviderRegistry, Route};
pub use sanitize::{EmDashFilter, FilterChain, OutputFilter, WhitespaceFilter};
pub use types::{Message, ProviderReply, Role, Tier, ToolCallRequest, ToolSchema};

/// Build a provider instance from one named config entry.
pub fn from_config(id: &str, cfg: &tinyclaw_config::ProviderConfig) -> anyhow::Result<Arc<dyn ChatProvider>> {
    let api_key = match (&cfg.api_key, &cfg.api_key_env) {
        (Some(k), _) => Some(k.clone()),
        (None, Some(env)) => std::env::var(env).ok(),
        (None, None) => None,
    };

    match cfg.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiCompatProvider::new(
            id,
            &cfg.name,
            api_key,
            cfg.base_url.as_deref().unwrap_or("https://api.openai.com/v1"),
            cfg.max_tokens,
            cfg.temperature,
        ))),
        "anthropic" => {
            let key = api_key.context("anthropic provider requires an API key")?;
            Ok(Arc::new(AnthropicProvider::new(
                id,
                &cfg.name,
                key,
                cfg.base_url.as_deref().unwrap_or("https://api.anthropic.com"),
                cfg.max_tokens,
            )))
        }
        "mock" => Ok(Arc::new(MockProvider::new(id))),
        other => bail!("unknown provider protocol: {other}"),
    }
}

/// Build the full registry from config: every named provider plus the tier map.
pub fn build_registry(cfg: &tinyclaw_config::Config) -> anyhow::Result<ProviderRegistry> {
    let mut providers: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
    for (id, pc) in &cfg.providers {
        providers.insert(id.clone(), from_config(id, pc)?);
    }
    if providers.is_empty() {
        // A registry with no providers cannot serve a turn; fall back to a
        // mock so the rest of the runtime can still start (CI, first boot).
        providers.insert("default".into(), Arc::new(MockProvider::new("default")));
    }

    let mut registry = ProviderRegistry::new(providers, &cfg.model.default)?;
    for (tier, key) in [
        (Tier::Simple, &cfg.model.simple),
        (Tier::Moderate, &cfg.model.moderate),
        (Tier::Complex, &cfg.model.complex),
        (Tier::Reasoning, &cfg.model.reasoning),
    ] {
        if let Some(id) = key {
            registry.map_tier(tier, id)?;
        }
    }
    Ok(registry)
}
