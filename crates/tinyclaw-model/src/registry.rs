// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider registry: tiered routing with health-aware failover.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use tracing::{debug, warn};

use crate::{classify, ChatProvider, Classification, Tier};

/// The routing outcome for one inbound message.
pub struct Route {
    pub provider: Arc<dyn ChatProvider>,
    pub classification: Classification,
    /// True when every registered provider failed its availability probe and
    /// the default was returned anyway.
    pub failed_over: bool,
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    tiers: HashMap<Tier, String>,
    default_id: String,
}

impl ProviderRegistry {
    /// Build a registry. `default_id` must name a registered provider; when it
    /// does not (e.g. config names a tier map entry that was never defined)
    /// the lexicographically first provider becomes the default.
    pub fn new(
        providers: HashMap<String, Arc<dyn ChatProvider>>,
        default_id: &str,
    ) -> anyhow::Result<Self> {
        if providers.is_empty() {
            bail!("provider registry requires at least one provider");
        }
        let default_id = if providers.contains_key(default_id) {
            default_id.to_string()
        } else {
            let mut ids: Vec<&String> = providers.keys().collect();
            ids.sort();
            warn!(
                requested = default_id,
                fallback = %ids[0],
                "default provider not registered, using first"
            );
            ids[0].clone()
        };
        Ok(Self { providers, tiers: HashMap::new(), default_id })
    }

    pub fn map_tier(&mut self, tier: Tier, provider_id: &str) -> anyhow::Result<()> {
        if !self.providers.contains_key(provider_id) {
            bail!("tier {tier} maps to unregistered provider {provider_id}");
        }
        self.tiers.insert(tier, provider_id.to_string());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn default_provider(&self) -> Arc<dyn ChatProvider> {
        self.providers[&self.default_id].clone()
    }

    /// Provider mapped for a tier, falling back to the default.
    pub fn for_tier(&self, tier: Tier) -> Arc<dyn ChatProvider> {
        self.tiers
            .get(&tier)
            .and_then(|id| self.providers.get(id))
            .cloned()
            .unwrap_or_else(|| self.default_provider())
    }

    /// Classify the message, pick the tier's provider, and probe health.
    ///
    /// On probe failure, iterate the remaining providers in stable (sorted id)
    /// order. If every probe fails, the default is returned with
    /// `failed_over = true`; the turn must never be short-circuited just
    /// because a probe failed; the actual call is allowed to fail with a
    /// useful error instead.
    pub async fn route_with_health(&self, message: &str) -> Route {
        let classification = classify(message);
        let preferred = self.for_tier(classification.tier);

        if preferred.is_available().await {
            return Route { provider: preferred, classification, failed_over: false };
        }
        debug!(provider = preferred.id(), "preferred provider unavailable, probing others");

        let mut ids: Vec<&String> = self.providers.keys().collect();
        ids.sort();
        for id in ids {
            if *id == preferred.id() {
                continue;
            }
            let candidate = &self.providers[id];
            if candidate.is_available().await {
                return Route {
                    provider: candidate.clone(),
                    classification,
                    failed_over: false,
                };
            }
        }

        warn!("all providers failed availability probes, returning default");
        Route {
            provider: self.default_provider(),
            classification,
            failed_over: true,
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProviderReply, ScriptedProvider};

    fn registry_with(entries: Vec<(&str, Arc<ScriptedProvider>)>, default: &str) -> ProviderRegistry {
        let providers: HashMap<String, Arc<dyn ChatProvider>> = entries
            .into_iter()
            .map(|(id, p)| (id.to_string(), p as Arc<dyn ChatProvider>))
            .collect();
        ProviderRegistry::new(providers, default).unwrap()
    }

    fn scripted(id: &str) -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(id, vec![ProviderReply::Text("ok".into())]))
    }

    #[tokio::test]
    async fn healthy_tier_provider_is_selected() {
        let fast = scripted("fast");
        let big = scripted("big");
        let mut reg = registry_with(vec![("fast", fast), ("big", big)], "fast");
        reg.map_tier(Tier::Complex, "big").unwrap();

        let route = reg.route_with_health("research the history of sqlite").await;
        assert_eq!(route.provider.id(), "big");
        assert!(!route.failed_over);
    }

    #[tokio::test]
    async fn unhealthy_provider_fails_over_in_stable_order() {
        let a = scripted("alpha");
        let b = scripted("beta");
        b.set_available(false);
        let mut reg = registry_with(vec![("alpha", a), ("beta", b)], "alpha");
        reg.map_tier(Tier::Complex, "beta").unwrap();

        let route = reg.route_with_health("research something").await;
        assert_eq!(route.provider.id(), "alpha");
        assert!(!route.failed_over);
    }

    #[tokio::test]
    async fn all_unhealthy_returns_default_with_flag() {
        let a = scripted("alpha");
        let b = scripted("beta");
        a.set_available(false);
        b.set_available(false);
        let reg = registry_with(vec![("alpha", a), ("beta", b)], "beta");

        let route = reg.route_with_health("hello").await;
        assert_eq!(route.provider.id(), "beta");
        assert!(route.failed_over);
    }

    #[tokio::test]
    async fn unset_tier_falls_back_to_default() {
        let a = scripted("only");
        let reg = registry_with(vec![("only", a)], "only");
        let route = reg.route_with_health("prove this theorem").await;
        assert_eq!(route.provider.id(), "only");
        assert_eq!(route.classification.tier, Tier::Reasoning);
    }
}
