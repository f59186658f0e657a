// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use tinyclaw_store::{now_ms, RoleTemplateRecord, Store};

use crate::keyword_overlap;

/// Minimum overlap between a role description and a template for
/// `find_best_match` to consider it.
const MATCH_THRESHOLD: f64 = 0.4;

#[derive(Debug, Error)]
pub enum TemplateError {
    /// Non-fatal by contract: the caller reports it and continues.
    #[error("template limit reached ({0}); delete unused templates first")]
    LimitReached(usize),
    #[error("template not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct TemplateStore {
    store: Arc<Store>,
    cfg: tinyclaw_config::AgentsConfig,
}

impl TemplateStore {
    pub fn new(store: Arc<Store>, cfg: tinyclaw_config::AgentsConfig) -> Self {
        Self { store, cfg }
    }

    pub fn create(
        &self,
        owner: &str,
        name: &str,
        role_description: &str,
        default_tools: Vec<String>,
        default_tier: Option<String>,
        tags: Vec<String>,
    ) -> Result<RoleTemplateRecord, TemplateError> {
        let count = self.store.count_templates(owner)?;
        if count as usize >= self.cfg.max_templates_per_user {
            return Err(TemplateError::LimitReached(self.cfg.max_templates_per_user));
        }

        let rec = RoleTemplateRecord {
            id: Uuid::new_v4().to_string(),
            owner_user_id: owner.to_string(),
            name: name.to_string(),
            role_description: role_description.to_string(),
            default_tools,
            default_tier,
            times_used: 0,
            avg_performance: 0.0,
            tags,
            created_at: now_ms(),
            updated_at: now_ms(),
        };
        self.store.insert_template(&rec)?;
        Ok(rec)
    }

    pub fn list(&self, owner: &str) -> Result<Vec<RoleTemplateRecord>, TemplateError> {
        Ok(self.store.list_templates(owner)?)
    }

    pub fn update(
        &self,
        id: &str,
        name: Option<&str>,
        role_description: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<(), TemplateError> {
        if !self.store.update_template(id, name, role_description, tags)? {
            return Err(TemplateError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), TemplateError> {
        if !self.store.delete_template(id)? {
            return Err(TemplateError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Fold one outcome score into the template's rolling average.
    pub fn record_usage(&self, id: &str, score: f64) -> Result<(), TemplateError> {
        if !self.store.record_template_usage(id, score.clamp(0.0, 1.0))? {
            return Err(TemplateError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Highest-overlap template at or above the match threshold; overlap ties
    /// prefer the higher rolling performance.
    pub fn find_best_match(
        &self,
        owner: &str,
        text: &str,
    ) -> Result<Option<RoleTemplateRecord>, TemplateError> {
        let mut best: Option<(f64, RoleTemplateRecord)> = None;
        for tpl in self.store.list_templates(owner)? {
            let haystack = format!("{} {}", tpl.name, tpl.role_description);
            let score = keyword_overlap(&haystack, text);
            if score < MATCH_THRESHOLD {
                continue;
            }
            let better = match &best {
                None => true,
                Some((s, t)) => {
                    score > *s
                        || ((score - s).abs() < f64::EPSILON
                            && tpl.avg_performance > t.avg_performance)
                }
            };
            if better {
                best = Some((score, tpl));
            }
        }
        Ok(best.map(|(_, tpl)| tpl))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
