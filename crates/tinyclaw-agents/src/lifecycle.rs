// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use tinyclaw_store::{now_ms, AgentStatus, Store, SubAgentRecord};

use crate::keyword_overlap;

/// Minimum role-text overlap for an existing agent to be reused.
const REUSE_THRESHOLD: f64 = 0.6;

const ORIENTATION: &str = "\
You are a persistent sub-agent working on behalf of your owner. \
Stay strictly within your role. Report results as plain, complete text; \
your final message is delivered back verbatim. Do not invent tools you \
were not granted.";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("active sub-agent capacity reached ({0} of {0}); dismiss one first")]
    CapacityExceeded(usize),
    #[error("sub-agent not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct CreateAgentConfig {
    pub owner_user_id: String,
    pub role: String,
    pub tools_granted: Vec<String>,
    pub tier_preference: Option<String>,
    pub template_id: Option<String>,
}

pub struct SubAgentManager {
    store: Arc<Store>,
    cfg: tinyclaw_config::AgentsConfig,
}

impl SubAgentManager {
    pub fn new(store: Arc<Store>, cfg: tinyclaw_config::AgentsConfig) -> Self {
        Self { store, cfg }
    }

    /// Create a new sub-agent, enforcing the per-owner active cap.
    pub fn create(&self, cfg: CreateAgentConfig) -> Result<SubAgentRecord, LifecycleError> {
        let active = self.store.count_active_sub_agents(&cfg.owner_user_id)?;
        if active as usize >= self.cfg.max_active_per_user {
            return Err(LifecycleError::CapacityExceeded(self.cfg.max_active_per_user));
        }

        let rec = SubAgentRecord {
            id: Uuid::new_v4().to_string(),
            owner_user_id: cfg.owner_user_id,
            system_prompt: format!("{ORIENTATION}\n\nYour role: {}", cfg.role),
            role: cfg.role,
            tools_granted: cfg.tools_granted,
            tier_preference: cfg.tier_preference,
            status: AgentStatus::Active,
            total_tasks: 0,
            successful_tasks: 0,
            performance_score: 0.0,
            template_id: cfg.template_id,
            created_at: now_ms(),
            last_active_at: now_ms(),
            deleted_at: None,
        };
        self.store.insert_sub_agent(&rec)?;
        info!(agent = %rec.id, role = %rec.role, "sub-agent created");
        Ok(rec)
    }

    /// Best existing agent for a role, searched across every status so a
    /// suspended or soft-deleted specialist can be revived instead of
    /// recreated. Returns the highest-overlap candidate at or above the
    /// reuse threshold.
    pub fn find_reusable(
        &self,
        owner: &str,
        role_text: &str,
    ) -> Result<Option<SubAgentRecord>, LifecycleError> {
        let mut best: Option<(f64, SubAgentRecord)> = None;
        for agent in self.store.list_sub_agents(owner)? {
            let score = keyword_overlap(&agent.role, role_text);
            debug!(agent = %agent.id, score, "reuse candidate");
            if score >= REUSE_THRESHOLD {
                match &best {
                    Some((current, _)) if *current >= score => {}
                    _ => best = Some((score, agent)),
                }
            }
        }
        Ok(best.map(|(_, agent)| agent))
    }

    pub fn get(&self, id: &str) -> Result<SubAgentRecord, LifecycleError> {
        self.store
            .get_sub_agent(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    pub fn list(&self, owner: &str) -> Result<Vec<SubAgentRecord>, LifecycleError> {
        Ok(self.store.list_sub_agents(owner)?)
    }

    pub fn record_task_result(&self, id: &str, success: bool) -> Result<(), LifecycleError> {
        if !self.store.record_sub_agent_task(id, success)? {
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Park the agent; data and counters are kept.
    pub fn suspend(&self, id: &str) -> Result<(), LifecycleError> {
        self.transition(id, AgentStatus::Suspended)
    }

    /// Soft delete; retained until the cleanup purge.
    pub fn dismiss(&self, id: &str) -> Result<(), LifecycleError> {
        self.transition(id, AgentStatus::SoftDeleted)
    }

    /// Restore to active from either suspended or soft-deleted.
    pub fn revive(&self, id: &str) -> Result<(), LifecycleError> {
        self.transition(id, AgentStatus::Active)
    }

    fn transition(&self, id: &str, status: AgentStatus) -> Result<(), LifecycleError> {
        if !self.store.set_sub_agent_status(id, status)? {
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Hard delete: the agent's private message stream and row go together.
    pub fn kill(&self, id: &str) -> Result<(), LifecycleError> {
        if !self.store.purge_sub_agent(id)? {
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        info!(agent = %id, "sub-agent killed");
        Ok(())
    }

    /// Retention sweep: suspended agents idle past their retention become
    /// soft-deleted; soft-deleted agents past theirs are purged.
    /// Returns (archived, purged).
    pub fn cleanup(&self) -> Result<(usize, usize), LifecycleError> {
        const DAY_MS: i64 = 24 * 60 * 60 * 1000;
        let now = now_ms();

        let mut archived = 0usize;
        let idle_cutoff = now - self.cfg.suspended_retention_days * DAY_MS;
        for agent in self.store.suspended_sub_agents_idle_before(idle_cutoff)? {
            self.store.set_sub_agent_status(&agent.id, AgentStatus::SoftDeleted)?;
            archived += 1;
        }

        let mut purged = 0usize;
        let delete_cutoff = now - self.cfg.deleted_retention_days * DAY_MS;
        for agent in self.store.soft_deleted_sub_agents_before(delete_cutoff)? {
            self.store.purge_sub_agent(&agent.id)?;
            purged += 1;
        }

        if archived + purged > 0 {
            info!(archived, purged, "sub-agent cleanup");
        }
        Ok((archived, purged))
    }

    /// Startup sweep: suspend every active agent with no running background
    /// task. Prevents ghost agents from accumulating across restarts.
    pub fn sweep_ghosts(&self) -> Result<usize, LifecycleError> {
        let ghosts = self.store.active_sub_agents_without_running_task()?;
        let count = ghosts.len();
        for agent in ghosts {
            self.store.set_sub_agent_status(&agent.id, AgentStatus::Suspended)?;
        }
        if count > 0 {
            info!(count, "suspended ghost sub-agents at startup");
        }
        Ok(count)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
