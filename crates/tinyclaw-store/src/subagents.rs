// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use crate::db::{now_ms, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Active,
    Suspended,
    SoftDeleted,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Suspended => "suspended",
            AgentStatus::SoftDeleted => "soft_deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AgentStatus::Active),
            "suspended" => Some(AgentStatus::Suspended),
            "soft_deleted" => Some(AgentStatus::SoftDeleted),
            _ => None,
        }
    }
}

/// A persistent role-scoped worker.
///
/// Invariants maintained by the write paths here:
/// `performance_score = successful_tasks / total_tasks` whenever
/// `total_tasks > 0`, and `deleted_at` is non-null iff the status is
/// `soft_deleted`.
#[derive(Debug, Clone)]
pub struct SubAgentRecord {
    pub id: String,
    pub owner_user_id: String,
    pub role: String,
    pub system_prompt: String,
    pub tools_granted: Vec<String>,
    pub tier_preference: Option<String>,
    pub status: AgentStatus,
    pub total_tasks: i64,
    pub successful_tasks: i64,
    pub performance_score: f64,
    pub template_id: Option<String>,
    pub created_at: i64,
    pub last_active_at: i64,
    pub deleted_at: Option<i64>,
}

impl Store {
    pub fn insert_sub_agent(&self, rec: &SubAgentRecord) -> Result<()> {
        let tools = serde_json::to_string(&rec.tools_granted)?;
        self.with(|conn| {
            conn.execute(
                "INSERT INTO sub_agents (id, owner_user_id, role, system_prompt, tools_granted,
                     tier_preference, status, total_tasks, successful_tasks, performance_score,
                     template_id, created_at, last_active_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    rec.id,
                    rec.owner_user_id,
                    rec.role,
                    rec.system_prompt,
                    tools,
                    rec.tier_preference,
                    rec.status.as_str(),
                    rec.total_tasks,
                    rec.successful_tasks,
                    rec.performance_score,
                    rec.template_id,
                    rec.created_at,
                    rec.last_active_at,
                    rec.deleted_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_sub_agent(&self, id: &str) -> Result<Option<SubAgentRecord>> {
        self.with(|conn| {
            let rec = conn
                .query_row(
                    &format!("{SELECT_AGENT} WHERE id = ?1"),
                    [id],
                    row_to_agent,
                )
                .optional()?;
            Ok(rec)
        })
    }

    /// All sub-agents for an owner, newest first. Includes soft-deleted rows
    /// so history views can show them.
    pub fn list_sub_agents(&self, owner: &str) -> Result<Vec<SubAgentRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_AGENT} WHERE owner_user_id = ?1 ORDER BY created_at DESC"
            ))?;
            let rows = stmt
                .query_map([owner], row_to_agent)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_active_sub_agents(&self, owner: &str) -> Result<i64> {
        self.with(|conn| {
            let n = conn.query_row(
                "SELECT count(*) FROM sub_agents WHERE owner_user_id = ?1 AND status = 'active'",
                [owner],
                |r| r.get(0),
            )?;
            Ok(n)
        })
    }

    /// Status transition. Sets or clears `deleted_at` to keep the
    /// soft-deleted invariant.
    pub fn set_sub_agent_status(&self, id: &str, status: AgentStatus) -> Result<bool> {
        let deleted_at = match status {
            AgentStatus::SoftDeleted => Some(now_ms()),
            _ => None,
        };
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE sub_agents SET status = ?2, deleted_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), deleted_at],
            )?;
            Ok(n > 0)
        })
    }

    /// Atomically fold one task outcome into the counters.
    pub fn record_sub_agent_task(&self, id: &str, success: bool) -> Result<bool> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE sub_agents SET
                     total_tasks = total_tasks + 1,
                     successful_tasks = successful_tasks + ?2,
                     performance_score = CAST(successful_tasks + ?2 AS REAL) / (total_tasks + 1),
                     last_active_at = ?3
                 WHERE id = ?1",
                params![id, if success { 1 } else { 0 }, now_ms()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn touch_sub_agent(&self, id: &str) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE sub_agents SET last_active_at = ?2 WHERE id = ?1",
                params![id, now_ms()],
            )?;
            Ok(())
        })
    }

    /// Hard delete: purge the agent's private message stream and its row in
    /// one transaction.
    pub fn purge_sub_agent(&self, id: &str) -> Result<bool> {
        self.with_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE user_id = ?1",
                [format!("subagent:{id}")],
            )?;
            let n = tx.execute("DELETE FROM sub_agents WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(n > 0)
        })
    }

    /// Suspended agents idle since before `cutoff_ms`.
    pub fn suspended_sub_agents_idle_before(&self, cutoff_ms: i64) -> Result<Vec<SubAgentRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_AGENT} WHERE status = 'suspended' AND last_active_at < ?1"
            ))?;
            let rows = stmt
                .query_map([cutoff_ms], row_to_agent)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }

    /// Soft-deleted agents whose `deleted_at` precedes `cutoff_ms`.
    pub fn soft_deleted_sub_agents_before(&self, cutoff_ms: i64) -> Result<Vec<SubAgentRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_AGENT} WHERE status = 'soft_deleted'
                 AND deleted_at IS NOT NULL AND deleted_at < ?1"
            ))?;
            let rows = stmt
                .query_map([cutoff_ms], row_to_agent)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }

    /// Active agents with no running background task. Used by the startup
    /// sweep that suspends ghost agents left over from a previous process.
    pub fn active_sub_agents_without_running_task(&self) -> Result<Vec<SubAgentRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_AGENT} WHERE status = 'active' AND id NOT IN
                     (SELECT agent_id FROM background_tasks WHERE status = 'running')"
            ))?;
            let rows = stmt
                .query_map([], row_to_agent)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }
}

const SELECT_AGENT: &str =
    "SELECT id, owner_user_id, role, system_prompt, tools_granted, tier_preference, status,
            total_tasks, successful_tasks, performance_score, template_id,
            created_at, last_active_at, deleted_at
     FROM sub_agents";

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubAgentRecord> {
    let tools_json: String = row.get(4)?;
    let status_str: String = row.get(6)?;
    Ok(SubAgentRecord {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        role: row.get(2)?,
        system_prompt: row.get(3)?,
        tools_granted: serde_json::from_str(&tools_json).unwrap_or_default(),
        tier_preference: row.get(5)?,
        status: AgentStatus::parse(&status_str).unwrap_or(AgentStatus::Active),
        total_tasks: row.get(7)?,
        successful_tasks: row.get(8)?,
        performance_score: row.get(9)?,
        template_id: row.get(10)?,
        created_at: row.get(11)?,
        last_active_at: row.get(12)?,
        deleted_at: row.get(13)?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, owner: &str) -> SubAgentRecord {
        SubAgentRecord {
            id: id.to_string(),
            owner_user_id: owner.to_string(),
            role: "Research Analyst".into(),
            system_prompt: "You are a research analyst.".into(),
            tools_granted: vec!["memory_search".into()],
            tier_preference: Some("complex".into()),
            status: AgentStatus::Active,
            total_tasks: 0,
            successful_tasks: 0,
            performance_score: 0.0,
            template_id: None,
            created_at: now_ms(),
            last_active_at: now_ms(),
            deleted_at: None,
        }
    }

    #[test]
    fn performance_score_tracks_counters() {
        let store = Store::open_in_memory().unwrap();
        store.insert_sub_agent(&sample("a1", "owner")).unwrap();

        store.record_sub_agent_task("a1", true).unwrap();
        store.record_sub_agent_task("a1", true).unwrap();
        store.record_sub_agent_task("a1", false).unwrap();

        let rec = store.get_sub_agent("a1").unwrap().unwrap();
        assert_eq!(rec.total_tasks, 3);
        assert_eq!(rec.successful_tasks, 2);
        assert!((rec.performance_score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn soft_delete_sets_deleted_at_and_revive_clears_it() {
        let store = Store::open_in_memory().unwrap();
        store.insert_sub_agent(&sample("a1", "owner")).unwrap();

        store.set_sub_agent_status("a1", AgentStatus::SoftDeleted).unwrap();
        let rec = store.get_sub_agent("a1").unwrap().unwrap();
        assert_eq!(rec.status, AgentStatus::SoftDeleted);
        assert!(rec.deleted_at.is_some());

        store.set_sub_agent_status("a1", AgentStatus::Active).unwrap();
        let rec = store.get_sub_agent("a1").unwrap().unwrap();
        assert_eq!(rec.status, AgentStatus::Active);
        assert!(rec.deleted_at.is_none());
    }

    #[test]
    fn purge_removes_row_and_messages() {
        let store = Store::open_in_memory().unwrap();
        store.insert_sub_agent(&sample("a1", "owner")).unwrap();
        store
            .append_message("subagent:a1", "assistant", "hi", None, None)
            .unwrap();

        assert!(store.purge_sub_agent("a1").unwrap());
        assert!(store.get_sub_agent("a1").unwrap().is_none());
        assert_eq!(store.message_count("subagent:a1").unwrap(), 0);
    }

    #[test]
    fn ghost_sweep_query_skips_agents_with_running_tasks() {
        let store = Store::open_in_memory().unwrap();
        store.insert_sub_agent(&sample("busy", "owner")).unwrap();
        store.insert_sub_agent(&sample("idle", "owner")).unwrap();
        store
            .insert_background_task("owner", "busy", "long research")
            .unwrap();

        let ghosts = store.active_sub_agents_without_running_task().unwrap();
        let ids: Vec<&str> = ghosts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["idle"]);
    }
}
