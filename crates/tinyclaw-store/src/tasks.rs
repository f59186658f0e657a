// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::{now_ms, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Delivered,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Delivered => "delivered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "delivered" => Some(TaskStatus::Delivered),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Delivered)
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundTaskRecord {
    pub id: String,
    pub owner_user_id: String,
    pub agent_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub delivered_at: Option<i64>,
}

impl Store {
    pub fn insert_background_task(
        &self,
        owner: &str,
        agent_id: &str,
        description: &str,
    ) -> Result<BackgroundTaskRecord> {
        let rec = BackgroundTaskRecord {
            id: Uuid::new_v4().to_string(),
            owner_user_id: owner.to_string(),
            agent_id: agent_id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Running,
            result: None,
            started_at: now_ms(),
            completed_at: None,
            delivered_at: None,
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO background_tasks
                     (id, owner_user_id, agent_id, description, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
                params![rec.id, rec.owner_user_id, rec.agent_id, rec.description, rec.started_at],
            )?;
            Ok(())
        })?;
        Ok(rec)
    }

    pub fn get_background_task(&self, id: &str) -> Result<Option<BackgroundTaskRecord>> {
        self.with(|conn| {
            let rec = conn
                .query_row(&format!("{SELECT_TASK} WHERE id = ?1"), [id], row_to_task)
                .optional()?;
            Ok(rec)
        })
    }

    /// Terminal transition from `running`. A task that is already terminal is
    /// left untouched (returns false).
    pub fn complete_background_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(matches!(status, TaskStatus::Completed | TaskStatus::Failed));
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE background_tasks SET status = ?2, result = ?3, completed_at = ?4
                 WHERE id = ?1 AND status = 'running'",
                params![id, status.as_str(), result, now_ms()],
            )?;
            Ok(n > 0)
        })
    }

    /// Terminal tasks not yet surfaced to the owner.
    pub fn undelivered_background_tasks(&self, owner: &str) -> Result<Vec<BackgroundTaskRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_TASK}
                 WHERE owner_user_id = ?1
                   AND status IN ('completed', 'failed')
                   AND delivered_at IS NULL
                 ORDER BY completed_at ASC"
            ))?;
            let rows = stmt
                .query_map([owner], row_to_task)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }

    /// Exactly-once delivery marker: the stamp only succeeds the first time.
    pub fn mark_background_task_delivered(&self, id: &str) -> Result<bool> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE background_tasks SET status = 'delivered', delivered_at = ?2
                 WHERE id = ?1 AND status IN ('completed', 'failed') AND delivered_at IS NULL",
                params![id, now_ms()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn list_background_tasks(&self, owner: &str) -> Result<Vec<BackgroundTaskRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_TASK} WHERE owner_user_id = ?1 ORDER BY started_at DESC"
            ))?;
            let rows = stmt
                .query_map([owner], row_to_task)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }

    /// Mark as failed every `running` task started before `cutoff_ms`.
    pub fn fail_stale_background_tasks(&self, cutoff_ms: i64) -> Result<usize> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE background_tasks
                 SET status = 'failed', result = 'task timed out (stale)', completed_at = ?2
                 WHERE status = 'running' AND started_at < ?1",
                params![cutoff_ms, now_ms()],
            )?;
            Ok(n)
        })
    }

    pub fn running_background_tasks(&self) -> Result<Vec<BackgroundTaskRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_TASK} WHERE status = 'running'"))?;
            let rows = stmt
                .query_map([], row_to_task)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }
}

const SELECT_TASK: &str =
    "SELECT id, owner_user_id, agent_id, description, status, result,
            started_at, completed_at, delivered_at
     FROM background_tasks";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackgroundTaskRecord> {
    let status_str: String = row.get(4)?;
    Ok(BackgroundTaskRecord {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        agent_id: row.get(2)?,
        description: row.get(3)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        result: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        delivered_at: row.get(8)?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_is_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        let task = store.insert_background_task("owner", "a1", "research").unwrap();
        store
            .complete_background_task(&task.id, TaskStatus::Completed, Some("findings"))
            .unwrap();

        let undelivered = store.undelivered_background_tasks("owner").unwrap();
        assert_eq!(undelivered.len(), 1);

        assert!(store.mark_background_task_delivered(&task.id).unwrap());
        assert!(!store.mark_background_task_delivered(&task.id).unwrap());
        assert!(store.undelivered_background_tasks("owner").unwrap().is_empty());
    }

    #[test]
    fn terminal_status_cannot_be_overwritten() {
        let store = Store::open_in_memory().unwrap();
        let task = store.insert_background_task("owner", "a1", "x").unwrap();
        assert!(store
            .complete_background_task(&task.id, TaskStatus::Failed, Some("boom"))
            .unwrap());
        assert!(!store
            .complete_background_task(&task.id, TaskStatus::Completed, Some("late"))
            .unwrap());

        let rec = store.get_background_task(&task.id).unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Failed);
    }

    #[test]
    fn stale_running_tasks_fail() {
        let store = Store::open_in_memory().unwrap();
        store.insert_background_task("owner", "a1", "slow").unwrap();
        let n = store.fail_stale_background_tasks(now_ms() + 1_000).unwrap();
        assert_eq!(n, 1);
        assert!(store.running_background_tasks().unwrap().is_empty());
    }
}
