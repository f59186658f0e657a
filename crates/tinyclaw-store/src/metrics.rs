// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use rusqlite::params;
use uuid::Uuid;

use crate::db::{now_ms, Store};

/// One completed task's runtime characteristics, used by the timeout
/// estimator's percentile queries.
#[derive(Debug, Clone)]
pub struct TaskMetric {
    pub id: String,
    pub owner_user_id: String,
    pub task_type: String,
    pub tier: String,
    pub duration_ms: i64,
    pub iterations: i64,
    pub success: bool,
    pub created_at: i64,
}

impl Store {
    pub fn insert_task_metric(
        &self,
        owner: &str,
        task_type: &str,
        tier: &str,
        duration_ms: i64,
        iterations: i64,
        success: bool,
    ) -> Result<TaskMetric> {
        let rec = TaskMetric {
            id: Uuid::new_v4().to_string(),
            owner_user_id: owner.to_string(),
            task_type: task_type.to_string(),
            tier: tier.to_string(),
            duration_ms,
            iterations,
            success,
            created_at: now_ms(),
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO task_metrics
                     (id, owner_user_id, task_type, tier, duration_ms, iterations, success, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rec.id,
                    rec.owner_user_id,
                    rec.task_type,
                    rec.tier,
                    rec.duration_ms,
                    rec.iterations,
                    rec.success as i64,
                    rec.created_at,
                ],
            )?;
            Ok(())
        })?;
        Ok(rec)
    }

    /// Metrics for a (task_type, tier) pair recorded at or after `since_ms`.
    pub fn task_metrics_since(
        &self,
        task_type: &str,
        tier: &str,
        since_ms: i64,
    ) -> Result<Vec<TaskMetric>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_user_id, task_type, tier, duration_ms, iterations, success, created_at
                 FROM task_metrics
                 WHERE task_type = ?1 AND tier = ?2 AND created_at >= ?3
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![task_type, tier, since_ms], |row| {
                    let success: i64 = row.get(6)?;
                    Ok(TaskMetric {
                        id: row.get(0)?,
                        owner_user_id: row.get(1)?,
                        task_type: row.get(2)?,
                        tier: row.get(3)?,
                        duration_ms: row.get(4)?,
                        iterations: row.get(5)?,
                        success: success != 0,
                        created_at: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_filter_by_type_tier_and_window() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_task_metric("owner", "research", "complex", 20_000, 5, true)
            .unwrap();
        store
            .insert_task_metric("owner", "code", "complex", 40_000, 8, true)
            .unwrap();

        let hits = store.task_metrics_since("research", "complex", 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].duration_ms, 20_000);

        let future = store
            .task_metrics_since("research", "complex", now_ms() + 60_000)
            .unwrap();
        assert!(future.is_empty());
    }
}
