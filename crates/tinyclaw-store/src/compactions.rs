// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::{now_ms, Store};

/// A compaction checkpoint. For context assembly, the latest record replaces
/// every message strictly older than `replaced_before`.
#[derive(Debug, Clone)]
pub struct CompactionRecord {
    pub id: String,
    pub user_id: String,
    pub summary: String,
    pub replaced_before: i64,
    pub created_at: i64,
}

impl Store {
    pub fn insert_compaction(
        &self,
        user_id: &str,
        summary: &str,
        replaced_before: i64,
    ) -> Result<CompactionRecord> {
        let rec = CompactionRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            summary: summary.to_string(),
            replaced_before,
            created_at: now_ms(),
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO compactions (id, user_id, summary, replaced_before, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![rec.id, rec.user_id, rec.summary, rec.replaced_before, rec.created_at],
            )?;
            Ok(())
        })?;
        Ok(rec)
    }

    pub fn latest_compaction(&self, user_id: &str) -> Result<Option<CompactionRecord>> {
        self.with(|conn| {
            let rec = conn
                .query_row(
                    "SELECT id, user_id, summary, replaced_before, created_at
                     FROM compactions
                     WHERE user_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1",
                    [user_id],
                    |row| {
                        Ok(CompactionRecord {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            summary: row.get(2)?,
                            replaced_before: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(rec)
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
