// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use rusqlite::params;
use uuid::Uuid;

use crate::db::{now_ms, Store};

/// Message timestamps must be strictly increasing so the persisted order is
/// the submission order even when appends land within the same millisecond.
fn next_message_ts() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let mut candidate = now_ms();
    loop {
        let prev = LAST.load(Ordering::SeqCst);
        if candidate <= prev {
            candidate = prev + 1;
        }
        if LAST
            .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return candidate;
        }
    }
}

/// One persisted message. `user_id` is the stream key: `"<principal>"` for
/// conversations, `"subagent:<id>"` for a sub-agent's private history.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub user_id: String,
    pub role: String,
    pub content: String,
    pub tool_calls: Option<String>,
    pub tool_call_id: Option<String>,
    pub created_at: i64,
}

impl Store {
    /// Append a message to a stream. Messages are never mutated afterwards.
    pub fn append_message(
        &self,
        user_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> Result<MessageRecord> {
        let rec = MessageRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            tool_calls: tool_calls.map(|s| s.to_string()),
            tool_call_id: tool_call_id.map(|s| s.to_string()),
            created_at: next_message_ts(),
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO messages (id, user_id, role, content, tool_calls, tool_call_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rec.id,
                    rec.user_id,
                    rec.role,
                    rec.content,
                    rec.tool_calls,
                    rec.tool_call_id,
                    rec.created_at
                ],
            )?;
            Ok(())
        })?;
        Ok(rec)
    }

    /// Most recent `limit` messages at or after `after_ts`, oldest first.
    pub fn recent_messages(&self, user_id: &str, limit: usize, after_ts: i64) -> Result<Vec<MessageRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, role, content, tool_calls, tool_call_id, created_at
                 FROM messages
                 WHERE user_id = ?1 AND created_at >= ?2
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3",
            )?;
            let mut rows: Vec<MessageRecord> = stmt
                .query_map(params![user_id, after_ts, limit as i64], row_to_message)?
                .collect::<std::result::Result<_, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    /// All messages in a stream older than `before_ts`, oldest first.
    pub fn messages_before(&self, user_id: &str, before_ts: i64) -> Result<Vec<MessageRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, role, content, tool_calls, tool_call_id, created_at
                 FROM messages
                 WHERE user_id = ?1 AND created_at < ?2
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![user_id, before_ts], row_to_message)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }

    pub fn message_count(&self, user_id: &str) -> Result<i64> {
        self.with(|conn| {
            let n = conn.query_row(
                "SELECT count(*) FROM messages WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )?;
            Ok(n)
        })
    }

    /// Delete an entire stream. Used when a sub-agent is killed.
    pub fn delete_stream(&self, user_id: &str) -> Result<usize> {
        self.with(|conn| {
            let n = conn.execute("DELETE FROM messages WHERE user_id = ?1", [user_id])?;
            Ok(n)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        tool_calls: row.get(4)?,
        tool_call_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
