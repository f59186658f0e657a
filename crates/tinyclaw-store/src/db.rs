// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to the agent database.
///
/// A single connection behind a mutex: statements are short and SQLite in WAL
/// mode lets readers in other processes overlap writers. Callers share the
/// store via `Arc<Store>`.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?;
        // WAL so searches and writes from concurrent turns can overlap.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn)
    }

    pub(crate) fn with_mut<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        f(&mut conn)
    }

    fn init_schema(&self) -> Result<()> {
        self.with(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    tool_calls TEXT,
                    tool_call_id TEXT,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_messages_user_ts
                    ON messages(user_id, created_at);

                CREATE TABLE IF NOT EXISTS compactions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    replaced_before INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_compactions_user
                    ON compactions(user_id, created_at DESC);

                CREATE TABLE IF NOT EXISTS sub_agents (
                    id TEXT PRIMARY KEY,
                    owner_user_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    system_prompt TEXT NOT NULL,
                    tools_granted TEXT NOT NULL DEFAULT '[]',
                    tier_preference TEXT,
                    status TEXT NOT NULL DEFAULT 'active',
                    total_tasks INTEGER NOT NULL DEFAULT 0,
                    successful_tasks INTEGER NOT NULL DEFAULT 0,
                    performance_score REAL NOT NULL DEFAULT 0,
                    template_id TEXT,
                    created_at INTEGER NOT NULL,
                    last_active_at INTEGER NOT NULL,
                    deleted_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_sub_agents_owner
                    ON sub_agents(owner_user_id, status);

                CREATE TABLE IF NOT EXISTS role_templates (
                    id TEXT PRIMARY KEY,
                    owner_user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    role_description TEXT NOT NULL,
                    default_tools TEXT NOT NULL DEFAULT '[]',
                    default_tier TEXT,
                    times_used INTEGER NOT NULL DEFAULT 0,
                    avg_performance REAL NOT NULL DEFAULT 0,
                    tags TEXT NOT NULL DEFAULT '[]',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_templates_owner
                    ON role_templates(owner_user_id);

                CREATE TABLE IF NOT EXISTS background_tasks (
                    id TEXT PRIMARY KEY,
                    owner_user_id TEXT NOT NULL,
                    agent_id TEXT NOT NULL,
                    description TEXT NOT NULL,
                    status TEXT NOT NULL,
                    result TEXT,
                    started_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    delivered_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_owner_status
                    ON background_tasks(owner_user_id, status);

                CREATE TABLE IF NOT EXISTS episodic_memory (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    content TEXT NOT NULL,
                    outcome TEXT,
                    importance REAL NOT NULL DEFAULT 0.5,
                    access_count INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    last_accessed_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_memory_user
                    ON episodic_memory(user_id, created_at DESC);

                CREATE VIRTUAL TABLE IF NOT EXISTS episodic_fts USING fts5(
                    content,
                    content='episodic_memory',
                    content_rowid='rowid'
                );
                CREATE TRIGGER IF NOT EXISTS episodic_ai AFTER INSERT ON episodic_memory BEGIN
                    INSERT INTO episodic_fts(rowid, content) VALUES (new.rowid, new.content);
                END;
                CREATE TRIGGER IF NOT EXISTS episodic_ad AFTER DELETE ON episodic_memory BEGIN
                    INSERT INTO episodic_fts(episodic_fts, rowid, content)
                        VALUES ('delete', old.rowid, old.content);
                END;
                CREATE TRIGGER IF NOT EXISTS episodic_au AFTER UPDATE OF content ON episodic_memory BEGIN
                    INSERT INTO episodic_fts(episodic_fts, rowid, content)
                        VALUES ('delete', old.rowid, old.content);
                    INSERT INTO episodic_fts(rowid, content) VALUES (new.rowid, new.content);
                END;

                CREATE TABLE IF NOT EXISTS task_metrics (
                    id TEXT PRIMARY KEY,
                    owner_user_id TEXT NOT NULL,
                    task_type TEXT NOT NULL,
                    tier TEXT NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    iterations INTEGER NOT NULL,
                    success INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_metrics_type_tier
                    ON task_metrics(task_type, tier, created_at);

                CREATE TABLE IF NOT EXISTS blackboard (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )?;
            Ok(())
        })
    }

    // ── Blackboard ───────────────────────────────────────────────────────────

    pub fn blackboard_set(&self, key: &str, value: &str) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO blackboard (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                rusqlite::params![key, value, now_ms()],
            )?;
            Ok(())
        })
    }

    pub fn blackboard_get(&self, key: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        self.with(|conn| {
            let v = conn
                .query_row(
                    "SELECT value FROM blackboard WHERE key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(v)
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_on_fresh_db() {
        let store = Store::open_in_memory().unwrap();
        store
            .with(|conn| {
                let n: i64 = conn.query_row("SELECT count(*) FROM messages", [], |r| r.get(0))?;
                assert_eq!(n, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn open_is_idempotent_on_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.db");
        drop(Store::open(&path).unwrap());
        drop(Store::open(&path).unwrap());
    }

    #[test]
    fn blackboard_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.blackboard_set("k", "v1").unwrap();
        store.blackboard_set("k", "v2").unwrap();
        assert_eq!(store.blackboard_get("k").unwrap().as_deref(), Some("v2"));
        assert_eq!(store.blackboard_get("missing").unwrap(), None);
    }
}
