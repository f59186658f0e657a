// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persistent security state (`security.db`).
//!
//! Holds everything authentication needs to survive a restart: the owner id,
//! credential hashes (session token, TOTP secret, backup codes, recovery
//! token), per-IP permanent blocks, and recovery attempt counters. Kept in
//! its own database file so conversation data and credentials have separate
//! blast radii.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::now_ms;

pub struct SecurityStore {
    conn: Mutex<Connection>,
}

impl SecurityStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening security database {}", path.display()))?;
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
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

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("security mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ip_blocks (
                ip TEXT PRIMARY KEY,
                permanent INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recovery_attempts (
                ip TEXT PRIMARY KEY,
                failures INTEGER NOT NULL DEFAULT 0,
                last_failure_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // ── Key-value (credential hashes, owner id) ──────────────────────────────

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("security mutex poisoned");
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, now_ms()],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("security mutex poisoned");
        let v = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |r| r.get(0))
            .optional()?;
        Ok(v)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("security mutex poisoned");
        let n = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(n > 0)
    }

    // ── IP blocks ────────────────────────────────────────────────────────────

    pub fn block_ip(&self, ip: &str) -> Result<()> {
        let conn = self.conn.lock().expect("security mutex poisoned");
        conn.execute(
            "INSERT INTO ip_blocks (ip, permanent, created_at) VALUES (?1, 1, ?2)
             ON CONFLICT(ip) DO UPDATE SET permanent = 1",
            params![ip, now_ms()],
        )?;
        Ok(())
    }

    pub fn is_ip_blocked(&self, ip: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("security mutex poisoned");
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM ip_blocks WHERE ip = ?1 AND permanent = 1",
            [ip],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    // ── Recovery attempt counters ────────────────────────────────────────────

    /// Record a failed recovery attempt; returns the new lifetime failure count.
    pub fn record_recovery_failure(&self, ip: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("security mutex poisoned");
        conn.execute(
            "INSERT INTO recovery_attempts (ip, failures, last_failure_at) VALUES (?1, 1, ?2)
             ON CONFLICT(ip) DO UPDATE SET failures = failures + 1, last_failure_at = ?2",
            params![ip, now_ms()],
        )?;
        let n = conn.query_row(
            "SELECT failures FROM recovery_attempts WHERE ip = ?1",
            [ip],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn recovery_failures(&self, ip: &str) -> Result<(i64, i64)> {
        let conn = self.conn.lock().expect("security mutex poisoned");
        let row = conn
            .query_row(
                "SELECT failures, last_failure_at FROM recovery_attempts WHERE ip = ?1",
                [ip],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row.unwrap_or((0, 0)))
    }

    pub fn clear_recovery_failures(&self, ip: &str) -> Result<()> {
        let conn = self.conn.lock().expect("security mutex poisoned");
        conn.execute("DELETE FROM recovery_attempts WHERE ip = ?1", [ip])?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_round_trip() {
        let s = SecurityStore::open_in_memory().unwrap();
        s.put("owner_id", "alice").unwrap();
        assert_eq!(s.get("owner_id").unwrap().as_deref(), Some("alice"));
        assert!(s.delete("owner_id").unwrap());
        assert_eq!(s.get("owner_id").unwrap(), None);
    }

    #[test]
    fn recovery_failures_accumulate_and_clear() {
        let s = SecurityStore::open_in_memory().unwrap();
        assert_eq!(s.record_recovery_failure("1.2.3.4").unwrap(), 1);
        assert_eq!(s.record_recovery_failure("1.2.3.4").unwrap(), 2);
        let (n, _) = s.recovery_failures("1.2.3.4").unwrap();
        assert_eq!(n, 2);
        s.clear_recovery_failures("1.2.3.4").unwrap();
        assert_eq!(s.recovery_failures("1.2.3.4").unwrap().0, 0);
    }

    #[test]
    fn permanent_block_sticks() {
        let s = SecurityStore::open_in_memory().unwrap();
        assert!(!s.is_ip_blocked("5.6.7.8").unwrap());
        s.block_ip("5.6.7.8").unwrap();
        assert!(s.is_ip_blocked("5.6.7.8").unwrap());
    }
}
