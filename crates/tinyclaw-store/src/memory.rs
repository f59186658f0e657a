// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::{now_ms, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    TaskCompleted,
    PreferenceLearned,
    Correction,
    DelegationResult,
    FactStored,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCompleted => "task_completed",
            EventType::PreferenceLearned => "preference_learned",
            EventType::Correction => "correction",
            EventType::DelegationResult => "delegation_result",
            EventType::FactStored => "fact_stored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task_completed" => Some(EventType::TaskCompleted),
            "preference_learned" => Some(EventType::PreferenceLearned),
            "correction" => Some(EventType::Correction),
            "delegation_result" => Some(EventType::DelegationResult),
            "fact_stored" => Some(EventType::FactStored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpisodicRecord {
    pub id: String,
    pub user_id: String,
    pub event_type: EventType,
    pub content: String,
    pub outcome: Option<String>,
    pub importance: f64,
    pub access_count: i64,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

/// One full-text hit with its raw FTS rank (bm25; lower is better).
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub record: EpisodicRecord,
    pub rank: f64,
}

impl Store {
    pub fn insert_episodic(
        &self,
        user_id: &str,
        event_type: EventType,
        content: &str,
        outcome: Option<&str>,
        importance: f64,
    ) -> Result<EpisodicRecord> {
        let rec = EpisodicRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            event_type,
            content: content.to_string(),
            outcome: outcome.map(|s| s.to_string()),
            importance,
            access_count: 0,
            created_at: now_ms(),
            last_accessed_at: now_ms(),
        };
        self.with(|conn| {
            conn.execute(
                "INSERT INTO episodic_memory
                     (id, user_id, event_type, content, outcome, importance, access_count,
                      created_at, last_accessed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
                params![
                    rec.id,
                    rec.user_id,
                    rec.event_type.as_str(),
                    rec.content,
                    rec.outcome,
                    rec.importance,
                    rec.created_at,
                    rec.last_accessed_at,
                ],
            )?;
            Ok(())
        })?;
        Ok(rec)
    }

    pub fn get_episodic(&self, id: &str) -> Result<Option<EpisodicRecord>> {
        self.with(|conn| {
            let rec = conn
                .query_row(&format!("{SELECT_MEM} WHERE m.id = ?1"), [id], row_to_episodic)
                .optional()?;
            Ok(rec)
        })
    }

    /// Full-text candidates for a query. The query string is tokenized and
    /// OR-joined so user text can never inject FTS5 syntax.
    pub fn fts_episodic(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<FtsHit>> {
        let fts_query = fts_escape(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.user_id, m.event_type, m.content, m.outcome, m.importance,
                        m.access_count, m.created_at, m.last_accessed_at,
                        bm25(episodic_fts) AS rank
                 FROM episodic_fts
                 JOIN episodic_memory m ON m.rowid = episodic_fts.rowid
                 WHERE episodic_fts MATCH ?1 AND m.user_id = ?2
                 ORDER BY rank ASC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![fts_query, user_id, limit as i64], |row| {
                    Ok(FtsHit { record: row_to_episodic(row)?, rank: row.get(9)? })
                })?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }

    pub fn all_episodic(&self, user_id: &str) -> Result<Vec<EpisodicRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_MEM} WHERE m.user_id = ?1 ORDER BY m.created_at ASC"
            ))?;
            let rows = stmt
                .query_map([user_id], row_to_episodic)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }

    /// Bump access statistics after a record influenced a reply.
    pub fn reinforce_episodic(&self, id: &str) -> Result<bool> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE episodic_memory
                 SET access_count = access_count + 1, last_accessed_at = ?2
                 WHERE id = ?1",
                params![id, now_ms()],
            )?;
            Ok(n > 0)
        })
    }

    /// Merge `loser` into `winner`: counts sum, importance takes the max,
    /// the loser's row is removed.
    pub fn merge_episodic(&self, winner_id: &str, loser_id: &str) -> Result<()> {
        self.with_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE episodic_memory SET
                     access_count = access_count +
                         (SELECT access_count FROM episodic_memory WHERE id = ?2),
                     importance = MAX(importance,
                         (SELECT importance FROM episodic_memory WHERE id = ?2))
                 WHERE id = ?1",
                params![winner_id, loser_id],
            )?;
            tx.execute("DELETE FROM episodic_memory WHERE id = ?1", [loser_id])?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn delete_episodic(&self, id: &str) -> Result<bool> {
        self.with(|conn| {
            let n = conn.execute("DELETE FROM episodic_memory WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    pub fn scale_episodic_importance(&self, id: &str, factor: f64) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE episodic_memory SET importance = importance * ?2 WHERE id = ?1",
                params![id, factor],
            )?;
            Ok(())
        })
    }
}

const SELECT_MEM: &str =
    "SELECT m.id, m.user_id, m.event_type, m.content, m.outcome, m.importance,
            m.access_count, m.created_at, m.last_accessed_at
     FROM episodic_memory m";

fn row_to_episodic(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpisodicRecord> {
    let type_str: String = row.get(2)?;
    Ok(EpisodicRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        event_type: EventType::parse(&type_str).unwrap_or(EventType::FactStored),
        content: row.get(3)?,
        outcome: row.get(4)?,
        importance: row.get(5)?,
        access_count: row.get(6)?,
        created_at: row.get(7)?,
        last_accessed_at: row.get(8)?,
    })
}

/// Reduce free text to a safe FTS5 query: quoted tokens joined with OR.
fn fts_escape(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_finds_matching_content() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_episodic("u1", EventType::FactStored, "owner lives in Manila", None, 0.5)
            .unwrap();
        store
            .insert_episodic("u1", EventType::FactStored, "favorite color is green", None, 0.5)
            .unwrap();

        let hits = store.fts_episodic("u1", "where does the owner live? Manila", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].record.content.contains("Manila"));
    }

    #[test]
    fn fts_is_scoped_per_user() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_episodic("u1", EventType::FactStored, "secret plans", None, 0.5)
            .unwrap();
        let hits = store.fts_episodic("u2", "secret plans", 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn fts_query_cannot_inject_syntax() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_episodic("u1", EventType::FactStored, "notes about sqlite", None, 0.5)
            .unwrap();
        // Raw quotes/parens would be an FTS5 syntax error if passed through.
        let hits = store.fts_episodic("u1", "sqlite\" OR (*", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn merge_sums_access_and_keeps_max_importance() {
        let store = Store::open_in_memory().unwrap();
        let a = store
            .insert_episodic("u1", EventType::FactStored, "likes coffee", None, 0.4)
            .unwrap();
        let b = store
            .insert_episodic("u1", EventType::FactStored, "likes coffee a lot", None, 0.9)
            .unwrap();
        store.reinforce_episodic(&b.id).unwrap();

        store.merge_episodic(&a.id, &b.id).unwrap();
        let merged = store.get_episodic(&a.id).unwrap().unwrap();
        assert_eq!(merged.access_count, 1);
        assert!((merged.importance - 0.9).abs() < 1e-9);
        assert!(store.get_episodic(&b.id).unwrap().is_none());
    }

    #[test]
    fn deleted_record_leaves_fts_index() {
        let store = Store::open_in_memory().unwrap();
        let rec = store
            .insert_episodic("u1", EventType::FactStored, "temporary note", None, 0.5)
            .unwrap();
        store.delete_episodic(&rec.id).unwrap();
        assert!(store.fts_episodic("u1", "temporary note", 10).unwrap().is_empty());
    }
}
