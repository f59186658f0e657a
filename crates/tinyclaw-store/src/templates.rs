// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use crate::db::{now_ms, Store};

#[derive(Debug, Clone)]
pub struct RoleTemplateRecord {
    pub id: String,
    pub owner_user_id: String,
    pub name: String,
    pub role_description: String,
    pub default_tools: Vec<String>,
    pub default_tier: Option<String>,
    pub times_used: i64,
    pub avg_performance: f64,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Store {
    pub fn insert_template(&self, rec: &RoleTemplateRecord) -> Result<()> {
        let tools = serde_json::to_string(&rec.default_tools)?;
        let tags = serde_json::to_string(&rec.tags)?;
        self.with(|conn| {
            conn.execute(
                "INSERT INTO role_templates
                     (id, owner_user_id, name, role_description, default_tools, default_tier,
                      times_used, avg_performance, tags, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    rec.id,
                    rec.owner_user_id,
                    rec.name,
                    rec.role_description,
                    tools,
                    rec.default_tier,
                    rec.times_used,
                    rec.avg_performance,
                    tags,
                    rec.created_at,
                    rec.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_template(&self, id: &str) -> Result<Option<RoleTemplateRecord>> {
        self.with(|conn| {
            let rec = conn
                .query_row(&format!("{SELECT_TPL} WHERE id = ?1"), [id], row_to_template)
                .optional()?;
            Ok(rec)
        })
    }

    pub fn list_templates(&self, owner: &str) -> Result<Vec<RoleTemplateRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_TPL} WHERE owner_user_id = ?1 ORDER BY times_used DESC, name ASC"
            ))?;
            let rows = stmt
                .query_map([owner], row_to_template)?
                .collect::<std::result::Result<_, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_templates(&self, owner: &str) -> Result<i64> {
        self.with(|conn| {
            let n = conn.query_row(
                "SELECT count(*) FROM role_templates WHERE owner_user_id = ?1",
                [owner],
                |r| r.get(0),
            )?;
            Ok(n)
        })
    }

    pub fn update_template(
        &self,
        id: &str,
        name: Option<&str>,
        role_description: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<bool> {
        let tags_json = match tags {
            Some(t) => Some(serde_json::to_string(t)?),
            None => None,
        };
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE role_templates SET
                     name = COALESCE(?2, name),
                     role_description = COALESCE(?3, role_description),
                     tags = COALESCE(?4, tags),
                     updated_at = ?5
                 WHERE id = ?1",
                params![id, name, role_description, tags_json, now_ms()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn delete_template(&self, id: &str) -> Result<bool> {
        self.with(|conn| {
            let n = conn.execute("DELETE FROM role_templates WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    /// Fold one usage into `times_used` and the rolling `avg_performance`.
    pub fn record_template_usage(&self, id: &str, score: f64) -> Result<bool> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE role_templates SET
                     avg_performance = (avg_performance * times_used + ?2) / (times_used + 1),
                     times_used = times_used + 1,
                     updated_at = ?3
                 WHERE id = ?1",
                params![id, score, now_ms()],
            )?;
            Ok(n > 0)
        })
    }
}

const SELECT_TPL: &str =
    "SELECT id, owner_user_id, name, role_description, default_tools, default_tier,
            times_used, avg_performance, tags, created_at, updated_at
     FROM role_templates";

fn row_to_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoleTemplateRecord> {
    let tools_json: String = row.get(4)?;
    let tags_json: String = row.get(8)?;
    Ok(RoleTemplateRecord {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        name: row.get(2)?,
        role_description: row.get(3)?,
        default_tools: serde_json::from_str(&tools_json).unwrap_or_default(),
        default_tier: row.get(5)?,
        times_used: row.get(6)?,
        avg_performance: row.get(7)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample(owner: &str, name: &str) -> RoleTemplateRecord {
        RoleTemplateRecord {
            id: Uuid::new_v4().to_string(),
            owner_user_id: owner.to_string(),
            name: name.to_string(),
            role_description: "Researches topics in depth".into(),
            default_tools: vec!["memory_search".into()],
            default_tier: Some("complex".into()),
            times_used: 0,
            avg_performance: 0.0,
            tags: vec!["research".into()],
            created_at: now_ms(),
            updated_at: now_ms(),
        }
    }

    #[test]
    fn usage_updates_rolling_average() {
        let store = Store::open_in_memory().unwrap();
        let tpl = sample("owner", "Researcher");
        store.insert_template(&tpl).unwrap();

        store.record_template_usage(&tpl.id, 1.0).unwrap();
        store.record_template_usage(&tpl.id, 0.0).unwrap();

        let rec = store.get_template(&tpl.id).unwrap().unwrap();
        assert_eq!(rec.times_used, 2);
        assert!((rec.avg_performance - 0.5).abs() < 1e-9);
    }

    #[test]
    fn crud_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let tpl = sample("owner", "Writer");
        store.insert_template(&tpl).unwrap();

        assert!(store
            .update_template(&tpl.id, Some("Ghostwriter"), None, None)
            .unwrap());
        let rec = store.get_template(&tpl.id).unwrap().unwrap();
        assert_eq!(rec.name, "Ghostwriter");
        assert_eq!(rec.role_description, tpl.role_description);

        assert!(store.delete_template(&tpl.id).unwrap());
        assert!(store.get_template(&tpl.id).unwrap().is_none());
    }
}
