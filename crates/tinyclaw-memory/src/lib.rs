// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Episodic memory engine.
//!
//! Records live in the store's `episodic_memory` table with an FTS5 index.
//! Retrieval blends three signals: full-text rank, temporal recency, and
//! learned importance. Consolidation keeps the table healthy over months of
//! accumulation: near-duplicates merge, dead weight is pruned, and stale
//! importance decays.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

pub use tinyclaw_store::{EpisodicRecord, EventType};
use tinyclaw_store::{now_ms, Store};

/// Relevance weights. Chosen so the three terms land in the same ballpark
/// for a one-day-old, medium-importance, mid-ranked hit: a fresher or more
/// important record can win, but no single term dominates.
const W_FTS: f64 = 0.40;
const W_RECENCY: f64 = 0.30;
const W_IMPORTANCE: f64 = 0.30;
/// Recency decay rate per day of age.
const LAMBDA: f64 = 0.15;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
/// Records below this importance with zero accesses are prune candidates.
const PRUNE_IMPORTANCE: f64 = 0.2;
const PRUNE_AGE_DAYS: i64 = 7;
const DECAY_AGE_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: EpisodicRecord,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsolidateReport {
    pub merged: usize,
    pub pruned: usize,
    pub decayed: usize,
}

pub struct MemoryEngine {
    store: Arc<Store>,
    cfg: tinyclaw_config::MemoryConfig,
}

impl MemoryEngine {
    pub fn new(store: Arc<Store>, cfg: tinyclaw_config::MemoryConfig) -> Self {
        Self { store, cfg }
    }

    /// Persist one episodic event. Importance defaults to 0.5 when the caller
    /// has no opinion.
    pub fn record_event(
        &self,
        user_id: &str,
        event_type: EventType,
        content: &str,
        outcome: Option<&str>,
        importance: Option<f64>,
    ) -> Result<EpisodicRecord> {
        self.store.insert_episodic(
            user_id,
            event_type,
            content,
            outcome,
            importance.unwrap_or(0.5).clamp(0.0, 1.0),
        )
    }

    /// Hybrid-scored search. Ties break toward the more recent record.
    pub fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<ScoredRecord>> {
        // Over-fetch FTS candidates so re-scoring has room to reorder.
        let hits = self.store.fts_episodic(user_id, query, limit.max(1) * 4)?;
        let now = now_ms();

        let mut scored: Vec<ScoredRecord> = hits
            .into_iter()
            .map(|hit| {
                let age_days = ((now - hit.record.created_at).max(0) as f64) / DAY_MS as f64;
                // bm25 rank: more negative is better. Map to (0, 1).
                let strength = (-hit.rank).max(0.0);
                let fts_norm = strength / (1.0 + strength);
                let score = W_FTS * fts_norm
                    + W_RECENCY * (-LAMBDA * age_days).exp()
                    + W_IMPORTANCE * hit.record.importance;
                ScoredRecord { record: hit.record, score }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.record.created_at.cmp(&a.record.created_at))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Bump a record that influenced a reply.
    pub fn reinforce(&self, id: &str) -> Result<bool> {
        self.store.reinforce_episodic(id)
    }

    /// Housekeeping pass: merge near-duplicates, prune dead weight, decay
    /// stale importance.
    pub fn consolidate(&self, user_id: &str) -> Result<ConsolidateReport> {
        let mut report = ConsolidateReport::default();
        let now = now_ms();

        // (i) merge near-duplicates (earlier record wins, sums counts, max importance)
        let records = self.store.all_episodic(user_id)?;
        let mut absorbed: HashSet<String> = HashSet::new();
        for i in 0..records.len() {
            if absorbed.contains(&records[i].id) {
                continue;
            }
            for j in (i + 1)..records.len() {
                if absorbed.contains(&records[j].id) {
                    continue;
                }
                let sim = trigram_similarity(&records[i].content, &records[j].content);
                if sim >= self.cfg.merge_threshold {
                    debug!(winner = %records[i].id, loser = %records[j].id, sim, "merging near-duplicates");
                    self.store.merge_episodic(&records[i].id, &records[j].id)?;
                    absorbed.insert(records[j].id.clone());
                    report.merged += 1;
                }
            }
        }

        // (ii) prune low-value, never-accessed, old records
        let prune_cutoff = now - PRUNE_AGE_DAYS * DAY_MS;
        for rec in self.store.all_episodic(user_id)? {
            if rec.importance < PRUNE_IMPORTANCE
                && rec.access_count == 0
                && rec.created_at < prune_cutoff
            {
                self.store.delete_episodic(&rec.id)?;
                report.pruned += 1;
            }
        }

        // (iii) decay importance of old survivors
        let decay_cutoff = now - DECAY_AGE_DAYS * DAY_MS;
        for rec in self.store.all_episodic(user_id)? {
            if rec.created_at < decay_cutoff {
                self.store
                    .scale_episodic_importance(&rec.id, self.cfg.decay_factor)?;
                report.decayed += 1;
            }
        }

        Ok(report)
    }

    /// Compact text block of the top hits, ready for prompt injection.
    /// Hits used this way are reinforced.
    pub fn context_for_agent(&self, user_id: &str, query: Option<&str>) -> Result<String> {
        let hits = match query {
            Some(q) => self.search(user_id, q, self.cfg.context_hits)?,
            None => {
                let mut all: Vec<ScoredRecord> = self
                    .store
                    .all_episodic(user_id)?
                    .into_iter()
                    .map(|record| ScoredRecord { score: record.importance, record })
                    .collect();
                all.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.record.created_at.cmp(&a.record.created_at))
                });
                all.truncate(self.cfg.context_hits);
                all
            }
        };
        if hits.is_empty() {
            return Ok(String::new());
        }

        let mut block = String::from("Relevant memories:\n");
        for hit in &hits {
            block.push_str(&format!(
                "- [{}] {}\n",
                hit.record.event_type.as_str(),
                hit.record.content
            ));
            let _ = self.store.reinforce_episodic(&hit.record.id);
        }
        Ok(block)
    }
}

/// Jaccard similarity over lowercase character trigrams.
fn trigram_similarity(a: &str, b: &str) -> f64 {
    let grams = |s: &str| -> HashSet<String> {
        let chars: Vec<char> = s.to_lowercase().chars().collect();
        if chars.len() < 3 {
            return HashSet::from([chars.iter().collect::<String>()]);
        }
        chars.windows(3).map(|w| w.iter().collect()).collect()
    };
    let ga = grams(a);
    let gb = grams(b);
    if ga.is_empty() || gb.is_empty() {
        return 0.0;
    }
    let inter = ga.intersection(&gb).count() as f64;
    let union = ga.union(&gb).count() as f64;
    inter / union
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MemoryEngine {
        MemoryEngine::new(
            Arc::new(Store::open_in_memory().unwrap()),
            tinyclaw_config::MemoryConfig::default(),
        )
    }

    #[test]
    fn higher_importance_ranks_no_lower_all_else_equal() {
        let eng = engine();
        eng.record_event("u", EventType::FactStored, "the owner lives in Manila", None, Some(0.9))
            .unwrap();
        eng.record_event("u", EventType::FactStored, "the owner lives in Manila too", None, Some(0.1))
            .unwrap();

        let hits = eng.search("u", "where does the owner live Manila", 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].record.importance >= hits[1].record.importance);
    }

    #[test]
    fn search_returns_empty_for_no_match() {
        let eng = engine();
        eng.record_event("u", EventType::FactStored, "likes green tea", None, None)
            .unwrap();
        assert!(eng.search("u", "quantum chromodynamics", 5).unwrap().is_empty());
    }

    #[test]
    fn consolidate_merges_near_duplicates() {
        let eng = engine();
        eng.record_event("u", EventType::FactStored, "owner prefers dark roast coffee", None, Some(0.4))
            .unwrap();
        eng.record_event("u", EventType::FactStored, "owner prefers dark roast coffee!", None, Some(0.8))
            .unwrap();
        eng.record_event("u", EventType::FactStored, "completely unrelated note about sailing", None, None)
            .unwrap();

        let report = eng.consolidate("u").unwrap();
        assert_eq!(report.merged, 1);

        let remaining = eng.store.all_episodic("u").unwrap();
        assert_eq!(remaining.len(), 2);
        let merged = remaining
            .iter()
            .find(|r| r.content.contains("dark roast"))
            .unwrap();
        assert!((merged.importance - 0.8).abs() < 1e-9);
    }

    #[test]
    fn fresh_records_are_not_pruned_or_decayed() {
        let eng = engine();
        eng.record_event("u", EventType::FactStored, "barely important", None, Some(0.05))
            .unwrap();
        let report = eng.consolidate("u").unwrap();
        assert_eq!(report.pruned, 0);
        assert_eq!(report.decayed, 0);
        assert_eq!(eng.store.all_episodic("u").unwrap().len(), 1);
    }

    #[test]
    fn context_block_lists_top_hits_and_reinforces() {
        let eng = engine();
        let rec = eng
            .record_event("u", EventType::PreferenceLearned, "prefers short answers", None, Some(0.9))
            .unwrap();
        let block = eng.context_for_agent("u", None).unwrap();
        assert!(block.contains("prefers short answers"));
        assert!(block.contains("preference_learned"));

        let after = eng.store.get_episodic(&rec.id).unwrap().unwrap();
        assert_eq!(after.access_count, 1);
    }

    #[test]
    fn trigram_similarity_behaves() {
        assert!(trigram_similarity("dark roast coffee", "dark roast coffee!") > 0.8);
        assert!(trigram_similarity("dark roast coffee", "sailing at dawn") < 0.2);
    }
}
