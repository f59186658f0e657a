// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tiered conversation compaction.
//!
//! Three tiers bound prompt size: L0 is the most recent raw turns, L1 a
//! coarse summary of what left L0, L2 an archival digest of what left L1.
//! The L1 and L2 text live together in the latest `CompactionRecord`; for
//! context assembly that record replaces every message strictly older than
//! its `replaced_before` timestamp.
//!
//! Before any model call the source text is pre-compressed (emoji stripped,
//! duplicate lines removed, optionally near-identical sentences dropped) and
//! new summary lines that restate an already-summarized fact are deduplicated
//! by similarity.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use tinyclaw_model::{ChatProvider, Message};
use tinyclaw_store::Store;

const SUMMARIZE_PROMPT: &str = "You are a conversation compaction assistant for a personal AI \
companion. Summarise the conversation below into a dense set of facts, decisions, preferences, \
and open threads that the companion needs to keep serving its owner well. Use short bullet \
lines. Never invent details.";

const ARCHIVE_PROMPT: &str = "You are a conversation compaction assistant. The text below is an \
accumulated summary that has grown too large. Condense it into an archival digest: keep stable \
facts, standing preferences, and unresolved commitments; drop play-by-play detail.";

const ARCHIVE_HEADER: &str = "## Archive";
const RECENT_HEADER: &str = "## Recent";

pub struct Compactor {
    store: Arc<Store>,
    cfg: tinyclaw_config::CompactorConfig,
}

impl Compactor {
    pub fn new(store: Arc<Store>, cfg: tinyclaw_config::CompactorConfig) -> Self {
        Self { store, cfg }
    }

    /// Current summary block for prompt injection, if any.
    pub fn latest_summary(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.store.latest_compaction(user_id)?.map(|r| r.summary))
    }

    /// Timestamp boundary: messages at or after this still belong to the raw
    /// window.
    pub fn window_start(&self, user_id: &str) -> Result<i64> {
        Ok(self
            .store
            .latest_compaction(user_id)?
            .map(|r| r.replaced_before)
            .unwrap_or(0))
    }

    /// Compact when the active window exceeds the token threshold. Returns
    /// true when a new compaction record was written.
    pub async fn compact_if_needed(
        &self,
        user_id: &str,
        provider: &dyn ChatProvider,
    ) -> Result<bool> {
        let window_start = self.window_start(user_id)?;
        let active = self.store.recent_messages(user_id, 10_000, window_start)?;

        let prior_summary = self.latest_summary(user_id)?;
        let window_tokens: usize = active.iter().map(|m| m.content.len() / 4).sum::<usize>()
            + prior_summary.as_deref().map(|s| s.len() / 4).unwrap_or(0);
        if window_tokens <= self.cfg.trigger_tokens {
            return Ok(false);
        }

        // L0 keeps the most recent turns verbatim; everything older is
        // summarized into L1.
        let keep = self.cfg.keep_turns.min(active.len());
        let to_summarize = &active[..active.len() - keep];
        if to_summarize.is_empty() {
            return Ok(false);
        }
        let boundary = to_summarize
            .last()
            .map(|m| m.created_at + 1)
            .unwrap_or(window_start);

        let mut transcript = String::new();
        for msg in to_summarize {
            transcript.push_str(&format!("{}: {}\n", msg.role, msg.content));
        }
        let transcript = self.pre_compress(&transcript);

        let request = vec![
            Message::system(SUMMARIZE_PROMPT),
            Message::user(transcript),
        ];
        let reply = provider
            .chat(&request, &[])
            .await
            .context("compaction summarization call")?;
        let new_summary = reply.as_text().unwrap_or("").trim().to_string();
        if new_summary.is_empty() {
            return Ok(false);
        }

        let merged = self.merge_summaries(prior_summary.as_deref(), &new_summary);

        // L2 fold: when the combined summary outgrows its budget, condense
        // it into the archival tier.
        let summary = if merged.len() / 4 > self.cfg.summary_budget_tokens {
            let request = vec![Message::system(ARCHIVE_PROMPT), Message::user(merged.clone())];
            match provider.chat(&request, &[]).await {
                Ok(reply) => {
                    let archive = reply.as_text().unwrap_or("").trim().to_string();
                    if archive.is_empty() {
                        merged
                    } else {
                        format!("{ARCHIVE_HEADER}\n{archive}")
                    }
                }
                Err(e) => {
                    debug!("archival fold failed, keeping merged summary: {e:#}");
                    merged
                }
            }
        } else {
            merged
        };

        self.store.insert_compaction(user_id, &summary, boundary)?;
        info!(
            user = user_id,
            summarized = to_summarize.len(),
            kept = keep,
            "conversation compacted"
        );
        Ok(true)
    }

    /// Combine the prior summary with new lines, dropping near-duplicates of
    /// facts the summary already states.
    fn merge_summaries(&self, prior: Option<&str>, new_summary: &str) -> String {
        let Some(prior) = prior.filter(|p| !p.trim().is_empty()) else {
            return format!("{RECENT_HEADER}\n{new_summary}");
        };
        let existing: Vec<&str> = prior
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.starts_with("##"))
            .collect();

        let mut merged = prior.trim_end().to_string();
        if !merged.contains(RECENT_HEADER) {
            merged.push_str(&format!("\n{RECENT_HEADER}"));
        }
        for line in new_summary.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let duplicate = existing
                .iter()
                .any(|e| trigram_similarity(e, trimmed) >= self.cfg.dedup_threshold);
            if !duplicate {
                merged.push('\n');
                merged.push_str(trimmed);
            }
        }
        merged
    }

    /// Deterministic cleanup before the model sees the text.
    fn pre_compress(&self, text: &str) -> String {
        let mut out = text.to_string();
        if self.cfg.strip_emoji {
            out = strip_emoji(&out);
        }
        if self.cfg.dedup_lines {
            out = dedup_lines(&out);
        }
        if self.cfg.dedup_sentences {
            out = dedup_similar_sentences(&out, self.cfg.dedup_threshold);
        }
        out
    }
}

fn strip_emoji(text: &str) -> String {
    text.chars()
        .filter(|c| {
            let cp = *c as u32;
            // Emoji, pictographs, transport, flags, and the variation selectors.
            !matches!(cp,
                0x1F300..=0x1FAFF | 0x2600..=0x27BF | 0x1F1E6..=0x1F1FF | 0xFE00..=0xFE0F | 0x2700..=0x27FF
            )
        })
        .collect()
}

fn dedup_lines(text: &str) -> String {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let key = line.trim();
        if key.is_empty() || seen.insert(key) {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn dedup_similar_sentences(text: &str, threshold: f64) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut out = String::with_capacity(text.len());
    for sentence in text.split_inclusive(['.', '!', '?', '\n']) {
        let trimmed = sentence.trim();
        if trimmed.len() < 8 {
            out.push_str(sentence);
            continue;
        }
        if kept.iter().any(|k| trigram_similarity(k, trimmed) >= threshold) {
            continue;
        }
        kept.push(trimmed.to_string());
        out.push_str(sentence);
    }
    out
}

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
    ga.intersection(&gb).count() as f64 / ga.union(&gb).count() as f64
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tinyclaw_model::{ProviderReply, ScriptedProvider};

    fn compactor_with(trigger_tokens: usize, keep_turns: usize) -> Compactor {
        let mut cfg = tinyclaw_config::CompactorConfig::default();
        cfg.trigger_tokens = trigger_tokens;
        cfg.keep_turns = keep_turns;
        Compactor::new(Arc::new(Store::open_in_memory().unwrap()), cfg)
    }

    #[tokio::test]
    async fn below_threshold_is_a_no_op() {
        let compactor = compactor_with(1_000, 2);
        compactor
            .store
            .append_message("u", "user", "short", None, None)
            .unwrap();
        let provider = ScriptedProvider::new("p", vec![]);
        let compacted = compactor.compact_if_needed("u", &provider).await.unwrap();
        assert!(!compacted);
    }

    #[tokio::test]
    async fn over_threshold_writes_record_and_moves_boundary() {
        let compactor = compactor_with(10, 2);
        for i in 0..6 {
            compactor
                .store
                .append_message("u", "user", &format!("message number {i} with some length"), None, None)
                .unwrap();
        }
        let provider = ScriptedProvider::new(
            "p",
            vec![ProviderReply::Text("- owner discussed six messages".into())],
        );

        let compacted = compactor.compact_if_needed("u", &provider).await.unwrap();
        assert!(compacted);

        let summary = compactor.latest_summary("u").unwrap().unwrap();
        assert!(summary.contains("six messages"));

        // Raw window now starts after the summarized messages: only the
        // kept turns remain.
        let start = compactor.window_start("u").unwrap();
        let window = compactor.store.recent_messages("u", 100, start).unwrap();
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn merge_drops_near_duplicate_lines() {
        let compactor = compactor_with(10, 1);
        let merged = compactor.merge_summaries(
            Some("## Recent\n- owner lives in Manila"),
            "- owner lives in Manila\n- owner prefers tea",
        );
        assert_eq!(merged.matches("Manila").count(), 1);
        assert!(merged.contains("prefers tea"));
    }

    #[test]
    fn pre_compress_strips_emoji_and_duplicate_lines() {
        let compactor = compactor_with(10, 1);
        let out = compactor.pre_compress("hello 🎉 world\nhello 🎉 world\nother\n");
        assert!(!out.contains('🎉'));
        assert_eq!(out.matches("hello").count(), 1);
        assert!(out.contains("other"));
    }

    #[test]
    fn similar_sentence_dedup_respects_threshold() {
        let text = "The owner enjoys hiking in the mountains. The owner enjoys hiking in the mountain. Completely different fact here.";
        let out = dedup_similar_sentences(text, 0.85);
        assert_eq!(out.matches("hiking").count(), 1);
        assert!(out.contains("different fact"));
    }
}
