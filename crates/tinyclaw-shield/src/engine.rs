// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::feed::parse_feed;
use crate::types::{Decision, ShieldAction, ShieldEvent, ThreatEntry};

/// The policy engine. Holds the parsed, validated threat set; evaluation is
/// lock-free apart from a read lock on the entry list (the feed watcher swaps
/// the list on file change).
pub struct Shield {
    entries: RwLock<Vec<ThreatEntry>>,
    enabled: bool,
}

impl Shield {
    pub fn new(entries: Vec<ThreatEntry>, enabled: bool) -> Self {
        Self { entries: RwLock::new(entries), enabled }
    }

    pub fn from_feed_file(path: &Path, enabled: bool) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading threat feed {}", path.display()))?;
        let entries = parse_feed(&text);
        info!(count = entries.len(), "threat feed loaded");
        Ok(Self::new(entries, enabled))
    }

    /// Disabled shield that logs everything.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().expect("shield lock poisoned").len()
    }

    /// Swap in a freshly parsed entry set (used by the feed watcher).
    pub fn replace_entries(&self, entries: Vec<ThreatEntry>) {
        let mut guard = self.entries.write().expect("shield lock poisoned");
        *guard = entries;
    }

    pub fn reload_from(&self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading threat feed {}", path.display()))?;
        let entries = parse_feed(&text);
        let count = entries.len();
        self.replace_entries(entries);
        info!(count, "threat feed reloaded");
        Ok(count)
    }

    /// Evaluate one event against every scope-compatible threat.
    ///
    /// Within a threat, directives are tried in order and the first match
    /// produces that threat's candidate. Across threats the candidates are
    /// combined: `block > require_approval > log`, then the highest
    /// `severity × confidence`, then the lexicographically smallest id. No
    /// match at all yields a no-op `log` with no threat id.
    pub fn evaluate(&self, event: &ShieldEvent) -> Decision {
        if !self.enabled {
            return Decision::log_noop();
        }
        let scope = event.scope();
        let compatible = scope.compatible_categories();

        let entries = self.entries.read().expect("shield lock poisoned");
        let mut best: Option<(ShieldAction, f64, &ThreatEntry, &str)> = None;

        for threat in entries.iter() {
            if !compatible.contains(&threat.category) {
                continue;
            }
            let matched = threat.directives.iter().find(|d| {
                d.condition
                    .as_ref()
                    .map(|c| c.matches(event))
                    .unwrap_or(false)
            });
            let Some(directive) = matched else { continue };

            let weight = threat.severity.weight() * threat.confidence;
            let candidate = (directive.action, weight, threat, directive.condition_text.as_str());
            debug!(threat = %threat.id, action = directive.action.as_str(), "directive matched");

            best = Some(match best.take() {
                None => candidate,
                Some(current) => pick(current, candidate),
            });
        }

        match best {
            Some((action, _, threat, condition)) => Decision {
                action,
                threat_id: Some(threat.id.clone()),
                reason: Some(format!("{}: {}", threat.title, condition)),
                severity: Some(threat.severity),
                confidence: threat.confidence,
            },
            None => Decision::log_noop(),
        }
    }
}

type Candidate<'a> = (ShieldAction, f64, &'a ThreatEntry, &'a str);

fn pick<'a>(a: Candidate<'a>, b: Candidate<'a>) -> Candidate<'a> {
    // Priority first, then weight, then smallest id.
    if b.0 != a.0 {
        return if b.0 > a.0 { b } else { a };
    }
    if (b.1 - a.1).abs() > f64::EPSILON {
        return if b.1 > a.1 { b } else { a };
    }
    if b.2.id < a.2.id {
        b
    } else {
        a
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Condition;
    use crate::types::{Category, Directive, Severity};
    use serde_json::json;

    fn threat(id: &str, category: Category, severity: Severity, confidence: f64, directives: Vec<Directive>) -> ThreatEntry {
        ThreatEntry {
            id: id.to_string(),
            fingerprint: format!("fp-{id}"),
            category,
            severity,
            confidence,
            action: ShieldAction::Log,
            title: format!("threat {id}"),
            description: String::new(),
            directives,
            expires_at: None,
            revoked: false,
        }
    }

    fn directive(action: ShieldAction, text: &str) -> Directive {
        Directive {
            action,
            condition_text: text.to_string(),
            condition: Condition::parse(text),
        }
    }

    #[test]
    fn no_match_yields_log_with_null_threat() {
        let shield = Shield::new(vec![], true);
        let d = shield.evaluate(&ShieldEvent::tool_call("memory_add", json!({})));
        assert_eq!(d.action, ShieldAction::Log);
        assert!(d.threat_id.is_none());
    }

    #[test]
    fn block_beats_require_approval() {
        let shield = Shield::new(
            vec![
                threat("A", Category::Tool, Severity::Low, 0.1, vec![directive(
                    ShieldAction::Block,
                    "tool.call execute_code",
                )]),
                threat("B", Category::Tool, Severity::Critical, 1.0, vec![directive(
                    ShieldAction::RequireApproval,
                    "tool.call execute_code",
                )]),
            ],
            true,
        );
        let d = shield.evaluate(&ShieldEvent::tool_call("execute_code", json!({})));
        assert_eq!(d.action, ShieldAction::Block);
        assert_eq!(d.threat_id.as_deref(), Some("A"));
    }

    #[test]
    fn same_priority_highest_weight_wins() {
        let shield = Shield::new(
            vec![
                threat("weak", Category::Tool, Severity::Low, 0.5, vec![directive(
                    ShieldAction::Block,
                    "tool.call execute_code",
                )]),
                threat("strong", Category::Tool, Severity::Critical, 0.9, vec![directive(
                    ShieldAction::Block,
                    "tool.call execute_code",
                )]),
            ],
            true,
        );
        let d = shield.evaluate(&ShieldEvent::tool_call("execute_code", json!({})));
        assert_eq!(d.threat_id.as_deref(), Some("strong"));
    }

    #[test]
    fn weight_tie_breaks_by_lexicographic_id() {
        let shield = Shield::new(
            vec![
                threat("B-2", Category::Tool, Severity::High, 0.8, vec![directive(
                    ShieldAction::Block,
                    "tool.call execute_code",
                )]),
                threat("A-1", Category::Tool, Severity::High, 0.8, vec![directive(
                    ShieldAction::Block,
                    "tool.call execute_code",
                )]),
            ],
            true,
        );
        let d = shield.evaluate(&ShieldEvent::tool_call("execute_code", json!({})));
        assert_eq!(d.threat_id.as_deref(), Some("A-1"));
    }

    #[test]
    fn scope_incompatible_threats_are_skipped() {
        let shield = Shield::new(
            vec![threat("P", Category::Prompt, Severity::Critical, 1.0, vec![directive(
                ShieldAction::Block,
                "incoming message contains anything",
            )])],
            true,
        );
        // Tool-call scope never consults prompt-category threats.
        let mut ev = ShieldEvent::tool_call("x", json!({}));
        ev.message = Some("anything".into());
        let d = shield.evaluate(&ev);
        assert_eq!(d.action, ShieldAction::Log);
        assert!(d.threat_id.is_none());
    }

    #[test]
    fn first_matching_directive_within_threat_wins() {
        let shield = Shield::new(
            vec![threat(
                "T",
                Category::Tool,
                Severity::High,
                0.9,
                vec![
                    directive(ShieldAction::RequireApproval, "tool.call execute_code"),
                    directive(ShieldAction::Block, "tool.call execute_code"),
                ],
            )],
            true,
        );
        let d = shield.evaluate(&ShieldEvent::tool_call("execute_code", json!({})));
        assert_eq!(d.action, ShieldAction::RequireApproval);
    }

    #[test]
    fn disabled_shield_logs_everything() {
        let shield = Shield::new(
            vec![threat("T", Category::Tool, Severity::Critical, 1.0, vec![directive(
                ShieldAction::Block,
                "tool.call execute_code",
            )])],
            false,
        );
        let d = shield.evaluate(&ShieldEvent::tool_call("execute_code", json!({})));
        assert_eq!(d.action, ShieldAction::Log);
    }
}
