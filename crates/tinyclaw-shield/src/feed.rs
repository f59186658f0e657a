// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Threat feed parser.
//!
//! The feed is a markdown document. Every fenced code block is a candidate
//! threat entry: simple `key: value` lines plus a multi-line
//! `recommendation_agent` field whose `BLOCK:`/`APPROVE:`/`LOG:` lines become
//! directives. Prose between fences is ignored so the feed stays
//! human-editable.
//!
//! Entries with `revoked: true` or an `expires_at` in the past are filtered
//! at parse time; evaluation never sees them.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::directive::Condition;
use crate::types::{Category, Directive, Severity, ShieldAction, ThreatEntry};

/// Parse a threat feed document. Blocks that fail validation are skipped
/// with a warning; a malformed entry must never take the shield down.
pub fn parse_feed(markdown: &str) -> Vec<ThreatEntry> {
    let now = Utc::now().timestamp_millis();
    extract_fenced_blocks(markdown)
        .iter()
        .filter_map(|block| parse_block(block))
        .filter(|entry| {
            if entry.revoked {
                return false;
            }
            match entry.expires_at {
                Some(exp) => exp > now,
                None => true,
            }
        })
        .collect()
}

/// Serialize entries back into feed markdown. `parse_feed(serialize_feed(x))`
/// yields the same set of active entries modulo ordering.
pub fn serialize_feed(entries: &[ThreatEntry]) -> String {
    let mut out = String::from("# Threat feed\n\n");
    for e in entries {
        out.push_str("```threat\n");
        out.push_str(&format!("id: {}\n", e.id));
        out.push_str(&format!("fingerprint: {}\n", e.fingerprint));
        out.push_str(&format!("category: {}\n", e.category.as_str()));
        out.push_str(&format!("severity: {}\n", e.severity.as_str()));
        out.push_str(&format!("confidence: {}\n", e.confidence));
        out.push_str(&format!("action: {}\n", e.action.as_str()));
        out.push_str(&format!("title: {}\n", e.title));
        out.push_str(&format!("description: {}\n", e.description));
        if let Some(exp) = e.expires_at {
            if let Some(dt) = DateTime::<Utc>::from_timestamp_millis(exp) {
                out.push_str(&format!("expires_at: {}\n", dt.to_rfc3339()));
            }
        }
        if e.revoked {
            out.push_str("revoked: true\n");
        }
        if !e.directives.is_empty() {
            out.push_str("recommendation_agent: |\n");
            for d in &e.directives {
                let prefix = match d.action {
                    ShieldAction::Block => "BLOCK",
                    ShieldAction::RequireApproval => "APPROVE",
                    ShieldAction::Log => "LOG",
                };
                out.push_str(&format!("  {prefix}: {}\n", d.condition_text));
            }
        }
        out.push_str("```\n\n");
    }
    out
}

fn extract_fenced_blocks(markdown: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            match current.take() {
                Some(block) => blocks.push(block),
                None => current = Some(String::new()),
            }
            continue;
        }
        if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }
    }
    blocks
}

fn parse_block(block: &str) -> Option<ThreatEntry> {
    let mut id = None;
    let mut fingerprint = String::new();
    let mut category = None;
    let mut severity = None;
    let mut confidence = 0.5_f64;
    let mut action = ShieldAction::Log;
    let mut title = String::new();
    let mut description = String::new();
    let mut expires_at = None;
    let mut revoked = false;
    let mut recommendation = String::new();

    let mut lines = block.lines().peekable();
    while let Some(line) = lines.next() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "id" => id = Some(value.to_string()),
            "fingerprint" => fingerprint = value.to_string(),
            "category" => category = Category::parse(value),
            "severity" => severity = Severity::parse(value),
            "confidence" => confidence = value.parse().unwrap_or(0.5),
            "action" => action = ShieldAction::parse(value).unwrap_or(ShieldAction::Log),
            "title" => title = value.to_string(),
            "description" => description = value.to_string(),
            "expires_at" => expires_at = parse_timestamp(value),
            "revoked" => revoked = value == "true",
            "recommendation_agent" => {
                // Either inline (single line) or a `|` literal block whose
                // continuation lines are indented.
                if value != "|" && !value.is_empty() {
                    recommendation.push_str(value);
                    recommendation.push('\n');
                }
                while let Some(next) = lines.peek() {
                    if next.starts_with(' ') || next.starts_with('\t') {
                        recommendation.push_str(next.trim_start());
                        recommendation.push('\n');
                        lines.next();
                    } else {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    let id = id?;
    let (Some(category), Some(severity)) = (category, severity) else {
        warn!(threat = %id, "threat entry missing category or severity, skipping");
        return None;
    };

    let directives = parse_directives(&recommendation);

    Some(ThreatEntry {
        id,
        fingerprint,
        category,
        severity,
        confidence: confidence.clamp(0.0, 1.0),
        action,
        title,
        description,
        directives,
        expires_at,
        revoked,
    })
}

fn parse_directives(text: &str) -> Vec<Directive> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (action, body) = if let Some(rest) = line.strip_prefix("BLOCK:") {
                (ShieldAction::Block, rest)
            } else if let Some(rest) = line.strip_prefix("APPROVE:") {
                (ShieldAction::RequireApproval, rest)
            } else if let Some(rest) = line.strip_prefix("LOG:") {
                (ShieldAction::Log, rest)
            } else {
                return None;
            };
            let condition_text = body.trim().to_string();
            let condition = Condition::parse(&condition_text);
            if condition.is_none() {
                warn!(condition = %condition_text, "unparseable directive condition");
            }
            Some(Directive { action, condition_text, condition })
        })
        .collect()
}

/// Accepts RFC 3339 or raw epoch milliseconds.
fn parse_timestamp(value: &str) -> Option<i64> {
    if let Ok(ms) = value.parse::<i64>() {
        return Some(ms);
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"# Active threats

Some prose the agent maintains by hand.

```threat
id: TC-001
fingerprint: fp-1
category: tool
severity: high
confidence: 0.9
action: require_approval
title: Arbitrary code execution
description: Sandbox executions need a second look.
recommendation_agent: |
  APPROVE: tool.call execute_code with arguments containing (require, import, fs)
  BLOCK: outbound request to evil.example
```

```threat
id: TC-002
fingerprint: fp-2
category: prompt
severity: critical
confidence: 1.0
action: block
title: Prompt injection
description: Classic override phrasing.
recommendation_agent: |
  BLOCK: incoming message contains ignore all previous instructions
```

```threat
id: TC-003
fingerprint: fp-3
category: tool
severity: low
confidence: 0.2
action: log
title: Revoked entry
description: Should not survive parsing.
revoked: true
```
"#;

    #[test]
    fn parses_active_entries_and_filters_revoked() {
        let entries = parse_feed(FEED);
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["TC-001", "TC-002"]);
    }

    #[test]
    fn directives_parse_with_actions() {
        let entries = parse_feed(FEED);
        let tc1 = &entries[0];
        assert_eq!(tc1.directives.len(), 2);
        assert_eq!(tc1.directives[0].action, ShieldAction::RequireApproval);
        assert!(tc1.directives[0].condition.is_some());
        assert_eq!(tc1.directives[1].action, ShieldAction::Block);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let feed = "```\nid: OLD-1\ncategory: tool\nseverity: low\nexpires_at: 2001-01-01T00:00:00Z\n```\n";
        assert!(parse_feed(feed).is_empty());
    }

    #[test]
    fn parse_serialize_parse_round_trips() {
        let first = parse_feed(FEED);
        let serialized = serialize_feed(&first);
        let second = parse_feed(&serialized);

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.category, b.category);
            assert_eq!(a.severity, b.severity);
            assert_eq!(a.action, b.action);
            assert_eq!(a.directives, b.directives);
        }
    }

    #[test]
    fn malformed_block_is_skipped_not_fatal() {
        let feed = "```\nthis is not yaml at all\n```\n";
        assert!(parse_feed(feed).is_empty());
    }
}
