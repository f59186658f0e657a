// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Rule-based query tier estimation.
//!
//! Purely lexical: keyword sets plus length thresholds. Never calls the
//! model, so classification is free and deterministic. When nothing matches,
//! the answer is `moderate`, the safe middle of the routing table.

use crate::Tier;

/// Classification result: the routing tier and how sure the rules are.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub tier: Tier,
    pub confidence: f64,
}

const REASONING_KEYWORDS: &[&str] = &[
    "prove",
    "step by step",
    "step-by-step",
    "derive",
    "theorem",
    "logic puzzle",
    "chain of thought",
    "formally",
    "deduce",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "research",
    "analyze",
    "analyse",
    "investigate",
    "architecture",
    "design a",
    "compare",
    "trade-off",
    "tradeoff",
    "strategy",
    "in depth",
    "comprehensive",
    "write a report",
    "refactor",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "thanks",
    "thank you",
    "good morning",
    "good night",
    "what time",
    "ok",
    "yes",
    "no",
];

/// Length below which a keyword-free message is considered simple chat.
const SHORT_MESSAGE_CHARS: usize = 24;
/// Length above which a keyword-free message is bumped to complex.
const LONG_MESSAGE_CHARS: usize = 600;

pub fn classify(text: &str) -> Classification {
    let lower = text.to_lowercase();
    let trimmed = lower.trim();

    if contains_any(trimmed, REASONING_KEYWORDS) {
        return Classification { tier: Tier::Reasoning, confidence: 0.9 };
    }
    if contains_any(trimmed, COMPLEX_KEYWORDS) {
        return Classification { tier: Tier::Complex, confidence: 0.8 };
    }
    // Simple keywords only count for short messages; "thanks" buried in a
    // long request does not make the request simple.
    if trimmed.len() <= SHORT_MESSAGE_CHARS {
        if SIMPLE_KEYWORDS.iter().any(|k| trimmed == *k || trimmed.starts_with(&format!("{k} "))) {
            return Classification { tier: Tier::Simple, confidence: 0.9 };
        }
        return Classification { tier: Tier::Simple, confidence: 0.6 };
    }
    if trimmed.len() >= LONG_MESSAGE_CHARS {
        return Classification { tier: Tier::Complex, confidence: 0.6 };
    }

    Classification { tier: Tier::Moderate, confidence: 0.5 }
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_simple() {
        assert_eq!(classify("hi there").tier, Tier::Simple);
    }

    #[test]
    fn research_request_is_complex() {
        assert_eq!(
            classify("research the latest on quantum computing").tier,
            Tier::Complex
        );
    }

    #[test]
    fn proof_request_is_reasoning() {
        assert_eq!(classify("prove that sqrt(2) is irrational").tier, Tier::Reasoning);
    }

    #[test]
    fn default_is_moderate() {
        let c = classify("tell me about your day and what you did");
        assert_eq!(c.tier, Tier::Moderate);
    }

    #[test]
    fn thanks_in_long_message_is_not_simple() {
        let c = classify("thanks, now please also summarise the meeting notes I sent");
        assert_ne!(c.tier, Tier::Simple);
    }

    #[test]
    fn very_long_message_bumps_to_complex() {
        let long = "please help me with this ".repeat(40);
        assert_eq!(classify(&long).tier, Tier::Complex);
    }

    #[test]
    fn deterministic() {
        let a = classify("compare rust and go for systems work");
        let b = classify("compare rust and go for systems work");
        assert_eq!(a.tier, b.tier);
        assert!((a.confidence - b.confidence).abs() < f64::EPSILON);
    }
}
