// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent management: lifecycle, role templates, background execution,
//! and adaptive timeouts.

mod lifecycle;
mod runner;
mod templates;
mod timeout;

pub use lifecycle::{CreateAgentConfig, LifecycleError, SubAgentManager};
pub use runner::{BackgroundRunner, Publisher, TaskHandle};
pub use templates::{TemplateError, TemplateStore};
pub use timeout::{
    classify_task, EstimateBasis, ExtensionGrant, TaskType, TimeoutEstimate, TimeoutEstimator,
};

/// Keyword overlap between two texts with stopwords removed:
/// `matches / min(|a|, |b|)`. Shared by agent reuse and template matching.
pub(crate) fn keyword_overlap(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;

    const STOPWORDS: &[&str] = &[
        "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of",
        "on", "or", "that", "the", "this", "to", "with", "you", "your",
    ];

    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1 && !STOPWORDS.contains(t))
            .map(|t| t.to_string())
            .collect()
    };
    let ta = tokens(a);
    let tb = tokens(b);
    let smaller = ta.len().min(tb.len());
    if smaller == 0 {
        return 0.0;
    }
    let matches = ta.intersection(&tb).count();
    matches as f64 / smaller as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_ignores_stopwords() {
        let a = "a researcher for the quantum computing domain";
        let b = "quantum computing researcher";
        assert!((keyword_overlap(a, b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn disjoint_texts_score_zero() {
        assert_eq!(keyword_overlap("alpha beta", "gamma delta"), 0.0);
    }
}
