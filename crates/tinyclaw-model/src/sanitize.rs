// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cosmetic output filters applied to user-facing text.
//!
//! The orchestrator's stream wrapper runs every outgoing text event through a
//! filter chain. Keeping the filters pluggable lets tests assert raw model
//! text separately from the sanitized user-facing form.

/// A single cosmetic transformation on outgoing text.
pub trait OutputFilter: Send + Sync {
    fn apply(&self, text: &str) -> String;
}

/// Replaces em- and en-dashes with a plain hyphen form.
pub struct EmDashFilter;

impl OutputFilter for EmDashFilter {
    fn apply(&self, text: &str) -> String {
        text.replace('\u{2014}', " - ").replace('\u{2013}', "-")
    }
}

/// Collapses runs of 3+ blank lines left behind by other filters.
pub struct WhitespaceFilter;

impl OutputFilter for WhitespaceFilter {
    fn apply(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut blank_run = 0usize;
        for line in text.lines() {
            if line.trim().is_empty() {
                blank_run += 1;
                if blank_run > 2 {
                    continue;
                }
            } else {
                blank_run = 0;
            }
            out.push_str(line);
            out.push('\n');
        }
        if !text.ends_with('\n') {
            out.pop();
        }
        out
    }
}

/// Ordered filter chain. Filters run in registration order.
pub struct FilterChain {
    filters: Vec<Box<dyn OutputFilter>>,
}

impl FilterChain {
    pub fn empty() -> Self {
        Self { filters: Vec::new() }
    }

    pub fn push(mut self, filter: impl OutputFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn apply(&self, text: &str) -> String {
        self.filters
            .iter()
            .fold(text.to_string(), |acc, f| f.apply(&acc))
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::empty().push(EmDashFilter).push(WhitespaceFilter)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn em_dash_is_replaced() {
        let chain = FilterChain::default();
        assert_eq!(chain.apply("wait\u{2014}what"), "wait - what");
    }

    #[test]
    fn en_dash_is_replaced() {
        assert_eq!(EmDashFilter.apply("2019\u{2013}2024"), "2019-2024");
    }

    #[test]
    fn empty_chain_is_identity() {
        let chain = FilterChain::empty();
        assert_eq!(chain.apply("a\u{2014}b"), "a\u{2014}b");
    }

    #[test]
    fn whitespace_filter_caps_blank_runs() {
        let text = "a\n\n\n\n\nb";
        assert_eq!(WhitespaceFilter.apply(text), "a\n\n\nb");
    }
}
