// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adaptive per-task-type timeouts.
//!
//! The estimator looks at the last 30 days of recorded task metrics for the
//! (task type, tier) pair. With enough history the budget is a P85-based
//! estimate; with too little it falls back to fixed tier defaults. Running
//! tasks can earn up to two live extensions.

use std::sync::Arc;

use tinyclaw_store::{now_ms, Store};

const HISTORY_WINDOW_DAYS: i64 = 30;
const MIN_SAMPLES: usize = 5;
const MAX_EXTENSIONS: u32 = 2;

const MIN_TIMEOUT_MS: u64 = 15_000;
const MAX_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Research,
    Code,
    Analysis,
    Writing,
    SimpleLookup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Research => "research",
            TaskType::Code => "code",
            TaskType::Analysis => "analysis",
            TaskType::Writing => "writing",
            TaskType::SimpleLookup => "simple_lookup",
        }
    }

    /// Tie-break priority when keyword votes are equal (highest first).
    const PRIORITY: [TaskType; 5] = [
        TaskType::Research,
        TaskType::Code,
        TaskType::Analysis,
        TaskType::Writing,
        TaskType::SimpleLookup,
    ];
}

/// Keyword vote across the five task types.
pub fn classify_task(text: &str) -> TaskType {
    let lower = text.to_lowercase();
    let votes = |keywords: &[&str]| -> usize {
        keywords.iter().filter(|k| lower.contains(*k)).count()
    };

    let scores = [
        (TaskType::Research, votes(&["research", "investigate", "find out", "latest", "survey", "sources"])),
        (TaskType::Code, votes(&["code", "implement", "function", "bug", "script", "compile", "refactor"])),
        (TaskType::Analysis, votes(&["analyze", "analyse", "compare", "evaluate", "assess", "metrics"])),
        (TaskType::Writing, votes(&["write", "draft", "essay", "blog", "summarize", "summarise", "compose"])),
        (TaskType::SimpleLookup, votes(&["what is", "who is", "when", "lookup", "look up", "define"])),
    ];

    let max_votes = scores.iter().map(|(_, v)| *v).max().unwrap_or(0);
    if max_votes == 0 {
        return TaskType::SimpleLookup;
    }
    // Fixed priority order resolves ties deterministically.
    for ty in TaskType::PRIORITY {
        if scores.iter().any(|(t, v)| *t == ty && *v == max_votes) {
            return ty;
        }
    }
    TaskType::SimpleLookup
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateBasis {
    Historical,
    TierDefault,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct TimeoutEstimate {
    pub task_type: TaskType,
    pub timeout_ms: u64,
    pub expected_iterations: u32,
    /// min(1, n/20) of the sample count backing the estimate.
    pub confidence: f64,
    pub basis: EstimateBasis,
}

/// Outcome of a live extension check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionGrant {
    /// Close to the iteration cap but plenty of time left.
    ExtraIterations(u32),
    /// Close to the time budget but few iterations used.
    ExtraTimeMs(u64),
    None,
}

pub struct TimeoutEstimator {
    store: Arc<Store>,
}

impl TimeoutEstimator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn estimate(&self, text: &str, tier: &str) -> TimeoutEstimate {
        let task_type = classify_task(text);
        let since = now_ms() - HISTORY_WINDOW_DAYS * 24 * 60 * 60 * 1000;

        let metrics = self
            .store
            .task_metrics_since(task_type.as_str(), tier, since)
            .unwrap_or_default();

        if metrics.len() >= MIN_SAMPLES {
            let mut durations: Vec<i64> = metrics.iter().map(|m| m.duration_ms).collect();
            let mut iterations: Vec<i64> = metrics.iter().map(|m| m.iterations).collect();
            durations.sort_unstable();
            iterations.sort_unstable();

            let p85_duration = percentile(&durations, 0.85);
            let p85_iterations = percentile(&iterations, 0.85);

            return TimeoutEstimate {
                task_type,
                timeout_ms: ((p85_duration as f64 * 1.5) as u64)
                    .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS),
                expected_iterations: (p85_iterations as f64 * 1.2).ceil() as u32,
                confidence: (metrics.len() as f64 / 20.0).min(1.0),
                basis: EstimateBasis::Historical,
            };
        }

        let (timeout_ms, iterations, basis) = match tier {
            "simple" => (30_000, 5, EstimateBasis::TierDefault),
            "moderate" => (60_000, 8, EstimateBasis::TierDefault),
            "complex" => (120_000, 12, EstimateBasis::TierDefault),
            "reasoning" => (180_000, 15, EstimateBasis::TierDefault),
            _ => (60_000, 10, EstimateBasis::Fallback),
        };
        TimeoutEstimate {
            task_type,
            timeout_ms,
            expected_iterations: iterations,
            confidence: (metrics.len() as f64 / 20.0).min(1.0),
            basis,
        }
    }

    /// Live extension policy, at most [`MAX_EXTENSIONS`] per task.
    ///
    /// Case A: iteration-bound: ≥70% of iterations used with <80% of time
    /// elapsed earns 5 more iterations. Case B: time-bound: ≥90% of time
    /// elapsed with <50% of iterations used earns 30 more seconds.
    pub fn should_extend(
        &self,
        current_iteration: u32,
        max_iterations: u32,
        elapsed_ms: u64,
        timeout_ms: u64,
        extensions_granted: u32,
    ) -> ExtensionGrant {
        if extensions_granted >= MAX_EXTENSIONS || max_iterations == 0 || timeout_ms == 0 {
            return ExtensionGrant::None;
        }
        let iter_frac = current_iteration as f64 / max_iterations as f64;
        let time_frac = elapsed_ms as f64 / timeout_ms as f64;

        if iter_frac >= 0.7 && time_frac < 0.8 {
            return ExtensionGrant::ExtraIterations(5);
        }
        if time_frac >= 0.9 && iter_frac < 0.5 {
            return ExtensionGrant::ExtraTimeMs(30_000);
        }
        ExtensionGrant::None
    }
}

/// Nearest-rank percentile of a sorted slice.
fn percentile(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
