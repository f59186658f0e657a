// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-principal queue of tool calls awaiting conversational approval.
//!
//! Entirely in-memory: approvals expire silently on restart. Entries that
//! sit unanswered for the TTL (default 5 minutes) are dropped on the next
//! access; the comparison is exclusive, so an entry exactly at the boundary
//! is already gone.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tinyclaw_model::ToolCallRequest;

use crate::types::Decision;

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub tool_call: ToolCallRequest,
    pub decision: Decision,
    pub created_at: i64,
}

pub struct ApprovalQueue {
    queues: Mutex<HashMap<String, VecDeque<PendingApproval>>>,
    ttl: Duration,
}

impl ApprovalQueue {
    pub fn new(ttl: Duration) -> Self {
        Self { queues: Mutex::new(HashMap::new()), ttl }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn is_fresh(&self, entry: &PendingApproval, now: i64) -> bool {
        // Exclusive: age == ttl is already expired.
        (now - entry.created_at) < self.ttl.as_millis() as i64
    }

    pub fn push(&self, user_id: &str, tool_call: ToolCallRequest, decision: Decision) {
        let entry = PendingApproval { tool_call, decision, created_at: Self::now_ms() };
        let mut queues = self.queues.lock().expect("approval mutex poisoned");
        queues.entry(user_id.to_string()).or_default().push_back(entry);
    }

    /// Re-queue at the head with a refreshed timestamp (the UNCLEAR path).
    pub fn push_front_refreshed(&self, user_id: &str, mut entry: PendingApproval) {
        entry.created_at = Self::now_ms();
        let mut queues = self.queues.lock().expect("approval mutex poisoned");
        queues.entry(user_id.to_string()).or_default().push_front(entry);
    }

    /// Pop the oldest non-expired entry, discarding expired ones on the way.
    pub fn pop_fresh(&self, user_id: &str) -> Option<PendingApproval> {
        let now = Self::now_ms();
        let mut queues = self.queues.lock().expect("approval mutex poisoned");
        let queue = queues.get_mut(user_id)?;
        while let Some(entry) = queue.pop_front() {
            if self.is_fresh(&entry, now) {
                if queue.is_empty() {
                    queues.remove(user_id);
                }
                return Some(entry);
            }
        }
        queues.remove(user_id);
        None
    }

    /// True if a non-expired entry is waiting (without consuming it).
    pub fn has_pending(&self, user_id: &str) -> bool {
        let now = Self::now_ms();
        let mut queues = self.queues.lock().expect("approval mutex poisoned");
        let Some(queue) = queues.get_mut(user_id) else {
            return false;
        };
        while let Some(front) = queue.front() {
            if self.is_fresh(front, now) {
                return true;
            }
            queue.pop_front();
        }
        queues.remove(user_id);
        false
    }

    /// Number of queued (possibly stale) entries, for diagnostics.
    pub fn queued_len(&self, user_id: &str) -> usize {
        let queues = self.queues.lock().expect("approval mutex poisoned");
        queues.get(user_id).map(|q| q.len()).unwrap_or(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
