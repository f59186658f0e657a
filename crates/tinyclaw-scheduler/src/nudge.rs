// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Proactive outbound notifications.
//!
//! Nudges queue in memory and drain through `flush()`: urgent first, then
//! normal, then low, ties by creation time. Non-urgent nudges respect quiet
//! hours and a sliding one-hour delivery cap per user; urgent nudges bypass
//! both and trigger an automatic flush shortly after scheduling. A gateway
//! failure leaves the nudge queued for the next flush.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Timelike;
use tracing::{debug, warn};
use uuid::Uuid;

/// How soon after scheduling an urgent nudge the auto-flush fires.
const URGENT_FLUSH_DELAY: Duration = Duration::from_millis(200);
/// Delivery log entries kept per user.
const DELIVERY_LOG_CAP: usize = 64;
const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NudgePriority {
    // Ordering is delivery order: urgent drains first.
    Urgent,
    Normal,
    Low,
}

#[derive(Debug, Clone)]
pub struct Nudge {
    pub id: String,
    pub user_id: String,
    pub category: String,
    pub content: String,
    pub priority: NudgePriority,
    pub deliver_after: i64,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub delivered: bool,
}

/// Transport used to put a nudge in front of the user.
#[async_trait]
pub trait NudgeGateway: Send + Sync {
    async fn deliver(&self, nudge: &Nudge) -> Result<()>;
}

pub struct NudgeEngine {
    queue: Mutex<Vec<Nudge>>,
    /// Sliding-window delivery timestamps, bounded per user.
    delivery_log: Mutex<HashMap<String, VecDeque<i64>>>,
    gateway: Arc<dyn NudgeGateway>,
    cfg: tinyclaw_config::NudgeConfig,
}

impl NudgeEngine {
    pub fn new(gateway: Arc<dyn NudgeGateway>, cfg: tinyclaw_config::NudgeConfig) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            delivery_log: Mutex::new(HashMap::new()),
            gateway,
            cfg,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Queue a nudge. Urgent nudges schedule an automatic flush.
    pub fn schedule(
        self: &Arc<Self>,
        user_id: &str,
        category: &str,
        content: &str,
        priority: NudgePriority,
        deliver_after: Option<i64>,
        metadata: serde_json::Value,
    ) -> String {
        let nudge = Nudge {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            category: category.to_string(),
            content: content.to_string(),
            priority,
            deliver_after: deliver_after.unwrap_or_else(Self::now_ms),
            metadata,
            created_at: Self::now_ms(),
            delivered: false,
        };
        let id = nudge.id.clone();
        self.queue.lock().expect("nudge mutex poisoned").push(nudge);

        if priority == NudgePriority::Urgent {
            let engine = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(URGENT_FLUSH_DELAY).await;
                engine.flush().await;
            });
        }
        id
    }

    /// Deliver everything currently due. Returns the number delivered.
    pub async fn flush(&self) -> usize {
        let now = Self::now_ms();
        let hour = chrono::Local::now().hour();
        self.flush_at(now, hour).await
    }

    async fn flush_at(&self, now: i64, local_hour: u32) -> usize {
        let mut due: Vec<Nudge> = {
            let queue = self.queue.lock().expect("nudge mutex poisoned");
            queue
                .iter()
                .filter(|n| !n.delivered && n.deliver_after <= now)
                .cloned()
                .collect()
        };
        due.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));

        let mut delivered = 0usize;
        for nudge in due {
            let urgent = nudge.priority == NudgePriority::Urgent;

            if !urgent && self.in_quiet_hours(local_hour) {
                self.defer(&nudge.id, self.end_of_quiet(now, local_hour));
                debug!(nudge = %nudge.id, "deferred into quiet hours");
                continue;
            }
            if !urgent && self.rate_limited(&nudge.user_id, now) {
                debug!(nudge = %nudge.id, "held by hourly rate cap");
                continue;
            }

            match self.gateway.deliver(&nudge).await {
                Ok(()) => {
                    self.mark_delivered(&nudge.id);
                    self.log_delivery(&nudge.user_id, now);
                    delivered += 1;
                }
                Err(e) => {
                    // Stays queued; the next flush retries.
                    warn!(nudge = %nudge.id, "nudge delivery failed: {e:#}");
                }
            }
        }

        // Drop delivered entries from the queue.
        self.queue
            .lock()
            .expect("nudge mutex poisoned")
            .retain(|n| !n.delivered);
        delivered
    }

    pub fn pending_count(&self) -> usize {
        self.queue
            .lock()
            .expect("nudge mutex poisoned")
            .iter()
            .filter(|n| !n.delivered)
            .count()
    }

    fn mark_delivered(&self, id: &str) {
        let mut queue = self.queue.lock().expect("nudge mutex poisoned");
        if let Some(n) = queue.iter_mut().find(|n| n.id == id) {
            n.delivered = true;
        }
    }

    fn defer(&self, id: &str, until: i64) {
        let mut queue = self.queue.lock().expect("nudge mutex poisoned");
        if let Some(n) = queue.iter_mut().find(|n| n.id == id) {
            n.deliver_after = until;
        }
    }

    fn in_quiet_hours(&self, hour: u32) -> bool {
        let start = self.cfg.quiet_start_hour;
        let end = self.cfg.quiet_end_hour;
        if start == end {
            return false;
        }
        if start < end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        }
    }

    fn end_of_quiet(&self, now: i64, hour: u32) -> i64 {
        let end = self.cfg.quiet_end_hour;
        let hours_left = if hour < end {
            end - hour
        } else {
            24 - hour + end
        };
        now + hours_left as i64 * HOUR_MS
    }

    fn rate_limited(&self, user_id: &str, now: i64) -> bool {
        let mut log = self.delivery_log.lock().expect("nudge mutex poisoned");
        let entries = log.entry(user_id.to_string()).or_default();
        while let Some(front) = entries.front() {
            if now - front > HOUR_MS {
                entries.pop_front();
            } else {
                break;
            }
        }
        entries.len() >= self.cfg.max_per_hour
    }

    fn log_delivery(&self, user_id: &str, now: i64) {
        let mut log = self.delivery_log.lock().expect("nudge mutex poisoned");
        let entries = log.entry(user_id.to_string()).or_default();
        entries.push_back(now);
        while entries.len() > DELIVERY_LOG_CAP {
            entries.pop_front();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockGateway {
        delivered: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl MockGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self { delivered: Mutex::new(Vec::new()), fail: AtomicBool::new(false) })
        }
    }

    #[async_trait]
    impl NudgeGateway for MockGateway {
        async fn deliver(&self, nudge: &Nudge) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("gateway down");
            }
            self.delivered.lock().unwrap().push(nudge.content.clone());
            Ok(())
        }
    }

    fn engine_with(gateway: Arc<MockGateway>) -> Arc<NudgeEngine> {
        // Quiet hours disabled so tests are independent of the wall clock.
        let mut cfg = tinyclaw_config::NudgeConfig::default();
        cfg.quiet_start_hour = 0;
        cfg.quiet_end_hour = 0;
        Arc::new(NudgeEngine::new(gateway, cfg))
    }

    #[tokio::test]
    async fn priority_then_created_at_ordering() {
        let gw = MockGateway::new();
        let engine = engine_with(gw.clone());
        engine.schedule("u", "misc", "low-1", NudgePriority::Low, None, serde_json::json!({}));
        engine.schedule("u", "misc", "normal-1", NudgePriority::Normal, None, serde_json::json!({}));
        engine.schedule("u", "misc", "normal-2", NudgePriority::Normal, None, serde_json::json!({}));

        let delivered = engine.flush().await;
        assert_eq!(delivered, 3);
        assert_eq!(
            gw.delivered.lock().unwrap().as_slice(),
            ["normal-1", "normal-2", "low-1"]
        );
    }

    #[tokio::test]
    async fn future_nudges_are_not_due() {
        let gw = MockGateway::new();
        let engine = engine_with(gw.clone());
        let later = chrono::Utc::now().timestamp_millis() + 60_000;
        engine.schedule("u", "misc", "later", NudgePriority::Normal, Some(later), serde_json::json!({}));

        assert_eq!(engine.flush().await, 0);
        assert_eq!(engine.pending_count(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_stays_queued() {
        let gw = MockGateway::new();
        gw.fail.store(true, Ordering::SeqCst);
        let engine = engine_with(gw.clone());
        engine.schedule("u", "misc", "retry me", NudgePriority::Normal, None, serde_json::json!({}));

        assert_eq!(engine.flush().await, 0);
        assert_eq!(engine.pending_count(), 1);

        gw.fail.store(false, Ordering::SeqCst);
        assert_eq!(engine.flush().await, 1);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn hourly_cap_holds_normal_but_not_urgent() {
        let gw = MockGateway::new();
        let engine = engine_with(gw.clone());
        let cap = tinyclaw_config::NudgeConfig::default().max_per_hour;

        for i in 0..cap {
            engine.schedule("u", "misc", &format!("n{i}"), NudgePriority::Normal, None, serde_json::json!({}));
        }
        engine.flush().await;
        assert_eq!(gw.delivered.lock().unwrap().len(), cap);

        engine.schedule("u", "misc", "over-cap", NudgePriority::Normal, None, serde_json::json!({}));
        engine.flush().await;
        assert_eq!(gw.delivered.lock().unwrap().len(), cap);

        engine.schedule("u", "alert", "urgent!", NudgePriority::Urgent, None, serde_json::json!({}));
        engine.flush().await;
        assert!(gw.delivered.lock().unwrap().contains(&"urgent!".to_string()));
    }

    #[tokio::test]
    async fn urgent_auto_flushes_without_explicit_call() {
        let gw = MockGateway::new();
        let engine = engine_with(gw.clone());
        engine.schedule("u", "alert", "fire", NudgePriority::Urgent, None, serde_json::json!({}));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(gw.delivered.lock().unwrap().as_slice(), ["fire"]);
    }

    #[tokio::test]
    async fn quiet_hours_defer_non_urgent() {
        let gw = MockGateway::new();
        let mut cfg = tinyclaw_config::NudgeConfig::default();
        cfg.quiet_start_hour = 22;
        cfg.quiet_end_hour = 8;
        let engine = Arc::new(NudgeEngine::new(gw.clone(), cfg));

        engine.schedule("u", "misc", "sleepy", NudgePriority::Normal, None, serde_json::json!({}));
        engine.schedule("u", "alert", "wake up", NudgePriority::Urgent, None, serde_json::json!({}));

        // Simulate a 23:00 flush: urgent goes out, normal is deferred.
        let now = chrono::Utc::now().timestamp_millis();
        let delivered = engine.flush_at(now, 23).await;
        assert_eq!(delivered, 1);
        assert_eq!(gw.delivered.lock().unwrap().as_slice(), ["wake up"]);
        assert_eq!(engine.pending_count(), 1);
    }
}
