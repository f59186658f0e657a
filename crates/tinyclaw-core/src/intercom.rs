// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process topic bus for lifecycle events.
//!
//! Handlers run synchronously in registration order. A handler error is
//! logged and suppressed; one bad subscriber must not affect the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
pub struct Intercom {
    topics: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

/// Returned by [`Intercom::on`]; pass back to [`Intercom::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic: String,
    id: u64,
}

impl Intercom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, topic: &str, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut topics = self.topics.lock().expect("intercom mutex poisoned");
        topics
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        Subscription { topic: topic.to_string(), id }
    }

    pub fn unsubscribe(&self, sub: Subscription) {
        let mut topics = self.topics.lock().expect("intercom mutex poisoned");
        if let Some(handlers) = topics.get_mut(&sub.topic) {
            handlers.retain(|(id, _)| *id != sub.id);
            if handlers.is_empty() {
                topics.remove(&sub.topic);
            }
        }
    }

    pub fn publish(&self, topic: &str, event: &Value) {
        let handlers: Vec<Handler> = {
            let topics = self.topics.lock().expect("intercom mutex poisoned");
            topics
                .get(topic)
                .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            if let Err(e) = handler(event) {
                warn!(topic, "intercom handler failed: {e:#}");
            }
        }
    }

    pub fn clear(&self) {
        self.topics.lock().expect("intercom mutex poisoned").clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("intercom mutex poisoned")
            .get(topic)
            .map(|h| h.len())
            .unwrap_or(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
