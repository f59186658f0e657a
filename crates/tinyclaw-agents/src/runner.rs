// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Background task runner.
//!
//! `start` persists a `running` record and spawns the work off the caller's
//! critical path, returning immediately. Completion writes the terminal
//! status and publishes `task:completed` / `task:failed` through the injected
//! publisher (the intercom, in production wiring). Results wait in the store
//! until the next owner turn delivers them exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tinyclaw_store::{now_ms, BackgroundTaskRecord, Store, TaskStatus};

/// Topic publisher injected by the runtime (backed by the intercom bus).
pub type Publisher = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;

pub struct TaskHandle {
    join: JoinHandle<()>,
}

pub struct BackgroundRunner {
    store: Arc<Store>,
    publisher: Publisher,
    handles: Mutex<HashMap<String, TaskHandle>>,
}

impl BackgroundRunner {
    pub fn new(store: Arc<Store>, publisher: Publisher) -> Self {
        Self { store, publisher, handles: Mutex::new(HashMap::new()) }
    }

    /// Launch `work` as a background task. Returns as soon as the `running`
    /// record is persisted; the work itself races the given timeout.
    pub fn start<F>(
        &self,
        owner: &str,
        agent_id: &str,
        description: &str,
        timeout_ms: u64,
        work: F,
    ) -> Result<BackgroundTaskRecord>
    where
        F: Future<Output = Result<String>> + Send + 'static,
    {
        let record = self.store.insert_background_task(owner, agent_id, description)?;
        let task_id = record.id.clone();

        let store = self.store.clone();
        let publisher = self.publisher.clone();
        let owner = owner.to_string();
        let agent = agent_id.to_string();
        let id_for_task = task_id.clone();

        let join = tokio::spawn(async move {
            let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), work).await;
            let (status, result, topic) = match outcome {
                Ok(Ok(text)) => (TaskStatus::Completed, text, "task:completed"),
                Ok(Err(e)) => (TaskStatus::Failed, format!("Error: {e:#}"), "task:failed"),
                Err(_) => (
                    TaskStatus::Failed,
                    format!("Error: task exceeded its {timeout_ms}ms budget"),
                    "task:failed",
                ),
            };

            if let Err(e) = store.complete_background_task(&id_for_task, status, Some(&result)) {
                warn!(task = %id_for_task, "failed to persist task outcome: {e:#}");
            }
            publisher(
                topic,
                json!({
                    "taskId": id_for_task,
                    "agentId": agent,
                    "ownerUserId": owner,
                    "status": status.as_str(),
                }),
            );
        });

        self.handles
            .lock()
            .expect("runner mutex poisoned")
            .insert(task_id.clone(), TaskHandle { join });
        debug!(task = %task_id, "background task started");
        Ok(record)
    }

    /// Remove bookkeeping for tasks that already finished.
    pub fn reap_finished(&self) {
        let mut handles = self.handles.lock().expect("runner mutex poisoned");
        handles.retain(|_, h| !h.join.is_finished());
    }

    /// Terminal tasks awaiting delivery into an owner turn.
    pub fn undelivered(&self, owner: &str) -> Result<Vec<BackgroundTaskRecord>> {
        self.store.undelivered_background_tasks(owner)
    }

    /// Exactly-once delivery stamp.
    pub fn mark_delivered(&self, task_id: &str) -> Result<bool> {
        self.store.mark_background_task_delivered(task_id)
    }

    /// Best-effort cancellation of everything in flight. Each cancelled task
    /// reaches a terminal `failed` status before this returns.
    pub fn cancel_all(&self) -> Result<usize> {
        let drained: Vec<(String, TaskHandle)> = {
            let mut handles = self.handles.lock().expect("runner mutex poisoned");
            handles.drain().collect()
        };
        let mut cancelled = 0usize;
        for (task_id, handle) in drained {
            if !handle.join.is_finished() {
                handle.join.abort();
                // The aborted task cannot write its own terminal status.
                self.store.complete_background_task(
                    &task_id,
                    TaskStatus::Failed,
                    Some("Error: cancelled by shutdown"),
                )?;
                (self.publisher)(
                    "task:failed",
                    json!({ "taskId": task_id, "status": "failed", "cancelled": true }),
                );
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Fail any `running` task older than the threshold. Catches tasks
    /// orphaned by a crash (their tokio task no longer exists).
    pub fn cleanup_stale(&self, threshold_ms: u64) -> Result<usize> {
        let cutoff = now_ms() - threshold_ms as i64;
        self.store.fail_stale_background_tasks(cutoff)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_with_log() -> (Arc<BackgroundRunner>, Arc<Mutex<Vec<String>>>) {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let publisher: Publisher = Arc::new(move |topic, _payload| {
            sink.lock().unwrap().push(topic.to_string());
        });
        let runner = Arc::new(BackgroundRunner::new(
            Arc::new(Store::open_in_memory().unwrap()),
            publisher,
        ));
        (runner, events)
    }

    async fn wait_terminal(runner: &BackgroundRunner, owner: &str) -> BackgroundTaskRecord {
        for _ in 0..100 {
            let tasks = runner.undelivered(owner).unwrap();
            if let Some(t) = tasks.into_iter().next() {
                return t;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached a terminal status");
    }

    #[tokio::test]
    async fn start_returns_before_completion() {
        let (runner, events) = runner_with_log();
        let record = runner
            .start("owner", "agent-1", "slow research", 5_000, async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("findings".to_string())
            })
            .unwrap();
        assert_eq!(record.status, TaskStatus::Running);

        let done = wait_terminal(&runner, "owner").await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("findings"));
        assert_eq!(events.lock().unwrap().as_slice(), ["task:completed"]);
    }

    #[tokio::test]
    async fn failing_work_is_marked_failed() {
        let (runner, events) = runner_with_log();
        runner
            .start("owner", "agent-1", "doomed", 5_000, async {
                anyhow::bail!("model unreachable")
            })
            .unwrap();

        let done = wait_terminal(&runner, "owner").await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.result.unwrap().contains("model unreachable"));
        assert_eq!(events.lock().unwrap().as_slice(), ["task:failed"]);
    }

    #[tokio::test]
    async fn timeout_produces_failed_status() {
        let (runner, _) = runner_with_log();
        runner
            .start("owner", "agent-1", "too slow", 20, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("never".to_string())
            })
            .unwrap();

        let done = wait_terminal(&runner, "owner").await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.result.unwrap().contains("budget"));
    }

    #[tokio::test]
    async fn cancel_all_reaches_terminal_status() {
        let (runner, _) = runner_with_log();
        runner
            .start("owner", "agent-1", "endless", 60_000, async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok("never".to_string())
            })
            .unwrap();

        let cancelled = runner.cancel_all().unwrap();
        assert_eq!(cancelled, 1);
        let tasks = runner.undelivered("owner").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn delivery_marks_exactly_once() {
        let (runner, _) = runner_with_log();
        runner
            .start("owner", "agent-1", "quick", 5_000, async { Ok("done".to_string()) })
            .unwrap();
        let done = wait_terminal(&runner, "owner").await;

        assert!(runner.mark_delivered(&done.id).unwrap());
        assert!(!runner.mark_delivered(&done.id).unwrap());
        assert!(runner.undelivered("owner").unwrap().is_empty());
    }
}
