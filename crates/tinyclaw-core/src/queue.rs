// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-principal FIFO serialization.
//!
//! Work sharing a key executes in strict submission order on a dedicated
//! worker task; work across keys runs concurrently. A failed or panicking
//! job never blocks later jobs on the same key. When a key's last job
//! finishes, its worker and map entry are removed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("session queue is stopped")]
    Stopped,
    #[error("queued work was dropped before completing")]
    Dropped,
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct KeyEntry {
    tx: mpsc::UnboundedSender<Job>,
    pending: usize,
}

#[derive(Clone)]
pub struct SessionQueue {
    inner: Arc<Mutex<HashMap<String, KeyEntry>>>,
    stopped: Arc<AtomicBool>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Submit `work` under `key` and wait for its result.
    pub async fn enqueue<T, F>(&self, key: &str, work: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let (result_tx, result_rx) = oneshot::channel::<T>();
        let inner = self.inner.clone();
        let key_owned = key.to_string();

        let job: Job = Box::pin(async move {
            let result = work.await;
            // Refcount bookkeeping happens inside the job so a caller that
            // abandons the result future cannot leak the map entry.
            {
                let mut map = inner.lock().expect("queue mutex poisoned");
                if let Some(entry) = map.get_mut(&key_owned) {
                    entry.pending -= 1;
                    if entry.pending == 0 {
                        map.remove(&key_owned);
                        debug!(key = %key_owned, "session queue drained");
                    }
                }
            }
            let _ = result_tx.send(result);
        });

        {
            let mut map = self.inner.lock().expect("queue mutex poisoned");
            let entry = map.entry(key.to_string()).or_insert_with(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        // Run each job on its own task so a panic aborts the
                        // job, not the whole key's worker.
                        let _ = tokio::spawn(job).await;
                    }
                });
                KeyEntry { tx, pending: 0 }
            });
            entry.pending += 1;
            entry.tx.send(job).map_err(|_| QueueError::Stopped)?;
        }

        result_rx.await.map_err(|_| QueueError::Dropped)
    }

    /// Reject further submissions. In-flight work finishes normally.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of keys with work outstanding (diagnostics).
    pub fn active_keys(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").len()
    }
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_runs_in_submission_order() {
        let queue = SessionQueue::new();
        let log: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let queue = queue.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue("userA", async move {
                        // Earlier jobs sleep longer; order must still hold.
                        tokio::time::sleep(Duration::from_millis((5 - i) as u64 * 10)).await;
                        log.lock().unwrap().push(i);
                    })
                    .await
                    .unwrap();
            }));
            // Give each submission time to land before the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(log.lock().unwrap().as_slice(), &[0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let queue = SessionQueue::new();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        // userA#1 (slow), then userB (fast) submitted while A runs: B must
        // finish before A's second job.
        let qa = queue.clone();
        let la = log.clone();
        let a1 = tokio::spawn(async move {
            qa.enqueue("userA", async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                la.lock().unwrap().push("userA#1");
            })
            .await
            .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let qb = queue.clone();
        let lb = log.clone();
        let b = tokio::spawn(async move {
            qb.enqueue("userB", async move {
                lb.lock().unwrap().push("userB");
            })
            .await
            .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let qa2 = queue.clone();
        let la2 = log.clone();
        let a2 = tokio::spawn(async move {
            qa2.enqueue("userA", async move {
                la2.lock().unwrap().push("userA#2");
            })
            .await
            .unwrap();
        });

        for h in [a1, b, a2] {
            h.await.unwrap();
        }
        assert_eq!(log.lock().unwrap().as_slice(), &["userB", "userA#1", "userA#2"]);
    }

    #[tokio::test]
    async fn failed_work_does_not_block_the_chain() {
        let queue = SessionQueue::new();
        let first: Result<&str, &str> = queue
            .enqueue("k", async { Err("boom") })
            .await
            .unwrap();
        assert!(first.is_err());

        let second = queue.enqueue("k", async { Ok::<_, &str>("fine") }).await.unwrap();
        assert_eq!(second, Ok("fine"));
    }

    #[tokio::test]
    async fn stop_rejects_new_submissions() {
        let queue = SessionQueue::new();
        queue.stop();
        let err = queue.enqueue("k", async { 1 }).await.unwrap_err();
        assert_eq!(err, QueueError::Stopped);
    }

    #[tokio::test]
    async fn drained_keys_are_removed() {
        let queue = SessionQueue::new();
        queue.enqueue("k", async {}).await.unwrap();
        // The entry is removed inside the job before the result is sent.
        assert_eq!(queue.active_keys(), 0);
    }
}
