// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Interval-driven job dispatcher.
//!
//! Schedules are compact strings (`"10m"`, `"6h"`, `"1d"`). Each job runs on
//! its own tokio task with ±10% jitter so periodic work never thunders in
//! lockstep. Handler errors are logged and do not affect other jobs. `stop()`
//! is cooperative: in-flight handlers finish, no new dispatches occur.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct PulseJob {
    pub id: String,
    pub schedule: String,
    pub handler: JobHandler,
    pub run_on_start: bool,
}

impl PulseJob {
    pub fn new(id: &str, schedule: &str, run_on_start: bool, handler: JobHandler) -> Self {
        Self {
            id: id.to_string(),
            schedule: schedule.to_string(),
            handler,
            run_on_start,
        }
    }
}

/// Parse `"<N><m|h|d>"` into a duration.
pub fn parse_schedule(schedule: &str) -> Result<Duration> {
    let schedule = schedule.trim();
    let Some(unit) = schedule.chars().last() else {
        bail!("empty schedule");
    };
    let value: u64 = schedule[..schedule.len() - 1]
        .parse()
        .map_err(|_| anyhow::anyhow!("bad schedule: {schedule}"))?;
    if value == 0 {
        bail!("schedule interval must be positive: {schedule}");
    }
    let seconds = match unit {
        'm' => value * 60,
        'h' => value * 3600,
        'd' => value * 86_400,
        _ => bail!("unknown schedule unit in {schedule} (expected m, h, or d)"),
    };
    Ok(Duration::from_secs(seconds))
}

pub struct PulseScheduler {
    jobs: Vec<PulseJob>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl PulseScheduler {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self { jobs: Vec::new(), stop_tx, handles: Vec::new() }
    }

    pub fn add_job(&mut self, job: PulseJob) {
        self.jobs.push(job);
    }

    /// Validate schedules and spawn every job loop. Run-on-start jobs
    /// dispatch immediately.
    pub fn start(&mut self) -> Result<()> {
        for job in self.jobs.drain(..) {
            let interval = parse_schedule(&job.schedule)?;
            let mut stop_rx = self.stop_tx.subscribe();
            let handle = tokio::spawn(async move {
                if job.run_on_start {
                    run_once(&job).await;
                }
                loop {
                    let sleep_for = with_jitter(interval);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = stop_rx.changed() => {
                            debug!(job = %job.id, "pulse job stopping");
                            return;
                        }
                    }
                    if *stop_rx.borrow() {
                        return;
                    }
                    run_once(&job).await;
                }
            });
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Cooperative stop: no new dispatches; in-flight handlers run to
    /// completion before their task exits.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Default for PulseScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_once(job: &PulseJob) {
    debug!(job = %job.id, "pulse dispatch");
    if let Err(e) = (job.handler)().await {
        warn!(job = %job.id, "pulse job failed: {e:#}");
    }
}

/// ±10% jitter around the nominal interval.
fn with_jitter(interval: Duration) -> Duration {
    let base = interval.as_millis() as i64;
    let spread = base / 10;
    if spread == 0 {
        return interval;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((base + offset).max(1) as u64)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn schedule_parsing() {
        assert_eq!(parse_schedule("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_schedule("6h").unwrap(), Duration::from_secs(6 * 3600));
        assert_eq!(parse_schedule("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_schedule("0m").is_err());
        assert!(parse_schedule("5x").is_err());
        assert!(parse_schedule("").is_err());
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let nominal = Duration::from_secs(600);
        for _ in 0..100 {
            let jittered = with_jitter(nominal).as_secs_f64();
            assert!((540.0..=660.0).contains(&jittered));
        }
    }

    #[tokio::test]
    async fn run_on_start_dispatches_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handler: JobHandler = Arc::new(move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let mut scheduler = PulseScheduler::new();
        scheduler.add_job(PulseJob::new("test", "1h", true, handler));
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn handler_error_does_not_kill_other_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let failing: JobHandler =
            Arc::new(|| Box::pin(async { anyhow::bail!("always fails") }));
        let counting: JobHandler = Arc::new(move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let mut scheduler = PulseScheduler::new();
        scheduler.add_job(PulseJob::new("bad", "1h", true, failing));
        scheduler.add_job(PulseJob::new("good", "1h", true, counting));
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_prevents_future_dispatches() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handler: JobHandler = Arc::new(move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let mut scheduler = PulseScheduler::new();
        scheduler.add_job(PulseJob::new("test", "1h", true, handler));
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop().await;
        let seen = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }
}
