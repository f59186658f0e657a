// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Isolated JavaScript evaluator.
//!
//! Each execution gets a fresh QuickJS runtime with no filesystem or network
//! bindings: the only way in is the `input` global, the only way out is the
//! evaluated value. A wall-clock deadline is enforced through the engine's
//! interrupt handler, so even `while(true){}` terminates.
//!
//! Evaluation is blocking; it runs on the tokio blocking pool so the calling
//! turn task never stalls the executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::{Context, Runtime};
use tracing::debug;

/// Structured outcome of one evaluation.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Wall-clock budget. `None` uses the configured default; values above
    /// the configured cap are clamped.
    pub timeout_ms: Option<u64>,
}

pub struct Sandbox {
    cfg: tinyclaw_config::SandboxConfig,
    /// Set by `shutdown()`; every interrupt handler observes it.
    shutting_down: Arc<AtomicBool>,
}

impl Sandbox {
    pub fn new(cfg: tinyclaw_config::SandboxConfig) -> Self {
        Self { cfg, shutting_down: Arc::new(AtomicBool::new(false)) }
    }

    pub async fn execute(&self, code: &str, opts: ExecuteOptions) -> SandboxResult {
        self.run(code.to_string(), None, opts).await
    }

    /// Like [`execute`] but binds `input` as a global string inside the
    /// sandbox.
    pub async fn execute_with_input(
        &self,
        code: &str,
        input: &str,
        opts: ExecuteOptions,
    ) -> SandboxResult {
        self.run(code.to_string(), Some(input.to_string()), opts).await
    }

    /// Interrupt all outstanding evaluations. New executions fail fast.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn effective_timeout(&self, opts: &ExecuteOptions) -> Duration {
        let requested = opts.timeout_ms.unwrap_or(self.cfg.timeout_ms);
        Duration::from_millis(requested.min(self.cfg.max_timeout_ms))
    }

    async fn run(&self, code: String, input: Option<String>, opts: ExecuteOptions) -> SandboxResult {
        let timeout = self.effective_timeout(&opts);
        let shutting_down = self.shutting_down.clone();

        if shutting_down.load(Ordering::SeqCst) {
            return SandboxResult {
                success: false,
                output: None,
                error: Some("sandbox is shutting down".into()),
                duration_ms: 0,
            };
        }

        let handle = tokio::task::spawn_blocking(move || {
            evaluate_blocking(&code, input.as_deref(), timeout, shutting_down)
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => SandboxResult {
                success: false,
                output: None,
                error: Some(format!("sandbox task failed: {e}")),
                duration_ms: 0,
            },
        }
    }
}

fn evaluate_blocking(
    code: &str,
    input: Option<&str>,
    timeout: Duration,
    shutting_down: Arc<AtomicBool>,
) -> SandboxResult {
    let started = Instant::now();
    let deadline = started + timeout;

    let fail = |error: String, started: Instant| SandboxResult {
        success: false,
        output: None,
        error: Some(error),
        duration_ms: started.elapsed().as_millis() as u64,
    };

    let runtime = match Runtime::new() {
        Ok(r) => r,
        Err(e) => return fail(format!("runtime init failed: {e}"), started),
    };
    runtime.set_interrupt_handler(Some(Box::new(move || {
        Instant::now() >= deadline || shutting_down.load(Ordering::SeqCst)
    })));

    let context = match Context::full(&runtime) {
        Ok(c) => c,
        Err(e) => return fail(format!("context init failed: {e}"), started),
    };

    let outcome: Result<Option<String>, String> = context.with(|ctx| {
        if let Some(input) = input {
            ctx.globals()
                .set("input", input)
                .map_err(|e| format!("binding input failed: {e}"))?;
        }
        match ctx.eval::<rquickjs::Value, _>(code) {
            Ok(value) => {
                if value.is_undefined() {
                    return Ok(Some("undefined".to_string()));
                }
                // JSON gives a readable, deterministic rendering of objects;
                // primitives fall back to their string form.
                match ctx.json_stringify(value.clone()) {
                    Ok(Some(s)) => Ok(Some(
                        s.to_string().unwrap_or_else(|_| "null".to_string()),
                    )),
                    _ => Ok(value
                        .as_string()
                        .and_then(|s| s.to_string().ok())
                        .or(Some("null".to_string()))),
                }
            }
            Err(_) => {
                let caught = ctx.catch();
                let rendered = caught
                    .as_exception()
                    .and_then(|exc| exc.message())
                    .unwrap_or_else(|| format!("{caught:?}"));
                Err(rendered)
            }
        }
    });

    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(output) => SandboxResult { success: true, output, error: None, duration_ms },
        Err(error) => {
            debug!(error = %error, "sandbox evaluation failed");
            let error = if started.elapsed() >= timeout {
                format!("execution timed out after {}ms", timeout.as_millis())
            } else {
                error
            };
            SandboxResult { success: false, output: None, error: Some(error), duration_ms }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
