// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only audit log.
//!
//! One JSON-lines file per day under the audit directory. Writes are
//! best-effort: an audit failure is logged and never propagates into the
//! flow being audited.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::json;
use tracing::warn;

use crate::db::now_ms;

pub struct AuditLog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, lock: Mutex::new(()) }
    }

    /// Append one record. `kind` is a short event name ("auth.login",
    /// "shield.block", ...); `detail` is arbitrary structured context.
    pub fn record(&self, kind: &str, detail: serde_json::Value) {
        let line = json!({
            "ts": now_ms(),
            "kind": kind,
            "detail": detail,
        });
        let day = chrono::Utc::now().format("%Y-%m-%d");
        let path = self.dir.join(format!("audit-{day}.jsonl"));

        let _guard = self.lock.lock().expect("audit mutex poisoned");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(path = %path.display(), "audit write failed: {e}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
