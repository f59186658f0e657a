// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tinyclaw_heartware::{Heartware, IDENTITY_FILE, SOUL_FILE};
use tinyclaw_model::ToolCallRequest;

use crate::tool::{optional_str, ResultDisposition, Tool, ToolCtx, ToolOutput};

/// Rewrite the companion's identity heartware. Owner-only: a guest must never
/// be able to rename the companion out from under its owner.
pub struct IdentityUpdateTool {
    heartware: Arc<Heartware>,
}

impl IdentityUpdateTool {
    pub fn new(heartware: Arc<Heartware>) -> Self {
        Self { heartware }
    }
}

#[async_trait]
impl Tool for IdentityUpdateTool {
    fn name(&self) -> &str {
        "identity_update"
    }

    fn description(&self) -> &str {
        "Update the companion's name and tagline."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "tagline": { "type": "string" }
            }
        })
    }

    fn owner_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCallRequest, _ctx: &ToolCtx) -> ToolOutput {
        let name = optional_str(&call.arguments, "name");
        let tagline = optional_str(&call.arguments, "tagline");
        if name.is_none() && tagline.is_none() {
            return ToolOutput::err("provide a name or a tagline to update");
        }

        let current = match self.heartware.load(IDENTITY_FILE) {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(format!("reading identity: {e:#}")),
        };
        let updated = rewrite_identity(&current, name, tagline);
        match self.heartware.save(IDENTITY_FILE, &updated) {
            Ok(()) => ToolOutput::ok("Identity updated"),
            Err(e) => ToolOutput::err(format!("writing identity: {e:#}")),
        }
    }
}

/// Replace (or append) the `name:` / `tagline:` lines, preserving the rest.
fn rewrite_identity(current: &str, name: Option<&str>, tagline: Option<&str>) -> String {
    let mut lines: Vec<String> = current.lines().map(|l| l.to_string()).collect();
    let mut set = |key: &str, value: &str| {
        let prefix = format!("{key}:");
        match lines.iter_mut().find(|l| l.starts_with(&prefix)) {
            Some(line) => *line = format!("{key}: {value}"),
            None => lines.push(format!("{key}: {value}")),
        }
    };
    if let Some(name) = name {
        set("name", name);
    }
    if let Some(tagline) = tagline {
        set("tagline", tagline);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Read identity or soul heartware for the model to narrate.
pub struct HeartwareReadTool {
    heartware: Arc<Heartware>,
}

impl HeartwareReadTool {
    pub fn new(heartware: Arc<Heartware>) -> Self {
        Self { heartware }
    }
}

#[async_trait]
impl Tool for HeartwareReadTool {
    fn name(&self) -> &str {
        "heartware_read"
    }

    fn description(&self) -> &str {
        "Read the companion's identity or soul file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file": { "type": "string", "enum": ["identity", "soul"] }
            },
            "required": ["file"]
        })
    }

    fn disposition(&self) -> ResultDisposition {
        ResultDisposition::Narrate
    }

    async fn execute(&self, call: &ToolCallRequest, _ctx: &ToolCtx) -> ToolOutput {
        let file = match optional_str(&call.arguments, "file") {
            Some("identity") => IDENTITY_FILE,
            Some("soul") => SOUL_FILE,
            _ => return ToolOutput::err("file must be 'identity' or 'soul'"),
        };
        match self.heartware.load(file) {
            Ok(content) if content.is_empty() => ToolOutput::ok("(file is empty)"),
            Ok(content) => ToolOutput::ok(content),
            Err(e) => ToolOutput::err(format!("reading {file}: {e:#}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolCtx {
        ToolCtx { caller_id: "owner".into(), owner_id: "owner".into() }
    }

    #[tokio::test]
    async fn update_rewrites_name_and_keeps_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let hw = Arc::new(Heartware::new(tmp.path().to_path_buf()));
        hw.seed_defaults("Ant").unwrap();
        let tool = IdentityUpdateTool::new(hw.clone());

        let call = ToolCallRequest {
            id: "c1".into(),
            name: "identity_update".into(),
            arguments: json!({"name": "Pip", "tagline": "Your small-but-mighty AI companion"}),
        };
        let out = tool.execute(&call, &ctx()).await;
        assert!(!out.is_error);

        let identity = hw.load(IDENTITY_FILE).unwrap();
        assert!(identity.contains("name: Pip"));
        assert!(identity.contains("tagline: Your small-but-mighty AI companion"));
        assert!(identity.contains("# Identity"));
    }

    #[test]
    fn identity_update_is_owner_only() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = IdentityUpdateTool::new(Arc::new(Heartware::new(tmp.path().to_path_buf())));
        assert!(tool.owner_only());
    }

    #[tokio::test]
    async fn heartware_read_narrates() {
        let tmp = tempfile::tempdir().unwrap();
        let hw = Arc::new(Heartware::new(tmp.path().to_path_buf()));
        hw.seed_defaults("Ant").unwrap();
        let tool = HeartwareReadTool::new(hw);
        assert_eq!(tool.disposition(), ResultDisposition::Narrate);

        let call = ToolCallRequest {
            id: "c1".into(),
            name: "heartware_read".into(),
            arguments: json!({"file": "soul"}),
        };
        let out = tool.execute(&call, &ctx()).await;
        assert!(out.content.contains("Warm"));
    }
}
