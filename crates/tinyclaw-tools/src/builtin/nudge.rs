// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tinyclaw_model::ToolCallRequest;
use tinyclaw_scheduler::{NudgeEngine, NudgePriority};

use crate::tool::{optional_str, required_str, Tool, ToolCtx, ToolOutput};

/// Schedule a proactive reminder for later delivery through the nudge engine.
pub struct ScheduleNudgeTool {
    nudges: Arc<NudgeEngine>,
}

impl ScheduleNudgeTool {
    pub fn new(nudges: Arc<NudgeEngine>) -> Self {
        Self { nudges }
    }
}

#[async_trait]
impl Tool for ScheduleNudgeTool {
    fn name(&self) -> &str {
        "schedule_nudge"
    }

    fn description(&self) -> &str {
        "Schedule a proactive reminder to be delivered later."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string" },
                "category": { "type": "string" },
                "priority": { "type": "string", "enum": ["urgent", "normal", "low"] },
                "deliver_in_minutes": { "type": "integer", "minimum": 0 }
            },
            "required": ["content"]
        })
    }

    fn owner_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCallRequest, ctx: &ToolCtx) -> ToolOutput {
        let content = match required_str(&call.arguments, "content") {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(e),
        };
        let priority = match optional_str(&call.arguments, "priority") {
            Some("urgent") => NudgePriority::Urgent,
            Some("low") => NudgePriority::Low,
            _ => NudgePriority::Normal,
        };
        let deliver_after = call
            .arguments
            .get("deliver_in_minutes")
            .and_then(|v| v.as_i64())
            .map(|mins| chrono::Utc::now().timestamp_millis() + mins * 60_000);

        let id = self.nudges.schedule(
            &ctx.caller_id,
            optional_str(&call.arguments, "category").unwrap_or("reminder"),
            content,
            priority,
            deliver_after,
            json!({}),
        );
        ToolOutput::ok(format!("Nudge scheduled ({id})"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
