// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streamed turn events and the sink that carries them to the transport.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use tinyclaw_model::FilterChain;

/// Events emitted while a turn is in flight. The transport serializes each
/// into one SSE frame.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Text { content: String },
    ToolStart { tool: String },
    ToolResult { tool: String, result: String },
    DelegationStart { agent_id: Option<String> },
    DelegationComplete {
        agent_id: String,
        task_id: Option<String>,
        background: bool,
        status: String,
    },
    Done,
    Error { message: String },
}

impl StreamEvent {
    /// Wire envelope: `{type, content?, tool?, result?, error?, delegation?}`.
    pub fn to_envelope(&self) -> Value {
        match self {
            StreamEvent::Text { content } => json!({"type": "text", "content": content}),
            StreamEvent::ToolStart { tool } => json!({"type": "tool_start", "tool": tool}),
            StreamEvent::ToolResult { tool, result } => {
                json!({"type": "tool_result", "tool": tool, "result": result})
            }
            StreamEvent::DelegationStart { agent_id } => {
                json!({"type": "delegation_start", "delegation": {"agentId": agent_id}})
            }
            StreamEvent::DelegationComplete { agent_id, task_id, background, status } => json!({
                "type": "delegation_complete",
                "delegation": {
                    "agentId": agent_id,
                    "taskId": task_id,
                    "background": background,
                    "status": status,
                }
            }),
            StreamEvent::Done => json!({"type": "done"}),
            StreamEvent::Error { message } => json!({"type": "error", "error": message}),
        }
    }
}

/// Writer half of the turn's event channel. Text events pass through the
/// cosmetic output filter chain; everything else is forwarded untouched.
/// Emission never blocks the orchestrator.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
    filters: Arc<FilterChain>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<StreamEvent>, filters: Arc<FilterChain>) -> Self {
        Self { tx, filters }
    }

    pub fn channel(filters: Arc<FilterChain>) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, filters), rx)
    }

    pub fn emit(&self, event: StreamEvent) {
        let event = match event {
            StreamEvent::Text { content } => StreamEvent::Text {
                content: self.filters.apply(&content),
            },
            other => other,
        };
        // A receiver that went away just means nobody is watching anymore.
        let _ = self.tx.send(event);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_events_pass_through_filters() {
        let (sink, mut rx) = EventSink::channel(Arc::new(FilterChain::default()));
        sink.emit(StreamEvent::Text { content: "wait\u{2014}what".into() });

        match rx.recv().await.unwrap() {
            StreamEvent::Text { content } => assert_eq!(content, "wait - what"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_text_events_are_untouched() {
        let (sink, mut rx) = EventSink::channel(Arc::new(FilterChain::default()));
        sink.emit(StreamEvent::ToolStart { tool: "memory\u{2014}add".into() });
        match rx.recv().await.unwrap() {
            StreamEvent::ToolStart { tool } => assert_eq!(tool, "memory\u{2014}add"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn envelopes_match_wire_contract() {
        let done = StreamEvent::Done.to_envelope();
        assert_eq!(done["type"], "done");

        let dc = StreamEvent::DelegationComplete {
            agent_id: "a1".into(),
            task_id: Some("t1".into()),
            background: true,
            status: "running".into(),
        }
        .to_envelope();
        assert_eq!(dc["type"], "delegation_complete");
        assert_eq!(dc["delegation"]["background"], true);
        assert_eq!(dc["delegation"]["taskId"], "t1");
    }

    #[test]
    fn emit_after_receiver_drop_is_silent() {
        let (sink, rx) = EventSink::channel(Arc::new(FilterChain::default()));
        drop(rx);
        sink.emit(StreamEvent::Done);
    }
}
