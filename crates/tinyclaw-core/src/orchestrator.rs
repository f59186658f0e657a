// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn orchestrator.
//!
//! One inbound message flows through: pending-approval handling → compaction
//! check → history assembly (summary, raw window, undelivered background
//! results) → guest injection defense → system prompt composition → the
//! agent loop (model call, tool parse, authority gate, shield gate, execute,
//! result feedback) → streamed events out. Turns for the same principal are
//! serialized by the session queue; different principals run concurrently.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use tinyclaw_agents::BackgroundRunner;
use tinyclaw_config::OrchestratorConfig;
use tinyclaw_memory::{EventType, MemoryEngine};
use tinyclaw_model::{
    FilterChain, Message, ProviderRegistry, ProviderReply, ToolCallRequest,
};
use tinyclaw_shield::{ApprovalQueue, PendingApproval, Shield, ShieldAction, ShieldEvent};
use tinyclaw_store::{AuditLog, Store};
use tinyclaw_tools::{ResultDisposition, ToolCtx, ToolRegistry};

use crate::compactor::Compactor;
use crate::events::{EventSink, StreamEvent};
use crate::prompts;
use crate::queue::SessionQueue;

pub struct OrchestratorDeps {
    pub registry: Arc<ProviderRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub shield: Arc<Shield>,
    pub approvals: Arc<ApprovalQueue>,
    pub memory: Arc<MemoryEngine>,
    pub compactor: Arc<Compactor>,
    pub store: Arc<Store>,
    pub runner: Arc<BackgroundRunner>,
    pub queue: SessionQueue,
    pub filters: Arc<FilterChain>,
    pub audit: Option<Arc<AuditLog>>,
    /// Identity and soul heartware text, loaded at wiring time.
    pub identity_text: String,
    pub soul_text: String,
    pub cfg: OrchestratorConfig,
}

pub struct Orchestrator {
    deps: OrchestratorDeps,
    agent_id_re: Regex,
    task_id_re: Regex,
    uuid_re: Regex,
    injection_patterns: Vec<Regex>,
}

enum Step {
    /// The turn is over; reply with this text.
    Finish(String),
    /// Keep looping; `messages` was extended with feedback.
    Continue,
}

#[derive(Debug, PartialEq, Eq)]
enum ApprovalVerdict {
    Approved,
    Denied,
    Unclear,
}

const UUID_PATTERN: &str =
    "[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            agent_id_re: Regex::new(&format!(r"(?i)agent[ _-]?id:?\s*({UUID_PATTERN})"))
                .expect("static regex"),
            task_id_re: Regex::new(&format!(r"(?i)task[ _-]?id:?\s*({UUID_PATTERN})"))
                .expect("static regex"),
            uuid_re: Regex::new(UUID_PATTERN).expect("static regex"),
            injection_patterns: prompts::injection_patterns(),
        })
    }

    pub fn queue(&self) -> &SessionQueue {
        &self.deps.queue
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.deps.store
    }

    fn is_owner(&self, user_id: &str) -> bool {
        user_id == self.deps.cfg.owner_id
    }

    /// Entry point: serialize per principal, then run the turn.
    pub async fn handle_message(
        self: Arc<Self>,
        user_id: &str,
        message: &str,
        sink: Option<EventSink>,
    ) -> Result<String> {
        let this = self.clone();
        let user = user_id.to_string();
        let text = message.to_string();
        let result = self
            .deps
            .queue
            .enqueue(user_id, async move { this.turn(&user, &text, sink.as_ref()).await })
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        result
    }

    async fn turn(&self, user_id: &str, message: &str, sink: Option<&EventSink>) -> Result<String> {
        // ── Pending approval handling ────────────────────────────────────────
        if self.deps.approvals.has_pending(user_id) {
            if let Some(entry) = self.deps.approvals.pop_fresh(user_id) {
                let reply = self.resolve_approval(user_id, message, entry).await;
                self.deps
                    .store
                    .append_message(user_id, "user", message, None, None)?;
                return Ok(self.finish(user_id, reply, sink));
            }
        }

        // ── Compaction check (best-effort) ──────────────────────────────────
        let compaction_provider = self.deps.registry.default_provider();
        if let Err(e) = self
            .deps
            .compactor
            .compact_if_needed(user_id, compaction_provider.as_ref())
            .await
        {
            warn!(user = user_id, "compaction failed: {e:#}");
        }

        // ── Persist inbound, assemble history ───────────────────────────────
        let inbound = self
            .deps
            .store
            .append_message(user_id, "user", message, None, None)?;

        let mut messages: Vec<Message> = Vec::new();
        if let Ok(Some(summary)) = self.deps.compactor.latest_summary(user_id) {
            messages.push(Message::system(format!(
                "Conversation summary so far:\n{summary}"
            )));
        }

        let window_start = self.deps.compactor.window_start(user_id).unwrap_or(0);
        let raw = self.deps.store.recent_messages(
            user_id,
            self.deps.cfg.history_window,
            window_start,
        )?;
        for rec in raw.iter().filter(|r| r.id != inbound.id) {
            messages.push(record_to_message(rec));
        }

        // Undelivered background results, delivered exactly once.
        for task in self.deps.runner.undelivered(user_id).unwrap_or_default() {
            let status = task.status.as_str();
            messages.push(Message::system(format!(
                "[Background task {status}] \"{}\" Result: {}",
                task.description,
                task.result.as_deref().unwrap_or("(none)")
            )));
            if let Err(e) = self.deps.runner.mark_delivered(&task.id) {
                warn!(task = %task.id, "marking delivery failed: {e:#}");
            }
        }

        // ── Guest prompt-injection defense ──────────────────────────────────
        let outbound_text = if !self.is_owner(user_id)
            && prompts::looks_like_injection(message, &self.injection_patterns)
        {
            debug!(user = user_id, "guest message wrapped as untrusted content");
            prompts::wrap_untrusted(message)
        } else {
            message.to_string()
        };
        messages.push(Message::user(outbound_text));

        // ── Route and compose the system prompt ─────────────────────────────
        let route = self.deps.registry.route_with_health(message).await;
        if route.failed_over {
            warn!("all providers unhealthy; attempting call on default anyway");
        }
        let provider = route.provider;

        let preferences = self.preferences_block(user_id);
        let memory_context = self
            .deps
            .memory
            .context_for_agent(user_id, Some(message))
            .unwrap_or_default();
        let base = prompts::base_system_prompt(
            &self.deps.cfg.owner_id,
            provider.id(),
            provider.name(),
            &self.deps.tools.names(),
            &self.deps.identity_text,
            &self.deps.soul_text,
        );
        messages.insert(
            0,
            Message::system(prompts::with_context_blocks(base, &preferences, &memory_context)),
        );

        // ── Agent loop ──────────────────────────────────────────────────────
        let schemas = self.deps.tools.schemas();
        let mut json_tool_replies = 0u32;

        for iteration in 1..=self.deps.cfg.max_tool_iterations {
            let reply = match provider.chat(&messages, &schemas).await {
                Ok(r) => r,
                Err(e) => {
                    if let Some(sink) = sink {
                        sink.emit(StreamEvent::Error {
                            message: prompts::PROVIDER_ERROR_MESSAGE.into(),
                        });
                    }
                    return Err(e).context("provider call failed");
                }
            };

            match reply {
                ProviderReply::ToolCalls(calls) => {
                    match self
                        .structured_branch(user_id, calls, &mut messages, sink, iteration)
                        .await?
                    {
                        Step::Finish(reply) => return Ok(self.finish(user_id, reply, sink)),
                        Step::Continue => continue,
                    }
                }
                ProviderReply::Text(text) => {
                    let Some(call) = self.parse_embedded_tool_call(&text, user_id) else {
                        // Plain text answer: emit, persist, learn, done.
                        let reply = self.deps.filters.apply(&text);
                        self.maybe_learn(user_id, message);
                        return Ok(self.finish(user_id, reply, sink));
                    };

                    json_tool_replies += 1;
                    if json_tool_replies > self.deps.cfg.max_json_tool_replies {
                        return Ok(
                            self.finish(user_id, prompts::JSON_FALLBACK_MESSAGE.into(), sink)
                        );
                    }

                    match self
                        .run_tool_step(user_id, call, &mut messages, sink, iteration)
                        .await?
                    {
                        Step::Finish(reply) => return Ok(self.finish(user_id, reply, sink)),
                        Step::Continue => continue,
                    }
                }
            }
        }

        // ── Exhaustion ──────────────────────────────────────────────────────
        if let Some(sink) = sink {
            sink.emit(StreamEvent::Error { message: "tool iteration budget exhausted".into() });
        }
        Ok(self.finish(user_id, prompts::EXHAUSTION_MESSAGE.into(), sink))
    }

    /// Persist the assistant reply, emit the trailing stream events, and hand
    /// the text back to the transport.
    fn finish(&self, user_id: &str, reply: String, sink: Option<&EventSink>) -> String {
        if let Err(e) = self
            .deps
            .store
            .append_message(user_id, "assistant", &reply, None, None)
        {
            warn!(user = user_id, "persisting assistant reply failed: {e:#}");
        }
        if let Some(sink) = sink {
            sink.emit(StreamEvent::Text { content: reply.clone() });
            sink.emit(StreamEvent::Done);
        }
        reply
    }

    // ── Approval resolution ──────────────────────────────────────────────────

    async fn resolve_approval(
        &self,
        user_id: &str,
        message: &str,
        entry: PendingApproval,
    ) -> String {
        match self.classify_approval(message).await {
            ApprovalVerdict::Approved => {
                let call = entry.tool_call;
                // Authority still applies; shield re-evaluation is skipped
                // for the approved entry by design.
                if self.deps.tools.is_owner_only(&call.name) && !self.is_owner(user_id) {
                    return prompts::OWNER_ONLY_REFUSAL.to_string();
                }
                let ctx = ToolCtx {
                    caller_id: user_id.to_string(),
                    owner_id: self.deps.cfg.owner_id.clone(),
                };
                let out = self.deps.tools.execute(&call, &ctx).await;
                self.audit("approval.executed", json!({"tool": &call.name, "user": user_id}));
                format!(
                    "Approved. Here's the result of running **{}**: {}",
                    call.name, out.content
                )
            }
            ApprovalVerdict::Denied => {
                self.audit("approval.denied", json!({"tool": &entry.tool_call.name}));
                prompts::APPROVAL_DENIED_REPLY.to_string()
            }
            ApprovalVerdict::Unclear => {
                self.deps.approvals.push_front_refreshed(user_id, entry);
                prompts::APPROVAL_UNCLEAR_REPLY.to_string()
            }
        }
    }

    /// Constrained classification call. Provider trouble reads as UNCLEAR so
    /// the queued action is re-prompted instead of lost or auto-approved.
    async fn classify_approval(&self, message: &str) -> ApprovalVerdict {
        let provider = self.deps.registry.default_provider();
        let request = vec![
            Message::system(prompts::APPROVAL_CLASSIFIER_PROMPT),
            Message::user(message),
        ];
        match provider.chat(&request, &[]).await {
            Ok(reply) => {
                let text = reply.as_text().unwrap_or("").to_uppercase();
                if text.contains("APPROVED") {
                    ApprovalVerdict::Approved
                } else if text.contains("DENIED") {
                    ApprovalVerdict::Denied
                } else {
                    ApprovalVerdict::Unclear
                }
            }
            Err(e) => {
                warn!("approval classification failed: {e:#}");
                ApprovalVerdict::Unclear
            }
        }
    }

    // ── Single tool step (text branch) ───────────────────────────────────────

    async fn run_tool_step(
        &self,
        user_id: &str,
        call: ToolCallRequest,
        messages: &mut Vec<Message>,
        sink: Option<&EventSink>,
        iteration: u32,
    ) -> Result<Step> {
        // Authority gate: no shield call, no execution, fixed refusal.
        if self.deps.tools.is_owner_only(&call.name) && !self.is_owner(user_id) {
            self.audit("authority.refused", json!({"tool": &call.name, "user": user_id}));
            return Ok(Step::Finish(prompts::OWNER_ONLY_REFUSAL.to_string()));
        }

        // Shield gate.
        if self.deps.shield.is_enabled() {
            let mut event = ShieldEvent::tool_call(&call.name, call.arguments.clone());
            event.iterations = Some(iteration);
            event.importance = call.arguments.get("importance").and_then(|v| v.as_f64());
            let decision = self.deps.shield.evaluate(&event);
            match decision.action {
                ShieldAction::Block => {
                    self.audit(
                        "shield.block",
                        json!({"tool": &call.name, "threat": &decision.threat_id}),
                    );
                    return Ok(Step::Finish(format!(
                        "🛡️ I can't do that. My shield blocked **{}** (threat {}): {}",
                        call.name,
                        decision.threat_id.as_deref().unwrap_or("unknown"),
                        decision.reason.as_deref().unwrap_or("no details")
                    )));
                }
                ShieldAction::RequireApproval if !self.deps.tools.is_self_gated(&call.name) => {
                    let prompt = approval_prompt(&call.name, &decision.reason);
                    self.audit(
                        "shield.require_approval",
                        json!({"tool": &call.name, "threat": &decision.threat_id}),
                    );
                    self.deps.approvals.push(user_id, call, decision);
                    return Ok(Step::Finish(prompt));
                }
                _ => {
                    self.audit(
                        "shield.log",
                        json!({"tool": &call.name, "threat": &decision.threat_id}),
                    );
                }
            }
        }

        // Execute.
        let is_delegation = matches!(call.name.as_str(), "delegate" | "delegate_background");
        if let Some(sink) = sink {
            sink.emit(StreamEvent::ToolStart { tool: call.name.clone() });
            if is_delegation {
                sink.emit(StreamEvent::DelegationStart { agent_id: None });
            }
        }

        let ctx = ToolCtx {
            caller_id: user_id.to_string(),
            owner_id: self.deps.cfg.owner_id.clone(),
        };
        let out = self.deps.tools.execute(&call, &ctx).await;

        // Persist the call and its result in the conversation stream.
        let call_json = json!({"action": &call.name, "arguments": &call.arguments}).to_string();
        self.deps
            .store
            .append_message(user_id, "assistant", &call_json, Some(&call_json), None)?;
        self.deps
            .store
            .append_message(user_id, "tool", &out.content, None, Some(&call.id))?;

        if let Some(sink) = sink {
            if is_delegation && !out.is_error {
                let (agent_id, task_id) = self.delegation_ids(&out);
                let background = out.delegation.as_ref().map(|d| d.background).unwrap_or(false);
                sink.emit(StreamEvent::DelegationComplete {
                    agent_id: agent_id.unwrap_or_else(|| "unknown".into()),
                    task_id,
                    background,
                    status: if background { "running".into() } else { "completed".into() },
                });
            } else {
                sink.emit(StreamEvent::ToolResult {
                    tool: call.name.clone(),
                    result: out.content.clone(),
                });
            }
        }

        // Errors go back to the model so it can adapt or explain.
        if out.is_error {
            messages.push(Message::assistant(&call_json));
            messages.push(Message::user(prompts::narrate_request(&call.name, &out.content)));
            return Ok(Step::Continue);
        }

        match self.deps.tools.disposition(&call.name) {
            ResultDisposition::Narrate => {
                messages.push(Message::assistant(&call_json));
                messages.push(Message::user(prompts::narrate_request(&call.name, &out.content)));
                Ok(Step::Continue)
            }
            ResultDisposition::Summarize => {
                Ok(Step::Finish(prompts::tool_phrase(&call.name, &out.content)))
            }
        }
    }

    // ── Structured tool-calls branch ─────────────────────────────────────────

    /// Mirrors the text branch while batching: authority and shield run per
    /// call, executed results are concatenated, and at most one approval
    /// prompt trails the batch (the rest stay queued).
    async fn structured_branch(
        &self,
        user_id: &str,
        calls: Vec<ToolCallRequest>,
        messages: &mut Vec<Message>,
        sink: Option<&EventSink>,
        iteration: u32,
    ) -> Result<Step> {
        let mut combined: Vec<String> = Vec::new();
        let mut approval_prompt_text: Option<String> = None;
        let mut narrate_results = 0usize;

        messages.push(Message::assistant_tool_calls(calls.clone()));
        self.deps.store.append_message(
            user_id,
            "assistant",
            "",
            Some(&serde_json::to_string(&calls).unwrap_or_default()),
            None,
        )?;

        for call in calls {
            if self.deps.tools.is_owner_only(&call.name) && !self.is_owner(user_id) {
                self.audit("authority.refused", json!({"tool": &call.name, "user": user_id}));
                combined.push(prompts::OWNER_ONLY_REFUSAL.to_string());
                messages.push(Message::tool_result(&call.id, prompts::OWNER_ONLY_REFUSAL));
                continue;
            }

            if self.deps.shield.is_enabled() {
                let mut event = ShieldEvent::tool_call(&call.name, call.arguments.clone());
                event.iterations = Some(iteration);
                let decision = self.deps.shield.evaluate(&event);
                match decision.action {
                    ShieldAction::Block => {
                        let msg = format!(
                            "🛡️ Blocked **{}** (threat {}).",
                            call.name,
                            decision.threat_id.as_deref().unwrap_or("unknown")
                        );
                        messages.push(Message::tool_result(&call.id, &msg));
                        combined.push(msg);
                        continue;
                    }
                    ShieldAction::RequireApproval
                        if !self.deps.tools.is_self_gated(&call.name) =>
                    {
                        // Only the first pending entry is prompted for; the
                        // rest wait in the queue.
                        if approval_prompt_text.is_none() {
                            approval_prompt_text =
                                Some(approval_prompt(&call.name, &decision.reason));
                        }
                        messages.push(Message::tool_result(&call.id, "queued for approval"));
                        self.deps.approvals.push(user_id, call, decision);
                        continue;
                    }
                    _ => {}
                }
            }

            if let Some(sink) = sink {
                sink.emit(StreamEvent::ToolStart { tool: call.name.clone() });
            }
            let ctx = ToolCtx {
                caller_id: user_id.to_string(),
                owner_id: self.deps.cfg.owner_id.clone(),
            };
            let out = self.deps.tools.execute(&call, &ctx).await;
            self.deps
                .store
                .append_message(user_id, "tool", &out.content, None, Some(&call.id))?;
            if let Some(sink) = sink {
                sink.emit(StreamEvent::ToolResult {
                    tool: call.name.clone(),
                    result: out.content.clone(),
                });
            }
            messages.push(Message::tool_result(&call.id, &out.content));

            if out.is_error {
                combined.push(out.content.clone());
            } else {
                match self.deps.tools.disposition(&call.name) {
                    ResultDisposition::Summarize => {
                        combined.push(prompts::tool_phrase(&call.name, &out.content))
                    }
                    ResultDisposition::Narrate => narrate_results += 1,
                }
            }
        }

        // Approvals pending: one combined string carries the executed
        // results and the single trailing prompt.
        if let Some(prompt) = approval_prompt_text {
            combined.push(prompt);
            return Ok(Step::Finish(combined.join("\n\n")));
        }

        if narrate_results == 0 {
            if combined.is_empty() {
                return Ok(Step::Continue);
            }
            return Ok(Step::Finish(combined.join("\n\n")));
        }

        // Results that want narration loop back to the model (the standard
        // native-protocol continuation; the tool results are already in
        // `messages`).
        Ok(Step::Continue)
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Structured delegation ids with the labelled-regex scrape (and a
    /// positional last resort) preserved for providers that mangle results.
    fn delegation_ids(&self, out: &tinyclaw_tools::ToolOutput) -> (Option<String>, Option<String>) {
        if let Some(d) = &out.delegation {
            return (Some(d.agent_id.clone()), d.task_id.clone());
        }
        let agent = self
            .agent_id_re
            .captures(&out.content)
            .map(|c| c[1].to_string());
        let task = self
            .task_id_re
            .captures(&out.content)
            .map(|c| c[1].to_string());
        if agent.is_some() || task.is_some() {
            return (agent, task);
        }
        let mut uuids = self.uuid_re.find_iter(&out.content);
        let first = uuids.next().map(|m| m.as_str().to_string());
        let second = uuids.next().map(|m| m.as_str().to_string());
        (first, second)
    }

    /// Parse a JSON object tool call embedded in free text: the first
    /// balanced `{…}` span with one of the keys `action | tool | name`.
    fn parse_embedded_tool_call(&self, text: &str, user_id: &str) -> Option<ToolCallRequest> {
        let span = first_json_object(text)?;
        let value: Value = serde_json::from_str(span).ok()?;
        let mut obj = match value {
            Value::Object(map) => map,
            _ => return None,
        };

        let name = ["action", "tool", "name"]
            .iter()
            .find_map(|k| obj.remove(*k).and_then(|v| v.as_str().map(|s| s.to_string())))?;

        // Alias normalization and principal injection.
        if !obj.contains_key("filename") {
            if let Some(v) = obj.remove("file_path").or_else(|| obj.remove("path")) {
                obj.insert("filename".into(), v);
            }
        }
        obj.entry("user_id".to_string())
            .or_insert_with(|| Value::String(user_id.to_string()));

        Some(ToolCallRequest {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            arguments: Value::Object(obj),
        })
    }

    /// Last few learned preferences as a prompt block.
    fn preferences_block(&self, user_id: &str) -> String {
        let Ok(records) = self.deps.store.all_episodic(user_id) else {
            return String::new();
        };
        records
            .iter()
            .filter(|r| r.event_type == EventType::PreferenceLearned)
            .rev()
            .take(5)
            .map(|r| format!("- {}", r.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Cheap best-effort preference learning from the inbound text.
    fn maybe_learn(&self, user_id: &str, message: &str) {
        let lower = message.to_lowercase();
        let is_preference = ["i prefer", "call me", "my name is", "i like my", "always "]
            .iter()
            .any(|m| lower.contains(m));
        if !is_preference {
            return;
        }
        if let Err(e) = self.deps.memory.record_event(
            user_id,
            EventType::PreferenceLearned,
            message,
            None,
            Some(0.6),
        ) {
            debug!("preference learning skipped: {e:#}");
        }
    }

    fn audit(&self, kind: &str, detail: Value) {
        if let Some(audit) = &self.deps.audit {
            audit.record(kind, detail);
        }
    }
}

fn approval_prompt(tool: &str, reason: &Option<String>) -> String {
    format!(
        "⚠️ That action needs your approval first: **{tool}**. Reason: {}. \
         Reply \"yes\" to run it or \"no\" to skip it.",
        reason.as_deref().unwrap_or("flagged by my shield")
    )
}

/// Extract the first balanced top-level `{…}` span, string-aware.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn record_to_message(rec: &tinyclaw_store::MessageRecord) -> Message {
    match tinyclaw_model::Role::from_str(&rec.role) {
        Ok(tinyclaw_model::Role::Tool) => Message::tool_result(
            rec.tool_call_id.clone().unwrap_or_default(),
            rec.content.as_str(),
        ),
        Ok(role) => Message {
            role,
            content: rec.content.clone(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        },
        Err(_) => Message::user(&rec.content),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
