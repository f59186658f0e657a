// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent task execution.
//!
//! A sub-agent runs its task inside its own conversation stream
//! (`subagent:<id>`), with its own system prompt and only the tools it was
//! granted. The loop mirrors the main turn loop in miniature: model call,
//! optional tool round, repeat. The shield still applies (a sub-agent is
//! not a policy bypass) but only `block` is enforced here; there is no
//! conversational counterpart to ask for approval mid-task.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tinyclaw_model::{Message, ProviderReply, ProviderRegistry, Tier};
use tinyclaw_shield::{Shield, ShieldAction, ShieldEvent};
use tinyclaw_store::{Store, SubAgentRecord};
use tinyclaw_tools::{SubAgentExecutor, ToolCtx, ToolRegistry};

/// Model ↔ tool rounds a sub-agent may use for one task.
const MAX_SUBAGENT_ITERATIONS: u32 = 5;

pub struct SubAgentRunner {
    registry: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    shield: Arc<Shield>,
    store: Arc<Store>,
}

impl SubAgentRunner {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        shield: Arc<Shield>,
        store: Arc<Store>,
    ) -> Self {
        Self { registry, tools, shield, store }
    }

    fn granted_schemas(&self, agent: &SubAgentRecord) -> Vec<tinyclaw_model::ToolSchema> {
        self.tools
            .schemas()
            .into_iter()
            .filter(|s| agent.tools_granted.iter().any(|g| g == &s.name))
            .collect()
    }
}

#[async_trait]
impl SubAgentExecutor for SubAgentRunner {
    async fn run_task(
        &self,
        agent: &SubAgentRecord,
        task: &str,
        tier: &str,
    ) -> anyhow::Result<tinyclaw_tools::TaskRunReport> {
        let provider = match Tier::from_str(tier) {
            Ok(t) => self.registry.for_tier(t),
            Err(_) => self.registry.default_provider(),
        };
        let stream = format!("subagent:{}", agent.id);
        let schemas = self.granted_schemas(agent);
        let ctx = ToolCtx {
            caller_id: agent.owner_user_id.clone(),
            owner_id: agent.owner_user_id.clone(),
        };

        let mut messages = vec![
            Message::system(&agent.system_prompt),
            Message::user(task),
        ];
        self.store
            .append_message(&stream, "user", task, None, None)?;

        let mut iterations = 0u32;
        loop {
            iterations += 1;
            if iterations > MAX_SUBAGENT_ITERATIONS {
                anyhow::bail!("sub-agent exceeded its iteration budget");
            }

            let reply = provider.chat(&messages, &schemas).await?;
            match reply {
                ProviderReply::Text(text) => {
                    self.store
                        .append_message(&stream, "assistant", &text, None, None)?;
                    return Ok(tinyclaw_tools::TaskRunReport { output: text, iterations });
                }
                ProviderReply::ToolCalls(calls) => {
                    messages.push(Message::assistant_tool_calls(calls.clone()));
                    for call in calls {
                        let decision = self
                            .shield
                            .evaluate(&ShieldEvent::tool_call(&call.name, call.arguments.clone()));
                        let output = if decision.action == ShieldAction::Block {
                            debug!(agent = %agent.id, tool = %call.name, "sub-agent tool blocked");
                            format!(
                                "Error: blocked by shield ({})",
                                decision.threat_id.as_deref().unwrap_or("policy")
                            )
                        } else {
                            self.tools.execute(&call, &ctx).await.content
                        };
                        self.store.append_message(
                            &stream,
                            "tool",
                            &output,
                            None,
                            Some(&call.id),
                        )?;
                        messages.push(Message::tool_result(&call.id, &output));
                    }
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tinyclaw_model::{ChatProvider, ScriptedProvider, ToolCallRequest};
    use tinyclaw_store::{now_ms, AgentStatus};

    fn agent(tools: Vec<String>) -> SubAgentRecord {
        SubAgentRecord {
            id: "agent-1".into(),
            owner_user_id: "owner".into(),
            role: "Researcher".into(),
            system_prompt: "You are a researcher.".into(),
            tools_granted: tools,
            tier_preference: None,
            status: AgentStatus::Active,
            total_tasks: 0,
            successful_tasks: 0,
            performance_score: 0.0,
            template_id: None,
            created_at: now_ms(),
            last_active_at: now_ms(),
            deleted_at: None,
        }
    }

    fn runner_with(provider: ScriptedProvider) -> (SubAgentRunner, Arc<Store>) {
        let mut providers: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
        providers.insert("p".into(), Arc::new(provider));
        let registry = Arc::new(ProviderRegistry::new(providers, "p").unwrap());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let runner = SubAgentRunner::new(
            registry,
            Arc::new(ToolRegistry::new()),
            Arc::new(Shield::disabled()),
            store.clone(),
        );
        (runner, store)
    }

    #[tokio::test]
    async fn text_reply_finishes_in_one_iteration() {
        let provider = ScriptedProvider::new("p", vec![ProviderReply::Text("findings".into())]);
        let (runner, store) = runner_with(provider);

        let report = runner
            .run_task(&agent(vec![]), "look into this", "moderate")
            .await
            .unwrap();
        assert_eq!(report.output, "findings");
        assert_eq!(report.iterations, 1);

        // Private stream captured both sides.
        let msgs = store.recent_messages("subagent:agent-1", 10, 0).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[1].role, "assistant");
    }

    #[tokio::test]
    async fn unknown_tool_round_feeds_error_back() {
        let provider = ScriptedProvider::new(
            "p",
            vec![
                ProviderReply::ToolCalls(vec![ToolCallRequest {
                    id: "c1".into(),
                    name: "missing_tool".into(),
                    arguments: serde_json::json!({}),
                }]),
                ProviderReply::Text("adapted without the tool".into()),
            ],
        );
        let (runner, _) = runner_with(provider);

        let report = runner
            .run_task(&agent(vec!["missing_tool".into()]), "task", "moderate")
            .await
            .unwrap();
        assert_eq!(report.output, "adapted without the tool");
        assert_eq!(report.iterations, 2);
    }

    #[tokio::test]
    async fn endless_tool_calls_hit_iteration_budget() {
        let call = ProviderReply::ToolCalls(vec![ToolCallRequest {
            id: "c".into(),
            name: "x".into(),
            arguments: serde_json::json!({}),
        }]);
        let provider = ScriptedProvider::new(
            "p",
            vec![call.clone(), call.clone(), call.clone(), call.clone(), call.clone(), call],
        );
        let (runner, _) = runner_with(provider);

        let err = runner
            .run_task(&agent(vec!["x".into()]), "task", "moderate")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("iteration budget"));
    }
}
