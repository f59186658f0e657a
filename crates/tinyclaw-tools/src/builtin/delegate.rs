// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Delegation tools: hand a task to a persistent sub-agent, either on the
//! caller's critical path (foreground, bounded by a fixed timeout) or via
//! the background runner (adaptive timeout, result delivered next turn).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use tinyclaw_agents::{
    BackgroundRunner, CreateAgentConfig, SubAgentManager, TemplateStore, TimeoutEstimator,
};
use tinyclaw_model::ToolCallRequest;
use tinyclaw_store::{Store, SubAgentRecord};

use crate::tool::{
    optional_str, required_str, DelegationOutcome, ResultDisposition, Tool, ToolCtx, ToolOutput,
};

/// Runs one task inside a sub-agent's own conversation. Implemented by the
/// orchestration layer, which owns provider access.
#[async_trait]
pub trait SubAgentExecutor: Send + Sync {
    async fn run_task(
        &self,
        agent: &SubAgentRecord,
        task: &str,
        tier: &str,
    ) -> anyhow::Result<TaskRunReport>;
}

#[derive(Debug, Clone)]
pub struct TaskRunReport {
    pub output: String,
    pub iterations: u32,
}

/// Shared plumbing for both delegation tools.
pub(crate) struct DelegationDeps {
    pub manager: Arc<SubAgentManager>,
    pub templates: Arc<TemplateStore>,
    pub executor: Arc<dyn SubAgentExecutor>,
    pub store: Arc<Store>,
}

impl DelegationDeps {
    /// Reuse a similar agent (reviving it when necessary), fall back to the
    /// best matching template, and only then create from scratch.
    fn acquire_agent(
        &self,
        owner: &str,
        role: &str,
        tier: Option<&str>,
    ) -> Result<SubAgentRecord, String> {
        if let Ok(Some(existing)) = self.manager.find_reusable(owner, role) {
            debug!(agent = %existing.id, "reusing sub-agent");
            if let Err(e) = self.manager.revive(&existing.id) {
                return Err(format!("reviving agent: {e}"));
            }
            return self.manager.get(&existing.id).map_err(|e| e.to_string());
        }

        let template = self.templates.find_best_match(owner, role).ok().flatten();
        let cfg = CreateAgentConfig {
            owner_user_id: owner.to_string(),
            role: role.to_string(),
            tools_granted: template
                .as_ref()
                .map(|t| t.default_tools.clone())
                .unwrap_or_default(),
            tier_preference: tier
                .map(|t| t.to_string())
                .or_else(|| template.as_ref().and_then(|t| t.default_tier.clone())),
            template_id: template.as_ref().map(|t| t.id.clone()),
        };
        self.manager.create(cfg).map_err(|e| e.to_string())
    }

    /// Book-keeping after a task: counters, template score, metric, and
    /// auto-suspension so finished agents do not hold capacity.
    fn settle(
        &self,
        agent: &SubAgentRecord,
        tier: &str,
        task: &str,
        success: bool,
        elapsed_ms: i64,
        iterations: u32,
    ) {
        let _ = self.manager.record_task_result(&agent.id, success);
        let _ = self.manager.suspend(&agent.id);
        if let Some(template_id) = &agent.template_id {
            let _ = self
                .templates
                .record_usage(template_id, if success { 1.0 } else { 0.0 });
        }
        let task_type = tinyclaw_agents::classify_task(task);
        let _ = self.store.insert_task_metric(
            &agent.owner_user_id,
            task_type.as_str(),
            tier,
            elapsed_ms,
            iterations as i64,
            success,
        );
    }
}

fn resolve_tier<'a>(args: &'a Value, agent: &'a SubAgentRecord) -> &'a str {
    optional_str(args, "tier")
        .or(agent.tier_preference.as_deref())
        .unwrap_or("moderate")
}

const DELEGATE_SCHEMA_PROPS: &str = r#"{
    "type": "object",
    "properties": {
        "task": { "type": "string", "description": "What the sub-agent should do" },
        "role": { "type": "string", "description": "Role description, e.g. 'Technical Research Analyst'" },
        "tier": { "type": "string", "enum": ["simple", "moderate", "complex", "reasoning"] }
    },
    "required": ["task", "role"]
}"#;

/// Foreground delegation: the caller waits for the sub-agent's answer.
pub struct DelegateTool {
    deps: DelegationDeps,
    foreground_timeout_ms: u64,
}

impl DelegateTool {
    pub fn new(
        manager: Arc<SubAgentManager>,
        templates: Arc<TemplateStore>,
        executor: Arc<dyn SubAgentExecutor>,
        store: Arc<Store>,
        foreground_timeout_ms: u64,
    ) -> Self {
        Self {
            deps: DelegationDeps { manager, templates, executor, store },
            foreground_timeout_ms,
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Delegate a task to a sub-agent and wait for the result."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::from_str(DELEGATE_SCHEMA_PROPS).unwrap_or_else(|_| json!({"type": "object"}))
    }

    fn owner_only(&self) -> bool {
        true
    }

    fn self_gated(&self) -> bool {
        true
    }

    fn disposition(&self) -> ResultDisposition {
        ResultDisposition::Narrate
    }

    async fn execute(&self, call: &ToolCallRequest, ctx: &ToolCtx) -> ToolOutput {
        let task = match required_str(&call.arguments, "task") {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(e),
        };
        let role = match required_str(&call.arguments, "role") {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(e),
        };

        let agent = match self.deps.acquire_agent(&ctx.owner_id, role, optional_str(&call.arguments, "tier")) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(e),
        };
        let tier = resolve_tier(&call.arguments, &agent).to_string();

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_millis(self.foreground_timeout_ms),
            self.deps.executor.run_task(&agent, task, &tier),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(Ok(report)) => {
                self.deps
                    .settle(&agent, &tier, task, true, elapsed_ms, report.iterations);
                ToolOutput::delegated(
                    format!("Agent ID: {}\n\n{}", agent.id, report.output),
                    DelegationOutcome { agent_id: agent.id, task_id: None, background: false },
                )
            }
            Ok(Err(e)) => {
                self.deps.settle(&agent, &tier, task, false, elapsed_ms, 0);
                ToolOutput::err(format!("delegation failed: {e:#}"))
            }
            Err(_) => {
                self.deps.settle(&agent, &tier, task, false, elapsed_ms, 0);
                ToolOutput::err(format!(
                    "delegation timed out after {}ms",
                    self.foreground_timeout_ms
                ))
            }
        }
    }
}

/// Background delegation: returns immediately; the result is injected into a
/// later owner turn.
pub struct DelegateBackgroundTool {
    deps: DelegationDeps,
    runner: Arc<BackgroundRunner>,
    estimator: Arc<TimeoutEstimator>,
}

impl DelegateBackgroundTool {
    pub fn new(
        manager: Arc<SubAgentManager>,
        templates: Arc<TemplateStore>,
        executor: Arc<dyn SubAgentExecutor>,
        store: Arc<Store>,
        runner: Arc<BackgroundRunner>,
        estimator: Arc<TimeoutEstimator>,
    ) -> Self {
        Self {
            deps: DelegationDeps { manager, templates, executor, store },
            runner,
            estimator,
        }
    }
}

#[async_trait]
impl Tool for DelegateBackgroundTool {
    fn name(&self) -> &str {
        "delegate_background"
    }

    fn description(&self) -> &str {
        "Delegate a task to a sub-agent that works in the background; the result arrives in a later turn."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::from_str(DELEGATE_SCHEMA_PROPS).unwrap_or_else(|_| json!({"type": "object"}))
    }

    fn owner_only(&self) -> bool {
        true
    }

    fn self_gated(&self) -> bool {
        true
    }

    fn disposition(&self) -> ResultDisposition {
        ResultDisposition::Narrate
    }

    async fn execute(&self, call: &ToolCallRequest, ctx: &ToolCtx) -> ToolOutput {
        let task = match required_str(&call.arguments, "task") {
            Ok(t) => t.to_string(),
            Err(e) => return ToolOutput::err(e),
        };
        let role = match required_str(&call.arguments, "role") {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(e),
        };

        let agent = match self.deps.acquire_agent(&ctx.owner_id, role, optional_str(&call.arguments, "tier")) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(e),
        };
        let tier = resolve_tier(&call.arguments, &agent).to_string();
        let estimate = self.estimator.estimate(&task, &tier);

        let executor = self.deps.executor.clone();
        let manager = self.deps.manager.clone();
        let templates = self.deps.templates.clone();
        let metrics_store = self.deps.store.clone();
        let agent_for_work = agent.clone();
        let tier_for_work = tier.clone();
        let task_for_work = task.clone();

        let work = async move {
            let started = Instant::now();
            let result = executor
                .run_task(&agent_for_work, &task_for_work, &tier_for_work)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as i64;
            let (success, iterations) = match &result {
                Ok(report) => (true, report.iterations),
                Err(_) => (false, 0),
            };

            let _ = manager.record_task_result(&agent_for_work.id, success);
            let _ = manager.suspend(&agent_for_work.id);
            if let Some(template_id) = &agent_for_work.template_id {
                let _ = templates.record_usage(template_id, if success { 1.0 } else { 0.0 });
            }
            let task_type = tinyclaw_agents::classify_task(&task_for_work);
            let _ = metrics_store.insert_task_metric(
                &agent_for_work.owner_user_id,
                task_type.as_str(),
                &tier_for_work,
                elapsed_ms,
                iterations as i64,
                success,
            );

            result.map(|r| r.output)
        };

        let record = match self.runner.start(
            &ctx.owner_id,
            &agent.id,
            &task,
            estimate.timeout_ms,
            work,
        ) {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(format!("starting background task: {e:#}")),
        };

        ToolOutput::delegated(
            format!(
                "Background task started.\nAgent ID: {}\nTask ID: {}\nBudget: {}ms ({:?})",
                agent.id, record.id, estimate.timeout_ms, estimate.basis
            ),
            DelegationOutcome {
                agent_id: agent.id,
                task_id: Some(record.id),
                background: true,
            },
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tinyclaw_store::TaskStatus;

    struct FakeExecutor {
        fail: bool,
    }

    #[async_trait]
    impl SubAgentExecutor for FakeExecutor {
        async fn run_task(
            &self,
            _agent: &SubAgentRecord,
            task: &str,
            _tier: &str,
        ) -> anyhow::Result<TaskRunReport> {
            if self.fail {
                anyhow::bail!("sub-agent imploded");
            }
            Ok(TaskRunReport { output: format!("done: {task}"), iterations: 3 })
        }
    }

    struct Fixture {
        store: Arc<Store>,
        delegate: DelegateTool,
        background: DelegateBackgroundTool,
        runner: Arc<BackgroundRunner>,
    }

    fn fixture(fail: bool) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cfg = tinyclaw_config::AgentsConfig::default();
        let manager = Arc::new(SubAgentManager::new(store.clone(), cfg.clone()));
        let templates = Arc::new(TemplateStore::new(store.clone(), cfg));
        let executor: Arc<dyn SubAgentExecutor> = Arc::new(FakeExecutor { fail });
        let publisher: tinyclaw_agents::Publisher = Arc::new(|_, _| {});
        let runner = Arc::new(BackgroundRunner::new(store.clone(), publisher));
        let estimator = Arc::new(TimeoutEstimator::new(store.clone()));

        Fixture {
            delegate: DelegateTool::new(
                manager.clone(),
                templates.clone(),
                executor.clone(),
                store.clone(),
                60_000,
            ),
            background: DelegateBackgroundTool::new(
                manager,
                templates,
                executor,
                store.clone(),
                runner.clone(),
                estimator,
            ),
            store,
            runner,
        }
    }

    fn ctx() -> ToolCtx {
        ToolCtx { caller_id: "owner".into(), owner_id: "owner".into() }
    }

    fn call(args: Value) -> ToolCallRequest {
        ToolCallRequest { id: "c1".into(), name: "delegate".into(), arguments: args }
    }

    #[tokio::test]
    async fn foreground_delegation_returns_result_and_suspends_agent() {
        let fx = fixture(false);
        let out = fx
            .delegate
            .execute(
                &call(json!({"task": "summarize the doc", "role": "Summary Writer"})),
                &ctx(),
            )
            .await;

        assert!(!out.is_error);
        assert!(out.content.contains("done: summarize the doc"));
        let outcome = out.delegation.unwrap();
        assert!(!outcome.background);

        let agent = fx.store.get_sub_agent(&outcome.agent_id).unwrap().unwrap();
        assert_eq!(agent.total_tasks, 1);
        assert_eq!(agent.successful_tasks, 1);
        assert_eq!(agent.status, tinyclaw_store::AgentStatus::Suspended);
    }

    #[tokio::test]
    async fn failed_delegation_counts_against_performance() {
        let fx = fixture(true);
        let out = fx
            .delegate
            .execute(&call(json!({"task": "explode", "role": "Demolition"})), &ctx())
            .await;
        assert!(out.is_error);

        let agents = fx.store.list_sub_agents("owner").unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].total_tasks, 1);
        assert_eq!(agents[0].successful_tasks, 0);
    }

    #[tokio::test]
    async fn background_delegation_returns_ids_immediately() {
        let fx = fixture(false);
        let out = fx
            .background
            .execute(
                &call(json!({
                    "task": "Research quantum computing developments",
                    "role": "Technical Research Analyst",
                    "tier": "complex"
                })),
                &ctx(),
            )
            .await;

        assert!(!out.is_error, "{}", out.content);
        let outcome = out.delegation.clone().unwrap();
        assert!(outcome.background);
        let task_id = outcome.task_id.unwrap();
        assert!(out.content.contains(&task_id));
        assert!(out.content.contains("Agent ID:"));

        // The work completes shortly after and lands as undelivered.
        for _ in 0..100 {
            if let Some(t) = fx.store.get_background_task(&task_id).unwrap() {
                if t.status == TaskStatus::Completed {
                    assert!(t.result.unwrap().contains("done:"));
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background task never completed");
    }

    #[tokio::test]
    async fn second_delegation_reuses_similar_agent() {
        let fx = fixture(false);
        let first = fx
            .delegate
            .execute(
                &call(json!({"task": "a", "role": "Quantum Computing Researcher"})),
                &ctx(),
            )
            .await;
        let second = fx
            .delegate
            .execute(
                &call(json!({"task": "b", "role": "researcher for quantum computing"})),
                &ctx(),
            )
            .await;

        let a = first.delegation.unwrap().agent_id;
        let b = second.delegation.unwrap().agent_id;
        assert_eq!(a, b);
        assert_eq!(fx.store.list_sub_agents("owner").unwrap().len(), 1);
        drop(fx.runner);
    }
}
