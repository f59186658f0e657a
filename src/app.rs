// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Node assembly: construct every subsystem, wire them together, and start
//! the background pulse jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use tinyclaw_agents::{BackgroundRunner, SubAgentManager, TemplateStore, TimeoutEstimator};
use tinyclaw_config::Config;
use tinyclaw_core::{
    Compactor, Intercom, Orchestrator, OrchestratorDeps, SessionQueue, SubAgentRunner,
};
use tinyclaw_heartware::{Heartware, IDENTITY_FILE, SOUL_FILE};
use tinyclaw_memory::MemoryEngine;
use tinyclaw_model::FilterChain;
use tinyclaw_node::{AppState, AuthRateLimiter, AuthService};
use tinyclaw_scheduler::{JobHandler, Nudge, NudgeEngine, NudgeGateway, PulseJob, PulseScheduler};
use tinyclaw_shield::{ApprovalQueue, FeedWatcher, Shield};
use tinyclaw_store::{AuditLog, SecurityStore, Store};
use tinyclaw_tools::{
    DelegateBackgroundTool, DelegateTool, ExecuteCodeTool, HeartwareReadTool, IdentityUpdateTool,
    ListSubAgentsTool, MemoryAddTool, MemorySearchTool, ScheduleNudgeTool, ToolRegistry,
};

/// Everything the node needs to serve; dropped on shutdown.
pub struct App {
    pub state: AppState,
    pub scheduler: PulseScheduler,
    pub queue: SessionQueue,
    pub runner: Arc<BackgroundRunner>,
    // Held for its reload side effect.
    _feed_watcher: Option<FeedWatcher>,
}

/// Nudge delivery through the conversation itself: the nudge lands in the
/// owner's message stream and is announced on the intercom, so the next turn
/// (or any live transport subscriber) surfaces it.
struct ConversationNudgeGateway {
    store: Arc<Store>,
    intercom: Arc<Intercom>,
}

#[async_trait]
impl NudgeGateway for ConversationNudgeGateway {
    async fn deliver(&self, nudge: &Nudge) -> Result<()> {
        self.store.append_message(
            &nudge.user_id,
            "assistant",
            &format!("⏰ {}", nudge.content),
            None,
            None,
        )?;
        self.intercom.publish(
            "nudge:delivered",
            &json!({"userId": nudge.user_id, "category": nudge.category}),
        );
        Ok(())
    }
}

pub async fn build(config: &Config) -> Result<App> {
    let layout = tinyclaw_config::ensure_data_layout(config.storage.data_dir.as_deref())?;

    // ── Storage ──────────────────────────────────────────────────────────────
    let store = Arc::new(Store::open(&layout.agent_db).context("opening agent store")?);
    let security =
        Arc::new(SecurityStore::open(&layout.security_db).context("opening security store")?);
    let audit = Arc::new(AuditLog::new(layout.audit_dir.clone()));

    // ── Heartware & shield ───────────────────────────────────────────────────
    let heartware = Arc::new(Heartware::new(layout.heartware_dir.clone()));
    heartware.seed_defaults("Tinyclaw")?;

    let feed_path = heartware.path(&config.shield.feed_file);
    let shield = Arc::new(
        Shield::from_feed_file(&feed_path, config.shield.enabled)
            .unwrap_or_else(|e| {
                warn!("threat feed unavailable, shield disabled: {e:#}");
                Shield::disabled()
            }),
    );
    let feed_watcher = if config.shield.enabled && config.shield.watch_feed {
        match FeedWatcher::spawn(shield.clone(), feed_path) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("feed watcher unavailable: {e:#}");
                None
            }
        }
    } else {
        None
    };

    // ── Models ───────────────────────────────────────────────────────────────
    let registry = Arc::new(tinyclaw_model::build_registry(config)?);
    info!(providers = ?registry.provider_ids(), "provider registry ready");

    // ── Engines ──────────────────────────────────────────────────────────────
    let memory = Arc::new(MemoryEngine::new(store.clone(), config.memory.clone()));
    let compactor = Arc::new(Compactor::new(store.clone(), config.compactor.clone()));
    let manager = Arc::new(SubAgentManager::new(store.clone(), config.agents.clone()));
    let templates = Arc::new(TemplateStore::new(store.clone(), config.agents.clone()));
    let estimator = Arc::new(TimeoutEstimator::new(store.clone()));
    let sandbox = Arc::new(tinyclaw_sandbox::Sandbox::new(config.sandbox.clone()));

    let intercom = Arc::new(Intercom::new());
    let publisher: tinyclaw_agents::Publisher = {
        let intercom = intercom.clone();
        Arc::new(move |topic, payload| intercom.publish(topic, &payload))
    };
    let runner = Arc::new(BackgroundRunner::new(store.clone(), publisher));

    let nudges = Arc::new(NudgeEngine::new(
        Arc::new(ConversationNudgeGateway { store: store.clone(), intercom: intercom.clone() }),
        config.nudge.clone(),
    ));

    // ── Tools ────────────────────────────────────────────────────────────────
    // Sub-agents get a narrower registry than the owner-facing one.
    let mut sub_tools = ToolRegistry::new();
    sub_tools.register(MemoryAddTool::new(memory.clone()));
    sub_tools.register(MemorySearchTool::new(memory.clone()));
    sub_tools.register(ExecuteCodeTool::new(sandbox.clone()));
    let executor = Arc::new(SubAgentRunner::new(
        registry.clone(),
        Arc::new(sub_tools),
        shield.clone(),
        store.clone(),
    ));

    let mut tools = ToolRegistry::new();
    tools.register(MemoryAddTool::new(memory.clone()));
    tools.register(MemorySearchTool::new(memory.clone()));
    tools.register(IdentityUpdateTool::new(heartware.clone()));
    tools.register(HeartwareReadTool::new(heartware.clone()));
    tools.register(ExecuteCodeTool::new(sandbox));
    tools.register(ScheduleNudgeTool::new(nudges.clone()));
    tools.register(ListSubAgentsTool::new(manager.clone()));
    tools.register(DelegateTool::new(
        manager.clone(),
        templates.clone(),
        executor.clone(),
        store.clone(),
        config.orchestrator.foreground_timeout_ms,
    ));
    tools.register(DelegateBackgroundTool::new(
        manager.clone(),
        templates.clone(),
        executor,
        store.clone(),
        runner.clone(),
        estimator,
    ));

    // ── Auth & orchestrator ──────────────────────────────────────────────────
    let auth = Arc::new(AuthService::new(security.clone()));
    let mut orchestrator_cfg = config.orchestrator.clone();
    if orchestrator_cfg.owner_id.is_empty() {
        if let Some(owner) = auth.owner_id() {
            orchestrator_cfg.owner_id = owner;
        }
    }

    let queue = SessionQueue::new();
    let filters = Arc::new(FilterChain::default());
    let orchestrator = Orchestrator::new(OrchestratorDeps {
        registry,
        tools: Arc::new(tools),
        shield,
        approvals: Arc::new(ApprovalQueue::new(Duration::from_secs(
            config.orchestrator.approval_ttl_secs,
        ))),
        memory: memory.clone(),
        compactor,
        store: store.clone(),
        runner: runner.clone(),
        queue: queue.clone(),
        filters: filters.clone(),
        audit: Some(audit),
        identity_text: heartware.load(IDENTITY_FILE).unwrap_or_default(),
        soul_text: heartware.load(SOUL_FILE).unwrap_or_default(),
        cfg: orchestrator_cfg.clone(),
    });

    // ── Startup sweeps ───────────────────────────────────────────────────────
    // Ghost agents from a previous process lose their active status; tasks
    // orphaned mid-run fail rather than hanging as running forever.
    manager.sweep_ghosts()?;
    let stale = runner.cleanup_stale(24 * 60 * 60 * 1000)?;
    if stale > 0 {
        info!(count = stale, "failed stale background tasks from a previous run");
    }

    // ── Pulse jobs ───────────────────────────────────────────────────────────
    let mut scheduler = PulseScheduler::new();

    let consolidate_memory: JobHandler = {
        let memory = memory.clone();
        let auth = auth.clone();
        Arc::new(move || {
            let memory = memory.clone();
            let auth = auth.clone();
            Box::pin(async move {
                if let Some(owner) = auth.owner_id() {
                    let report = memory.consolidate(&owner)?;
                    info!(?report, "memory consolidation");
                }
                Ok(())
            })
        })
    };
    scheduler.add_job(PulseJob::new("memory-consolidate", "6h", false, consolidate_memory));

    let agent_cleanup: JobHandler = {
        let manager = manager.clone();
        Arc::new(move || {
            let manager = manager.clone();
            Box::pin(async move {
                manager.cleanup().map_err(anyhow::Error::from)?;
                Ok(())
            })
        })
    };
    scheduler.add_job(PulseJob::new("subagent-cleanup", "1h", false, agent_cleanup));

    let stale_tasks: JobHandler = {
        let runner = runner.clone();
        Arc::new(move || {
            let runner = runner.clone();
            Box::pin(async move {
                runner.cleanup_stale(60 * 60 * 1000)?;
                runner.reap_finished();
                Ok(())
            })
        })
    };
    scheduler.add_job(PulseJob::new("stale-tasks", "10m", false, stale_tasks));

    let nudge_flush: JobHandler = {
        let nudges = nudges.clone();
        Arc::new(move || {
            let nudges = nudges.clone();
            Box::pin(async move {
                nudges.flush().await;
                Ok(())
            })
        })
    };
    scheduler.add_job(PulseJob::new("nudge-flush", "1m", true, nudge_flush));

    let state = AppState {
        auth,
        orchestrator,
        limiter: Arc::new(AuthRateLimiter::new(
            config.gateway.auth_attempts_per_minute,
            Duration::from_secs(config.gateway.lockout_secs),
            config.gateway.friend_requests_per_minute,
            security,
        )),
        heartware,
        filters,
    };

    Ok(App { state, scheduler, queue, runner, _feed_watcher: feed_watcher })
}
