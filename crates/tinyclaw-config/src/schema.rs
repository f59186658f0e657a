// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper: returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub shield: ShieldConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub compactor: CompactorConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub nudge: NudgeConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Named provider configurations, referenced by the tier map.
    ///
    /// ```yaml
    /// providers:
    ///   local_ollama:
    ///     provider: openai        # OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2
    ///   anthropic_main:
    ///     provider: anthropic
    ///     api_key_env: ANTHROPIC_API_KEY
    ///     name: claude-sonnet-4-5
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Wire protocol: "openai" (any OpenAI-compatible endpoint), "anthropic",
    /// or "mock" (tests only).
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in files kept under version control.
    pub api_key: Option<String>,
    /// Base URL override for local proxies or self-hosted servers.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o-mini".into(),
            api_key_env: Some("OPENAI_API_KEY".into()),
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Routing table: which named provider serves each complexity tier.
///
/// Unset tiers fall back to `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider key used when a tier has no explicit mapping.
    pub default: String,
    pub simple: Option<String>,
    pub moderate: Option<String>,
    pub complex: Option<String>,
    pub reasoning: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default: "default".into(),
            simple: None,
            moderate: None,
            complex: None,
            reasoning: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Owner principal id. Empty until setup completes.
    #[serde(default)]
    pub owner_id: String,
    /// Maximum model ↔ tool round-trips per inbound turn.
    #[serde(default = "OrchestratorConfig::default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// How many consecutive text-embedded JSON tool calls are accepted
    /// before giving up with a graceful fallback.
    #[serde(default = "OrchestratorConfig::default_max_json_tool_replies")]
    pub max_json_tool_replies: u32,
    /// Raw messages kept in the prompt window (most recent first).
    #[serde(default = "OrchestratorConfig::default_history_window")]
    pub history_window: usize,
    /// Wall-clock budget for foreground sub-agent execution.
    #[serde(default = "OrchestratorConfig::default_foreground_timeout_ms")]
    pub foreground_timeout_ms: u64,
    /// Seconds a pending approval survives before being silently dropped.
    #[serde(default = "OrchestratorConfig::default_approval_ttl_secs")]
    pub approval_ttl_secs: u64,
}

impl OrchestratorConfig {
    fn default_max_tool_iterations() -> u32 {
        10
    }
    fn default_max_json_tool_replies() -> u32 {
        3
    }
    fn default_history_window() -> usize {
        30
    }
    fn default_foreground_timeout_ms() -> u64 {
        60_000
    }
    fn default_approval_ttl_secs() -> u64 {
        300
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            owner_id: String::new(),
            max_tool_iterations: Self::default_max_tool_iterations(),
            max_json_tool_replies: Self::default_max_json_tool_replies(),
            history_window: Self::default_history_window(),
            foreground_timeout_ms: Self::default_foreground_timeout_ms(),
            approval_ttl_secs: Self::default_approval_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldConfig {
    /// Master switch. When off, every evaluation returns a log decision.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Threat feed file name inside the heartware directory.
    #[serde(default = "ShieldConfig::default_feed_file")]
    pub feed_file: String,
    /// Reload the parsed feed when the file changes on disk.
    #[serde(default = "default_true")]
    pub watch_feed: bool,
}

impl ShieldConfig {
    fn default_feed_file() -> String {
        "threat-feed.md".into()
    }
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feed_file: Self::default_feed_file(),
            watch_feed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Hits injected into the system prompt per turn.
    #[serde(default = "MemoryConfig::default_context_hits")]
    pub context_hits: usize,
    /// Character n-gram similarity at or above which two records merge.
    #[serde(default = "MemoryConfig::default_merge_threshold")]
    pub merge_threshold: f64,
    /// Multiplicative importance decay applied to records older than 30 days.
    #[serde(default = "MemoryConfig::default_decay_factor")]
    pub decay_factor: f64,
}

impl MemoryConfig {
    fn default_context_hits() -> usize {
        5
    }
    fn default_merge_threshold() -> f64 {
        0.80
    }
    fn default_decay_factor() -> f64 {
        0.9
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_hits: Self::default_context_hits(),
            merge_threshold: Self::default_merge_threshold(),
            decay_factor: Self::default_decay_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactorConfig {
    /// Approximate token count of the active window that triggers compaction.
    #[serde(default = "CompactorConfig::default_trigger_tokens")]
    pub trigger_tokens: usize,
    /// Raw turns always kept verbatim (the L0 tier).
    #[serde(default = "CompactorConfig::default_keep_turns")]
    pub keep_turns: usize,
    /// Token budget for the coarse summary tier before it is folded into
    /// the archival tier.
    #[serde(default = "CompactorConfig::default_summary_budget_tokens")]
    pub summary_budget_tokens: usize,
    /// Strip emoji from messages before summarization.
    #[serde(default = "default_true")]
    pub strip_emoji: bool,
    /// Remove duplicate lines before summarization.
    #[serde(default = "default_true")]
    pub dedup_lines: bool,
    /// Also drop near-identical sentences before summarization.
    #[serde(default)]
    pub dedup_sentences: bool,
    /// Similarity at or above which a summary line restating a known fact
    /// is dropped.
    #[serde(default = "CompactorConfig::default_dedup_threshold")]
    pub dedup_threshold: f64,
}

impl CompactorConfig {
    fn default_trigger_tokens() -> usize {
        6_000
    }
    fn default_keep_turns() -> usize {
        12
    }
    fn default_summary_budget_tokens() -> usize {
        1_200
    }
    fn default_dedup_threshold() -> f64 {
        0.85
    }
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            trigger_tokens: Self::default_trigger_tokens(),
            keep_turns: Self::default_keep_turns(),
            summary_budget_tokens: Self::default_summary_budget_tokens(),
            strip_emoji: true,
            dedup_lines: true,
            dedup_sentences: false,
            dedup_threshold: Self::default_dedup_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Hard cap on concurrently active sub-agents per owner.
    #[serde(default = "AgentsConfig::default_max_active_per_user")]
    pub max_active_per_user: usize,
    /// Days a soft-deleted sub-agent is kept before the hard purge.
    #[serde(default = "AgentsConfig::default_deleted_retention_days")]
    pub deleted_retention_days: i64,
    /// Days of inactivity after which a suspended sub-agent is archived.
    #[serde(default = "AgentsConfig::default_suspended_retention_days")]
    pub suspended_retention_days: i64,
    /// Per-user role-template cap.
    #[serde(default = "AgentsConfig::default_max_templates_per_user")]
    pub max_templates_per_user: usize,
}

impl AgentsConfig {
    fn default_max_active_per_user() -> usize {
        10
    }
    fn default_deleted_retention_days() -> i64 {
        14
    }
    fn default_suspended_retention_days() -> i64 {
        7
    }
    fn default_max_templates_per_user() -> usize {
        50
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_active_per_user: Self::default_max_active_per_user(),
            deleted_retention_days: Self::default_deleted_retention_days(),
            suspended_retention_days: Self::default_suspended_retention_days(),
            max_templates_per_user: Self::default_max_templates_per_user(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Default wall-clock budget for one evaluation.
    #[serde(default = "SandboxConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound a caller may request.
    #[serde(default = "SandboxConfig::default_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

impl SandboxConfig {
    fn default_timeout_ms() -> u64 {
        5_000
    }
    fn default_max_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            max_timeout_ms: Self::default_max_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeConfig {
    /// Sliding-window delivery cap per user per hour (urgent bypasses).
    #[serde(default = "NudgeConfig::default_max_per_hour")]
    pub max_per_hour: usize,
    /// Quiet hours as local 24h clock values [start, end). Non-urgent
    /// nudges due inside the window are deferred to the end of it.
    #[serde(default = "NudgeConfig::default_quiet_start_hour")]
    pub quiet_start_hour: u32,
    #[serde(default = "NudgeConfig::default_quiet_end_hour")]
    pub quiet_end_hour: u32,
}

impl NudgeConfig {
    fn default_max_per_hour() -> usize {
        6
    }
    fn default_quiet_start_hour() -> u32 {
        22
    }
    fn default_quiet_end_hour() -> u32 {
        8
    }
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            max_per_hour: Self::default_max_per_hour(),
            quiet_start_hour: Self::default_quiet_start_hour(),
            quiet_end_hour: Self::default_quiet_end_hour(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "GatewayConfig::default_bind")]
    pub bind: String,
    #[serde(default = "GatewayConfig::default_port")]
    pub port: u16,
    /// Max failed auth attempts per IP per sliding minute before lockout.
    #[serde(default = "GatewayConfig::default_auth_attempts_per_minute")]
    pub auth_attempts_per_minute: u32,
    /// Lockout duration after the auth rate limit trips.
    #[serde(default = "GatewayConfig::default_lockout_secs")]
    pub lockout_secs: u64,
    /// Guest chat requests per minute per IP.
    #[serde(default = "GatewayConfig::default_friend_requests_per_minute")]
    pub friend_requests_per_minute: u32,
}

impl GatewayConfig {
    fn default_bind() -> String {
        "127.0.0.1".into()
    }
    fn default_port() -> u16 {
        4200
    }
    fn default_auth_attempts_per_minute() -> u32 {
        5
    }
    fn default_lockout_secs() -> u64 {
        300
    }
    fn default_friend_requests_per_minute() -> u32 {
        20
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            port: Self::default_port(),
            auth_attempts_per_minute: Self::default_auth_attempts_per_minute(),
            lockout_secs: Self::default_lockout_secs(),
            friend_requests_per_minute: Self::default_friend_requests_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for databases, heartware, and audit records.
    /// Defaults to `~/.tinyclaw` when unset.
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: None }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
