// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::directive::Condition;

/// What a matched directive asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShieldAction {
    /// Lowest priority: proceed, write an audit record.
    Log,
    /// Queue the action and ask the principal to confirm.
    RequireApproval,
    /// Highest priority: refuse outright.
    Block,
}

impl ShieldAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShieldAction::Block => "block",
            ShieldAction::RequireApproval => "require_approval",
            ShieldAction::Log => "log",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "block" => Some(ShieldAction::Block),
            "require_approval" => Some(ShieldAction::RequireApproval),
            "log" => Some(ShieldAction::Log),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Weight used in decision tie-breaking (`severity × confidence`).
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Critical => 1.0,
            Severity::High => 0.75,
            Severity::Medium => 0.5,
            Severity::Low => 0.25,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Prompt,
    Tool,
    Mcp,
    Memory,
    SupplyChain,
    Vulnerability,
    Fraud,
    PolicyBypass,
    Anomaly,
    Skill,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Prompt => "prompt",
            Category::Tool => "tool",
            Category::Mcp => "mcp",
            Category::Memory => "memory",
            Category::SupplyChain => "supply_chain",
            Category::Vulnerability => "vulnerability",
            Category::Fraud => "fraud",
            Category::PolicyBypass => "policy_bypass",
            Category::Anomaly => "anomaly",
            Category::Skill => "skill",
            Category::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompt" => Some(Category::Prompt),
            "tool" => Some(Category::Tool),
            "mcp" => Some(Category::Mcp),
            "memory" => Some(Category::Memory),
            "supply_chain" => Some(Category::SupplyChain),
            "vulnerability" => Some(Category::Vulnerability),
            "fraud" => Some(Category::Fraud),
            "policy_bypass" => Some(Category::PolicyBypass),
            "anomaly" => Some(Category::Anomaly),
            "skill" => Some(Category::Skill),
            "other" => Some(Category::Other),
            _ => None,
        }
    }
}

/// Where in the runtime an event originated. Each scope accepts only a fixed
/// set of threat categories during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Prompt,
    SkillInstall,
    SkillExecute,
    ToolCall,
    NetworkEgress,
    SecretsRead,
    Mcp,
}

impl Scope {
    /// Threat categories this scope is evaluated against.
    pub fn compatible_categories(&self) -> &'static [Category] {
        match self {
            Scope::Prompt => &[
                Category::Prompt,
                Category::PolicyBypass,
                Category::Fraud,
                Category::Anomaly,
                Category::Other,
            ],
            Scope::SkillInstall => {
                &[Category::Skill, Category::SupplyChain, Category::Vulnerability]
            }
            Scope::SkillExecute => &[
                Category::Skill,
                Category::Tool,
                Category::Vulnerability,
                Category::Anomaly,
            ],
            Scope::ToolCall => &[
                Category::Tool,
                Category::Mcp,
                Category::Memory,
                Category::PolicyBypass,
                Category::Fraud,
                Category::Anomaly,
                Category::Other,
            ],
            Scope::NetworkEgress => &[
                Category::SupplyChain,
                Category::Fraud,
                Category::Anomaly,
                Category::Other,
            ],
            Scope::SecretsRead => {
                &[Category::Memory, Category::PolicyBypass, Category::Anomaly]
            }
            Scope::Mcp => &[Category::Mcp, Category::SupplyChain, Category::Tool],
        }
    }
}

/// One parsed `BLOCK:` / `APPROVE:` / `LOG:` line.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub action: ShieldAction,
    /// The raw condition text, preserved for serialization.
    pub condition_text: String,
    /// Parsed condition; `None` when the text did not match the grammar
    /// (the directive then never fires).
    pub condition: Option<Condition>,
}

/// One entry from the threat feed.
#[derive(Debug, Clone)]
pub struct ThreatEntry {
    pub id: String,
    pub fingerprint: String,
    pub category: Category,
    pub severity: Severity,
    pub confidence: f64,
    pub action: ShieldAction,
    pub title: String,
    pub description: String,
    pub directives: Vec<Directive>,
    pub expires_at: Option<i64>,
    pub revoked: bool,
}

/// A runtime event offered to the shield. Only the fields relevant to the
/// scope are populated.
#[derive(Debug, Clone, Default)]
pub struct ShieldEvent {
    pub scope: Option<Scope>,
    pub tool_name: Option<String>,
    pub arguments: Option<Value>,
    pub message: Option<String>,
    pub skill_name: Option<String>,
    pub package_name: Option<String>,
    pub domain: Option<String>,
    pub secret_path: Option<String>,
    pub file_path: Option<String>,
    pub importance: Option<f64>,
    pub delegation_depth: Option<u32>,
    pub iterations: Option<u32>,
}

impl ShieldEvent {
    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self {
            scope: Some(Scope::ToolCall),
            tool_name: Some(name.to_string()),
            arguments: Some(arguments),
            ..Default::default()
        }
    }

    pub fn prompt(message: &str) -> Self {
        Self {
            scope: Some(Scope::Prompt),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope.unwrap_or(Scope::ToolCall)
    }
}

/// The combined outcome of evaluating one event.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: ShieldAction,
    /// `None` when no directive matched (a no-op audit record).
    pub threat_id: Option<String>,
    pub reason: Option<String>,
    pub severity: Option<Severity>,
    pub confidence: f64,
}

impl Decision {
    pub fn log_noop() -> Self {
        Self {
            action: ShieldAction::Log,
            threat_id: None,
            reason: None,
            severity: None,
            confidence: 0.0,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
