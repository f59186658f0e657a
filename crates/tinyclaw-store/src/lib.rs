// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Embedded relational store.
//!
//! One SQLite database (`agent.db`, WAL mode) holds every durable runtime
//! entity: message streams, compaction records, sub-agents, role templates,
//! background tasks, episodic memory (with an FTS5 index), task metrics, and
//! the blackboard. A second database (`security.db`) isolates authentication
//! state so that wiping conversation data never touches credentials.
//!
//! The store is schema-on-write: records are typed structs and every write
//! goes through a prepared statement. All timestamps are epoch milliseconds.

mod audit;
mod compactions;
mod db;
mod memory;
mod messages;
mod metrics;
mod security;
mod subagents;
mod tasks;
mod templates;

pub use audit::AuditLog;
pub use compactions::CompactionRecord;
pub use db::{now_ms, Store};
pub use memory::{EpisodicRecord, EventType, FtsHit};
pub use messages::MessageRecord;
pub use metrics::TaskMetric;
pub use security::SecurityStore;
pub use subagents::{AgentStatus, SubAgentRecord};
pub use tasks::{BackgroundTaskRecord, TaskStatus};
pub use templates::RoleTemplateRecord;
