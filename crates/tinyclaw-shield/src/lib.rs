// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Runtime policy engine ("shield").
//!
//! The source of truth is a human-editable markdown threat feed. Each fenced
//! block describes one threat: metadata plus a list of directives whose
//! conditions are matched against runtime events. Evaluation combines the
//! matched directives into a single decision: block, require approval, or log.

mod approval;
mod directive;
mod engine;
mod feed;
mod types;
mod watcher;

pub use approval::{ApprovalQueue, PendingApproval};
pub use directive::Condition;
pub use engine::Shield;
pub use feed::{parse_feed, serialize_feed};
pub use types::{
    Category, Decision, Directive, Scope, Severity, ShieldAction, ShieldEvent, ThreatEntry,
};
pub use watcher::FeedWatcher;
