// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod code;
mod delegate;
mod identity;
mod memory;
mod nudge;
mod subagents;

pub use code::ExecuteCodeTool;
pub use delegate::{DelegateBackgroundTool, DelegateTool, SubAgentExecutor, TaskRunReport};
pub use identity::{HeartwareReadTool, IdentityUpdateTool};
pub use memory::{MemoryAddTool, MemorySearchTool};
pub use nudge::ScheduleNudgeTool;
pub use subagents::ListSubAgentsTool;
