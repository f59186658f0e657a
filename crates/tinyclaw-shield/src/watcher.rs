// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Threat-feed file watcher.
//!
//! The human-editable markdown feed stays the source of truth; the shield
//! keeps a parsed snapshot in memory. This watcher re-parses the file on
//! every filesystem change and swaps the snapshot in place.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::engine::Shield;

pub struct FeedWatcher {
    // Held for its Drop side effect: dropping stops the watch thread.
    _watcher: RecommendedWatcher,
}

impl FeedWatcher {
    /// Watch `path` and reload `shield` whenever the feed changes.
    pub fn spawn(shield: Arc<Shield>, path: PathBuf) -> Result<Self> {
        let watch_target = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    debug!(path = %path.display(), "threat feed changed");
                    if let Err(e) = shield.reload_from(&path) {
                        warn!("threat feed reload failed: {e:#}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("feed watcher error: {e}"),
            }
        })
        .context("creating feed watcher")?;

        watcher
            .watch(&watch_target, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", watch_target.display()))?;

        Ok(Self { _watcher: watcher })
    }
}
