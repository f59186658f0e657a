// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Heartware: the user-facing markdown files that define the companion.
//!
//! Identity, soul (personality), the friend profile, and the threat feed all
//! live as plain markdown so the owner can edit them with any editor. Every
//! write snapshots the previous content into `.backups/` first; an editing
//! accident never loses the old file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

pub const IDENTITY_FILE: &str = "identity.md";
pub const SOUL_FILE: &str = "soul.md";
pub const FRIEND_PROFILE_FILE: &str = "friend-profile.md";
pub const THREAT_FEED_FILE: &str = "threat-feed.md";

/// Backups kept per file before the oldest is removed.
const BACKUP_KEEP: usize = 10;

pub struct Heartware {
    dir: PathBuf,
}

impl Heartware {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Read one heartware file. Missing files read as empty; a blank soul
    /// is a valid (if boring) soul.
    pub fn load(&self, name: &str) -> Result<String> {
        validate_name(name)?;
        let path = self.path(name);
        if !path.exists() {
            return Ok(String::new());
        }
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
    }

    /// Write one heartware file, snapshotting the previous content first.
    pub fn save(&self, name: &str, content: &str) -> Result<()> {
        validate_name(name)?;
        let path = self.path(name);
        if path.exists() {
            self.backup(name, &path)?;
        }
        std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))
    }

    fn backup(&self, name: &str, path: &Path) -> Result<()> {
        let backups = self.dir.join(".backups");
        std::fs::create_dir_all(&backups)
            .with_context(|| format!("creating {}", backups.display()))?;

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let target = backups.join(format!("{name}.{stamp}"));
        std::fs::copy(path, &target)
            .with_context(|| format!("backing up {} to {}", path.display(), target.display()))?;
        debug!(file = name, backup = %target.display(), "heartware backup written");

        self.rotate_backups(name, &backups)?;
        Ok(())
    }

    fn rotate_backups(&self, name: &str, backups: &Path) -> Result<()> {
        let prefix = format!("{name}.");
        let mut snapshots: Vec<PathBuf> = std::fs::read_dir(backups)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        snapshots.sort();
        while snapshots.len() > BACKUP_KEEP {
            let oldest = snapshots.remove(0);
            let _ = std::fs::remove_file(oldest);
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "md").unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Create the default files on first boot; existing files are untouched.
    pub fn seed_defaults(&self, companion_name: &str) -> Result<()> {
        let defaults: [(&str, String); 4] = [
            (
                IDENTITY_FILE,
                format!("# Identity\n\nname: {companion_name}\ntagline: Your small-but-mighty AI companion\n"),
            ),
            (
                SOUL_FILE,
                "# Soul\n\nWarm, direct, quietly funny. Prefers doing over talking about doing.\n"
                    .to_string(),
            ),
            (
                FRIEND_PROFILE_FILE,
                "# Friend profile\n\nGuests are welcome to chat. Owner-only actions stay owner-only.\n"
                    .to_string(),
            ),
            (THREAT_FEED_FILE, "# Threat feed\n".to_string()),
        ];
        for (name, content) in defaults {
            if !self.path(name).exists() {
                std::fs::write(self.path(name), content)
                    .with_context(|| format!("seeding {name}"))?;
            }
        }
        Ok(())
    }
}

/// Heartware names are bare markdown file names; anything path-like is
/// rejected before it can escape the directory.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        bail!("invalid heartware file name: {name}");
    }
    if !name.ends_with(".md") {
        bail!("heartware files are markdown: {name}");
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
