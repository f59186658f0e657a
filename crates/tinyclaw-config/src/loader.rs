// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/tinyclaw/config.yaml"));
    paths.push(PathBuf::from("/etc/tinyclaw/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/tinyclaw/config.yaml"));
        paths.push(home.join(".config/tinyclaw/config.yml"));
    }

    paths.push(PathBuf::from(".tinyclaw.yaml"));
    paths.push(PathBuf::from(".tinyclaw.yml"));
    paths.push(PathBuf::from("tinyclaw.yaml"));
    paths.push(PathBuf::from("tinyclaw.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Data directory layout ────────────────────────────────────────────────────

/// Resolved on-disk layout under the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
    pub agent_db: PathBuf,
    pub security_db: PathBuf,
    pub heartware_dir: PathBuf,
    pub audit_dir: PathBuf,
}

/// Create the data directory tree, returning the resolved layout.
///
/// On non-Windows targets directories are chmod'd to 0o700 and the database
/// files (once they exist) to 0o600.
pub fn ensure_data_layout(data_dir: Option<&str>) -> anyhow::Result<DataLayout> {
    let root = match data_dir {
        Some(d) => PathBuf::from(shell_expand_home(d)),
        None => dirs::home_dir()
            .context("cannot determine home directory for default data dir")?
            .join(".tinyclaw"),
    };

    let data = root.join("data");
    let heartware = root.join("heartware");
    let backups = heartware.join(".backups");
    let audit = root.join("audit");

    for dir in [&root, &data, &heartware, &backups, &audit] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        restrict_dir_permissions(dir);
    }

    let layout = DataLayout {
        agent_db: data.join("agent.db"),
        security_db: data.join("security.db"),
        heartware_dir: heartware,
        audit_dir: audit,
        root,
    };

    for db in [&layout.agent_db, &layout.security_db] {
        restrict_file_permissions(db);
    }

    Ok(layout)
}

/// Expand a leading `~/` to the user's home directory.
fn shell_expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_path: &Path) {}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if path.exists() {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}

// ─── Unit tests ──────────────────────────────────────────────────────────────
