// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::FleetConfig;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/drover/config.yaml"));
    paths.push(PathBuf::from("/etc/drover/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/drover/config.yaml"));
        paths.push(home.join(".config/drover/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("drover/config.yaml"));
        paths.push(cfg.join("drover/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".drover/config.yaml"));
    paths.push(PathBuf::from(".drover/config.yml"));
    paths.push(PathBuf::from("drover.yaml"));
    paths.push(PathBuf::from("drover.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
///
/// The merged config is **not** validated here; call
/// [`FleetConfig::validate`] before handing it to the fleet manager.
pub fn load(extra: Option<&Path>) -> anyhow::Result<FleetConfig> {
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

    if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        return Ok(FleetConfig::default());
    }
    let config: FleetConfig =
        serde_yaml::from_value(merged).context("deserializing merged configuration")?;
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

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("scheduler:\n  tick_interval: 1s\n  max_concurrent_per_agent: 1");
        let src = val("scheduler:\n  max_concurrent_per_agent: 4");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["scheduler"]["tick_interval"].as_str(), Some("1s"));
        assert_eq!(dst["scheduler"]["max_concurrent_per_agent"].as_i64(), Some(4));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/drover_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_parses_agents() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "agents:\n  coder:\n    model: sonnet\n    working_directory: /tmp/repo"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.agents.len(), 1);
        assert_eq!(cfg.agents["coder"].model, "sonnet");
    }

    #[test]
    fn load_applies_schedule_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            concat!(
                "agents:\n",
                "  coder:\n",
                "    model: sonnet\n",
                "    working_directory: /tmp/repo\n",
                "    schedules:\n",
                "      nightly:\n",
                "        type: cron\n",
                "        expression: \"0 0 2 * * *\"\n",
            )
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        let sched = &cfg.agents["coder"].schedules["nightly"];
        assert!(sched.enabled, "schedules default to enabled");
        assert!(!sched.resume_session);
    }
}
