// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pre-initialise validation.
//!
//! Every check reports the YAML path of the offending field so the user can
//! fix the file without reading source code. A config that fails any check
//! must never reach the fleet manager.

use std::collections::HashMap;
use std::str::FromStr;

use crate::{
    FleetConfig, ScheduleConfig, ScheduleType, WebhookProviderKind, WorkspaceStrategyKind,
};

/// A single validation failure: YAML path plus a human-readable reason.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{path}: {reason}")]
pub struct ValidationError {
    pub path: String,
    pub reason: String,
}

fn err(path: impl Into<String>, reason: impl Into<String>) -> ValidationError {
    ValidationError {
        path: path.into(),
        reason: reason.into(),
    }
}

impl FleetConfig {
    /// Validate the whole fleet configuration. Returns every problem found,
    /// not just the first.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = humantime::parse_duration(&self.shutdown_grace) {
            errors.push(err("shutdown_grace", format!("invalid duration: {e}")));
        }
        if let Err(e) = humantime::parse_duration(&self.scheduler.tick_interval) {
            errors.push(err(
                "scheduler.tick_interval",
                format!("invalid duration: {e}"),
            ));
        }
        if self.scheduler.max_concurrent_per_agent == 0 {
            errors.push(err("scheduler.max_concurrent_per_agent", "must be ≥ 1"));
        }
        if self.runtime.runtime_type == crate::RuntimeType::InProcess
            && self.runtime.adapter.is_none()
        {
            errors.push(err(
                "runtime.adapter",
                "required when runtime.type is in_process",
            ));
        }

        if self.agents.is_empty() {
            errors.push(err("agents", "at least one agent must be configured"));
        }

        // Shared-mode channel ownership must be unambiguous.
        let mut channel_owner: HashMap<(String, String), String> = HashMap::new();

        for (name, agent) in &self.agents {
            let base = format!("agents.{name}");

            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
            {
                errors.push(err(&base, "agent names must be [a-zA-Z0-9_-]+"));
            }
            if agent.model.is_empty() {
                errors.push(err(format!("{base}.model"), "model must not be empty"));
            }
            if agent.working_directory.is_empty() {
                errors.push(err(
                    format!("{base}.working_directory"),
                    "working_directory must not be empty",
                ));
            }
            if !(agent.context_threshold > 0.0 && agent.context_threshold <= 1.0) {
                errors.push(err(
                    format!("{base}.context_threshold"),
                    "must be in (0, 1]",
                ));
            }
            if let Some(t) = &agent.job_timeout {
                if let Err(e) = humantime::parse_duration(t) {
                    errors.push(err(format!("{base}.job_timeout"), format!("invalid duration: {e}")));
                }
            }
            if agent.workspace_strategy == WorkspaceStrategyKind::GitWorktree
                && agent.worktree.branch_pattern.is_empty()
            {
                errors.push(err(
                    format!("{base}.worktree.branch_pattern"),
                    "must not be empty with git_worktree strategy",
                ));
            }

            for (sname, sched) in &agent.schedules {
                validate_schedule(&format!("{base}.schedules.{sname}"), sched, &mut errors);
            }

            for (htype, hooks) in [
                ("after_run", &agent.hooks.after_run),
                ("on_error", &agent.hooks.on_error),
                ("on_context_threshold", &agent.hooks.on_context_threshold),
                ("on_session_start", &agent.hooks.on_session_start),
            ] {
                for (i, hook) in hooks.iter().enumerate() {
                    let hpath = format!("{base}.hooks.{htype}[{i}]");
                    match hook.hook_type {
                        crate::HookType::Shell if hook.command.is_none() => {
                            errors.push(err(&hpath, "shell hooks require `command`"));
                        }
                        crate::HookType::HttpWebhook if hook.url.is_none() => {
                            errors.push(err(&hpath, "http_webhook hooks require `url`"));
                        }
                        crate::HookType::ChatPost if hook.channel.is_none() => {
                            errors.push(err(&hpath, "chat_post hooks require `channel`"));
                        }
                        _ => {}
                    }
                    if let Err(e) = humantime::parse_duration(&hook.timeout) {
                        errors.push(err(format!("{hpath}.timeout"), format!("invalid duration: {e}")));
                    }
                }
            }

            if let Some(chat) = &agent.chat {
                for platform in &chat.platforms {
                    if !self.chat.platforms.contains_key(platform) {
                        errors.push(err(
                            format!("{base}.chat.platforms"),
                            format!("unknown chat platform '{platform}'"),
                        ));
                    }
                }
                let platforms: Vec<String> = if chat.platforms.is_empty() {
                    self.chat.platforms.keys().cloned().collect()
                } else {
                    chat.platforms.clone()
                };
                for platform in platforms {
                    for channel in &chat.channels {
                        let key = (platform.clone(), channel.clone());
                        if let Some(other) = channel_owner.get(&key) {
                            errors.push(err(
                                format!("{base}.chat.channels"),
                                format!(
                                    "channel '{channel}' on '{}' already owned by agent '{other}'",
                                    key.0
                                ),
                            ));
                        } else {
                            channel_owner.insert(key, name.clone());
                        }
                    }
                }
            }
        }

        for (pname, platform) in &self.chat.platforms {
            if let Err(e) = humantime::parse_duration(&platform.min_message_interval) {
                errors.push(err(
                    format!("chat.platforms.{pname}.min_message_interval"),
                    format!("invalid duration: {e}"),
                ));
            }
            if platform.max_buffer_size == 0 {
                errors.push(err(
                    format!("chat.platforms.{pname}.max_buffer_size"),
                    "must be ≥ 1",
                ));
            }
        }
        for ttl in [
            ("chat.session_ttl", &self.chat.session_ttl),
            ("chat.issue_session_ttl", &self.chat.issue_session_ttl),
            ("webhook.idempotency_ttl", &self.webhook.idempotency_ttl),
        ] {
            if let Err(e) = humantime::parse_duration(ttl.1) {
                errors.push(err(ttl.0, format!("invalid duration: {e}")));
            }
        }

        for (pname, provider) in &self.webhook.providers {
            if provider.kind != WebhookProviderKind::Unverified && provider.secret_env.is_none() {
                errors.push(err(
                    format!("webhook.providers.{pname}.secret_env"),
                    "required unless kind is `unverified`",
                ));
            }
        }
        for (i, route) in self.webhook.routes.iter().enumerate() {
            let rpath = format!("webhook.routes[{i}]");
            if !self.webhook.providers.contains_key(&route.source) {
                errors.push(err(
                    format!("{rpath}.source"),
                    format!("unknown webhook provider '{}'", route.source),
                ));
            }
            if !self.agents.contains_key(&route.agent) {
                errors.push(err(
                    format!("{rpath}.agent"),
                    format!("unknown agent '{}'", route.agent),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn validate_schedule(path: &str, sched: &ScheduleConfig, errors: &mut Vec<ValidationError>) {
    match sched.schedule_type {
        ScheduleType::Interval => match &sched.interval {
            None => errors.push(err(
                format!("{path}.interval"),
                "required for type: interval",
            )),
            Some(raw) => {
                if let Err(e) = humantime::parse_duration(raw) {
                    errors.push(err(format!("{path}.interval"), format!("invalid duration: {e}")));
                }
            }
        },
        ScheduleType::Cron => match &sched.expression {
            None => errors.push(err(
                format!("{path}.expression"),
                "required for type: cron",
            )),
            Some(raw) => {
                if let Err(e) = cron::Schedule::from_str(raw) {
                    errors.push(err(
                        format!("{path}.expression"),
                        format!("invalid cron expression: {e}"),
                    ));
                }
            }
        },
        // Fired by ingestors; nothing schedule-side to check beyond the
        // prompt, which is allowed to be absent (the trigger supplies one).
        ScheduleType::Webhook | ScheduleType::Chat => {}
    }
    if let Some(ws) = &sched.work_source {
        if ws.repo.split('/').filter(|s| !s.is_empty()).count() != 2 {
            errors.push(err(
                format!("{path}.work_source.repo"),
                "must be an owner/name slug",
            ));
        }
        if ws.token_env.is_empty() {
            errors.push(err(
                format!("{path}.work_source.token_env"),
                "must not be empty",
            ));
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::{AgentConfig, FleetConfig};

    fn minimal_agent() -> AgentConfig {
        serde_yaml::from_str("model: sonnet\nworking_directory: /tmp/repo").unwrap()
    }

    fn minimal_config() -> FleetConfig {
        let mut cfg = FleetConfig::default();
        cfg.agents.insert("coder".into(), minimal_agent());
        cfg
    }

    #[test]
    fn minimal_config_is_valid() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn empty_fleet_is_rejected() {
        let cfg = FleetConfig::default();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.path == "agents"));
    }

    #[test]
    fn context_threshold_bounds() {
        let mut cfg = minimal_config();
        cfg.agents.get_mut("coder").unwrap().context_threshold = 0.0;
        let errors = cfg.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.path == "agents.coder.context_threshold"));

        let mut cfg = minimal_config();
        cfg.agents.get_mut("coder").unwrap().context_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = minimal_config();
        cfg.agents.get_mut("coder").unwrap().context_threshold = 1.0;
        assert!(cfg.validate().is_ok(), "1.0 is inclusive");
    }

    #[test]
    fn in_process_runtime_requires_adapter_name() {
        let mut cfg = minimal_config();
        cfg.runtime.runtime_type = crate::RuntimeType::InProcess;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.path == "runtime.adapter"));

        cfg.runtime.adapter = Some("embedded".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn interval_schedule_requires_interval() {
        let mut cfg = minimal_config();
        let agent = cfg.agents.get_mut("coder").unwrap();
        agent.schedules.insert(
            "tick".into(),
            serde_yaml::from_str("type: interval").unwrap(),
        );
        let errors = cfg.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.path == "agents.coder.schedules.tick.interval"));
    }

    #[test]
    fn cron_expression_is_parsed() {
        let mut cfg = minimal_config();
        let agent = cfg.agents.get_mut("coder").unwrap();
        agent.schedules.insert(
            "bad".into(),
            serde_yaml::from_str("type: cron\nexpression: \"not a cron\"").unwrap(),
        );
        let errors = cfg.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.path == "agents.coder.schedules.bad.expression"));
    }

    #[test]
    fn shell_hook_requires_command() {
        let mut cfg = minimal_config();
        let agent = cfg.agents.get_mut("coder").unwrap();
        agent.hooks.after_run =
            vec![serde_yaml::from_str("type: shell").unwrap()];
        let errors = cfg.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.path == "agents.coder.hooks.after_run[0]"));
    }

    #[test]
    fn duplicate_shared_channel_is_rejected() {
        let mut cfg: FleetConfig = serde_yaml::from_str(
            concat!(
                "chat:\n",
                "  platforms:\n",
                "    slack: {}\n",
                "agents:\n",
                "  a:\n",
                "    model: sonnet\n",
                "    working_directory: /tmp/a\n",
                "    chat: { channels: [C1] }\n",
                "  b:\n",
                "    model: sonnet\n",
                "    working_directory: /tmp/b\n",
                "    chat: { channels: [C1] }\n",
            ),
        )
        .unwrap();
        cfg.webhook.enabled = false;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.reason.contains("already owned")));
    }

    #[test]
    fn webhook_route_references_are_checked() {
        let cfg: FleetConfig = serde_yaml::from_str(
            concat!(
                "agents:\n",
                "  coder: { model: sonnet, working_directory: /tmp/r }\n",
                "webhook:\n",
                "  enabled: true\n",
                "  routes:\n",
                "    - name: r1\n",
                "      source: nowhere\n",
                "      agent: ghost\n",
                "      prompt: \"hi\"\n",
            ),
        )
        .unwrap();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.path == "webhook.routes[0].source"));
        assert!(errors.iter().any(|e| e.path == "webhook.routes[0].agent"));
    }
}
