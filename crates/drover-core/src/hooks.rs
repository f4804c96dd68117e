// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Hook pipeline: user-configured shell / HTTP / chat hooks fired at job
//! lifecycle points.
//!
//! Hooks in a slot run sequentially in declaration order. A hook failure
//! never fails the owning job; it only stops the remaining hooks in the
//! slot when `continue_on_error: false`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use drover_config::{HookConfig, HookEvent, HookType};
use drover_webhook::lookup_path;

// ─── Capabilities ─────────────────────────────────────────────────────────────

/// Posting capability for `chat_post` hooks, bound by the fleet to the
/// right platform connector.
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn post(&self, channel_id: &str, text: &str) -> anyhow::Result<()>;
}

// ─── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub name: Option<String>,
    pub hook_type: HookType,
    pub success: bool,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    /// Captured stdout for shell hooks; response body for HTTP hooks.
    pub output: Option<String>,
    pub error: Option<String>,
}

// ─── Payload builders ─────────────────────────────────────────────────────────

/// Session block shared by several payloads.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub agent_name: String,
    pub job_id: String,
    pub working_directory: String,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
}

impl SessionInfo {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "session_id": self.session_id,
            "agent_name": self.agent_name,
            "job_id": self.job_id,
            "working_directory": self.working_directory,
            "worktree_path": self.worktree_path,
            "branch_name": self.branch_name,
        })
    }
}

pub fn context_threshold_payload(
    session: &SessionInfo,
    input_tokens: u64,
    context_window: u64,
    model_name: Option<&str>,
    original_prompt: &str,
) -> serde_json::Value {
    let usage = input_tokens as f64 / context_window.max(1) as f64;
    serde_json::json!({
        "event": HookEvent::ContextThreshold.as_str(),
        "context": {
            "input_tokens": input_tokens,
            "context_window": context_window,
            "usage_percent": usage * 100.0,
            "remaining_percent": (1.0 - usage) * 100.0,
            "model_name": model_name,
        },
        "session": session.to_json(),
        "original_prompt": original_prompt,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn session_start_payload(
    session: &SessionInfo,
    is_continuation: bool,
    previous_session_id: Option<&str>,
    handoff_count: u32,
    prompt: &str,
) -> serde_json::Value {
    let mut s = session.to_json();
    s["is_continuation"] = serde_json::json!(is_continuation);
    s["previous_session_id"] = serde_json::json!(previous_session_id);
    s["handoff_count"] = serde_json::json!(handoff_count);
    serde_json::json!({
        "event": HookEvent::SessionStart.as_str(),
        "session": s,
        "prompt": prompt,
    })
}

pub fn after_run_payload(
    event: HookEvent,
    session: &SessionInfo,
    summary: Option<&str>,
    error: Option<&str>,
    duration_seconds: f64,
) -> serde_json::Value {
    serde_json::json!({
        "event": event.as_str(),
        "session": session.to_json(),
        "summary": summary,
        "error": error,
        "duration_seconds": duration_seconds,
    })
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

pub struct HookPipeline {
    http: reqwest::Client,
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

/// Truthiness of a `when` predicate value: the dot-path must resolve to
/// boolean `true`.
fn when_matches(when: Option<&str>, payload: &serde_json::Value) -> bool {
    match when {
        None => true,
        Some(path) => matches!(
            lookup_path(payload, path),
            Some(serde_json::Value::Bool(true))
        ),
    }
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one slot. Returns outcomes in execution order; hooks skipped by
    /// `on_events` or `when` produce no outcome.
    pub async fn run_slot(
        &self,
        hooks: &[HookConfig],
        event: HookEvent,
        payload: &serde_json::Value,
        working_dir: &Path,
        env: &HashMap<String, String>,
        notifier: Option<&Arc<dyn ChatNotifier>>,
    ) -> Vec<HookOutcome> {
        let mut outcomes = Vec::new();
        for hook in hooks {
            if let Some(allowed) = &hook.on_events {
                if !allowed.contains(&event) {
                    continue;
                }
            }
            if !when_matches(hook.when.as_deref(), payload) {
                debug!(hook = hook.name.as_deref().unwrap_or("-"), "when predicate false, skipping");
                continue;
            }
            let outcome = self.run_one(hook, payload, working_dir, env, notifier).await;
            let stop = !outcome.success && !hook.continue_on_error;
            if !outcome.success {
                warn!(
                    hook = hook.name.as_deref().unwrap_or("-"),
                    event = event.as_str(),
                    error = outcome.error.as_deref().unwrap_or("-"),
                    "hook failed"
                );
            }
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        outcomes
    }

    async fn run_one(
        &self,
        hook: &HookConfig,
        payload: &serde_json::Value,
        working_dir: &Path,
        env: &HashMap<String, String>,
        notifier: Option<&Arc<dyn ChatNotifier>>,
    ) -> HookOutcome {
        let started = Instant::now();
        let timeout = humantime::parse_duration(&hook.timeout)
            .unwrap_or_else(|_| Duration::from_secs(60));
        let result = tokio::time::timeout(
            timeout,
            self.invoke(hook, payload, working_dir, env, notifier),
        )
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok((exit_code, output))) => HookOutcome {
                name: hook.name.clone(),
                hook_type: hook.hook_type,
                success: exit_code.map_or(true, |c| c == 0),
                duration_ms,
                exit_code,
                output,
                error: exit_code
                    .filter(|c| *c != 0)
                    .map(|c| format!("exited with code {c}")),
            },
            Ok(Err(e)) => HookOutcome {
                name: hook.name.clone(),
                hook_type: hook.hook_type,
                success: false,
                duration_ms,
                exit_code: None,
                output: None,
                error: Some(e.to_string()),
            },
            Err(_) => HookOutcome {
                name: hook.name.clone(),
                hook_type: hook.hook_type,
                success: false,
                duration_ms,
                exit_code: None,
                output: None,
                error: Some(format!("timed out after {}", hook.timeout)),
            },
        }
    }

    async fn invoke(
        &self,
        hook: &HookConfig,
        payload: &serde_json::Value,
        working_dir: &Path,
        env: &HashMap<String, String>,
        notifier: Option<&Arc<dyn ChatNotifier>>,
    ) -> anyhow::Result<(Option<i32>, Option<String>)> {
        match hook.hook_type {
            HookType::Shell => {
                let command = hook
                    .command
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("shell hook has no command"))?;
                let mut child = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .current_dir(working_dir)
                    .envs(env)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                if let Some(mut stdin) = child.stdin.take() {
                    let json = serde_json::to_vec(payload)?;
                    stdin.write_all(&json).await?;
                    drop(stdin);
                }
                let output = child.wait_with_output().await?;
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                Ok((output.status.code(), Some(stdout)))
            }
            HookType::HttpWebhook => {
                let url = hook
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("http hook has no url"))?;
                let resp = self.http.post(url).json(payload).send().await?;
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                if status.is_success() {
                    Ok((Some(0), Some(body)))
                } else {
                    anyhow::bail!("POST {url} returned {status}")
                }
            }
            HookType::ChatPost => {
                let channel = hook
                    .channel
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("chat_post hook has no channel"))?;
                let notifier =
                    notifier.ok_or_else(|| anyhow::anyhow!("no chat connector available"))?;
                notifier.post(channel, &render_notification(payload)).await?;
                Ok((Some(0), None))
            }
        }
    }
}

/// Compact human-readable rendering of a hook payload for chat posts.
fn render_notification(payload: &serde_json::Value) -> String {
    let event = payload["event"].as_str().unwrap_or("event");
    let agent = payload["session"]["agent_name"].as_str().unwrap_or("-");
    let job = payload["session"]["job_id"].as_str().unwrap_or("-");
    let mut text = format!("*{event}* — agent `{agent}`, job `{job}`");
    if let Some(summary) = payload["summary"].as_str() {
        text.push_str(&format!("\n{summary}"));
    }
    if let Some(error) = payload["error"].as_str() {
        text.push_str(&format!("\n```\n{error}\n```"));
    }
    text
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(yaml: &str) -> HookConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn session() -> SessionInfo {
        SessionInfo {
            session_id: Some("S1".into()),
            agent_name: "coder".into(),
            job_id: "j1".into(),
            working_directory: "/work/repo".into(),
            worktree_path: None,
            branch_name: None,
        }
    }

    fn payload() -> serde_json::Value {
        session_start_payload(&session(), true, Some("S0"), 1, "continue please")
    }

    #[tokio::test]
    async fn shell_hook_receives_payload_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = HookPipeline::new();
        let hooks = vec![hook(
            "type: shell\ncommand: \"cat | head -c 100\"",
        )];
        let outcomes = pipeline
            .run_slot(
                &hooks,
                HookEvent::SessionStart,
                &payload(),
                dir.path(),
                &HashMap::new(),
                None,
            )
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert!(outcomes[0].output.as_deref().unwrap().contains("session_start"));
    }

    #[tokio::test]
    async fn shell_hook_captures_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = HookPipeline::new();
        let hooks = vec![hook("type: shell\ncommand: \"exit 3\"")];
        let outcomes = pipeline
            .run_slot(
                &hooks,
                HookEvent::Completed,
                &payload(),
                dir.path(),
                &HashMap::new(),
                None,
            )
            .await;
        assert!(!outcomes[0].success);
        assert_eq!(outcomes[0].exit_code, Some(3));
    }

    #[tokio::test]
    async fn on_events_filter_skips_other_events() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = HookPipeline::new();
        let hooks = vec![hook(
            "type: shell\ncommand: \"echo hi\"\non_events: [failed, timeout]",
        )];
        let outcomes = pipeline
            .run_slot(
                &hooks,
                HookEvent::Completed,
                &payload(),
                dir.path(),
                &HashMap::new(),
                None,
            )
            .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn when_predicate_gates_execution() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = HookPipeline::new();
        let hooks = vec![hook(
            "type: shell\ncommand: \"echo ran\"\nwhen: session.is_continuation",
        )];
        // is_continuation = true in this payload → runs.
        let outcomes = pipeline
            .run_slot(
                &hooks,
                HookEvent::SessionStart,
                &payload(),
                dir.path(),
                &HashMap::new(),
                None,
            )
            .await;
        assert_eq!(outcomes.len(), 1);

        // Fresh session → skipped.
        let fresh = session_start_payload(&session(), false, None, 0, "p");
        let outcomes = pipeline
            .run_slot(
                &hooks,
                HookEvent::SessionStart,
                &fresh,
                dir.path(),
                &HashMap::new(),
                None,
            )
            .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn continue_on_error_false_stops_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = HookPipeline::new();
        let hooks = vec![
            hook("type: shell\ncommand: \"exit 1\"\ncontinue_on_error: false"),
            hook("type: shell\ncommand: \"echo never\""),
        ];
        let outcomes = pipeline
            .run_slot(
                &hooks,
                HookEvent::Completed,
                &payload(),
                dir.path(),
                &HashMap::new(),
                None,
            )
            .await;
        assert_eq!(outcomes.len(), 1, "second hook never ran");
    }

    #[tokio::test]
    async fn failing_hook_continues_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = HookPipeline::new();
        let hooks = vec![
            hook("type: shell\ncommand: \"exit 1\""),
            hook("type: shell\ncommand: \"echo still here\""),
        ];
        let outcomes = pipeline
            .run_slot(
                &hooks,
                HookEvent::Completed,
                &payload(),
                dir.path(),
                &HashMap::new(),
                None,
            )
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[1].success);
    }

    #[tokio::test]
    async fn hook_timeout_is_an_error_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = HookPipeline::new();
        let hooks = vec![hook(
            "type: shell\ncommand: \"sleep 5\"\ntimeout: 100ms",
        )];
        let outcomes = pipeline
            .run_slot(
                &hooks,
                HookEvent::Completed,
                &payload(),
                dir.path(),
                &HashMap::new(),
                None,
            )
            .await;
        assert!(!outcomes[0].success);
        assert!(outcomes[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn chat_post_uses_the_notifier() {
        struct Recorder(std::sync::Mutex<Vec<(String, String)>>);
        #[async_trait]
        impl ChatNotifier for Recorder {
            async fn post(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
                self.0
                    .lock()
                    .unwrap()
                    .push((channel_id.into(), text.into()));
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let pipeline = HookPipeline::new();
        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let notifier: Arc<dyn ChatNotifier> = recorder.clone();
        let hooks = vec![hook("type: chat_post\nchannel: C-alerts")];
        let outcomes = pipeline
            .run_slot(
                &hooks,
                HookEvent::Failed,
                &after_run_payload(HookEvent::Failed, &session(), None, Some("boom"), 1.5),
                dir.path(),
                &HashMap::new(),
                Some(&notifier),
            )
            .await;
        assert!(outcomes[0].success);
        let posts = recorder.0.lock().unwrap();
        assert_eq!(posts[0].0, "C-alerts");
        assert!(posts[0].1.contains("failed"));
    }

    #[test]
    fn context_threshold_payload_shape() {
        let p = context_threshold_payload(&session(), 185_000, 200_000, Some("sonnet"), "orig");
        assert_eq!(p["event"], "context_threshold");
        assert_eq!(p["context"]["input_tokens"], 185_000);
        assert!((p["context"]["remaining_percent"].as_f64().unwrap() - 7.5).abs() < 1e-9);
        assert_eq!(p["session"]["job_id"], "j1");
        assert_eq!(p["original_prompt"], "orig");
    }

    #[test]
    fn session_start_payload_shape() {
        let p = payload();
        assert_eq!(p["event"], "session_start");
        assert_eq!(p["session"]["is_continuation"], true);
        assert_eq!(p["session"]["previous_session_id"], "S0");
        assert_eq!(p["session"]["handoff_count"], 1);
    }
}
