// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Subprocess runtime adapter.
//!
//! Spawns an external agent CLI per session and reads newline-delimited
//! JSON [`RuntimeMessage`]s from its stdout. The prompt is written to the
//! child's stdin; stderr is drained into the log. Non-JSON stdout lines are
//! skipped with a warning so a chatty backend cannot wedge the stream.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use crate::{ExecuteRequest, MessageStream, RuntimeAdapter, RuntimeMessage};

pub struct SubprocessRuntime {
    command: String,
    base_args: Vec<String>,
    base_env: HashMap<String, String>,
}

impl SubprocessRuntime {
    pub fn new(
        command: impl Into<String>,
        base_args: Vec<String>,
        base_env: HashMap<String, String>,
    ) -> Self {
        Self {
            command: command.into(),
            base_args,
            base_env,
        }
    }

    fn build_args(&self, req: &ExecuteRequest) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("--output-format".into());
        args.push("stream-json".into());
        args.push("--model".into());
        args.push(req.model.clone());
        args.push("--permission-mode".into());
        args.push(req.permission_mode.clone());
        if let Some(id) = &req.resume_session_id {
            args.push("--resume".into());
            args.push(id.clone());
        }
        if let Some(turns) = req.max_turns {
            args.push("--max-turns".into());
            args.push(turns.to_string());
        }
        if !req.allowed_tools.is_empty() {
            args.push("--allowed-tools".into());
            args.push(req.allowed_tools.join(","));
        }
        if !req.denied_tools.is_empty() {
            args.push("--disallowed-tools".into());
            args.push(req.denied_tools.join(","));
        }
        if let Some(prompt) = &req.system_prompt {
            args.push("--system-prompt".into());
            args.push(prompt.clone());
        }
        if !req.mcp_servers.is_empty() {
            // The backend accepts its MCP config as a JSON document.
            if let Ok(json) = serde_json::to_string(&req.mcp_servers) {
                args.push("--mcp-config".into());
                args.push(json);
            }
        }
        args
    }
}

#[async_trait]
impl RuntimeAdapter for SubprocessRuntime {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn execute(&self, req: ExecuteRequest) -> anyhow::Result<MessageStream> {
        let args = self.build_args(&req);
        debug!(agent = %req.agent_name, command = %self.command, "spawning runtime subprocess");

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&args)
            .current_dir(&req.working_directory)
            .envs(&self.base_env)
            .envs(&req.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning runtime command '{}'", self.command))?;

        let mut stdin = child.stdin.take().context("runtime child has no stdin")?;
        let stdout = child.stdout.take().context("runtime child has no stdout")?;
        let stderr = child.stderr.take().context("runtime child has no stderr")?;

        let prompt = req.prompt.clone();
        let agent = req.agent_name.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(agent = %agent, error = %e, "writing prompt to runtime stdin failed");
            }
            // Close stdin so the backend knows the prompt is complete.
            drop(stdin);
        });

        let agent = req.agent_name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(agent = %agent, "runtime stderr: {line}");
            }
        });

        let agent = req.agent_name.clone();
        let lines = LinesStream::new(BufReader::new(stdout).lines());
        // The child handle rides inside the stream closure so kill_on_drop
        // fires when the executor drops the stream (cancellation, handoff).
        let stream = lines.filter_map(move |line| {
            let agent = agent.clone();
            let _keepalive = &child;
            let parsed = match line {
                Ok(text) if text.trim().is_empty() => None,
                Ok(text) => match serde_json::from_str::<RuntimeMessage>(&text) {
                    Ok(msg) => Some(Ok(msg)),
                    Err(e) => {
                        warn!(agent = %agent, error = %e, "skipping unparseable runtime line");
                        None
                    }
                },
                Err(e) => Some(Err(anyhow::Error::from(e).context("reading runtime stdout"))),
            };
            futures::future::ready(parsed)
        });

        Ok(Box::pin(stream))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> SubprocessRuntime {
        SubprocessRuntime::new("agent-cli", vec!["--print".into()], HashMap::new())
    }

    #[test]
    fn args_carry_model_and_mode() {
        let req = ExecuteRequest::bare("a", "p");
        let args = runtime().build_args(&req);
        assert!(args.windows(2).any(|w| w == ["--model", "mock"]));
        assert!(args.windows(2).any(|w| w == ["--permission-mode", "default"]));
        assert_eq!(args[0], "--print", "base args come first");
    }

    #[test]
    fn resume_flag_only_when_present() {
        let mut req = ExecuteRequest::bare("a", "p");
        assert!(!runtime().build_args(&req).contains(&"--resume".to_string()));
        req.resume_session_id = Some("S9".into());
        let args = runtime().build_args(&req);
        assert!(args.windows(2).any(|w| w == ["--resume", "S9"]));
    }

    #[test]
    fn tool_patterns_are_joined() {
        let mut req = ExecuteRequest::bare("a", "p");
        req.allowed_tools = vec!["Bash(git *)".into(), "Read".into()];
        let args = runtime().build_args(&req);
        let idx = args.iter().position(|a| a == "--allowed-tools").unwrap();
        assert_eq!(args[idx + 1], "Bash(git *),Read");
    }

    #[tokio::test]
    async fn missing_command_surfaces_spawn_error() {
        let rt = SubprocessRuntime::new(
            "/nonexistent/drover-test-binary",
            Vec::new(),
            HashMap::new(),
        );
        let err = match rt.execute(ExecuteRequest::bare("a", "p")).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("spawning runtime command"));
    }
}
