// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::RuntimeMessage;

pub type MessageStream = Pin<Box<dyn Stream<Item = anyhow::Result<RuntimeMessage>> + Send>>;

// ─── Per-job tools ────────────────────────────────────────────────────────────

/// Result of executing an injected tool.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub content: String,
    pub is_error: bool,
}

impl ToolResponse {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            content: msg.into(),
            is_error: true,
        }
    }
}

/// A tool injected into the runtime for the duration of one job.
///
/// Implementations close over the job's live context (working directory,
/// originating chat channel, …); adapters only see this trait.
#[async_trait]
pub trait RuntimeTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool's arguments.
    fn parameters_schema(&self) -> serde_json::Value;
    async fn execute(&self, args: serde_json::Value) -> ToolResponse;
}

// ─── Request ──────────────────────────────────────────────────────────────────

/// Everything an adapter needs to run one session.
///
/// This is a value snapshot: the executor builds a fresh one per session
/// (including handoff continuations) so the adapter never reads shared
/// mutable agent state.
#[derive(Clone)]
pub struct ExecuteRequest {
    pub agent_name: String,
    pub prompt: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub permission_mode: String,
    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub working_directory: PathBuf,
    pub env: HashMap<String, String>,
    /// Opaque MCP server configs forwarded to the backend.
    pub mcp_servers: HashMap<String, serde_json::Value>,
    /// Resume this backend session instead of starting fresh.
    pub resume_session_id: Option<String>,
    /// Job-scoped tools served to the backend in-process.
    pub tools: Vec<Arc<dyn RuntimeTool>>,
}

impl std::fmt::Debug for ExecuteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteRequest")
            .field("agent_name", &self.agent_name)
            .field("model", &self.model)
            .field("resume_session_id", &self.resume_session_id)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl ExecuteRequest {
    /// Minimal request for tests and sub-queries.
    pub fn bare(agent_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            model: "mock".into(),
            system_prompt: None,
            permission_mode: "default".into(),
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            max_turns: None,
            working_directory: PathBuf::from("."),
            env: HashMap::new(),
            mcp_servers: HashMap::new(),
            resume_session_id: None,
            tools: Vec::new(),
        }
    }
}

// ─── Adapter ──────────────────────────────────────────────────────────────────

/// Backend-agnostic producer of runtime message streams.
///
/// `name()` doubles as the runtime-context discriminator stored in session
/// records: a session created by one backend is never resumed by another.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Backend discriminator (stable across releases).
    fn name(&self) -> &str;

    /// Start one session and return its message stream. The stream ends
    /// with a `result` message unless the backend dies mid-flight.
    async fn execute(&self, req: ExecuteRequest) -> anyhow::Result<MessageStream>;
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// name → adapter registry.
///
/// Tagged variants with a registry, not reflection: adapters are registered
/// at fleet initialise and resolved by the discriminator string.
#[derive(Default)]
pub struct RuntimeRegistry {
    adapters: HashMap<String, Arc<dyn RuntimeAdapter>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn RuntimeAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RuntimeAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedRuntime;

    #[test]
    fn registry_resolves_by_name() {
        let mut reg = RuntimeRegistry::new();
        reg.register(Arc::new(ScriptedRuntime::single_result("ok")));
        assert!(reg.get("scripted").is_some());
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.names(), vec!["scripted"]);
    }

    #[test]
    fn bare_request_has_no_resume() {
        let req = ExecuteRequest::bare("a", "p");
        assert!(req.resume_session_id.is_none());
        assert!(req.tools.is_empty());
    }
}
