// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless the user
/// explicitly disables them need a named function.
fn default_true() -> bool {
    true
}

fn default_context_threshold() -> f64 {
    0.10
}

fn default_max_handoffs() -> u32 {
    3
}

fn default_tick_interval() -> String {
    "1s".to_string()
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_shutdown_grace() -> String {
    "30s".to_string()
}

fn default_command_prefix() -> String {
    "!".to_string()
}

fn default_max_buffer_size() -> usize {
    3500
}

fn default_min_message_interval() -> String {
    "2s".to_string()
}

fn default_idempotency_ttl() -> String {
    "24h".to_string()
}

fn default_chat_session_ttl() -> String {
    "24h".to_string()
}

fn default_issue_session_ttl() -> String {
    "168h".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_ready_label() -> String {
    "ready".to_string()
}

fn default_in_progress_label() -> String {
    "in-progress".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_pattern() -> String {
    "drover/{agent}/{job_id}".to_string()
}

fn default_worktree_dir() -> String {
    ".drover-worktrees".to_string()
}

fn default_hook_timeout() -> String {
    "60s".to_string()
}

fn default_fetch_limit() -> u32 {
    30
}

// ─── Root ─────────────────────────────────────────────────────────────────────

/// Top-level fleet configuration.
///
/// Loaded from layered YAML files (see [`crate::load`]); the merged value is
/// validated with [`FleetConfig::validate`] before the fleet initialises.
/// A fleet that fails validation never starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Directory for persisted state (sessions, jobs, schedule records).
    /// Defaults to `~/.local/share/drover` when unset.
    pub state_dir: Option<String>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Named agents. The map key is the agent name (unique, stable).
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    /// Grace period for draining in-flight jobs on `stop()` before they are
    /// cancelled. Humantime string, e.g. `"30s"`, `"2m"`.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            runtime: RuntimeConfig::default(),
            scheduler: SchedulerConfig::default(),
            chat: ChatConfig::default(),
            webhook: WebhookConfig::default(),
            agents: HashMap::new(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

// ─── Runtime ──────────────────────────────────────────────────────────────────

/// Which runtime backend executes agent prompts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    /// Spawn an external agent CLI per job; messages arrive as
    /// newline-delimited JSON on its stdout.
    #[default]
    Subprocess,
    /// In-process adapter resolved from the runtime registry by name.
    /// Used by tests (scripted runtime) and embedded backends.
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "type", default)]
    pub runtime_type: RuntimeType,
    /// Executable for the subprocess runtime.
    #[serde(default = "RuntimeConfig::default_command")]
    pub command: String,
    /// Extra arguments prepended before the generated ones.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment passed to every runtime invocation (merged under the
    /// per-agent `env` map; the agent wins on conflicts).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Registry name for the in-process runtime (`type: in_process`).
    pub adapter: Option<String>,
}

impl RuntimeConfig {
    fn default_command() -> String {
        "claude".to_string()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: RuntimeType::default(),
            command: Self::default_command(),
            args: Vec::new(),
            env: HashMap::new(),
            adapter: None,
        }
    }
}

// ─── Agent ────────────────────────────────────────────────────────────────────

/// Tool permission posture forwarded to the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Bypass,
    Plan,
    Delegate,
    DontAsk,
}

/// Whether session ids persist across jobs for this agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// The last session id is stored and resumed on the next job.
    #[default]
    Persistent,
    /// Every job starts a fresh session; nothing is stored.
    Ephemeral,
}

/// Pre/post-job workspace lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStrategyKind {
    /// Run in the configured working directory as-is.
    #[default]
    Static,
    /// Create an isolated git worktree + branch per job.
    GitWorktree,
}

/// System prompt: either a literal string or a named preset with an
/// optional appended suffix:
///
/// ```yaml
/// system_prompt: "You are a release engineer."
/// # or
/// system_prompt:
///   preset: coder
///   append: "Prefer small commits."
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Preset {
        preset: String,
        #[serde(default)]
        append: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// LLM model identifier forwarded to the runtime.
    pub model: String,
    pub system_prompt: Option<SystemPrompt>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    /// Tool patterns the runtime may use without asking.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tool patterns the runtime must never use. Deny wins over allow.
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Maximum model turns per session; unlimited when unset.
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub session_mode: SessionMode,
    /// Fraction of the context window that must remain before a handoff is
    /// triggered. `0.10` = hand off when ≤ 10% of the window is left.
    #[serde(default = "default_context_threshold")]
    pub context_threshold: f64,
    /// Maximum handoffs within a single job.
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: u32,
    /// Root working directory. Shell expansions (`~`) are resolved at load.
    pub working_directory: String,
    #[serde(default)]
    pub workspace_strategy: WorkspaceStrategyKind,
    /// Worktree settings; only read when `workspace_strategy: git_worktree`.
    #[serde(default)]
    pub worktree: WorktreeConfig,
    /// Per-agent runtime override; falls back to the fleet runtime type.
    pub runtime_type: Option<RuntimeType>,
    /// Environment injected into the runtime and hook subprocesses.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// MCP server configs forwarded opaquely to the runtime.
    #[serde(default)]
    pub mcp_servers: HashMap<String, serde_json::Value>,
    /// Named schedules. Webhook/chat-typed schedules only mark intent;
    /// they are fired by their ingestors, never by the scheduler.
    #[serde(default)]
    pub schedules: HashMap<String, ScheduleConfig>,
    /// Chat trigger filter for this agent.
    pub chat: Option<AgentChatConfig>,
    /// Issue-tracker routing filter for this agent.
    pub issues: Option<IssueFilterConfig>,
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Per-job wall-clock timeout, e.g. `"20m"`. Unlimited when unset.
    pub job_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeConfig {
    /// Directory (relative to the repository root) that holds per-job
    /// worktrees: `<root>/<dir>/<job_id>`.
    #[serde(default = "default_worktree_dir")]
    pub dir: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Branch name pattern. Placeholders: `{agent}`, `{work_item}`,
    /// `{schedule}`, `{job_id}`, `{date}`.
    #[serde(default = "default_branch_pattern")]
    pub branch_pattern: String,
    /// Push the branch after a successful job.
    #[serde(default = "default_true")]
    pub push: bool,
    /// Commit message template for leftover changes; `{summary}` expands to
    /// the job summary.
    #[serde(default = "WorktreeConfig::default_commit_message")]
    pub commit_message: String,
    /// Shell command run in the worktree after a successful push, e.g.
    /// `gh pr create --fill`. Skipped on failed jobs and when unset.
    pub pr_command: Option<String>,
}

impl WorktreeConfig {
    fn default_commit_message() -> String {
        "drover: {summary}".to_string()
    }
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            dir: default_worktree_dir(),
            base_branch: default_base_branch(),
            branch_pattern: default_branch_pattern(),
            push: true,
            commit_message: Self::default_commit_message(),
            pr_command: None,
        }
    }
}

// ─── Schedules ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    Cron,
    Webhook,
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    /// Humantime interval for `type: interval`, e.g. `"15m"`.
    pub interval: Option<String>,
    /// Cron expression for `type: cron` (5 or 6 fields).
    pub expression: Option<String>,
    /// Static prompt used when the trigger carries none.
    pub prompt: Option<String>,
    /// Poll this work source before firing; a tick without an available
    /// item is a no-op.
    pub work_source: Option<WorkSourceConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Resume the agent's stored session instead of starting fresh.
    #[serde(default)]
    pub resume_session: bool,
}

// ─── Work sources ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkSourceType {
    Github,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSourceConfig {
    #[serde(rename = "type")]
    pub source_type: WorkSourceType,
    /// `owner/name` repository slug.
    pub repo: String,
    /// Environment variable holding the API token. The token itself never
    /// appears in config files.
    pub token_env: String,
    /// API base override, mainly for tests and GitHub Enterprise.
    pub api_base: Option<String>,
    #[serde(default = "default_ready_label")]
    pub ready_label: String,
    #[serde(default = "default_in_progress_label")]
    pub in_progress_label: String,
    /// Items carrying any of these labels are never fetched.
    #[serde(default)]
    pub exclude_labels: Vec<String>,
    /// Re-add the ready label when work is released.
    #[serde(default = "default_true")]
    pub cleanup_on_failure: bool,
    /// Default fetch page size (capped at 100 by the adapter).
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
}

// ─── Hooks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    /// Spawn a subprocess; the JSON payload is piped to stdin.
    Shell,
    /// POST the JSON payload to a URL.
    HttpWebhook,
    /// Post a notification to a named chat channel.
    ChatPost,
}

/// Lifecycle events a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    Completed,
    Failed,
    Timeout,
    Cancelled,
    ContextThreshold,
    SessionStart,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ContextThreshold => "context_threshold",
            Self::SessionStart => "session_start",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub hook_type: HookType,
    /// Shell command line (`type: shell`).
    pub command: Option<String>,
    /// Target URL (`type: http_webhook`).
    pub url: Option<String>,
    /// Chat channel id (`type: chat_post`).
    pub channel: Option<String>,
    /// Event allowlist; absent = fire on every event reaching this slot.
    pub on_events: Option<Vec<HookEvent>>,
    /// Dot-path into the payload that must resolve to boolean `true`,
    /// e.g. `"context.usage_percent"` would not qualify but
    /// `"session.is_continuation"` does. Absent = always fire.
    pub when: Option<String>,
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    #[serde(default = "default_hook_timeout")]
    pub timeout: String,
}

/// Hook slots per agent. Slot membership decides *when* the pipeline runs;
/// `on_events` filters decide *which* events a hook inside the slot sees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Fired once per job at terminal status (completed / failed /
    /// timeout / cancelled).
    #[serde(default)]
    pub after_run: Vec<HookConfig>,
    /// Fired on job failure, in addition to `after_run`.
    #[serde(default)]
    pub on_error: Vec<HookConfig>,
    /// Fired when the context tracker crosses the threshold. When
    /// non-empty these hooks *replace* the built-in handoff sub-query.
    #[serde(default)]
    pub on_context_threshold: Vec<HookConfig>,
    /// Fired whenever a session starts (including handoff continuations).
    /// Shell hook stdout is prepended to the continuation prompt.
    #[serde(default)]
    pub on_session_start: Vec<HookConfig>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.after_run.is_empty()
            && self.on_error.is_empty()
            && self.on_context_threshold.is_empty()
            && self.on_session_start.is_empty()
    }
}

// ─── Chat ─────────────────────────────────────────────────────────────────────

/// How a chat platform's connector maps to agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorMode {
    /// One workspace identity; channels route to agents via the
    /// channel→agent map derived from agent chat configs.
    #[default]
    Shared,
    /// Each agent owns an independent connector identity.
    PerAgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Named platforms, e.g. `slack`, `telegram`. The key doubles as the
    /// conversation-key-store namespace.
    #[serde(default)]
    pub platforms: HashMap<String, ChatPlatformConfig>,
    /// TTL for chat conversation-key records.
    #[serde(default = "default_chat_session_ttl")]
    pub session_ttl: String,
    /// TTL for issue-tracker conversation-key records (issues are
    /// longer-lived than chat threads).
    #[serde(default = "default_issue_session_ttl")]
    pub issue_session_ttl: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            platforms: HashMap::new(),
            session_ttl: default_chat_session_ttl(),
            issue_session_ttl: default_issue_session_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPlatformConfig {
    #[serde(default)]
    pub mode: ConnectorMode,
    /// Environment variable holding the connector token.
    pub token_env: Option<String>,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Upper bound on one outgoing message. Platform-specific: ~1500 for
    /// IRC-like platforms, 3500–4000 for Slack/Discord-like ones.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Minimum gap between sends (humantime), measured from the last
    /// successful send.
    #[serde(default = "default_min_message_interval")]
    pub min_message_interval: String,
}

/// Per-agent chat filter: which platforms/channels trigger this agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentChatConfig {
    /// Platform names this agent listens on; empty = all configured.
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Channel ids owned by this agent. In shared mode these build the
    /// channel→agent map; messages in unmapped channels are ignored.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Only react when the agent is mentioned.
    #[serde(default)]
    pub require_mention: bool,
}

/// Issue-tracker routing filter. First matching agent wins unless
/// `require_assignment` forces explicit assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueFilterConfig {
    /// Match issues assigned to this user id.
    pub assignee: Option<String>,
    /// Match issues in this team key.
    pub team: Option<String>,
    /// With `team`: only these workflow states (empty = all).
    #[serde(default)]
    pub states: Vec<String>,
    /// With `team`: skip issues carrying any of these labels.
    #[serde(default)]
    pub exclude_labels: Vec<String>,
    /// Match issues carrying this label.
    pub label: Option<String>,
    /// Match issues in this project.
    pub project: Option<String>,
    /// Route only explicitly assigned issues to this agent.
    #[serde(default)]
    pub require_assignment: bool,
}

// ─── Webhooks ─────────────────────────────────────────────────────────────────

/// Signature scheme for inbound webhook verification. All schemes are
/// HMAC-SHA256 over the raw request body; they differ in header name and
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookProviderKind {
    /// `Linear-Signature: <hex>`
    Linear,
    /// `X-Hub-Signature-256: sha256=<hex>`
    Github,
    /// `X-Slack-Signature: v0=<hex>` over `v0:<timestamp>:<body>`
    Slack,
    /// No signature verification (trusted network only).
    Unverified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookProviderConfig {
    pub kind: WebhookProviderKind,
    /// Environment variable holding the shared signing secret. Required for
    /// every kind except `unverified`.
    pub secret_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRouteConfig {
    pub name: String,
    /// Provider name this route listens under (`POST /webhooks/<source>`).
    pub source: String,
    /// Dot-path match on the payload `type`/`event` field; absent = any.
    pub event: Option<String>,
    /// Match on the payload `action` field; absent = any.
    pub action: Option<String>,
    /// Extra dot-path equality filters, e.g. `data.team.key: ENG`.
    #[serde(default)]
    pub filters: HashMap<String, String>,
    /// Agent to trigger.
    pub agent: String,
    /// Prompt template; `{{dot.path}}` placeholders are substituted from
    /// the payload.
    pub prompt: String,
    /// Dot-path whose value becomes the conversation key (session
    /// continuity per external object, e.g. `data.id`).
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen: String,
    #[serde(default)]
    pub providers: HashMap<String, WebhookProviderConfig>,
    #[serde(default)]
    pub routes: Vec<WebhookRouteConfig>,
    /// How long delivery ids are remembered for idempotency.
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_listen_addr(),
            providers: HashMap::new(),
            routes: Vec::new(),
            idempotency_ttl: default_idempotency_ttl(),
        }
    }
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Poll interval of the scheduler loop.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,
    /// Concurrent jobs allowed per agent. Chat-triggered agents on a
    /// shared connector should stay at 1 to preserve per-channel ordering.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_agent: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            max_concurrent_per_agent: default_max_concurrent(),
        }
    }
}

// ─── Resolution helpers ───────────────────────────────────────────────────────

impl FleetConfig {
    /// Absolute state directory, with `~` expanded and the default applied.
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(raw) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("drover"),
        }
    }
}

impl AgentConfig {
    /// Expanded absolute working directory.
    pub fn working_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.working_directory).into_owned())
    }

    /// Effective runtime type: per-agent override or the fleet default.
    pub fn runtime_type(&self, fleet: &RuntimeConfig) -> RuntimeType {
        self.runtime_type.unwrap_or(fleet.runtime_type)
    }
}

impl SystemPrompt {
    /// Flatten to the literal text sent to the runtime. Preset resolution
    /// happens at the runtime boundary; here presets render as
    /// `<preset>\n<append>` placeholders already resolved by the caller.
    pub fn render(&self, presets: &HashMap<String, String>) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Preset { preset, append } => {
                let base = presets.get(preset).cloned().unwrap_or_default();
                match append {
                    Some(extra) => format!("{base}\n\n{extra}"),
                    None => base,
                }
            }
        }
    }
}
