// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Fleet manager: the single entry point that owns every subsystem.
//!
//! `initialise` validates config, builds the stores and runtime, and runs
//! startup cleanup. `start` brings up the scheduler, chat connectors, and
//! the webhook server; `stop` drains in-flight jobs within the grace
//! period and persists state. Every trigger path (scheduler tick, chat
//! message, webhook delivery, manual CLI call) funnels into
//! [`FleetManager::trigger`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use drover_channels::{
    ChannelHandle, ChatEventHandler, ChatManager, ChatMessageEvent, ChatTransport, Routing,
    SessionLifecycle, StreamingResponder,
};
use drover_config::{AgentConfig, FleetConfig, ScheduleConfig};
use drover_runtime::{RuntimeAdapter, RuntimeRegistry, SubprocessRuntime};
use drover_state::{
    ConversationKeyStore, ConversationRecord, JobRecordStore, ScheduleStateStore, SessionStore,
    TriggerSource,
};
use drover_webhook::{IdempotencySet, WebhookDispatcher, WebhookState, WebhookTrigger};
use drover_worksource::WorkItem;

use crate::{
    executor::{ExecuteOptions, JobExecutor, RunnerResult},
    prune_orphan_worktrees,
    scheduler::{FireOutcome, ScheduleTrigger, Scheduler},
    workspace, ChatNotifier, FleetEvent, HookPipeline,
};

// ─── Trigger options ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct TriggerOptions {
    /// Prompt override; falls back to the schedule's static prompt.
    pub prompt: Option<String>,
    pub resume_session_id: Option<String>,
    pub schedule_name: Option<String>,
    pub trigger_source: Option<TriggerSource>,
    pub work_item: Option<WorkItem>,
    pub bypass_concurrency_limit: bool,
    /// Consult the agent-level session store for resumption.
    pub use_agent_session: bool,
    pub channel: Option<ChannelHandle>,
    pub on_message: Option<mpsc::Sender<String>>,
}

/// RAII decrement of the per-agent running counter.
struct RunningGuard {
    counts: Arc<StdMutex<HashMap<String, u32>>>,
    agent: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(n) = counts.get_mut(&self.agent) {
            *n = n.saturating_sub(1);
        }
    }
}

// ─── Fleet manager ────────────────────────────────────────────────────────────

impl std::fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetManager")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

pub struct FleetManager {
    config: Arc<FleetConfig>,
    agents: HashMap<String, Arc<AgentConfig>>,
    state_root: PathBuf,
    jobs: Arc<JobRecordStore>,
    sessions: Arc<SessionStore>,
    conversations: Arc<ConversationKeyStore>,
    schedule_state: Arc<ScheduleStateStore>,
    runtime: Arc<dyn RuntimeAdapter>,
    hooks: Arc<HookPipeline>,
    idempotency: Arc<IdempotencySet>,
    events: broadcast::Sender<FleetEvent>,
    running: Arc<StdMutex<HashMap<String, u32>>>,
    shutdown_tx: watch::Sender<bool>,
    chat_transports: StdMutex<Vec<Arc<dyn ChatTransport>>>,
    per_agent_transports: StdMutex<Vec<(String, Arc<dyn ChatTransport>)>>,
    chat_managers: StdMutex<Vec<Arc<ChatManager>>>,
    background_tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl FleetManager {
    /// Validate config and build the fleet with the configured runtime:
    /// the subprocess adapter driving the agent CLI, unless
    /// `runtime.type: in_process` names an embedded adapter.
    pub async fn initialise(config: FleetConfig) -> anyhow::Result<Arc<Self>> {
        Self::initialise_with_registry(config, &RuntimeRegistry::new()).await
    }

    /// Resolve an `in_process` runtime from `registry` by the configured
    /// adapter name; `subprocess` runtimes are built from config directly.
    pub async fn initialise_with_registry(
        config: FleetConfig,
        registry: &RuntimeRegistry,
    ) -> anyhow::Result<Arc<Self>> {
        let runtime: Arc<dyn RuntimeAdapter> = match config.runtime.runtime_type {
            drover_config::RuntimeType::Subprocess => Arc::new(SubprocessRuntime::new(
                config.runtime.command.clone(),
                config.runtime.args.clone(),
                config.runtime.env.clone(),
            )),
            drover_config::RuntimeType::InProcess => {
                let name = config
                    .runtime
                    .adapter
                    .as_deref()
                    .context("runtime.adapter is required for runtime.type: in_process")?;
                registry
                    .get(name)
                    .with_context(|| format!("no runtime adapter '{name}' is registered"))?
            }
        };
        Self::initialise_with_runtime(config, runtime).await
    }

    /// Like [`initialise`] but with an injected runtime adapter (embedded
    /// backends, tests).
    pub async fn initialise_with_runtime(
        config: FleetConfig,
        runtime: Arc<dyn RuntimeAdapter>,
    ) -> anyhow::Result<Arc<Self>> {
        if let Err(errors) = config.validate() {
            let rendered = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n  ");
            anyhow::bail!("configuration invalid:\n  {rendered}");
        }

        let state_root = config.state_dir();
        std::fs::create_dir_all(&state_root)
            .with_context(|| format!("creating state directory {}", state_root.display()))?;

        let agents: HashMap<String, Arc<AgentConfig>> = config
            .agents
            .iter()
            .map(|(name, agent)| (name.clone(), Arc::new(agent.clone())))
            .collect();

        let idempotency_ttl = humantime::parse_duration(&config.webhook.idempotency_ttl)
            .unwrap_or(Duration::from_secs(24 * 3600));
        let idempotency = Arc::new(IdempotencySet::load(
            &state_root.join("webhooks/idempotency.json"),
            idempotency_ttl,
        ));

        let (events, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);

        let fleet = Arc::new(Self {
            jobs: Arc::new(JobRecordStore::new(&state_root)),
            sessions: Arc::new(SessionStore::new(&state_root)),
            conversations: Arc::new(ConversationKeyStore::new(&state_root)),
            schedule_state: Arc::new(ScheduleStateStore::new(&state_root)),
            runtime,
            hooks: Arc::new(HookPipeline::new()),
            idempotency,
            events,
            running: Arc::new(StdMutex::new(HashMap::new())),
            shutdown_tx,
            chat_transports: StdMutex::new(Vec::new()),
            per_agent_transports: StdMutex::new(Vec::new()),
            chat_managers: StdMutex::new(Vec::new()),
            background_tasks: StdMutex::new(Vec::new()),
            state_root,
            agents,
            config: Arc::new(config),
        });
        fleet.startup_cleanup().await;
        Ok(fleet)
    }

    /// Expired conversation keys and orphan worktrees are cleared before
    /// anything can trigger.
    async fn startup_cleanup(&self) {
        let chat_ttl = humantime::parse_duration(&self.config.chat.session_ttl)
            .unwrap_or(Duration::from_secs(24 * 3600));
        let issue_ttl = humantime::parse_duration(&self.config.chat.issue_session_ttl)
            .unwrap_or(Duration::from_secs(168 * 3600));
        let now = Utc::now();
        for platform in self.conversations.platforms() {
            let ttl = if self.config.chat.platforms.contains_key(&platform) {
                chat_ttl
            } else {
                // Webhook/issue-tracker namespaces: issues live longer.
                issue_ttl
            };
            for agent in self.conversations.agents_for(&platform) {
                match self
                    .conversations
                    .cleanup_expired(&platform, &agent, now, ttl)
                {
                    Ok(0) => {}
                    Ok(n) => info!(platform = %platform, agent = %agent, removed = n, "expired conversations cleared"),
                    Err(e) => warn!(platform = %platform, agent = %agent, error = %e, "conversation cleanup failed"),
                }
            }
        }

        let live = self.jobs.non_terminal_ids();
        for (name, agent) in &self.agents {
            if agent.workspace_strategy == drover_config::WorkspaceStrategyKind::GitWorktree {
                let removed = prune_orphan_worktrees(agent, &live).await;
                if removed > 0 {
                    info!(agent = %name, removed, "orphan worktrees pruned");
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub fn jobs(&self) -> &Arc<JobRecordStore> {
        &self.jobs
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schedule_state(&self) -> &Arc<ScheduleStateStore> {
        &self.schedule_state
    }

    fn running_count(&self, agent: &str) -> u32 {
        *self.running.lock().unwrap().get(agent).unwrap_or(&0)
    }

    fn total_running(&self) -> u32 {
        self.running.lock().unwrap().values().sum()
    }

    /// Register the shared connector transport for a configured platform.
    pub fn register_chat_transport(&self, transport: Arc<dyn ChatTransport>) {
        self.chat_transports.lock().unwrap().push(transport);
    }

    /// Register a per-agent connector transport (the platform's mode must
    /// be `per_agent`).
    pub fn register_agent_transport(
        &self,
        agent_name: impl Into<String>,
        transport: Arc<dyn ChatTransport>,
    ) {
        self.per_agent_transports
            .lock()
            .unwrap()
            .push((agent_name.into(), transport));
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        // Scheduler, restarted with backoff if it ever panics.
        let scheduler = Arc::new(Scheduler::new(
            self.config.scheduler.clone(),
            self.agents.clone(),
            self.schedule_state.clone(),
            self.clone() as Arc<dyn ScheduleTrigger>,
            self.events.clone(),
        ));
        let shutdown_rx = self.shutdown_tx.subscribe();
        let task = supervise("scheduler", shutdown_rx.clone(), move || {
            let scheduler = scheduler.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move { scheduler.run(shutdown_rx).await }
        });
        self.background_tasks.lock().unwrap().push(task);

        // Chat connectors.
        let handler = self.clone() as Arc<dyn ChatEventHandler>;
        let shared: Vec<Arc<dyn ChatTransport>> =
            self.chat_transports.lock().unwrap().clone();
        for transport in shared {
            let platform = transport.platform().to_string();
            let Some(platform_config) = self.config.chat.platforms.get(&platform) else {
                warn!(platform = %platform, "transport registered for unconfigured platform, skipping");
                continue;
            };
            let routing = Routing::shared_from_config(&platform, &self.config);
            let manager = Arc::new(ChatManager::new(
                transport,
                routing,
                handler.clone(),
                platform_config.command_prefix.clone(),
            ));
            manager.start().await?;
            self.chat_managers.lock().unwrap().push(manager);
        }
        let per_agent: Vec<(String, Arc<dyn ChatTransport>)> =
            self.per_agent_transports.lock().unwrap().clone();
        for (agent_name, transport) in per_agent {
            let Some(agent) = self.agents.get(&agent_name) else {
                warn!(agent = %agent_name, "transport registered for unknown agent, skipping");
                continue;
            };
            let platform = transport.platform().to_string();
            let prefix = self
                .config
                .chat
                .platforms
                .get(&platform)
                .map(|p| p.command_prefix.clone())
                .unwrap_or_else(|| "!".to_string());
            let chat = agent.chat.clone().unwrap_or_default();
            let manager = Arc::new(ChatManager::new(
                transport,
                Routing::PerAgent {
                    route: drover_channels::AgentRoute {
                        agent_name: agent_name.clone(),
                        require_mention: chat.require_mention,
                        channels: chat.channels.clone(),
                    },
                },
                handler.clone(),
                prefix,
            ));
            manager.start().await?;
            self.chat_managers.lock().unwrap().push(manager);
        }

        // Webhook server.
        if self.config.webhook.enabled {
            let state = WebhookState::from_config(
                &self.config.webhook,
                self.idempotency.clone(),
                self.clone() as Arc<dyn WebhookDispatcher>,
            )?;
            let (_addr, task) = drover_webhook::serve(&self.config.webhook.listen, state).await?;
            self.background_tasks.lock().unwrap().push(task);
        }

        info!(agents = self.agents.len(), "fleet started");
        Ok(())
    }

    /// Stop everything: signal shutdown, drain in-flight jobs within the
    /// grace period (they cancel after it), close connectors, persist
    /// webhook idempotency state.
    pub async fn stop(&self) {
        let grace = humantime::parse_duration(&self.config.shutdown_grace)
            .unwrap_or(Duration::from_secs(30));
        info!(grace = ?grace, "fleet stopping");

        let deadline = tokio::time::Instant::now() + grace;
        while self.total_running() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // Anything still running gets the cancellation signal.
        let _ = self.shutdown_tx.send(true);
        while self.total_running() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let managers: Vec<Arc<ChatManager>> =
            self.chat_managers.lock().unwrap().drain(..).collect();
        for manager in managers {
            manager.stop().await;
        }
        for task in self.background_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Err(e) = self
            .idempotency
            .save(&self.state_root.join("webhooks/idempotency.json"))
        {
            warn!(error = %e, "persisting webhook idempotency set failed");
        }
        info!("fleet stopped");
    }

    // ── Triggering ───────────────────────────────────────────────────────

    /// Run one job for an agent. This is the only path that executes jobs.
    pub async fn trigger(
        &self,
        agent_name: &str,
        opts: TriggerOptions,
    ) -> anyhow::Result<RunnerResult> {
        let agent = self
            .agents
            .get(agent_name)
            .with_context(|| format!("unknown agent '{agent_name}'"))?
            .clone();

        let schedule = opts
            .schedule_name
            .as_deref()
            .and_then(|name| agent.schedules.get(name));
        let prompt = opts
            .prompt
            .clone()
            .or_else(|| schedule.and_then(|s| s.prompt.clone()))
            .or_else(|| opts.work_item.as_ref().map(work_item_prompt))
            .context("no prompt: neither the trigger nor the schedule provides one")?;

        if !opts.bypass_concurrency_limit {
            let limit = self.config.scheduler.max_concurrent_per_agent;
            let mut counts = self.running.lock().unwrap();
            let count = counts.entry(agent_name.to_string()).or_insert(0);
            if *count >= limit {
                anyhow::bail!("agent '{agent_name}' is at its concurrency limit ({limit})");
            }
            *count += 1;
        } else {
            *self
                .running
                .lock()
                .unwrap()
                .entry(agent_name.to_string())
                .or_insert(0) += 1;
        }
        let _guard = RunningGuard {
            counts: self.running.clone(),
            agent: agent_name.to_string(),
        };

        let workspace = workspace::for_kind(agent.workspace_strategy);
        let executor = JobExecutor::new(
            self.runtime.clone(),
            self.jobs.clone(),
            self.sessions.clone(),
            self.hooks.clone(),
            workspace,
            self.events.clone(),
        );

        let mut exec_opts = ExecuteOptions::new(
            agent_name,
            agent,
            prompt,
            opts.trigger_source.unwrap_or(TriggerSource::Manual),
        );
        exec_opts.schedule_name = opts.schedule_name;
        exec_opts.resume_session_id = opts.resume_session_id;
        exec_opts.use_agent_session = opts.use_agent_session;
        exec_opts.channel = opts.channel;
        exec_opts.notifier = Some(self.notifier());
        exec_opts.work_item = opts.work_item;
        exec_opts.on_message = opts.on_message;
        exec_opts.shutdown = Some(self.shutdown_tx.subscribe());

        executor.execute(exec_opts).await
    }

    /// Posting capability for `chat_post` hooks: tries each registered
    /// transport until one delivers.
    fn notifier(&self) -> Arc<dyn ChatNotifier> {
        let mut transports: Vec<Arc<dyn ChatTransport>> =
            self.chat_transports.lock().unwrap().clone();
        transports.extend(
            self.per_agent_transports
                .lock()
                .unwrap()
                .iter()
                .map(|(_, t)| t.clone()),
        );
        Arc::new(FleetNotifier { transports })
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }

    fn chat_session_ttl(&self) -> Duration {
        humantime::parse_duration(&self.config.chat.session_ttl)
            .unwrap_or(Duration::from_secs(24 * 3600))
    }

    fn issue_session_ttl(&self) -> Duration {
        humantime::parse_duration(&self.config.chat.issue_session_ttl)
            .unwrap_or(Duration::from_secs(168 * 3600))
    }

    /// Look up a conversation key, expiring it when idle past its TTL.
    fn resolve_conversation(
        &self,
        platform: &str,
        agent_name: &str,
        key: &str,
        ttl: Duration,
    ) -> Option<ConversationRecord> {
        let record = self.conversations.get(platform, agent_name, key)?;
        let expired = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| record.last_activity_at.checked_add_signed(ttl))
            .is_some_and(|expiry| expiry < Utc::now());
        if expired {
            let _ = self.conversations.clear(platform, agent_name, key);
            self.emit(FleetEvent::SessionLifecycle {
                agent_name: agent_name.to_string(),
                conversation_key: key.to_string(),
                event: SessionLifecycle::Expired,
            });
            return None;
        }
        Some(record)
    }

    fn persist_conversation(
        &self,
        platform: &str,
        agent_name: &str,
        key: &str,
        session_id: &str,
        resumed: bool,
    ) {
        if let Err(e) = self.conversations.put(
            platform,
            agent_name,
            key,
            ConversationRecord::new(session_id),
        ) {
            warn!(agent = %agent_name, error = %e, "persisting conversation key failed");
        }
        self.emit(FleetEvent::SessionLifecycle {
            agent_name: agent_name.to_string(),
            conversation_key: key.to_string(),
            event: if resumed {
                SessionLifecycle::Resumed
            } else {
                SessionLifecycle::Created
            },
        });
    }
}

fn work_item_prompt(item: &WorkItem) -> String {
    format!(
        "Work on {} ({}).\n\n{}\n\n{}",
        item.id, item.title, item.description, item.url
    )
}

/// Run a supervisor task, restarting it with exponential backoff when it
/// panics. A clean return (shutdown) ends supervision.
fn supervise<F, Fut>(
    name: &'static str,
    shutdown: watch::Receiver<bool>,
    factory: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Duration::from_millis(500);
        loop {
            match tokio::spawn(factory()).await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    warn!(task = name, "supervised task panicked, restarting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
                Err(_) => return,
            }
            if *shutdown.borrow() {
                return;
            }
        }
    })
}

struct FleetNotifier {
    transports: Vec<Arc<dyn ChatTransport>>,
}

#[async_trait]
impl ChatNotifier for FleetNotifier {
    async fn post(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        let mut last_err = anyhow::anyhow!("no chat transports registered");
        for transport in &self.transports {
            match transport.send_message(channel_id, text).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

// ─── Chat handler ─────────────────────────────────────────────────────────────

#[async_trait]
impl ChatEventHandler for FleetManager {
    async fn handle_message(&self, event: ChatMessageEvent) -> anyhow::Result<()> {
        let platform = event.metadata.platform.clone();
        let channel_id = event.metadata.channel_id.clone();
        let agent_name = event.agent_name.clone();

        let platform_config = self
            .config
            .chat
            .platforms
            .get(&platform)
            .with_context(|| format!("unconfigured chat platform '{platform}'"))?;
        let max_buffer = platform_config.max_buffer_size;
        let interval = humantime::parse_duration(&platform_config.min_message_interval)
            .unwrap_or(Duration::from_secs(2));

        let existing =
            self.resolve_conversation(&platform, &agent_name, &channel_id, self.chat_session_ttl());
        let resume = existing.as_ref().map(|r| r.session_id.clone());
        let resumed = resume.is_some();

        // Stream assistant chunks into a paced responder while the job runs.
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let mut responder = StreamingResponder::new(event.channel.clone(), max_buffer, interval);
        let responder_task = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = responder.add_message_and_send(&chunk).await {
                    warn!(error = %e, "streaming chat response failed");
                }
            }
            if let Err(e) = responder.flush().await {
                warn!(error = %e, "flushing chat response failed");
            }
            responder
        });

        let _typing = event.channel.indicator();
        let result = self
            .trigger(
                &agent_name,
                TriggerOptions {
                    prompt: Some(event.prompt.clone()),
                    resume_session_id: resume,
                    trigger_source: Some(TriggerSource::Chat),
                    use_agent_session: false,
                    channel: Some(event.channel.clone()),
                    ..TriggerOptions::default()
                },
            )
            .await;
        let responder = responder_task
            .await
            .map_err(|e| anyhow::anyhow!("responder task panicked: {e}"))?;

        let result = result?;
        if result.success {
            if !responder.has_sent_messages() {
                let text = result
                    .summary
                    .clone()
                    .unwrap_or_else(|| "Done.".to_string());
                let _ = event.channel.reply(&text).await;
            }
            if let Some(session_id) = &result.session_id {
                self.persist_conversation(&platform, &agent_name, &channel_id, session_id, resumed);
            }
            self.emit(FleetEvent::ChatMessageHandled {
                agent_name,
                channel_id,
            });
            Ok(())
        } else {
            let error = result.error.clone().unwrap_or_else(|| "job failed".into());
            self.emit(FleetEvent::ChatMessageError {
                agent_name,
                channel_id,
                error: error.clone(),
            });
            anyhow::bail!("{error}")
        }
    }

    async fn clear_conversation(&self, platform: &str, agent: &str, channel_id: &str) -> bool {
        match self.conversations.clear(platform, agent, channel_id) {
            Ok(existed) => {
                self.emit(FleetEvent::SessionLifecycle {
                    agent_name: agent.to_string(),
                    conversation_key: channel_id.to_string(),
                    event: SessionLifecycle::Cleared,
                });
                existed
            }
            Err(e) => {
                warn!(agent = %agent, error = %e, "clearing conversation failed");
                false
            }
        }
    }

    async fn status_summary(&self) -> String {
        let running = self.total_running();
        let schedules: usize = self.agents.values().map(|a| a.schedules.len()).sum();
        format!(
            "{} agents · {} schedules · {} running job{}",
            self.agents.len(),
            schedules,
            running,
            if running == 1 { "" } else { "s" }
        )
    }
}

// ─── Issue-tracker dispatch ───────────────────────────────────────────────────

impl FleetManager {
    /// Route an inbound issue-tracker event to the first matching agent's
    /// filters and run it. The conversation key is the **issue id**, so
    /// continuity follows the issue across comments and state changes.
    ///
    /// Agents are consulted in name order (config maps carry no
    /// declaration order). Returns `None` when the event was suppressed
    /// or matched nobody.
    pub async fn dispatch_issue_event(
        &self,
        platform: &str,
        event: &drover_channels::IssueEvent,
        api_user_id: Option<&str>,
    ) -> anyhow::Result<Option<RunnerResult>> {
        let mut filtered: Vec<(String, drover_config::IssueFilterConfig)> = self
            .agents
            .iter()
            .filter_map(|(name, agent)| {
                agent.issues.clone().map(|filter| (name.clone(), filter))
            })
            .collect();
        filtered.sort_by(|a, b| a.0.cmp(&b.0));

        let agent_name = match drover_channels::route_issue(event, &filtered, api_user_id) {
            drover_channels::IssueRouting::Route { agent_name } => agent_name,
            drover_channels::IssueRouting::Ignore { reason } => {
                tracing::debug!(
                    issue = %event.issue.identifier,
                    reason = %reason,
                    "issue event ignored"
                );
                return Ok(None);
            }
        };

        let key = event.issue.id.clone();
        let resume = self
            .resolve_conversation(platform, &agent_name, &key, self.issue_session_ttl())
            .map(|r| r.session_id);
        let resumed = resume.is_some();

        let result = self
            .trigger(
                &agent_name,
                TriggerOptions {
                    prompt: Some(drover_channels::default_prompt(event)),
                    resume_session_id: resume,
                    trigger_source: Some(TriggerSource::Chat),
                    use_agent_session: false,
                    ..TriggerOptions::default()
                },
            )
            .await?;

        if let Some(session_id) = &result.session_id {
            if let Err(e) = self.conversations.put(
                platform,
                &agent_name,
                &key,
                ConversationRecord {
                    session_id: session_id.clone(),
                    last_activity_at: Utc::now(),
                    branch_name: None,
                    issue_identifier: Some(event.issue.identifier.clone()),
                },
            ) {
                warn!(agent = %agent_name, error = %e, "persisting issue conversation failed");
            }
            self.emit(FleetEvent::SessionLifecycle {
                agent_name: agent_name.clone(),
                conversation_key: key,
                event: if resumed {
                    SessionLifecycle::Resumed
                } else {
                    SessionLifecycle::Created
                },
            });
        }
        Ok(Some(result))
    }
}

// ─── Webhook dispatcher ───────────────────────────────────────────────────────

#[async_trait]
impl WebhookDispatcher for FleetManager {
    async fn dispatch(&self, trigger: WebhookTrigger) -> anyhow::Result<()> {
        self.emit(FleetEvent::WebhookReceived {
            route_name: trigger.route_name.clone(),
            agent_name: trigger.agent_name.clone(),
        });

        let resume = trigger.session_key.as_deref().and_then(|key| {
            self.resolve_conversation(
                &trigger.source,
                &trigger.agent_name,
                key,
                self.issue_session_ttl(),
            )
            .map(|r| r.session_id)
        });
        let resumed = resume.is_some();

        let result = self
            .trigger(
                &trigger.agent_name,
                TriggerOptions {
                    prompt: Some(trigger.prompt.clone()),
                    resume_session_id: resume,
                    trigger_source: Some(TriggerSource::Webhook),
                    use_agent_session: false,
                    ..TriggerOptions::default()
                },
            )
            .await?;

        if let (Some(key), Some(session_id)) = (&trigger.session_key, &result.session_id) {
            self.persist_conversation(
                &trigger.source,
                &trigger.agent_name,
                key,
                session_id,
                resumed,
            );
        }
        Ok(())
    }
}

// ─── Schedule trigger ─────────────────────────────────────────────────────────

#[async_trait]
impl ScheduleTrigger for FleetManager {
    async fn fire(
        &self,
        agent_name: &str,
        schedule_name: &str,
        schedule: &ScheduleConfig,
        work_item: Option<WorkItem>,
    ) -> anyhow::Result<FireOutcome> {
        let source = if work_item.is_some() {
            TriggerSource::WorkSource
        } else {
            TriggerSource::Scheduler
        };
        let result = self
            .trigger(
                agent_name,
                TriggerOptions {
                    schedule_name: Some(schedule_name.to_string()),
                    trigger_source: Some(source),
                    use_agent_session: schedule.resume_session,
                    work_item,
                    ..TriggerOptions::default()
                },
            )
            .await?;
        Ok(FireOutcome {
            job_success: result.success,
            summary: result.summary,
            error: result.error,
        })
    }

    fn running_jobs(&self, agent_name: &str) -> u32 {
        self.running_count(agent_name)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
