// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Job executor: drives one job from trigger to terminal status.
//!
//! The handoff loop is an explicit state machine over restartable runtime
//! streams:
//!
//! ```text
//! Processing → HandoffRequested → HandoffSubquery → Continuation → Processing
//! ```
//!
//! A handoff abandons the exhausted session, asks it (while still
//! resumable) for a summary document, and starts a fresh session whose
//! prompt carries that document plus the original task. The job id and the
//! working directory never change across handoffs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use drover_config::{AgentConfig, HookEvent, SessionMode};
use drover_runtime::{
    ExecuteRequest, MessageStream, ResultMessage, RuntimeAdapter, RuntimeMessage, SystemMessage,
};
use drover_state::{
    JobRecord, JobRecordStore, JobStatus, OutputEntry, OutputKind, RuntimeContext, SessionRecord,
    SessionStore, StatusPatch, TokenStats, TriggerSource,
};

use crate::{
    build_job_tools, context_threshold_payload, session_start_payload, after_run_payload,
    ChatNotifier, ContextTracker, FleetEvent, HookPipeline, JobToolContext, SessionInfo,
    WorkspaceStrategy, workspace::JobContext,
};

// ─── Options and result ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    WorkspaceSetup,
    RuntimeStream,
    MaxHandoffsExceeded,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct RunnerResult {
    pub success: bool,
    pub status: JobStatus,
    pub job_id: String,
    pub session_id: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub handoff_count: u32,
    pub duration_seconds: f64,
}

pub struct ExecuteOptions {
    pub agent_name: String,
    pub agent: Arc<AgentConfig>,
    pub prompt: String,
    pub trigger_source: TriggerSource,
    pub schedule_name: Option<String>,
    /// Explicit session to resume (conversation-key continuity). Takes
    /// precedence over the agent-level session store.
    pub resume_session_id: Option<String>,
    /// Consult the agent-level session store when no explicit resume id is
    /// given and the agent is in persistent mode.
    pub use_agent_session: bool,
    /// Originating chat channel, for job tools.
    pub channel: Option<drover_channels::ChannelHandle>,
    /// Posting capability for `chat_post` hooks.
    pub notifier: Option<Arc<dyn ChatNotifier>>,
    pub work_item: Option<drover_worksource::WorkItem>,
    /// Assistant text chunks stream here as they arrive (the fleet wires
    /// this to a streaming responder).
    pub on_message: Option<mpsc::Sender<String>>,
    /// Fleet shutdown / cancellation signal.
    pub shutdown: Option<watch::Receiver<bool>>,
    /// Wall-clock limit; overrides the agent's `job_timeout`.
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new(
        agent_name: impl Into<String>,
        agent: Arc<AgentConfig>,
        prompt: impl Into<String>,
        trigger_source: TriggerSource,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            agent,
            prompt: prompt.into(),
            trigger_source,
            schedule_name: None,
            resume_session_id: None,
            use_agent_session: true,
            channel: None,
            notifier: None,
            work_item: None,
            on_message: None,
            shutdown: None,
            timeout: None,
        }
    }
}

// ─── Executor ─────────────────────────────────────────────────────────────────

pub struct JobExecutor {
    runtime: Arc<dyn RuntimeAdapter>,
    jobs: Arc<JobRecordStore>,
    sessions: Arc<SessionStore>,
    hooks: Arc<HookPipeline>,
    workspace: Arc<dyn WorkspaceStrategy>,
    events: broadcast::Sender<FleetEvent>,
}

/// The handoff state machine's phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Consuming the current stream.
    Processing,
    /// Threshold crossed; a handoff must happen before more processing.
    HandoffRequested,
    /// Asking the exhausted session for its summary document.
    HandoffSubquery,
    /// Starting the fresh session with the continuation prompt.
    Continuation,
}

enum StreamStep {
    Message(anyhow::Result<RuntimeMessage>),
    Ended,
    Cancelled,
    TimedOut,
}

const HANDOFF_PROMPT: &str = "\
Your context window is nearly exhausted. Write a handoff document for the \
agent instance that will continue this work in a fresh session. Be \
information-dense: current task and its exact state, decisions made and \
why, files touched, commands run, open problems, and the precise next \
steps. Do not perform any new work.";

impl JobExecutor {
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        jobs: Arc<JobRecordStore>,
        sessions: Arc<SessionStore>,
        hooks: Arc<HookPipeline>,
        workspace: Arc<dyn WorkspaceStrategy>,
        events: broadcast::Sender<FleetEvent>,
    ) -> Self {
        Self {
            runtime,
            jobs,
            sessions,
            hooks,
            workspace,
            events,
        }
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }

    /// Run one job to a terminal status. Domain failures come back inside
    /// the [`RunnerResult`]; only store-level breakage is an `Err`.
    pub async fn execute(&self, mut opts: ExecuteOptions) -> anyhow::Result<RunnerResult> {
        let started = Instant::now();
        let job_id = format!("job-{}", uuid::Uuid::new_v4());
        let agent = opts.agent.clone();
        // Taken out of `opts` up front so polling it does not conflict
        // with the request builder borrowing the rest of the options.
        let mut shutdown = opts.shutdown.take();

        let mut record = JobRecord::new(&job_id, &opts.agent_name, opts.trigger_source, &opts.prompt);
        record.schedule_name = opts.schedule_name.clone();
        record.resume_session_id = opts.resume_session_id.clone();
        self.jobs.create(&record)?;
        self.emit(FleetEvent::JobQueued {
            job_id: job_id.clone(),
            agent_name: opts.agent_name.clone(),
        });

        // ── Workspace setup ──────────────────────────────────────────────
        let job_ctx = JobContext {
            job_id: job_id.clone(),
            agent_name: opts.agent_name.clone(),
            schedule_name: opts.schedule_name.clone(),
            work_item_id: opts.work_item.as_ref().map(|w| w.id.clone()),
            work_item_title: opts.work_item.as_ref().map(|w| w.title.clone()),
        };
        let setup = match self.workspace.setup(&agent, &job_ctx).await {
            Ok(setup) => setup,
            Err(e) => {
                // Abort before any output is recorded.
                let error = format!("workspace setup failed: {e}");
                self.jobs.update_status(
                    &job_id,
                    JobStatus::Failed,
                    StatusPatch {
                        error: Some(error.clone()),
                        ..StatusPatch::default()
                    },
                )?;
                self.emit(FleetEvent::JobFailed {
                    job_id: job_id.clone(),
                    agent_name: opts.agent_name.clone(),
                    error: error.clone(),
                });
                return Ok(RunnerResult {
                    success: false,
                    status: JobStatus::Failed,
                    job_id,
                    session_id: None,
                    summary: None,
                    error: Some(error),
                    failure: Some(FailureKind::WorkspaceSetup),
                    handoff_count: 0,
                    duration_seconds: started.elapsed().as_secs_f64(),
                });
            }
        };
        let working_directory = setup.working_directory.clone();
        let runtime_context = RuntimeContext::new(self.runtime.name());

        let mut env: HashMap<String, String> = agent.env.clone();
        env.extend(setup.env.clone());

        // ── Session resolution ───────────────────────────────────────────
        let resume_session_id = match &opts.resume_session_id {
            Some(explicit) => Some(explicit.clone()),
            None if opts.use_agent_session && agent.session_mode == SessionMode::Persistent => {
                self.validated_agent_session(&opts.agent_name, &working_directory, &runtime_context)
            }
            None => None,
        };

        let tools = build_job_tools(&JobToolContext {
            job_id: job_id.clone(),
            agent_name: opts.agent_name.clone(),
            working_directory: working_directory.clone(),
            channel: opts.channel.clone(),
        });

        let request = |prompt: String, resume: Option<String>| ExecuteRequest {
            agent_name: opts.agent_name.clone(),
            prompt,
            model: agent.model.clone(),
            system_prompt: agent
                .system_prompt
                .as_ref()
                .map(|p| p.render(&HashMap::new())),
            permission_mode: permission_mode_str(&agent).to_string(),
            allowed_tools: agent.allowed_tools.clone(),
            denied_tools: agent.denied_tools.clone(),
            max_turns: agent.max_turns,
            working_directory: working_directory.clone(),
            env: env.clone(),
            mcp_servers: agent.mcp_servers.clone(),
            resume_session_id: resume,
            tools: tools.clone(),
        };

        let deadline = opts
            .timeout
            .or_else(|| {
                agent
                    .job_timeout
                    .as_deref()
                    .and_then(|t| humantime::parse_duration(t).ok())
            })
            .map(|d| started + d);

        let mut stream = match self
            .runtime
            .execute(request(opts.prompt.clone(), resume_session_id.clone()))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                return self
                    .fail_job(
                        &job_id,
                        &opts,
                        &setup,
                        FailureKind::RuntimeStream,
                        format!("runtime stream failed: {e}"),
                        started,
                        0,
                    )
                    .await;
            }
        };

        self.jobs
            .update_status(&job_id, JobStatus::Running, StatusPatch::default())?;
        self.emit(FleetEvent::JobStarted {
            job_id: job_id.clone(),
            agent_name: opts.agent_name.clone(),
        });

        // ── The handoff loop ─────────────────────────────────────────────
        let session_info = |session_id: &Option<String>| SessionInfo {
            session_id: session_id.clone(),
            agent_name: opts.agent_name.clone(),
            job_id: job_id.clone(),
            working_directory: working_directory.display().to_string(),
            worktree_path: setup
                .branch_name
                .is_some()
                .then(|| working_directory.display().to_string()),
            branch_name: setup.branch_name.clone(),
        };

        let mut tracker = ContextTracker::new(agent.context_threshold);
        let mut phase = Phase::Processing;
        let mut session_id: Option<String> = resume_session_id.clone();
        let mut previous_session_id: Option<String> = None;
        let mut handoffs: u32 = 0;
        let mut max_input_tokens: u64 = 0;
        let mut last_output_tokens: u64 = 0;
        let mut max_handoffs_exceeded = false;
        let mut pending_session_context: Option<String> = None;
        let mut terminal: Option<ResultMessage> = None;
        let mut stream_error: Option<String> = None;
        let mut outcome_kind: Option<FailureKind> = None;

        'outer: loop {
            debug_assert_eq!(phase, Phase::Processing);
            loop {
                match next_step(&mut stream, shutdown.as_mut(), deadline).await {
                    StreamStep::Cancelled => {
                        outcome_kind = Some(FailureKind::Cancelled);
                        break 'outer;
                    }
                    StreamStep::TimedOut => {
                        outcome_kind = Some(FailureKind::TimedOut);
                        break 'outer;
                    }
                    StreamStep::Ended => break 'outer,
                    StreamStep::Message(Err(e)) => {
                        stream_error = Some(e.to_string());
                        outcome_kind = Some(FailureKind::RuntimeStream);
                        break 'outer;
                    }
                    StreamStep::Message(Ok(msg)) => {
                        self.jobs.append_output(&job_id, &project(&msg))?;
                        tracker.observe(&msg);
                        max_input_tokens = max_input_tokens.max(tracker.last_input_tokens());

                        match &msg {
                            RuntimeMessage::System(SystemMessage::Init { session_id: new_id, .. }) => {
                                let is_continuation = handoffs > 0;
                                if is_continuation {
                                    self.emit(FleetEvent::ContextHandoffComplete {
                                        job_id: job_id.clone(),
                                        agent_name: opts.agent_name.clone(),
                                        new_session_id: Some(new_id.clone()),
                                    });
                                }
                                session_id = Some(new_id.clone());
                                self.jobs.update_status(
                                    &job_id,
                                    JobStatus::Running,
                                    StatusPatch {
                                        session_id: Some(new_id.clone()),
                                        ..StatusPatch::default()
                                    },
                                )?;
                                let payload = session_start_payload(
                                    &session_info(&session_id),
                                    is_continuation,
                                    previous_session_id.as_deref(),
                                    handoffs,
                                    &opts.prompt,
                                );
                                let outcomes = self
                                    .hooks
                                    .run_slot(
                                        &agent.hooks.on_session_start,
                                        HookEvent::SessionStart,
                                        &payload,
                                        &working_directory,
                                        &env,
                                        opts.notifier.as_ref(),
                                    )
                                    .await;
                                let captured = collect_shell_stdout(&outcomes);
                                if !captured.is_empty() {
                                    pending_session_context = Some(captured);
                                }
                            }
                            RuntimeMessage::Assistant { text, usage } => {
                                last_output_tokens = usage.output_tokens;
                                if let Some(tx) = &opts.on_message {
                                    let _ = tx.send(text.clone()).await;
                                }
                                self.emit(FleetEvent::JobOutput {
                                    job_id: job_id.clone(),
                                    agent_name: opts.agent_name.clone(),
                                    text: text.clone(),
                                });
                            }
                            RuntimeMessage::Result(result) => {
                                terminal = Some(result.clone());
                                break 'outer;
                            }
                            _ => {}
                        }

                        if tracker.should_handoff() {
                            if handoffs >= agent.max_handoffs {
                                warn!(job = %job_id, "context threshold crossed but max handoffs reached");
                                max_handoffs_exceeded = true;
                                continue;
                            }
                            phase = Phase::HandoffRequested;
                            break;
                        }
                    }
                }
            }

            // ── HandoffRequested ─────────────────────────────────────────
            debug_assert_eq!(phase, Phase::HandoffRequested);
            let input_tokens = tracker.last_input_tokens();
            let window = tracker.context_window_size().unwrap_or_default();
            self.emit(FleetEvent::ContextHandoffStart {
                job_id: job_id.clone(),
                agent_name: opts.agent_name.clone(),
                input_tokens,
            });
            self.jobs.append_output(
                &job_id,
                &OutputEntry::system(
                    "context_handoff",
                    serde_json::json!({
                        "input_tokens": input_tokens,
                        "context_window": window,
                        "handoff_number": handoffs + 1,
                    }),
                ),
            )?;
            info!(
                job = %job_id,
                input_tokens,
                window,
                handoff = handoffs + 1,
                "context threshold crossed, handing off"
            );

            // ── HandoffSubquery ──────────────────────────────────────────
            phase = Phase::HandoffSubquery;
            debug_assert_eq!(phase, Phase::HandoffSubquery);
            let handoff_doc = if !agent.hooks.on_context_threshold.is_empty() {
                // User hooks replace the built-in handoff; their stdout is
                // the continuation context.
                let payload = context_threshold_payload(
                    &session_info(&session_id),
                    input_tokens,
                    window,
                    tracker.model_name(),
                    &opts.prompt,
                );
                let outcomes = self
                    .hooks
                    .run_slot(
                        &agent.hooks.on_context_threshold,
                        HookEvent::ContextThreshold,
                        &payload,
                        &working_directory,
                        &env,
                        opts.notifier.as_ref(),
                    )
                    .await;
                collect_shell_stdout(&outcomes)
            } else {
                match self
                    .run_handoff_subquery(&request, session_id.clone())
                    .await
                {
                    Ok(doc) => doc,
                    Err(e) => {
                        // Fall back to the original prompt alone; the
                        // handoff still counts and the document entry is
                        // recorded as an empty marker.
                        warn!(job = %job_id, error = %e, "handoff sub-query failed");
                        String::new()
                    }
                }
            };
            self.jobs.append_output(
                &job_id,
                &OutputEntry::system(
                    "handoff_document",
                    serde_json::json!({ "content": handoff_doc }),
                ),
            )?;

            // ── Continuation ─────────────────────────────────────────────
            phase = Phase::Continuation;
            debug_assert_eq!(phase, Phase::Continuation);
            handoffs += 1;
            tracker.reset();
            previous_session_id = session_id.take();
            let continuation = continuation_prompt(
                pending_session_context.take(),
                &handoff_doc,
                &opts.prompt,
            );
            stream = match self.runtime.execute(request(continuation, None)).await {
                Ok(stream) => stream,
                Err(e) => {
                    stream_error = Some(format!("continuation stream failed: {e}"));
                    outcome_kind = Some(FailureKind::RuntimeStream);
                    break 'outer;
                }
            };
            phase = Phase::Processing;
        }

        // ── Finalise ─────────────────────────────────────────────────────
        let (status, mut success, mut error) = match (&outcome_kind, &terminal) {
            (Some(FailureKind::Cancelled), _) => {
                (JobStatus::Cancelled, false, Some("cancelled".to_string()))
            }
            (Some(FailureKind::TimedOut), _) => {
                (JobStatus::TimedOut, false, Some("timed out".to_string()))
            }
            (Some(FailureKind::RuntimeStream), _) => (
                JobStatus::Failed,
                false,
                Some(
                    stream_error
                        .clone()
                        .unwrap_or_else(|| "runtime stream failed".to_string()),
                ),
            ),
            (None, Some(result)) if result.is_error => (
                JobStatus::Failed,
                false,
                result.result.clone().or(Some("runtime error".to_string())),
            ),
            (None, Some(_)) => (JobStatus::Completed, true, None),
            (None, None) => (
                JobStatus::Failed,
                false,
                Some("runtime stream ended without a result".to_string()),
            ),
            // WorkspaceSetup and MaxHandoffsExceeded are never stored in
            // `outcome_kind`; keep the match total anyway.
            (Some(_), _) => (
                JobStatus::Failed,
                false,
                error_text(&stream_error),
            ),
        };
        let mut failure = outcome_kind;
        if failure.is_none() && !success {
            failure = Some(FailureKind::RuntimeStream);
        }
        if max_handoffs_exceeded && success {
            // The job ran to completion but needed more handoffs than
            // allowed; report failure so the operator notices the
            // truncated context.
            success = false;
            failure = Some(FailureKind::MaxHandoffsExceeded);
            error = Some(format!(
                "exceeded max handoffs ({})",
                agent.max_handoffs
            ));
        }

        let summary = terminal.as_ref().and_then(|r| r.result.clone());
        if let Some(result) = &terminal {
            if let Some(usage) = result.usage {
                max_input_tokens = max_input_tokens.max(usage.input_tokens);
                last_output_tokens = usage.output_tokens;
            }
        }
        let tokens = TokenStats {
            cumulative_input: max_input_tokens,
            last_output: last_output_tokens,
            handoff_count: handoffs,
        };
        self.jobs.update_status(
            &job_id,
            status,
            StatusPatch {
                session_id: session_id.clone(),
                tokens: Some(tokens),
                summary: summary.clone(),
                error: error.clone(),
            },
        )?;

        // ── Session persistence ──────────────────────────────────────────
        if agent.session_mode == SessionMode::Persistent {
            match &session_id {
                Some(id) => {
                    let mut session_record = SessionRecord::new(
                        id.clone(),
                        opts.agent_name.clone(),
                        working_directory.clone(),
                        runtime_context.clone(),
                    );
                    if let Some(existing) = self.sessions.get(&opts.agent_name) {
                        if existing.session_id == *id {
                            session_record.created_at = existing.created_at;
                            session_record.job_count = existing.job_count + 1;
                        }
                    }
                    if let Err(e) = self.sessions.put(&opts.agent_name, session_record) {
                        warn!(agent = %opts.agent_name, error = %e, "persisting session failed");
                    }
                }
                None => {
                    // A handoff happened but no init followed: force a
                    // fresh session next job rather than resuming a ghost.
                    if handoffs > 0 {
                        self.sessions.clear(&opts.agent_name);
                    }
                }
            }
        }

        // ── after_run hooks ──────────────────────────────────────────────
        let hook_event = match status {
            JobStatus::Completed => HookEvent::Completed,
            JobStatus::TimedOut => HookEvent::Timeout,
            JobStatus::Cancelled => HookEvent::Cancelled,
            _ => HookEvent::Failed,
        };
        let payload = after_run_payload(
            hook_event,
            &session_info(&session_id),
            summary.as_deref(),
            error.as_deref(),
            started.elapsed().as_secs_f64(),
        );
        self.hooks
            .run_slot(
                &agent.hooks.after_run,
                hook_event,
                &payload,
                &working_directory,
                &env,
                opts.notifier.as_ref(),
            )
            .await;
        if !success {
            self.hooks
                .run_slot(
                    &agent.hooks.on_error,
                    hook_event,
                    &payload,
                    &working_directory,
                    &env,
                    opts.notifier.as_ref(),
                )
                .await;
        }

        // ── Workspace teardown ───────────────────────────────────────────
        if let Err(e) = self
            .workspace
            .teardown(&agent, &setup, success, summary.as_deref())
            .await
        {
            warn!(job = %job_id, error = %e, "workspace teardown failed");
        }

        match status {
            JobStatus::Completed => self.emit(FleetEvent::JobCompleted {
                job_id: job_id.clone(),
                agent_name: opts.agent_name.clone(),
                status,
            }),
            _ => self.emit(FleetEvent::JobFailed {
                job_id: job_id.clone(),
                agent_name: opts.agent_name.clone(),
                error: error.clone().unwrap_or_default(),
            }),
        }

        Ok(RunnerResult {
            success,
            status,
            job_id,
            session_id,
            summary,
            error,
            failure,
            handoff_count: handoffs,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Resolve the agent-level stored session, clearing it when it fails
    /// validation against the current request.
    fn validated_agent_session(
        &self,
        agent_name: &str,
        working_directory: &std::path::Path,
        runtime_context: &RuntimeContext,
    ) -> Option<String> {
        let record = self.sessions.get(agent_name)?;
        match record.is_reusable(working_directory, runtime_context, None, chrono::Utc::now()) {
            Ok(()) => Some(record.session_id),
            Err(reason) => {
                info!(agent = %agent_name, %reason, "stored session not reusable, starting fresh");
                self.sessions.clear(agent_name);
                None
            }
        }
    }

    /// Ask the exhausted session for its handoff document.
    async fn run_handoff_subquery(
        &self,
        request: &impl Fn(String, Option<String>) -> ExecuteRequest,
        resume: Option<String>,
    ) -> anyhow::Result<String> {
        let mut stream = self
            .runtime
            .execute(request(HANDOFF_PROMPT.to_string(), resume))
            .await?;
        let mut text = String::new();
        while let Some(msg) = stream.next().await {
            match msg? {
                RuntimeMessage::Assistant { text: chunk, .. } => text.push_str(&chunk),
                RuntimeMessage::Result(result) => {
                    if let Some(final_text) = result.result {
                        if !final_text.is_empty() {
                            text = final_text;
                        }
                    }
                    break;
                }
                _ => {}
            }
        }
        Ok(text)
    }

    /// Record a pre-stream failure (workspace came up but the runtime
    /// never produced a stream) and tear the workspace back down.
    #[allow(clippy::too_many_arguments)]
    async fn fail_job(
        &self,
        job_id: &str,
        opts: &ExecuteOptions,
        setup: &crate::SetupResult,
        kind: FailureKind,
        error: String,
        started: Instant,
        handoffs: u32,
    ) -> anyhow::Result<RunnerResult> {
        self.jobs.update_status(
            job_id,
            JobStatus::Failed,
            StatusPatch {
                error: Some(error.clone()),
                ..StatusPatch::default()
            },
        )?;
        if let Err(e) = self
            .workspace
            .teardown(&opts.agent, setup, false, None)
            .await
        {
            warn!(job = %job_id, error = %e, "workspace teardown failed");
        }
        self.emit(FleetEvent::JobFailed {
            job_id: job_id.to_string(),
            agent_name: opts.agent_name.clone(),
            error: error.clone(),
        });
        Ok(RunnerResult {
            success: false,
            status: JobStatus::Failed,
            job_id: job_id.to_string(),
            session_id: None,
            summary: None,
            error: Some(error),
            failure: Some(kind),
            handoff_count: handoffs,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn error_text(stream_error: &Option<String>) -> Option<String> {
    Some(
        stream_error
            .clone()
            .unwrap_or_else(|| "job failed".to_string()),
    )
}

fn permission_mode_str(agent: &AgentConfig) -> &'static str {
    use drover_config::PermissionMode::*;
    match agent.permission_mode {
        Default => "default",
        AcceptEdits => "accept_edits",
        Bypass => "bypass",
        Plan => "plan",
        Delegate => "delegate",
        DontAsk => "dont_ask",
    }
}

/// Concatenated stdout of successful shell hooks, trimmed.
fn collect_shell_stdout(outcomes: &[crate::HookOutcome]) -> String {
    outcomes
        .iter()
        .filter(|o| o.success && o.hook_type == drover_config::HookType::Shell)
        .filter_map(|o| o.output.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the continuation prompt. Externally supplied session context
/// (shell hook stdout) is prepended so it outranks the original prompt.
fn continuation_prompt(
    session_context: Option<String>,
    handoff_doc: &str,
    original_prompt: &str,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(ctx) = session_context {
        parts.push(ctx);
    }
    if !handoff_doc.trim().is_empty() {
        parts.push(format!(
            "## Handoff from the previous session\n\n{handoff_doc}"
        ));
    }
    parts.push(format!(
        "## Original task (continue where the handoff leaves off)\n\n{original_prompt}"
    ));
    parts.join("\n\n")
}

/// Project a runtime message into its output-log entry.
fn project(msg: &RuntimeMessage) -> OutputEntry {
    match msg {
        RuntimeMessage::System(SystemMessage::Init { session_id, model }) => OutputEntry::system(
            "init",
            serde_json::json!({ "session_id": session_id, "model": model }),
        ),
        RuntimeMessage::System(SystemMessage::CompactBoundary { compact_metadata }) => {
            OutputEntry::system(
                "compact_boundary",
                serde_json::json!({ "pre_tokens": compact_metadata.pre_tokens }),
            )
        }
        RuntimeMessage::System(SystemMessage::Status { status }) => {
            OutputEntry::system("status", serde_json::json!({ "status": status }))
        }
        RuntimeMessage::Assistant { text, usage } => OutputEntry::new(
            OutputKind::Assistant,
            serde_json::json!({ "text": text, "usage": usage }),
        ),
        RuntimeMessage::ToolUse { id, name, input } => OutputEntry::new(
            OutputKind::ToolUse,
            serde_json::json!({ "id": id, "name": name, "input": input }),
        ),
        RuntimeMessage::ToolResult { id, content, is_error } => OutputEntry::new(
            OutputKind::ToolResult,
            serde_json::json!({ "id": id, "content": content, "is_error": is_error }),
        ),
        RuntimeMessage::Result(result) => OutputEntry::new(
            OutputKind::Result,
            serde_json::to_value(result).unwrap_or_default(),
        ),
    }
}

/// Pull the next stream item, racing cancellation and the deadline.
async fn next_step(
    stream: &mut MessageStream,
    shutdown: Option<&mut watch::Receiver<bool>>,
    deadline: Option<Instant>,
) -> StreamStep {
    let cancelled = async {
        match shutdown {
            Some(rx) => {
                if *rx.borrow() {
                    return;
                }
                loop {
                    if rx.changed().await.is_err() {
                        futures::future::pending::<()>().await;
                    }
                    if *rx.borrow() {
                        return;
                    }
                }
            }
            None => futures::future::pending().await,
        }
    };
    let timed_out = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => futures::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancelled => StreamStep::Cancelled,
        _ = timed_out => StreamStep::TimedOut,
        item = stream.next() => match item {
            Some(msg) => StreamStep::Message(msg),
            None => StreamStep::Ended,
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use drover_runtime::ScriptedRuntime;
    use drover_state::OutputKind;

    use super::*;
    use crate::workspace::StaticStrategy;

    fn agent_yaml(dir: &std::path::Path, extra: &str) -> Arc<AgentConfig> {
        Arc::new(
            serde_yaml::from_str(&format!(
                "model: sonnet\nworking_directory: {}\n{extra}",
                dir.display()
            ))
            .unwrap(),
        )
    }

    struct Harness {
        _state_dir: tempfile::TempDir,
        work_dir: tempfile::TempDir,
        jobs: Arc<JobRecordStore>,
        sessions: Arc<SessionStore>,
        events: broadcast::Sender<FleetEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let state_dir = tempfile::tempdir().unwrap();
            let work_dir = tempfile::tempdir().unwrap();
            let jobs = Arc::new(JobRecordStore::new(state_dir.path()));
            let sessions = Arc::new(SessionStore::new(state_dir.path()));
            let (events, _) = broadcast::channel(1024);
            Self {
                _state_dir: state_dir,
                work_dir,
                jobs,
                sessions,
                events,
            }
        }

        fn executor(&self, runtime: Arc<dyn RuntimeAdapter>) -> JobExecutor {
            JobExecutor::new(
                runtime,
                self.jobs.clone(),
                self.sessions.clone(),
                Arc::new(HookPipeline::new()),
                Arc::new(StaticStrategy),
                self.events.clone(),
            )
        }

        fn opts(&self, agent: Arc<AgentConfig>, prompt: &str) -> ExecuteOptions {
            ExecuteOptions::new("coder", agent, prompt, TriggerSource::Manual)
        }
    }

    #[tokio::test]
    async fn completed_job_round_trip() {
        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "");
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedRuntime::session(
            "S1",
            "sonnet",
            &[("hello", 1_000)],
            "all done",
        )]));
        let executor = h.executor(runtime.clone());

        let result = executor.execute(h.opts(agent, "do it")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.session_id.as_deref(), Some("S1"));
        assert_eq!(result.summary.as_deref(), Some("all done"));
        assert_eq!(result.handoff_count, 0);

        let record = h.jobs.load(&result.job_id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.session_id.as_deref(), Some("S1"));
        assert_eq!(record.tokens.cumulative_input, 1_000);

        // Session persisted for the next job.
        let session = h.sessions.get("coder").unwrap();
        assert_eq!(session.session_id, "S1");
        assert_eq!(session.runtime_context.backend, "scripted");
    }

    #[tokio::test]
    async fn handoff_preserves_job_id_and_orders_log() {
        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "context_threshold: 0.10");
        // Session A blows through the threshold (92.5% of 200k used);
        // the handoff sub-query answers from session A; session B finishes.
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            vec![
                RuntimeMessage::init("A", "sonnet"),
                RuntimeMessage::assistant("deep in it", 185_000),
                RuntimeMessage::result_ok("never reached"),
            ],
            ScriptedRuntime::session("A-sub", "sonnet", &[("handoff doc text", 10_000)], ""),
            ScriptedRuntime::session("B", "sonnet", &[("fresh start", 12_000)], "finished"),
        ]));
        let executor = h.executor(runtime.clone());

        let result = executor.execute(h.opts(agent, "big task")).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.handoff_count, 1);
        assert_eq!(result.session_id.as_deref(), Some("B"));

        // Output log ordering: init A … context_handoff, handoff_document,
        // init B.
        let entries = h.jobs.read_output(&result.job_id).unwrap();
        let subtypes: Vec<String> = entries
            .iter()
            .filter(|e| e.kind == OutputKind::System)
            .filter_map(|e| e.subtype.clone())
            .collect();
        let init_a = subtypes.iter().position(|s| s == "init").unwrap();
        let ch = subtypes.iter().position(|s| s == "context_handoff").unwrap();
        let hd = subtypes.iter().position(|s| s == "handoff_document").unwrap();
        let init_b = subtypes.iter().rposition(|s| s == "init").unwrap();
        assert!(init_a < ch && ch < hd && hd < init_b);

        // The handoff document came from the sub-query.
        let doc = entries
            .iter()
            .find(|e| e.subtype.as_deref() == Some("handoff_document"))
            .unwrap();
        assert_eq!(doc.content["content"], "handoff doc text");

        // Sub-query resumed session A; continuation started fresh.
        let requests = runtime.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].resume_session_id.as_deref(), Some("A"));
        assert!(requests[1].prompt.contains("handoff document"));
        assert!(requests[2].resume_session_id.is_none());
        assert!(requests[2].prompt.contains("handoff doc text"));
        assert!(requests[2].prompt.contains("big task"));

        // All sessions ran in the same working directory.
        for req in requests.iter() {
            assert_eq!(req.working_directory, h.work_dir.path());
        }
    }

    #[tokio::test]
    async fn handoff_without_init_clears_stored_session() {
        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "context_threshold: 0.10");
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            vec![
                RuntimeMessage::init("A", "sonnet"),
                RuntimeMessage::assistant("x", 185_000),
            ],
            ScriptedRuntime::session("A-sub", "sonnet", &[], "doc"),
            // Continuation never inits: result only.
            vec![RuntimeMessage::result_ok("finished blind")],
        ]));
        let executor = h.executor(runtime);

        let result = executor.execute(h.opts(agent, "task")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.handoff_count, 1);
        assert!(result.session_id.is_none());
        assert!(
            h.sessions.get("coder").is_none(),
            "no init after handoff forces a fresh session next job"
        );
    }

    #[tokio::test]
    async fn threshold_hooks_replace_builtin_subquery() {
        let h = Harness::new();
        let agent = agent_yaml(
            h.work_dir.path(),
            concat!(
                "context_threshold: 0.10\n",
                "hooks:\n",
                "  on_context_threshold:\n",
                "    - type: shell\n",
                "      command: \"echo hook-provided context\"\n",
            ),
        );
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            vec![
                RuntimeMessage::init("A", "sonnet"),
                RuntimeMessage::assistant("x", 190_000),
            ],
            ScriptedRuntime::session("B", "sonnet", &[], "done"),
        ]));
        let executor = h.executor(runtime.clone());

        let result = executor.execute(h.opts(agent, "task")).await.unwrap();
        assert!(result.success);
        // Only two runtime calls: no built-in sub-query ran.
        assert_eq!(runtime.call_count(), 2);
        let requests = runtime.requests.lock().unwrap();
        assert!(requests[1].prompt.contains("hook-provided context"));
    }

    #[tokio::test]
    async fn max_handoffs_marks_job_unsuccessful() {
        let h = Harness::new();
        let agent = agent_yaml(
            h.work_dir.path(),
            "context_threshold: 0.10\nmax_handoffs: 1",
        );
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            vec![
                RuntimeMessage::init("A", "sonnet"),
                RuntimeMessage::assistant("x", 190_000),
            ],
            ScriptedRuntime::session("A-sub", "sonnet", &[], "doc"),
            // The continuation also blows the threshold, then completes.
            vec![
                RuntimeMessage::init("B", "sonnet"),
                RuntimeMessage::assistant("y", 191_000),
                RuntimeMessage::result_ok("limped home"),
            ],
        ]));
        let executor = h.executor(runtime);

        let result = executor.execute(h.opts(agent, "task")).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed, "the job itself completed");
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::MaxHandoffsExceeded));
        assert_eq!(result.handoff_count, 1);
    }

    #[tokio::test]
    async fn subquery_failure_falls_back_to_original_prompt() {
        struct FailSecond {
            inner: ScriptedRuntime,
            calls: std::sync::atomic::AtomicU32,
        }
        #[async_trait]
        impl RuntimeAdapter for FailSecond {
            fn name(&self) -> &str {
                "scripted"
            }
            async fn execute(&self, req: ExecuteRequest) -> anyhow::Result<MessageStream> {
                let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 1 {
                    anyhow::bail!("sub-query backend unavailable");
                }
                self.inner.execute(req).await
            }
        }

        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "context_threshold: 0.10");
        let runtime = Arc::new(FailSecond {
            inner: ScriptedRuntime::new(vec![
                vec![
                    RuntimeMessage::init("A", "sonnet"),
                    RuntimeMessage::assistant("x", 190_000),
                ],
                ScriptedRuntime::session("B", "sonnet", &[], "recovered"),
            ]),
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let executor = h.executor(runtime);

        let result = executor.execute(h.opts(agent, "the original task")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.handoff_count, 1, "handoff still counts");

        let entries = h.jobs.read_output(&result.job_id).unwrap();
        let doc = entries
            .iter()
            .find(|e| e.subtype.as_deref() == Some("handoff_document"))
            .expect("empty marker still recorded");
        assert_eq!(doc.content["content"], "");
    }

    #[tokio::test]
    async fn invalid_stored_session_is_cleared_and_ignored() {
        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "");
        // Stored session points at a different working directory.
        h.sessions
            .put(
                "coder",
                SessionRecord::new(
                    "stale",
                    "coder",
                    "/somewhere/else",
                    RuntimeContext::new("scripted"),
                ),
            )
            .unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedRuntime::session(
            "fresh",
            "sonnet",
            &[],
            "ok",
        )]));
        let executor = h.executor(runtime.clone());

        let result = executor.execute(h.opts(agent, "task")).await.unwrap();
        assert!(result.success);
        assert!(runtime.requests.lock().unwrap()[0]
            .resume_session_id
            .is_none());
        assert_eq!(h.sessions.get("coder").unwrap().session_id, "fresh");
    }

    #[tokio::test]
    async fn valid_stored_session_is_resumed() {
        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "");
        h.sessions
            .put(
                "coder",
                SessionRecord::new(
                    "S-old",
                    "coder",
                    h.work_dir.path(),
                    RuntimeContext::new("scripted"),
                ),
            )
            .unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedRuntime::session(
            "S-old",
            "sonnet",
            &[],
            "ok",
        )]));
        let executor = h.executor(runtime.clone());

        let result = executor.execute(h.opts(agent, "task")).await.unwrap();
        assert!(result.success);
        assert_eq!(
            runtime.requests.lock().unwrap()[0].resume_session_id.as_deref(),
            Some("S-old")
        );
        assert_eq!(h.sessions.get("coder").unwrap().job_count, 2);
    }

    #[tokio::test]
    async fn explicit_resume_overrides_agent_session() {
        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "");
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedRuntime::session(
            "S-conv",
            "sonnet",
            &[],
            "ok",
        )]));
        let executor = h.executor(runtime.clone());

        let mut opts = h.opts(agent, "task");
        opts.resume_session_id = Some("S-conv".into());
        executor.execute(opts).await.unwrap();
        assert_eq!(
            runtime.requests.lock().unwrap()[0].resume_session_id.as_deref(),
            Some("S-conv")
        );
    }

    #[tokio::test]
    async fn runtime_error_fails_the_job() {
        struct Broken;
        #[async_trait]
        impl RuntimeAdapter for Broken {
            fn name(&self) -> &str {
                "scripted"
            }
            async fn execute(&self, _req: ExecuteRequest) -> anyhow::Result<MessageStream> {
                anyhow::bail!("backend exploded")
            }
        }

        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "");
        let executor = h.executor(Arc::new(Broken));

        let result = executor.execute(h.opts(agent, "task")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::RuntimeStream));
        let record = h.jobs.load(&result.job_id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_records_cancelled_status() {
        struct Hanging;
        #[async_trait]
        impl RuntimeAdapter for Hanging {
            fn name(&self) -> &str {
                "scripted"
            }
            async fn execute(&self, _req: ExecuteRequest) -> anyhow::Result<MessageStream> {
                Ok(Box::pin(futures::stream::pending()))
            }
        }

        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "");
        let executor = h.executor(Arc::new(Hanging));

        let (tx, rx) = watch::channel(false);
        let mut opts = h.opts(agent, "task");
        opts.shutdown = Some(rx);
        let handle = tokio::spawn(async move { executor.execute(opts).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(
            h.jobs.load(&result.job_id).unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn timeout_records_timed_out_status() {
        struct Hanging;
        #[async_trait]
        impl RuntimeAdapter for Hanging {
            fn name(&self) -> &str {
                "scripted"
            }
            async fn execute(&self, _req: ExecuteRequest) -> anyhow::Result<MessageStream> {
                Ok(Box::pin(futures::stream::pending()))
            }
        }

        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "");
        let executor = h.executor(Arc::new(Hanging));

        let mut opts = h.opts(agent, "task");
        opts.timeout = Some(Duration::from_millis(50));
        let result = executor.execute(opts).await.unwrap();
        assert_eq!(result.status, JobStatus::TimedOut);
        assert_eq!(result.failure, Some(FailureKind::TimedOut));
    }

    #[tokio::test]
    async fn assistant_text_streams_to_on_message() {
        let h = Harness::new();
        let agent = agent_yaml(h.work_dir.path(), "");
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedRuntime::session(
            "S1",
            "sonnet",
            &[("chunk one. ", 100), ("chunk two.", 200)],
            "done",
        )]));
        let executor = h.executor(runtime);

        let (tx, mut rx) = mpsc::channel(16);
        let mut opts = h.opts(agent, "task");
        opts.on_message = Some(tx);
        executor.execute(opts).await.unwrap();

        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec!["chunk one. ", "chunk two."]);
    }

    #[tokio::test]
    async fn session_start_stdout_is_prepended_to_continuation() {
        let h = Harness::new();
        let agent = agent_yaml(
            h.work_dir.path(),
            concat!(
                "context_threshold: 0.10\n",
                "hooks:\n",
                "  on_session_start:\n",
                "    - type: shell\n",
                "      command: \"echo externally supplied context\"\n",
            ),
        );
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            vec![
                RuntimeMessage::init("A", "sonnet"),
                RuntimeMessage::assistant("x", 190_000),
            ],
            ScriptedRuntime::session("A-sub", "sonnet", &[], "the doc"),
            ScriptedRuntime::session("B", "sonnet", &[], "done"),
        ]));
        let executor = h.executor(runtime.clone());

        let result = executor.execute(h.opts(agent, "original")).await.unwrap();
        assert!(result.success);
        let requests = runtime.requests.lock().unwrap();
        let continuation = &requests[2].prompt;
        assert!(
            continuation.starts_with("externally supplied context"),
            "hook stdout must come first: {continuation:?}"
        );
        let doc_pos = continuation.find("the doc").unwrap();
        let orig_pos = continuation.find("original").unwrap();
        assert!(doc_pos < orig_pos);
    }

    #[test]
    fn continuation_prompt_composition() {
        let with_all = continuation_prompt(Some("ctx".into()), "doc", "task");
        assert!(with_all.starts_with("ctx"));
        assert!(with_all.contains("doc"));
        assert!(with_all.ends_with("task"));

        let doc_only = continuation_prompt(None, "", "task");
        assert!(!doc_only.contains("Handoff from"));
        assert!(doc_only.contains("task"));
    }
}
