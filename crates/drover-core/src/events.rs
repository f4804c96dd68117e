// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use drover_state::JobStatus;

/// Events the fleet manager publishes on its broadcast bus.
/// Observers (CLI, tests, future UIs) subscribe; the fleet never blocks on
/// slow consumers.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    JobQueued {
        job_id: String,
        agent_name: String,
    },
    JobStarted {
        job_id: String,
        agent_name: String,
    },
    JobCompleted {
        job_id: String,
        agent_name: String,
        status: JobStatus,
    },
    JobFailed {
        job_id: String,
        agent_name: String,
        error: String,
    },
    /// A chunk of assistant output streamed from a running job.
    JobOutput {
        job_id: String,
        agent_name: String,
        text: String,
    },
    ChatMessageHandled {
        agent_name: String,
        channel_id: String,
    },
    ChatMessageError {
        agent_name: String,
        channel_id: String,
        error: String,
    },
    SessionLifecycle {
        agent_name: String,
        conversation_key: String,
        event: drover_channels::SessionLifecycle,
    },
    ContextHandoffStart {
        job_id: String,
        agent_name: String,
        input_tokens: u64,
    },
    ContextHandoffComplete {
        job_id: String,
        agent_name: String,
        new_session_id: Option<String>,
    },
    WebhookReceived {
        route_name: String,
        agent_name: String,
    },
    WorkSourceClaimFailed {
        work_id: String,
        reason: String,
    },
}
