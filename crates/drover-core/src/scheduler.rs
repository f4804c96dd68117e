// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Scheduler: the polling loop that decides when interval/cron schedules
//! fire.
//!
//! Webhook- and chat-typed schedules never fire from here; their
//! ingestors own them. Schedules that keep failing back off along a fixed
//! ladder and are disabled entirely after three consecutive errors; the
//! operator clears the persisted state file to re-arm them.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use drover_config::{AgentConfig, ScheduleConfig, ScheduleType, SchedulerConfig};
use drover_state::{ScheduleState, ScheduleStateStore};
use drover_worksource::{FetchOptions, WorkItem, WorkSource};

use crate::FleetEvent;

// ─── Fleet capability ─────────────────────────────────────────────────────────

/// How a fired job ended, for work-item completion.
#[derive(Debug, Clone)]
pub struct FireOutcome {
    pub job_success: bool,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// What the scheduler needs from the fleet.
#[async_trait]
pub trait ScheduleTrigger: Send + Sync {
    /// Run the schedule's agent once. `Ok` means a job ran to a terminal
    /// status (its outcome rides in the [`FireOutcome`]); `Err` means the
    /// job never ran and counts against the schedule.
    async fn fire(
        &self,
        agent_name: &str,
        schedule_name: &str,
        schedule: &ScheduleConfig,
        work_item: Option<WorkItem>,
    ) -> anyhow::Result<FireOutcome>;

    /// Jobs currently running for an agent (concurrency gate).
    fn running_jobs(&self, agent_name: &str) -> u32;
}

// ─── Due computation ──────────────────────────────────────────────────────────

/// Error backoff ladder: 30 s, 1 m, 5 m, 15 m, 60 m.
const ERROR_BACKOFF: [Duration; 5] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(900),
    Duration::from_secs(3600),
];

const MAX_CONSECUTIVE_ERRORS: u32 = 3;

pub fn error_backoff(consecutive_errors: u32) -> Duration {
    let idx = (consecutive_errors.saturating_sub(1) as usize).min(ERROR_BACKOFF.len() - 1);
    ERROR_BACKOFF[idx]
}

/// Next fire time for a schedule, from `after`.
pub fn compute_next_run(
    schedule: &ScheduleConfig,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule.schedule_type {
        ScheduleType::Interval => {
            let interval = humantime::parse_duration(schedule.interval.as_deref()?).ok()?;
            Some(after + chrono::Duration::from_std(interval).ok()?)
        }
        ScheduleType::Cron => {
            let expr = cron::Schedule::from_str(schedule.expression.as_deref()?).ok()?;
            expr.after(&after).next()
        }
        // Fired by ingestors, never due here.
        ScheduleType::Webhook | ScheduleType::Chat => None,
    }
}

/// The due predicate: enabled ∧ timer-typed ∧ not tripped ∧ next ≤ now.
pub fn is_due(schedule: &ScheduleConfig, state: &ScheduleState, now: DateTime<Utc>) -> bool {
    if !schedule.enabled || state.auto_disabled {
        return false;
    }
    if !matches!(
        schedule.schedule_type,
        ScheduleType::Interval | ScheduleType::Cron
    ) {
        return false;
    }
    match state.next_run_at {
        Some(next) => next <= now,
        // Never computed: due immediately (interval) or at the first cron
        // match, which the scheduler fills in on the first tick.
        None => schedule.schedule_type == ScheduleType::Interval,
    }
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

pub struct Scheduler {
    config: SchedulerConfig,
    agents: HashMap<String, Arc<AgentConfig>>,
    state: Arc<ScheduleStateStore>,
    trigger: Arc<dyn ScheduleTrigger>,
    events: tokio::sync::broadcast::Sender<FleetEvent>,
    /// Work sources built once per (agent, schedule) carrying one.
    sources: HashMap<(String, String), Arc<dyn WorkSource>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        agents: HashMap<String, Arc<AgentConfig>>,
        state: Arc<ScheduleStateStore>,
        trigger: Arc<dyn ScheduleTrigger>,
        events: tokio::sync::broadcast::Sender<FleetEvent>,
    ) -> Self {
        let mut sources: HashMap<(String, String), Arc<dyn WorkSource>> = HashMap::new();
        for (agent_name, agent) in &agents {
            for (schedule_name, schedule) in &agent.schedules {
                if let Some(ws_config) = &schedule.work_source {
                    match drover_worksource::from_config(ws_config) {
                        Ok(source) => {
                            sources
                                .insert((agent_name.clone(), schedule_name.clone()), source);
                        }
                        Err(e) => warn!(
                            agent = %agent_name,
                            schedule = %schedule_name,
                            error = %e,
                            "work source construction failed; schedule will tick without one"
                        ),
                    }
                }
            }
        }
        Self {
            config,
            agents,
            state,
            trigger,
            events,
            sources,
        }
    }

    /// The polling loop. Runs until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let tick = humantime::parse_duration(&self.config.tick_interval)
            .unwrap_or(Duration::from_secs(1));
        info!(tick = ?tick, "scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler stopping");
                        return;
                    }
                }
                _ = tokio::time::sleep(tick) => {
                    self.tick_all(Utc::now()).await;
                }
            }
        }
    }

    /// One pass over every schedule. Public for tests.
    pub async fn tick_all(&self, now: DateTime<Utc>) {
        for (agent_name, agent) in &self.agents {
            for (schedule_name, schedule) in &agent.schedules {
                self.tick_one(agent_name, schedule_name, schedule, now).await;
            }
        }
    }

    async fn tick_one(
        &self,
        agent_name: &str,
        schedule_name: &str,
        schedule: &ScheduleConfig,
        now: DateTime<Utc>,
    ) {
        if !matches!(
            schedule.schedule_type,
            ScheduleType::Interval | ScheduleType::Cron
        ) {
            return;
        }
        let mut state = self.state.get(agent_name, schedule_name);

        // First sighting of a cron schedule: seed next_run_at and wait.
        if state.next_run_at.is_none() && schedule.schedule_type == ScheduleType::Cron {
            state.next_run_at = compute_next_run(schedule, now);
            self.persist(agent_name, schedule_name, &state);
            return;
        }

        if !is_due(schedule, &state, now) {
            return;
        }

        // Concurrency gate: leave the schedule due; a later tick retries.
        let running = self.trigger.running_jobs(agent_name);
        if running >= self.config.max_concurrent_per_agent {
            debug!(
                agent = %agent_name,
                schedule = %schedule_name,
                running,
                "concurrency limit reached, deferring"
            );
            return;
        }

        // Work-source peek: no available item → the tick is a no-op (no
        // job record is created), but the schedule still advances.
        let source = self
            .sources
            .get(&(agent_name.to_string(), schedule_name.to_string()));
        let mut work_item = None;
        if let Some(source) = source {
            match source
                .fetch_available(FetchOptions {
                    limit: Some(1),
                    ..FetchOptions::default()
                })
                .await
            {
                Ok(result) => match result.items.into_iter().next() {
                    Some(item) => match source.claim(&item.id).await {
                        Ok(claim) if claim.success => work_item = claim.work_item,
                        Ok(claim) => {
                            // Raced another claimer; not an error.
                            let reason = claim.reason.map(|r| r.as_str()).unwrap_or("-");
                            debug!(
                                agent = %agent_name,
                                work = %item.id,
                                reason,
                                "work item claim refused"
                            );
                            let _ = self.events.send(FleetEvent::WorkSourceClaimFailed {
                                work_id: item.id.clone(),
                                reason: reason.to_string(),
                            });
                            self.advance(agent_name, schedule_name, schedule, &mut state, now);
                            return;
                        }
                        Err(e) => {
                            warn!(agent = %agent_name, error = %e, "work item claim errored");
                            self.record_error(agent_name, schedule_name, &mut state, now);
                            return;
                        }
                    },
                    None => {
                        self.advance(agent_name, schedule_name, schedule, &mut state, now);
                        return;
                    }
                },
                Err(e) => {
                    warn!(agent = %agent_name, schedule = %schedule_name, error = %e, "work source fetch failed");
                    self.record_error(agent_name, schedule_name, &mut state, now);
                    return;
                }
            }
        }

        match self
            .trigger
            .fire(agent_name, schedule_name, schedule, work_item.clone())
            .await
        {
            Ok(outcome) => {
                if let (Some(item), Some(source)) = (&work_item, source) {
                    self.settle_work_item(source.as_ref(), item, &outcome).await;
                }
                state.last_run_at = Some(now);
                state.consecutive_errors = 0;
                state.next_run_at = compute_next_run(schedule, now);
                self.persist(agent_name, schedule_name, &state);
            }
            Err(e) => {
                warn!(agent = %agent_name, schedule = %schedule_name, error = %e, "schedule trigger failed");
                if let (Some(item), Some(source)) = (&work_item, source) {
                    // The job never ran; give the item back.
                    if let Err(release_err) = source
                        .release(
                            &item.id,
                            drover_worksource::ReleaseOptions {
                                reason: Some(format!("job failed to start: {e}")),
                                post_comment: true,
                            },
                        )
                        .await
                    {
                        warn!(work = %item.id, error = %release_err, "releasing work item failed");
                    }
                }
                self.record_error(agent_name, schedule_name, &mut state, now);
            }
        }
    }

    /// Report a finished job back to the work source: close on success,
    /// comment-and-leave-open on failure.
    async fn settle_work_item(
        &self,
        source: &dyn WorkSource,
        item: &WorkItem,
        outcome: &FireOutcome,
    ) {
        let work_outcome = if outcome.job_success {
            drover_worksource::WorkOutcome::success(
                outcome
                    .summary
                    .clone()
                    .unwrap_or_else(|| "completed".to_string()),
            )
        } else {
            drover_worksource::WorkOutcome::failure(
                outcome
                    .summary
                    .clone()
                    .unwrap_or_else(|| "job did not complete".to_string()),
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            )
        };
        if let Err(e) = source.complete(&item.id, &work_outcome).await {
            warn!(work = %item.id, error = %e, "completing work item failed");
        }
    }

    /// Advance the schedule without recording a run (empty work-source tick
    /// or lost claim race).
    fn advance(
        &self,
        agent_name: &str,
        schedule_name: &str,
        schedule: &ScheduleConfig,
        state: &mut ScheduleState,
        now: DateTime<Utc>,
    ) {
        state.next_run_at = compute_next_run(schedule, now);
        self.persist(agent_name, schedule_name, state);
    }

    fn record_error(
        &self,
        agent_name: &str,
        schedule_name: &str,
        state: &mut ScheduleState,
        now: DateTime<Utc>,
    ) {
        state.consecutive_errors += 1;
        let backoff = error_backoff(state.consecutive_errors);
        state.next_run_at =
            Some(now + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero()));
        if state.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            warn!(
                agent = %agent_name,
                schedule = %schedule_name,
                errors = state.consecutive_errors,
                "schedule auto-disabled after repeated failures"
            );
            state.auto_disabled = true;
        }
        self.persist(agent_name, schedule_name, state);
    }

    fn persist(&self, agent_name: &str, schedule_name: &str, state: &ScheduleState) {
        if let Err(e) = self.state.put(agent_name, schedule_name, state) {
            warn!(agent = %agent_name, schedule = %schedule_name, error = %e, "persisting schedule state failed");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
