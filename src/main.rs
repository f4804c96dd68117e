// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use drover_core::{FailureKind, FleetEvent, FleetManager, TriggerOptions};

// Exit codes: 0 success, 2 configuration invalid, 3 agent not found,
// 4 runtime failed, 5 timed out, 6 cancelled.
const EXIT_CONFIG_INVALID: u8 = 2;
const EXIT_AGENT_NOT_FOUND: u8 = 3;
const EXIT_RUNTIME_FAILED: u8 = 4;
const EXIT_TIMED_OUT: u8 = 5;
const EXIT_CANCELLED: u8 = 6;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            let text = format!("{e:#}");
            if text.contains("configuration invalid") {
                ExitCode::from(EXIT_CONFIG_INVALID)
            } else if text.contains("unknown agent") {
                ExitCode::from(EXIT_AGENT_NOT_FOUND)
            } else {
                ExitCode::from(EXIT_RUNTIME_FAILED)
            }
        }
    }
}

/// Logs go to stderr; stdout is reserved for command output. `DROVER_LOG`
/// overrides the verbosity flags.
fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("DROVER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Commands::Validate => {
            let config = drover_config::load(cli.config.as_deref())?;
            match config.validate() {
                Ok(()) => {
                    println!("configuration is valid");
                    Ok(ExitCode::SUCCESS)
                }
                Err(errors) => {
                    for error in errors {
                        eprintln!("  {error}");
                    }
                    Ok(ExitCode::from(EXIT_CONFIG_INVALID))
                }
            }
        }

        Commands::ShowConfig => {
            let config = drover_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Start => {
            let config = drover_config::load(cli.config.as_deref())?;
            let fleet = FleetManager::initialise(config).await?;
            log_fleet_events(&fleet);
            fleet.start().await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("interrupt received, draining fleet");
            fleet.stop().await;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Trigger {
            agent,
            schedule,
            prompt,
            resume,
            bypass_concurrency,
        } => {
            let config = drover_config::load(cli.config.as_deref())?;
            let fleet = FleetManager::initialise(config).await?;
            let result = fleet
                .trigger(
                    agent,
                    TriggerOptions {
                        prompt: prompt.clone(),
                        schedule_name: schedule.clone(),
                        resume_session_id: resume.clone(),
                        bypass_concurrency_limit: *bypass_concurrency,
                        use_agent_session: true,
                        ..TriggerOptions::default()
                    },
                )
                .await?;

            if let Some(summary) = &result.summary {
                println!("{summary}");
            }
            if let Some(error) = &result.error {
                eprintln!("job {}: {error}", result.job_id);
            }
            Ok(match result.failure {
                None => ExitCode::SUCCESS,
                Some(FailureKind::TimedOut) => ExitCode::from(EXIT_TIMED_OUT),
                Some(FailureKind::Cancelled) => ExitCode::from(EXIT_CANCELLED),
                Some(_) => ExitCode::from(EXIT_RUNTIME_FAILED),
            })
        }

        Commands::Jobs { limit, json } => {
            let config = drover_config::load(cli.config.as_deref())?;
            let fleet = FleetManager::initialise(config).await?;
            let jobs = fleet.jobs().list(Some(*limit))?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for job in jobs {
                    println!(
                        "{}  {:<10}  {:<12}  {}",
                        job.started_at.format("%Y-%m-%d %H:%M:%S"),
                        format!("{:?}", job.status).to_lowercase(),
                        job.agent_name,
                        job.id,
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status => {
            let config = drover_config::load(cli.config.as_deref())?;
            let fleet = FleetManager::initialise(config).await?;
            println!("agents:");
            for name in fleet.agent_names() {
                println!("  {name}");
                let agent = &fleet.config().agents[&name];
                for (schedule_name, schedule) in &agent.schedules {
                    let state = fleet.schedule_state().get(&name, schedule_name);
                    let next = state
                        .next_run_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let flags = if state.auto_disabled {
                        " [auto-disabled]"
                    } else if !schedule.enabled {
                        " [disabled]"
                    } else {
                        ""
                    };
                    println!(
                        "    {schedule_name}: next {next}, errors {}{}",
                        state.consecutive_errors, flags
                    );
                }
            }
            let recent = fleet.jobs().list(Some(5))?;
            if !recent.is_empty() {
                println!("recent jobs:");
                for job in recent {
                    println!(
                        "  {}  {:<10}  {}",
                        job.started_at.format("%Y-%m-%d %H:%M:%S"),
                        format!("{:?}", job.status).to_lowercase(),
                        job.id
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Mirror fleet events into the log so `drover start` is observable.
fn log_fleet_events(fleet: &FleetManager) {
    let mut events = fleet.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                FleetEvent::JobQueued { job_id, agent_name } => {
                    tracing::info!(job = %job_id, agent = %agent_name, "job queued")
                }
                FleetEvent::JobStarted { job_id, agent_name } => {
                    tracing::info!(job = %job_id, agent = %agent_name, "job started")
                }
                FleetEvent::JobCompleted { job_id, agent_name, status } => {
                    tracing::info!(job = %job_id, agent = %agent_name, ?status, "job finished")
                }
                FleetEvent::JobFailed { job_id, agent_name, error } => {
                    tracing::warn!(job = %job_id, agent = %agent_name, error = %error, "job failed")
                }
                FleetEvent::ContextHandoffStart { job_id, input_tokens, .. } => {
                    tracing::info!(job = %job_id, input_tokens, "context handoff starting")
                }
                FleetEvent::ContextHandoffComplete { job_id, new_session_id, .. } => {
                    tracing::info!(job = %job_id, session = ?new_session_id, "context handoff complete")
                }
                FleetEvent::WebhookReceived { route_name, agent_name } => {
                    tracing::info!(route = %route_name, agent = %agent_name, "webhook received")
                }
                FleetEvent::WorkSourceClaimFailed { work_id, reason } => {
                    tracing::warn!(work = %work_id, reason = %reason, "work claim failed")
                }
                _ => {}
            }
        }
    });
}
