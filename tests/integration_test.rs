// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the fleet: trigger → executor → handoff →
/// stores, driven through the public `FleetManager` API with a scripted
/// runtime.
use std::sync::Arc;

use drover_core::{FleetManager, TriggerOptions};
use drover_runtime::{RuntimeMessage, ScriptedRuntime};
use drover_state::{JobStatus, OutputKind};

fn fleet_config(state: &std::path::Path, work: &std::path::Path, agent_extra: &str) -> drover_config::FleetConfig {
    let extra = agent_extra
        .lines()
        .map(|l| format!("    {l}"))
        .collect::<Vec<_>>()
        .join("\n");
    serde_yaml::from_str(&format!(
        concat!(
            "state_dir: {}\n",
            "agents:\n",
            "  coder:\n",
            "    model: sonnet\n",
            "    working_directory: {}\n",
            "{}\n",
        ),
        state.display(),
        work.display(),
        extra
    ))
    .unwrap()
}

#[tokio::test]
async fn fleet_runs_a_job_end_to_end() {
    let state = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let config = fleet_config(state.path(), work.path(), "");
    let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptedRuntime::session(
        "S1",
        "sonnet",
        &[("thinking out loud", 2_000)],
        "shipped it",
    )]));
    let fleet = FleetManager::initialise_with_runtime(config, runtime)
        .await
        .unwrap();

    let result = fleet
        .trigger(
            "coder",
            TriggerOptions {
                prompt: Some("ship the feature".into()),
                use_agent_session: true,
                ..TriggerOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.summary.as_deref(), Some("shipped it"));

    let record = fleet.jobs().load(&result.job_id).unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.session_id.as_deref(), Some("S1"));
    assert_eq!(record.prompt, "ship the feature");

    let output = fleet.jobs().read_output(&result.job_id).unwrap();
    assert!(output
        .iter()
        .any(|e| e.subtype.as_deref() == Some("init")));
    assert!(output.iter().any(|e| e.kind == OutputKind::Result));
}

#[tokio::test]
async fn fleet_survives_a_context_handoff() {
    let state = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let config = fleet_config(state.path(), work.path(), "context_threshold: 0.10");
    // Session A exhausts its window; the sub-query summarises it; session
    // B finishes the job.
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        vec![
            RuntimeMessage::init("A", "sonnet"),
            RuntimeMessage::assistant("grinding through a huge refactor", 186_000),
        ],
        ScriptedRuntime::session("A", "sonnet", &[("state: half done", 5_000)], ""),
        ScriptedRuntime::session("B", "sonnet", &[("picking it back up", 9_000)], "refactor done"),
    ]));
    let fleet = FleetManager::initialise_with_runtime(config, runtime)
        .await
        .unwrap();

    let result = fleet
        .trigger(
            "coder",
            TriggerOptions {
                prompt: Some("refactor the world".into()),
                use_agent_session: true,
                ..TriggerOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.handoff_count, 1);
    assert_eq!(result.session_id.as_deref(), Some("B"));
    assert_eq!(result.summary.as_deref(), Some("refactor done"));

    // The output log tells the whole story in order.
    let output = fleet.jobs().read_output(&result.job_id).unwrap();
    let subtypes: Vec<&str> = output
        .iter()
        .filter_map(|e| e.subtype.as_deref())
        .collect();
    let first_init = subtypes.iter().position(|s| *s == "init").unwrap();
    let handoff = subtypes
        .iter()
        .position(|s| *s == "context_handoff")
        .unwrap();
    let document = subtypes
        .iter()
        .position(|s| *s == "handoff_document")
        .unwrap();
    let last_init = subtypes.iter().rposition(|s| *s == "init").unwrap();
    assert!(first_init < handoff);
    assert!(handoff < document);
    assert!(document < last_init);

    let record = fleet.jobs().load(&result.job_id).unwrap().unwrap();
    assert_eq!(record.tokens.handoff_count, 1);
    assert!(record.tokens.cumulative_input >= 186_000);
}

#[tokio::test]
async fn validate_rejects_a_broken_config() {
    let config: drover_config::FleetConfig = serde_yaml::from_str(concat!(
        "agents:\n",
        "  coder:\n",
        "    model: sonnet\n",
        "    working_directory: /tmp/x\n",
        "    context_threshold: 7.5\n",
    ))
    .unwrap();
    let errors = config.validate().unwrap_err();
    assert!(errors
        .iter()
        .any(|e| e.path == "agents.coder.context_threshold"));
}
