// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Workspace strategies: pre/post-job working-directory lifecycle.
//!
//! `static` hands the agent its configured directory untouched. The
//! `git_worktree` strategy gives every job an isolated worktree + branch
//! created from `origin/<base>`; a single worktree spans **all** sessions
//! of the job, including handoff continuations, and is force-removed on
//! teardown. Branches are kept, including for failed jobs, so their work
//! can be inspected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use drover_config::{AgentConfig, WorkspaceStrategyKind};

// ─── Contract ─────────────────────────────────────────────────────────────────

/// Trigger-side facts a strategy may fold into branch names and env.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub job_id: String,
    pub agent_name: String,
    pub schedule_name: Option<String>,
    pub work_item_id: Option<String>,
    pub work_item_title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SetupResult {
    pub working_directory: PathBuf,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    /// Extra environment injected into the runtime and hooks.
    pub env: HashMap<String, String>,
}

#[async_trait]
pub trait WorkspaceStrategy: Send + Sync {
    async fn setup(&self, agent: &AgentConfig, ctx: &JobContext) -> anyhow::Result<SetupResult>;

    async fn teardown(
        &self,
        agent: &AgentConfig,
        setup: &SetupResult,
        job_succeeded: bool,
        summary: Option<&str>,
    ) -> anyhow::Result<()>;
}

pub fn for_kind(kind: WorkspaceStrategyKind) -> Arc<dyn WorkspaceStrategy> {
    match kind {
        WorkspaceStrategyKind::Static => Arc::new(StaticStrategy),
        WorkspaceStrategyKind::GitWorktree => Arc::new(GitWorktreeStrategy),
    }
}

// ─── Static ───────────────────────────────────────────────────────────────────

/// Pass-through: the agent runs where it is configured to run.
pub struct StaticStrategy;

#[async_trait]
impl WorkspaceStrategy for StaticStrategy {
    async fn setup(&self, agent: &AgentConfig, _ctx: &JobContext) -> anyhow::Result<SetupResult> {
        Ok(SetupResult {
            working_directory: agent.working_dir(),
            branch_name: None,
            base_branch: None,
            env: HashMap::from([(
                "WORKSPACE_STRATEGY".to_string(),
                "static".to_string(),
            )]),
        })
    }

    async fn teardown(
        &self,
        _agent: &AgentConfig,
        _setup: &SetupResult,
        _job_succeeded: bool,
        _summary: Option<&str>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Branch pattern ───────────────────────────────────────────────────────────

/// Render a branch pattern. Placeholders: `{agent}`, `{work_item}`,
/// `{schedule}`, `{job_id}`, `{date}` (UTC `YYYYMMDD`).
pub fn render_branch_pattern(pattern: &str, ctx: &JobContext, date: &str) -> String {
    let raw = pattern
        .replace("{agent}", &ctx.agent_name)
        .replace("{work_item}", ctx.work_item_id.as_deref().unwrap_or("none"))
        .replace("{schedule}", ctx.schedule_name.as_deref().unwrap_or("manual"))
        .replace("{job_id}", &ctx.job_id)
        .replace("{date}", date);
    sanitize_branch(&raw)
}

/// Keep git-legal characters only; everything else becomes `-`.
fn sanitize_branch(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').trim_matches('/').to_string()
}

// ─── Git worktree ─────────────────────────────────────────────────────────────

pub struct GitWorktreeStrategy;

async fn run_git(dir: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("spawning git {args:?}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

impl GitWorktreeStrategy {
    fn worktree_path(agent: &AgentConfig, job_id: &str) -> PathBuf {
        agent.working_dir().join(&agent.worktree.dir).join(job_id)
    }
}

/// Run the configured PR sink command in the worktree, with the worktree
/// env vars available.
async fn run_pr_command(
    worktree: &Path,
    command: &str,
    setup: &SetupResult,
) -> anyhow::Result<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(worktree)
        .envs(&setup.env)
        .output()
        .await
        .context("spawning PR command")?;
    if !output.status.success() {
        anyhow::bail!(
            "PR command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[async_trait]
impl WorkspaceStrategy for GitWorktreeStrategy {
    async fn setup(&self, agent: &AgentConfig, ctx: &JobContext) -> anyhow::Result<SetupResult> {
        let repo_root = agent.working_dir();
        let worktree = Self::worktree_path(agent, &ctx.job_id);
        let base = agent.worktree.base_branch.clone();
        let date = Utc::now().format("%Y%m%d").to_string();
        let branch = render_branch_pattern(&agent.worktree.branch_pattern, ctx, &date);

        if let Some(parent) = worktree.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        run_git(&repo_root, &["fetch", "origin", &base])
            .await
            .context("fetching base branch")?;
        run_git(
            &repo_root,
            &[
                "worktree",
                "add",
                worktree.to_str().context("worktree path is not utf-8")?,
                "-b",
                &branch,
                &format!("origin/{base}"),
            ],
        )
        .await
        .context("creating worktree")?;
        info!(job = %ctx.job_id, branch = %branch, path = %worktree.display(), "worktree created");

        let mut env = HashMap::from([
            ("WORKTREE_PATH".to_string(), worktree.display().to_string()),
            ("WORKTREE_BRANCH".to_string(), branch.clone()),
            ("WORKTREE_BASE_BRANCH".to_string(), base.clone()),
            ("REPO_ROOT".to_string(), repo_root.display().to_string()),
            (
                "WORKSPACE_STRATEGY".to_string(),
                "git_worktree".to_string(),
            ),
        ]);
        if let Some(id) = &ctx.work_item_id {
            env.insert("WORK_ITEM_ID".to_string(), id.clone());
        }
        if let Some(title) = &ctx.work_item_title {
            env.insert("WORK_ITEM_TITLE".to_string(), title.clone());
        }

        Ok(SetupResult {
            working_directory: worktree,
            branch_name: Some(branch),
            base_branch: Some(base),
            env,
        })
    }

    async fn teardown(
        &self,
        agent: &AgentConfig,
        setup: &SetupResult,
        job_succeeded: bool,
        summary: Option<&str>,
    ) -> anyhow::Result<()> {
        let worktree = &setup.working_directory;
        let repo_root = agent.working_dir();

        if job_succeeded {
            // Stage and commit whatever the agent left behind. An empty
            // commit attempt is not an error.
            if let Err(e) = run_git(worktree, &["add", "-A"]).await {
                warn!(error = %e, "staging leftover changes failed");
            } else {
                let message = agent
                    .worktree
                    .commit_message
                    .replace("{summary}", summary.unwrap_or("automated changes"));
                match run_git(worktree, &["commit", "-m", &message]).await {
                    Ok(_) => debug!("leftover changes committed"),
                    Err(e) if e.to_string().contains("nothing to commit") => {}
                    Err(e) => warn!(error = %e, "committing leftover changes failed"),
                }
            }
            if agent.worktree.push {
                if let Some(branch) = &setup.branch_name {
                    match run_git(worktree, &["push", "-u", "origin", branch]).await {
                        Ok(_) => {
                            if let Some(pr_command) = &agent.worktree.pr_command {
                                if let Err(e) = run_pr_command(worktree, pr_command, setup).await {
                                    warn!(error = %e, "PR command failed");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(branch = %branch, error = %e, "pushing worktree branch failed")
                        }
                    }
                }
            }
        }

        // Always remove the worktree; the branch stays either way.
        let path = worktree.display().to_string();
        if let Err(e) = run_git(&repo_root, &["worktree", "remove", "--force", &path]).await {
            warn!(error = %e, "worktree remove failed, deleting directory");
            let _ = std::fs::remove_dir_all(worktree);
            let _ = run_git(&repo_root, &["worktree", "prune"]).await;
        }
        Ok(())
    }
}

/// Startup cleanup: prune stale worktree bookkeeping and delete worktree
/// directories whose job id no longer corresponds to a live job.
/// Returns the number of directories removed.
pub async fn prune_orphan_worktrees(agent: &AgentConfig, live_job_ids: &[String]) -> usize {
    let dir = agent.working_dir().join(&agent.worktree.dir);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return 0;
    };
    let repo_root = agent.working_dir();
    let _ = run_git(&repo_root, &["worktree", "prune"]).await;

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(job_id) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if live_job_ids.iter().any(|id| id == job_id) {
            continue;
        }
        let path_str = path.display().to_string();
        if run_git(&repo_root, &["worktree", "remove", "--force", &path_str])
            .await
            .is_err()
        {
            let _ = std::fs::remove_dir_all(&path);
        }
        info!(path = %path_str, "removed orphan worktree");
        removed += 1;
    }
    let _ = run_git(&repo_root, &["worktree", "prune"]).await;
    removed
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
