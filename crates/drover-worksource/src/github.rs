// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! GitHub work source: issues as work items.
//!
//! The claim protocol is a label exchange (add in-progress, remove ready)
//! executed as two separate API calls; the claim counts only when both
//! complete. Races between claimers resolve at the API: the loser observes
//! the in-progress label on the pre-claim fetch and backs off.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use drover_config::WorkSourceConfig;

use crate::{
    retry::{with_retry, RateLimitInfo, RetryPolicy},
    ClaimFailure, ClaimResult, FetchOptions, FetchResult, Priority, ReleaseOptions,
    ReleaseResult, WorkItem, WorkOutcome, WorkSource, WorkSourceError,
};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const RATE_LIMIT_WARNING_THRESHOLD: u64 = 100;

type WarningCallback = Box<dyn Fn(&RateLimitInfo) + Send + Sync>;

pub struct GithubWorkSource {
    config: WorkSourceConfig,
    client: reqwest::Client,
    base: String,
    token: Option<String>,
    policy: RetryPolicy,
    last_rate_limit: Mutex<Option<RateLimitInfo>>,
    warning_callback: Mutex<Option<Arc<WarningCallback>>>,
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    html_url: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Present when the "issue" is actually a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl GithubWorkSource {
    pub fn new(config: WorkSourceConfig) -> Result<Self, WorkSourceError> {
        let token = std::env::var(&config.token_env).ok();
        if token.is_none() {
            warn!(
                env = %config.token_env,
                repo = %config.repo,
                "work-source token env var unset; requests will be unauthenticated"
            );
        }
        let base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let client = reqwest::Client::builder()
            .user_agent("drover")
            .build()
            .map_err(|e| WorkSourceError::Source(e.to_string()))?;
        Ok(Self {
            config,
            client,
            base,
            token,
            policy: RetryPolicy::default(),
            last_rate_limit: Mutex::new(None),
            warning_callback: Mutex::new(None),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Install a callback fired when the remaining quota drops below the
    /// warning threshold.
    pub fn set_warning_callback(&self, cb: impl Fn(&RateLimitInfo) + Send + Sync + 'static) {
        *self.warning_callback.lock().unwrap() = Some(Arc::new(Box::new(cb)));
    }

    fn repo_path(&self) -> &str {
        &self.config.repo
    }

    /// Extract the issue number from a work id (`github-42` → 42).
    fn issue_number(&self, work_id: &str) -> Result<u64, WorkSourceError> {
        let raw = work_id
            .strip_prefix(&format!("{}-", self.name()))
            .unwrap_or(work_id);
        raw.parse()
            .map_err(|_| WorkSourceError::NotFound(work_id.to_string()))
    }

    fn to_work_item(&self, issue: &GhIssue) -> WorkItem {
        let labels: Vec<String> = issue.labels.iter().map(|l| l.name.clone()).collect();
        WorkItem {
            id: format!("{}-{}", self.name(), issue.number),
            source: self.name().to_string(),
            external_id: issue.number.to_string(),
            title: issue.title.clone(),
            description: issue.body.clone().unwrap_or_default(),
            priority: Priority::from_labels(&labels),
            labels,
            metadata: std::collections::HashMap::from([(
                "state".to_string(),
                serde_json::Value::String(issue.state.clone()),
            )]),
            url: issue.html_url.clone(),
            created_at: issue.created_at,
            updated_at: issue.updated_at,
        }
    }

    /// One HTTP round-trip: records rate-limit headers, classifies
    /// non-success statuses into [`WorkSourceError`] kinds.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, WorkSourceError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req
            .header("accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| WorkSourceError::Network(e.to_string()))?;

        let info = RateLimitInfo::from_headers(resp.headers());
        if let Some(info) = &info {
            if info.remaining < RATE_LIMIT_WARNING_THRESHOLD {
                warn!(
                    remaining = info.remaining,
                    limit = info.limit,
                    resource = info.resource.as_deref().unwrap_or("-"),
                    "work-source rate limit running low"
                );
                if let Some(cb) = self.warning_callback.lock().unwrap().clone() {
                    cb(info);
                }
            }
            *self.last_rate_limit.lock().unwrap() = Some(info.clone());
        }

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let remaining = info.as_ref().map(|i| i.remaining);
        let reset = info.as_ref().and_then(|i| i.reset);
        if RateLimitInfo::classifies_as_rate_limit(status.as_u16(), remaining) {
            return Err(WorkSourceError::RateLimited { reset });
        }
        match status {
            StatusCode::NOT_FOUND => Err(WorkSourceError::NotFound("resource".to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                WorkSourceError::PermissionDenied(format!("github returned {status}")),
            ),
            s if s.is_server_error() => {
                Err(WorkSourceError::Source(format!("github returned {status}")))
            }
            // Any other status (422 and friends): the request is wrong,
            // not the server, so retrying it is pointless.
            s => Err(WorkSourceError::Rejected(format!("github returned {s}"))),
        }
    }

    async fn fetch_issue(&self, number: u64) -> Result<GhIssue, WorkSourceError> {
        let url = format!("{}/repos/{}/issues/{}", self.base, self.repo_path(), number);
        let resp = with_retry(&self.policy, "get_issue", || {
            self.send(self.client.get(&url))
        })
        .await?;
        resp.json()
            .await
            .map_err(|e| WorkSourceError::Source(format!("decoding issue: {e}")))
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<(), WorkSourceError> {
        let url = format!(
            "{}/repos/{}/issues/{}/labels",
            self.base,
            self.repo_path(),
            number
        );
        let body = serde_json::json!({ "labels": [label] });
        with_retry(&self.policy, "add_label", || {
            self.send(self.client.post(&url).json(&body))
        })
        .await?;
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<(), WorkSourceError> {
        let url = format!(
            "{}/repos/{}/issues/{}/labels/{}",
            self.base,
            self.repo_path(),
            number,
            label
        );
        let result = with_retry(&self.policy, "remove_label", || {
            self.send(self.client.delete(&url))
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            // Removing an absent label is a no-op, which keeps release
            // idempotent.
            Err(WorkSourceError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn post_comment(&self, number: u64, body: &str) -> Result<(), WorkSourceError> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.base,
            self.repo_path(),
            number
        );
        let payload = serde_json::json!({ "body": body });
        with_retry(&self.policy, "post_comment", || {
            self.send(self.client.post(&url).json(&payload))
        })
        .await?;
        Ok(())
    }

    async fn close_issue(&self, number: u64) -> Result<(), WorkSourceError> {
        let url = format!("{}/repos/{}/issues/{}", self.base, self.repo_path(), number);
        let body = serde_json::json!({ "state": "closed", "state_reason": "completed" });
        with_retry(&self.policy, "close_issue", || {
            self.send(self.client.patch(&url).json(&body))
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkSource for GithubWorkSource {
    fn name(&self) -> &str {
        "github"
    }

    async fn fetch_available(&self, opts: FetchOptions) -> Result<FetchResult, WorkSourceError> {
        let limit = opts.effective_limit(self.config.fetch_limit);
        let page: u32 = opts
            .cursor
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(1);

        let mut labels = vec![self.config.ready_label.clone()];
        if let Some(extra) = &opts.labels {
            labels.extend(extra.iter().cloned());
        }
        let url = format!("{}/repos/{}/issues", self.base, self.repo_path());
        let query = [
            ("state", "open".to_string()),
            ("labels", labels.join(",")),
            ("per_page", limit.to_string()),
            ("page", page.to_string()),
            ("sort", "created".to_string()),
            ("direction", "asc".to_string()),
        ];
        let resp = with_retry(&self.policy, "fetch_available", || {
            self.send(self.client.get(&url).query(&query))
        })
        .await?;
        let issues: Vec<GhIssue> = resp
            .json()
            .await
            .map_err(|e| WorkSourceError::Source(format!("decoding issues: {e}")))?;

        let fetched = issues.len();
        let mut items: Vec<WorkItem> = issues
            .iter()
            .filter(|i| i.pull_request.is_none())
            .map(|i| self.to_work_item(i))
            .filter(|item| {
                if !opts.include_claimed && item.has_label(&self.config.in_progress_label) {
                    return false;
                }
                if self
                    .config
                    .exclude_labels
                    .iter()
                    .any(|ex| item.has_label(ex))
                {
                    return false;
                }
                if let Some(priority) = opts.priority {
                    if item.priority != priority {
                        return false;
                    }
                }
                true
            })
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        debug!(fetched, kept = items.len(), page, "fetched work items");
        Ok(FetchResult {
            items,
            next_cursor: (fetched as u32 == limit).then(|| (page + 1).to_string()),
            total_count: None,
        })
    }

    async fn claim(&self, work_id: &str) -> Result<ClaimResult, WorkSourceError> {
        let number = match self.issue_number(work_id) {
            Ok(n) => n,
            Err(_) => {
                return Ok(ClaimResult::refused(
                    ClaimFailure::NotFound,
                    format!("malformed work id '{work_id}'"),
                ))
            }
        };

        let issue = match self.fetch_issue(number).await {
            Ok(issue) => issue,
            Err(e) => return Ok(ClaimResult::refused(ClaimFailure::from(&e), e.to_string())),
        };
        if issue.state != "open" {
            return Ok(ClaimResult::refused(
                ClaimFailure::InvalidState,
                format!("work item is '{}'", issue.state),
            ));
        }
        if issue
            .labels
            .iter()
            .any(|l| l.name.eq_ignore_ascii_case(&self.config.in_progress_label))
        {
            return Ok(ClaimResult::refused(
                ClaimFailure::AlreadyClaimed,
                "in-progress label already present",
            ));
        }

        if let Err(e) = self.add_label(number, &self.config.in_progress_label).await {
            return Ok(ClaimResult::refused(ClaimFailure::from(&e), e.to_string()));
        }
        if let Err(e) = self.remove_label(number, &self.config.ready_label).await {
            return Ok(ClaimResult::refused(ClaimFailure::from(&e), e.to_string()));
        }

        let updated = self.fetch_issue(number).await?;
        Ok(ClaimResult::claimed(self.to_work_item(&updated)))
    }

    async fn complete(
        &self,
        work_id: &str,
        outcome: &WorkOutcome,
    ) -> Result<(), WorkSourceError> {
        let number = self.issue_number(work_id)?;
        self.post_comment(number, &outcome.render_comment()).await?;
        self.remove_label(number, &self.config.in_progress_label)
            .await?;
        if outcome.status == crate::OutcomeStatus::Success {
            self.close_issue(number).await?;
        }
        Ok(())
    }

    async fn release(
        &self,
        work_id: &str,
        opts: ReleaseOptions,
    ) -> Result<ReleaseResult, WorkSourceError> {
        let number = self.issue_number(work_id)?;
        self.remove_label(number, &self.config.in_progress_label)
            .await?;
        if self.config.cleanup_on_failure {
            self.add_label(number, &self.config.ready_label).await?;
        }
        if opts.post_comment {
            let reason = opts.reason.as_deref().unwrap_or("released by operator");
            self.post_comment(number, &format!("🔓 **Work Released**\n\n{reason}"))
                .await?;
        }
        Ok(ReleaseResult {
            success: true,
            message: opts.reason,
        })
    }

    async fn get(&self, work_id: &str) -> Result<Option<WorkItem>, WorkSourceError> {
        let number = self.issue_number(work_id)?;
        match self.fetch_issue(number).await {
            Ok(issue) => Ok(Some(self.to_work_item(&issue))),
            Err(WorkSourceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn last_rate_limit_info(&self) -> Option<RateLimitInfo> {
        self.last_rate_limit.lock().unwrap().clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkSourceConfig {
        serde_yaml::from_str(
            "type: github\nrepo: acme/widgets\ntoken_env: DROVER_TEST_ABSENT_TOKEN",
        )
        .unwrap()
    }

    fn source() -> GithubWorkSource {
        GithubWorkSource::new(config()).unwrap()
    }

    #[test]
    fn issue_number_parses_prefixed_and_bare_ids() {
        let s = source();
        assert_eq!(s.issue_number("github-42").unwrap(), 42);
        assert_eq!(s.issue_number("42").unwrap(), 42);
        assert!(s.issue_number("github-abc").is_err());
    }

    #[test]
    fn work_item_conversion_carries_priority_and_state() {
        let s = source();
        let issue: GhIssue = serde_json::from_value(serde_json::json!({
            "number": 7,
            "title": "fix the flake",
            "body": "details",
            "state": "open",
            "labels": [{"name": "ready"}, {"name": "urgent"}],
            "html_url": "https://github.com/acme/widgets/issues/7",
            "created_at": "2026-01-10T10:00:00Z",
            "updated_at": "2026-01-11T10:00:00Z"
        }))
        .unwrap();
        let item = s.to_work_item(&issue);
        assert_eq!(item.id, "github-7");
        assert_eq!(item.external_id, "7");
        assert_eq!(item.priority, Priority::Critical);
        assert_eq!(item.metadata["state"], "open");
    }
}
