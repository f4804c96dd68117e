// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority of a work item, inferred from labels when the source has no
/// native priority field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Case-insensitive label → priority mapping. Anything unrecognised is
    /// medium; the first matching label wins.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        for label in labels {
            match label.as_ref().to_ascii_lowercase().as_str() {
                "critical" | "p0" | "urgent" => return Self::Critical,
                "high" | "p1" | "important" => return Self::High,
                "low" | "p3" => return Self::Low,
                _ => {}
            }
        }
        Self::Medium
    }
}

/// Normalised representation of an external task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// `<source>-<externalId>`, e.g. `github-42`.
    pub id: String,
    pub source: String,
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Ordered as the source reports them.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// Options for `fetch_available`.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub labels: Option<Vec<String>>,
    pub priority: Option<Priority>,
    /// Page size; the adapter clamps this to 100.
    pub limit: Option<u32>,
    pub cursor: Option<String>,
    /// Include items already carrying the in-progress label.
    pub include_claimed: bool,
}

pub const FETCH_LIMIT_CAP: u32 = 100;

impl FetchOptions {
    /// Effective page size after clamping.
    pub fn effective_limit(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default).min(FETCH_LIMIT_CAP)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Sorted by creation time ascending (oldest first).
    pub items: Vec<WorkItem>,
    pub next_cursor: Option<String>,
    pub total_count: Option<u64>,
}

// ─── Completion / release ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
    Partial,
}

impl OutcomeStatus {
    /// Comment prefix encoding the outcome.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Success => "✅",
            Self::Failure => "❌",
            Self::Partial => "⚠️",
        }
    }
}

/// What the agent did with a claimed item.
#[derive(Debug, Clone)]
pub struct WorkOutcome {
    pub status: OutcomeStatus,
    pub summary: String,
    pub details: Option<String>,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
}

impl WorkOutcome {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            summary: summary.into(),
            details: None,
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn failure(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            summary: summary.into(),
            details: None,
            artifacts: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Render the structured outcome comment.
    pub fn render_comment(&self) -> String {
        let heading = match self.status {
            OutcomeStatus::Success => "Work Completed",
            OutcomeStatus::Failure => "Work Failed",
            OutcomeStatus::Partial => "Work Partially Completed",
        };
        let mut out = format!("{} **{}**\n\n{}", self.status.marker(), heading, self.summary);
        if let Some(details) = &self.details {
            out.push_str("\n\n");
            out.push_str(details);
        }
        if !self.artifacts.is_empty() {
            out.push_str("\n\n**Artifacts**\n");
            for artifact in &self.artifacts {
                out.push_str(&format!("- {artifact}\n"));
            }
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("\n\n**Error**\n```\n{error}\n```"));
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReleaseOptions {
    pub reason: Option<String>,
    /// Post a "Work Released" comment.
    pub post_comment: bool,
}

#[derive(Debug, Clone)]
pub struct ReleaseResult {
    pub success: bool,
    pub message: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
