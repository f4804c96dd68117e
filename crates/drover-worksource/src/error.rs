// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};

use crate::WorkItem;

/// Errors from a work-source adapter.
///
/// Exactly three kinds are retryable: `RateLimited`, `Network`, and the
/// 5xx-backed `Source`. Everything else, including `Rejected` (any other
/// 4xx), is permanent: the identical request would fail identically, so
/// it must never be retried.
#[derive(Debug, thiserror::Error)]
pub enum WorkSourceError {
    #[error("work item {0} not found")]
    NotFound(String),
    #[error("work item {0} is already claimed")]
    AlreadyClaimed(String),
    #[error("work item {id} is in state '{state}'")]
    InvalidState { id: String, state: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("rate limited{}", reset.map(|r| format!(" until {r}")).unwrap_or_default())]
    RateLimited { reset: Option<DateTime<Utc>> },
    /// The source rejected the request itself (4xx other than the
    /// rate-limit, auth, and not-found cases), e.g. a malformed body.
    #[error("rejected by the source: {0}")]
    Rejected(String),
    /// Server-side failure (5xx) or a malformed response from it.
    #[error("source error: {0}")]
    Source(String),
    #[error("network error: {0}")]
    Network(String),
}

impl WorkSourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Network(_) | Self::Source(_)
        )
    }
}

/// Why a claim was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimFailure {
    NotFound,
    AlreadyClaimed,
    InvalidState,
    PermissionDenied,
    SourceError,
}

impl ClaimFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyClaimed => "already_claimed",
            Self::InvalidState => "invalid_state",
            Self::PermissionDenied => "permission_denied",
            Self::SourceError => "source_error",
        }
    }
}

impl From<&WorkSourceError> for ClaimFailure {
    fn from(err: &WorkSourceError) -> Self {
        match err {
            WorkSourceError::NotFound(_) => Self::NotFound,
            WorkSourceError::AlreadyClaimed(_) => Self::AlreadyClaimed,
            WorkSourceError::InvalidState { .. } => Self::InvalidState,
            WorkSourceError::PermissionDenied(_) => Self::PermissionDenied,
            WorkSourceError::RateLimited { .. }
            | WorkSourceError::Rejected(_)
            | WorkSourceError::Source(_)
            | WorkSourceError::Network(_) => Self::SourceError,
        }
    }
}

/// Outcome of a claim attempt. Protocol-level refusals (already claimed,
/// closed, missing) are data, not transport errors: races are expected and
/// the loser needs the reason.
#[derive(Debug, Clone)]
pub struct ClaimResult {
    pub success: bool,
    pub work_item: Option<WorkItem>,
    pub reason: Option<ClaimFailure>,
    pub message: Option<String>,
}

impl ClaimResult {
    pub fn claimed(item: WorkItem) -> Self {
        Self {
            success: true,
            work_item: Some(item),
            reason: None,
            message: None,
        }
    }

    pub fn refused(reason: ClaimFailure, message: impl Into<String>) -> Self {
        Self {
            success: false,
            work_item: None,
            reason: Some(reason),
            message: Some(message.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
