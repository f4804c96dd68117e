// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;

use drover_config::{WorkSourceConfig, WorkSourceType};

use crate::{
    ClaimResult, FetchOptions, FetchResult, RateLimitInfo, ReleaseOptions, ReleaseResult,
    WorkItem, WorkOutcome, WorkSourceError,
};

/// Capability set every work source implements.
///
/// The claim protocol is label-based and race-visible: concurrent claimers
/// are mediated by the external source itself, and the loser gets an
/// `already_claimed` refusal rather than an error.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Source discriminator, also the prefix of work-item ids.
    fn name(&self) -> &str;

    /// Open items ready to be worked, oldest first.
    async fn fetch_available(&self, opts: FetchOptions) -> Result<FetchResult, WorkSourceError>;

    /// Claim an item: add the in-progress label, remove the ready label,
    /// re-fetch. Refusals (already claimed, closed, missing) come back as
    /// an unsuccessful [`ClaimResult`], not an `Err`.
    async fn claim(&self, work_id: &str) -> Result<ClaimResult, WorkSourceError>;

    /// Report an outcome: structured comment, label removal, and (on
    /// success) closing the item.
    async fn complete(&self, work_id: &str, outcome: &WorkOutcome)
        -> Result<(), WorkSourceError>;

    /// Give an item back: remove the in-progress label and (by default)
    /// restore the ready label.
    async fn release(
        &self,
        work_id: &str,
        opts: ReleaseOptions,
    ) -> Result<ReleaseResult, WorkSourceError>;

    async fn get(&self, work_id: &str) -> Result<Option<WorkItem>, WorkSourceError>;

    /// Rate-limit state observed on the most recent call, if any.
    fn last_rate_limit_info(&self) -> Option<RateLimitInfo>;
}

/// Build a work source from its config. Tagged variants with a factory
/// match, not reflection.
pub fn from_config(config: &WorkSourceConfig) -> Result<Arc<dyn WorkSource>, WorkSourceError> {
    match config.source_type {
        WorkSourceType::Github => Ok(Arc::new(crate::GithubWorkSource::new(config.clone())?)),
    }
}
