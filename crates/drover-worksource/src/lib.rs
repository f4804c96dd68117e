// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod github;
mod item;
mod retry;
mod source;

pub use error::{ClaimFailure, ClaimResult, WorkSourceError};
pub use github::GithubWorkSource;
pub use item::{
    FetchOptions, FetchResult, OutcomeStatus, Priority, ReleaseOptions, ReleaseResult, WorkItem,
    WorkOutcome, FETCH_LIMIT_CAP,
};
pub use retry::{with_retry, RateLimitInfo, RetryPolicy};
pub use source::{from_config, WorkSource};
