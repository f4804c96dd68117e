// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod atomic;
mod conversation;
mod error;
mod jobs;
mod schedule;
mod session;

pub use atomic::{append_line, write_atomic};
pub use conversation::{ConversationKeyStore, ConversationRecord, CONVERSATION_FILE_VERSION};
pub use error::StateError;
pub use jobs::{
    JobRecord, JobRecordStore, JobStatus, OutputEntry, OutputKind, StatusPatch, TokenStats,
    TriggerSource, JOB_RECORD_VERSION,
};
pub use schedule::{ScheduleState, ScheduleStateStore, SCHEDULE_STATE_VERSION};
pub use session::{
    InvalidReason, RuntimeContext, SessionRecord, SessionStore, SESSION_RECORD_VERSION,
};
