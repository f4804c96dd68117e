// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod adapter;
pub mod catalog;
mod message;
mod scripted;
mod subprocess;

pub use adapter::{
    ExecuteRequest, MessageStream, RuntimeAdapter, RuntimeRegistry, RuntimeTool, ToolResponse,
};
pub use message::{CompactMetadata, ResultMessage, RuntimeMessage, SystemMessage, Usage};
pub use scripted::ScriptedRuntime;
pub use subprocess::SubprocessRuntime;
