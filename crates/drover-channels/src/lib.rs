// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod commands;
mod event;
mod issues;
mod manager;
mod responder;
mod transport;

pub use commands::{help_text, parse_command, ParsedCommand};
pub use event::{
    ChatMessageMetadata, ConnectorEvent, ConnectorState, InboundMessage, SessionLifecycle,
    TriggerKind,
};
pub use issues::{
    default_prompt, route_issue, IssueEvent, IssueEventKind, IssueRouting, IssueSummary,
};
pub use manager::{AgentRoute, ChatEventHandler, ChatManager, ChatMessageEvent, Routing};
pub use responder::{open_fence, split_message, StreamingResponder};
pub use transport::{ChannelHandle, ChatTransport, IndicatorGuard, RecordingTransport};
