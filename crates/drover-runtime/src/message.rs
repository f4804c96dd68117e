// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Usage ────────────────────────────────────────────────────────────────────

/// Token usage reported by the backend.
///
/// `input_tokens` is **cumulative for the turn** (the full context the model
/// read), not a delta; the context tracker relies on that.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// Metadata attached to a compaction boundary emitted by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactMetadata {
    /// Context size immediately before the backend compacted.
    #[serde(default)]
    pub pre_tokens: u64,
}

/// Backend lifecycle notices. On the wire these share `type: "system"` and
/// are discriminated by `subtype`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum SystemMessage {
    /// First message of every session. Carries the session id the executor
    /// needs for resumption.
    Init { session_id: String, model: String },
    /// The backend compacted its own context.
    CompactBoundary { compact_metadata: CompactMetadata },
    /// Free-form status notice (`status: "compacting"` is the one the
    /// tracker cares about).
    Status { status: String },
}

/// Terminal event of a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    /// Final response text / summary.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    /// Actual context window for the model in use, when the backend
    /// reports it. Overrides the catalog-inferred value.
    #[serde(default)]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// One message on the runtime stream.
///
/// Wire format is newline-delimited JSON with a `type` tag:
///
/// ```json
/// {"type":"system","subtype":"init","session_id":"S1","model":"sonnet"}
/// {"type":"assistant","text":"…","usage":{"input_tokens":1200,"output_tokens":40}}
/// {"type":"result","is_error":false,"result":"done"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeMessage {
    System(SystemMessage),
    Assistant {
        text: String,
        #[serde(default)]
        usage: Usage,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Result(ResultMessage),
}

impl RuntimeMessage {
    /// `true` for the stream-terminal `result` message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    pub fn init(session_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self::System(SystemMessage::Init {
            session_id: session_id.into(),
            model: model.into(),
        })
    }

    pub fn assistant(text: impl Into<String>, input_tokens: u64) -> Self {
        Self::Assistant {
            text: text.into(),
            usage: Usage {
                input_tokens,
                ..Usage::default()
            },
        }
    }

    pub fn result_ok(text: impl Into<String>) -> Self {
        Self::Result(ResultMessage {
            result: Some(text.into()),
            ..ResultMessage::default()
        })
    }

    pub fn result_err(text: impl Into<String>) -> Self {
        Self::Result(ResultMessage {
            is_error: true,
            result: Some(text.into()),
            ..ResultMessage::default()
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
