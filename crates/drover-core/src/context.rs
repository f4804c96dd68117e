// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context tracker: watches the runtime stream and decides when a session
//! is close enough to context exhaustion that the job must hand off.

use drover_runtime::{catalog, RuntimeMessage, SystemMessage};

/// Tracks cumulative input tokens against the model's context window.
///
/// The handoff signal is edge-triggered: once `should_handoff()` returns
/// `true` it latches and never fires again for this tracker instance. The
/// executor resets the tracker (keeping model/window) after each handoff.
#[derive(Debug, Clone)]
pub struct ContextTracker {
    /// Fraction of the window that must remain; at or below it, hand off.
    threshold: f64,
    model_name: Option<String>,
    context_window_size: Option<u64>,
    last_input_tokens: u64,
    is_compacting: bool,
    handoff_triggered: bool,
}

impl ContextTracker {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            model_name: None,
            context_window_size: None,
            last_input_tokens: 0,
            is_compacting: false,
            handoff_triggered: false,
        }
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn context_window_size(&self) -> Option<u64> {
        self.context_window_size
    }

    pub fn last_input_tokens(&self) -> u64 {
        self.last_input_tokens
    }

    /// Fraction of the window used, when the window is known.
    pub fn usage_fraction(&self) -> Option<f64> {
        let window = self.context_window_size?;
        if window == 0 {
            return None;
        }
        Some(self.last_input_tokens as f64 / window as f64)
    }

    /// Feed one runtime message through the tracker.
    pub fn observe(&mut self, msg: &RuntimeMessage) {
        match msg {
            RuntimeMessage::System(SystemMessage::Init { model, .. }) => {
                self.model_name = Some(model.clone());
                if self.context_window_size.is_none() {
                    self.context_window_size = Some(catalog::context_window_or_default(model));
                }
            }
            RuntimeMessage::Assistant { usage, .. } => {
                if usage.input_tokens > 0 {
                    self.last_input_tokens = usage.input_tokens;
                }
                // The backend finished whatever compaction it announced.
                self.is_compacting = false;
            }
            RuntimeMessage::System(SystemMessage::CompactBoundary { compact_metadata }) => {
                self.last_input_tokens = compact_metadata.pre_tokens;
            }
            RuntimeMessage::System(SystemMessage::Status { status }) => {
                if status == "compacting" {
                    self.is_compacting = true;
                }
            }
            RuntimeMessage::Result(result) => {
                if let Some(window) = result.context_window {
                    self.context_window_size = Some(window);
                }
            }
            RuntimeMessage::ToolUse { .. } | RuntimeMessage::ToolResult { .. } => {}
        }
    }

    /// `true` exactly once, when the remaining window fraction drops to or
    /// below the threshold. Never fires while the backend is compacting
    /// (its own compaction may bring the count back down).
    pub fn should_handoff(&mut self) -> bool {
        if self.handoff_triggered || self.is_compacting {
            return false;
        }
        let Some(window) = self.context_window_size else {
            return false;
        };
        if window == 0 || self.last_input_tokens == 0 {
            return false;
        }
        let remaining = 1.0 - (self.last_input_tokens as f64 / window as f64);
        if remaining <= self.threshold {
            self.handoff_triggered = true;
            return true;
        }
        false
    }

    /// Reset after a handoff: keep the model and window, clear token
    /// state, compaction flag, and the latch.
    pub fn reset(&mut self) {
        self.last_input_tokens = 0;
        self.is_compacting = false;
        self.handoff_triggered = false;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
