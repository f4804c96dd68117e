// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-window catalog: static metadata for known model families.
//!
//! The tracker needs a window size before the first `result` message can
//! confirm one, so it infers from the model name announced in `init`.
//! Matching is by substring so provider-prefixed ids (`anthropic/claude-…`)
//! and dated releases resolve without an exhaustive list.

/// Window applied when the model is not in the catalog.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// (name fragment, context window). First match wins, so more specific
/// fragments must precede the family fragment they contain.
static WINDOWS: &[(&str, u64)] = &[
    ("claude-3-5-haiku", 200_000),
    ("claude-3-haiku", 200_000),
    ("haiku", 200_000),
    ("sonnet", 200_000),
    ("opus", 200_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("o3-mini", 200_000),
    ("o3", 200_000),
    ("gemini-1.5-pro", 2_000_000),
    ("gemini", 1_000_000),
];

/// Infer the context window for a model name. `None` when the name matches
/// nothing; callers usually fall back to [`DEFAULT_CONTEXT_WINDOW`].
pub fn context_window_for(model: &str) -> Option<u64> {
    let lower = model.to_ascii_lowercase();
    WINDOWS
        .iter()
        .find(|(fragment, _)| lower.contains(fragment))
        .map(|(_, window)| *window)
}

/// Window for a model, defaulted.
pub fn context_window_or_default(model: &str) -> u64 {
    context_window_for(model).unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_families_resolve() {
        assert_eq!(context_window_for("claude-sonnet-4-5"), Some(200_000));
        assert_eq!(context_window_for("gpt-4o-2024-08-06"), Some(128_000));
        assert_eq!(context_window_for("gemini-1.5-pro-002"), Some(2_000_000));
    }

    #[test]
    fn provider_prefixes_are_tolerated() {
        assert_eq!(
            context_window_for("anthropic/claude-opus-4-6"),
            Some(200_000)
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(context_window_for("Claude-Sonnet"), Some(200_000));
    }

    #[test]
    fn specific_fragment_beats_family() {
        // gpt-4o must not fall through to the 8k gpt-4 entry.
        assert_eq!(context_window_for("gpt-4o"), Some(128_000));
        assert_eq!(context_window_for("gpt-4-0613"), Some(8_192));
    }

    #[test]
    fn unknown_model_defaults() {
        assert_eq!(context_window_for("mystery-model"), None);
        assert_eq!(context_window_or_default("mystery-model"), 200_000);
    }
}
