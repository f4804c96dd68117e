// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{ExecuteRequest, MessageStream, ResultMessage, RuntimeAdapter, RuntimeMessage, Usage};

/// A pre-scripted runtime. Each `execute` call pops the next message script
/// from the front of the queue. Tests specify exact stream contents,
/// including handoff-provoking token bursts, without any backend.
pub struct ScriptedRuntime {
    scripts: Arc<Mutex<Vec<Vec<RuntimeMessage>>>>,
    /// Every `ExecuteRequest` seen, in order. Tests inspect prompts,
    /// resume ids, and injected tools.
    pub requests: Arc<Mutex<Vec<ExecuteRequest>>>,
}

impl ScriptedRuntime {
    /// Build a runtime from an ordered list of session scripts.
    pub fn new(scripts: Vec<Vec<RuntimeMessage>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: one session that inits and returns a single result.
    pub fn single_result(text: impl Into<String>) -> Self {
        Self::new(vec![vec![
            RuntimeMessage::init("scripted-session", "mock"),
            RuntimeMessage::result_ok(text),
        ]])
    }

    /// Convenience: a full session script with explicit id, model, assistant
    /// turns (cumulative input tokens each), and final result text.
    pub fn session(
        session_id: &str,
        model: &str,
        turns: &[(&str, u64)],
        result: &str,
    ) -> Vec<RuntimeMessage> {
        let mut script = vec![RuntimeMessage::init(session_id, model)];
        for (text, input_tokens) in turns {
            script.push(RuntimeMessage::assistant(*text, *input_tokens));
        }
        script.push(RuntimeMessage::Result(ResultMessage {
            session_id: Some(session_id.to_string()),
            result: Some(result.to_string()),
            usage: Some(Usage {
                input_tokens: turns.last().map(|(_, t)| *t).unwrap_or(0),
                ..Usage::default()
            }),
            ..ResultMessage::default()
        }));
        script
    }

    /// Number of `execute` calls observed so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The prompt of the n-th `execute` call.
    pub fn prompt_of(&self, n: usize) -> Option<String> {
        self.requests.lock().unwrap().get(n).map(|r| r.prompt.clone())
    }
}

#[async_trait]
impl RuntimeAdapter for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, req: ExecuteRequest) -> anyhow::Result<MessageStream> {
        self.requests.lock().unwrap().push(req);
        let messages = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Fallback once all scripts are consumed
                vec![
                    RuntimeMessage::init("scripted-exhausted", "mock"),
                    RuntimeMessage::result_ok("[no more scripts]"),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<RuntimeMessage>> = messages.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
