// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming responder: converts a running stream of assistant text into a
//! paced, chunked sequence of chat posts.
//!
//! Splits happen on natural boundaries (blank line, sentence end, line
//! end) and never corrupt Markdown code fences: a split inside an open
//! fence closes it at the cut and reopens it, with the same language tag,
//! at the start of the next chunk.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::ChannelHandle;

// ─── Fence tracking ───────────────────────────────────────────────────────────

/// If `text` ends inside an open code fence, returns the fence's language
/// tag (possibly empty).
pub fn open_fence(text: &str) -> Option<String> {
    let mut open: Option<String> = None;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            open = match open {
                None => Some(rest.trim().to_string()),
                Some(_) => None,
            };
        }
    }
    open
}

// ─── Splitting ────────────────────────────────────────────────────────────────

/// Find the byte index (≤ `max`, on a char boundary) to split `text` at.
/// Preference order: after a blank line, after a sentence terminator
/// followed by whitespace, after a line break, hard cut.
fn find_split_point(text: &str, max: usize) -> usize {
    if text.len() <= max {
        return text.len();
    }
    let mut boundary = max;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let window = &text[..boundary];

    if let Some(idx) = window.rfind("\n\n") {
        if idx > 0 {
            return idx + 2;
        }
    }
    let bytes = window.as_bytes();
    for i in (1..bytes.len()).rev() {
        if matches!(bytes[i - 1], b'.' | b'!' | b'?') && bytes[i].is_ascii_whitespace() {
            return i + 1;
        }
    }
    if let Some(idx) = window.rfind('\n') {
        if idx > 0 {
            return idx + 1;
        }
    }
    boundary.max(1)
}

/// Split `text` into chunks of at most ~`max` bytes, preserving code
/// fences across the cuts. Concatenating the chunks and removing each
/// auto-inserted ```` ```\n```<lang>\n ```` pair reproduces the input.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text.to_string();

    while rest.len() > max {
        let idx = find_split_point(&rest, max);
        let mut chunk = rest[..idx].to_string();
        let mut remainder = rest[idx..].to_string();
        if let Some(lang) = open_fence(&chunk) {
            if !chunk.ends_with('\n') {
                chunk.push('\n');
            }
            chunk.push_str("```\n");
            remainder = format!("```{lang}\n{remainder}");
        }
        chunks.push(chunk);
        rest = remainder;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Whether the buffer ends on a boundary worth flushing at.
fn ends_on_natural_break(text: &str) -> bool {
    let trimmed = text.trim_end_matches(' ');
    trimmed.ends_with("\n\n")
        || trimmed
            .chars()
            .last()
            .is_some_and(|c| matches!(c, '.' | '!' | '?'))
}

// ─── Responder ────────────────────────────────────────────────────────────────

pub struct StreamingResponder {
    channel: ChannelHandle,
    max_buffer_size: usize,
    min_message_interval: Duration,
    buffer: String,
    last_send: Option<Instant>,
    sent_any: bool,
}

impl StreamingResponder {
    pub fn new(
        channel: ChannelHandle,
        max_buffer_size: usize,
        min_message_interval: Duration,
    ) -> Self {
        Self {
            channel,
            max_buffer_size,
            min_message_interval,
            buffer: String::new(),
            last_send: None,
            sent_any: false,
        }
    }

    /// Append streamed text and send whatever is ready.
    pub async fn add_message_and_send(&mut self, chunk: &str) -> anyhow::Result<()> {
        self.buffer.push_str(chunk);

        if self.buffer.len() >= self.max_buffer_size {
            let mut pieces = split_message(&self.buffer, self.max_buffer_size);
            // The tail stays buffered; it may still grow to a natural break.
            let tail = pieces.pop().unwrap_or_default();
            for piece in pieces {
                self.send_one(&piece).await?;
            }
            self.buffer = tail;
        } else if ends_on_natural_break(&self.buffer) && open_fence(&self.buffer).is_none() {
            let text = std::mem::take(&mut self.buffer);
            if !text.trim().is_empty() {
                self.send_one(&text).await?;
            }
        }
        Ok(())
    }

    /// Emit any residual buffer.
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        let text = std::mem::take(&mut self.buffer);
        if text.trim().is_empty() {
            return Ok(());
        }
        for piece in split_message(&text, self.max_buffer_size) {
            self.send_one(&piece).await?;
        }
        Ok(())
    }

    pub fn has_sent_messages(&self) -> bool {
        self.sent_any
    }

    /// Send one post, pacing from the time of the last successful send.
    async fn send_one(&mut self, text: &str) -> anyhow::Result<()> {
        if let Some(last) = self.last_send {
            let elapsed = last.elapsed();
            if elapsed < self.min_message_interval {
                tokio::time::sleep(self.min_message_interval - elapsed).await;
            }
        }
        debug!(
            channel = %self.channel.channel_id,
            bytes = text.len(),
            "sending chat chunk"
        );
        self.channel.reply(text).await?;
        self.last_send = Some(Instant::now());
        self.sent_any = true;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::RecordingTransport;

    /// Strip auto-inserted close/reopen pairs so the concatenation can be
    /// compared with the original input.
    fn unsplit(chunks: &[String]) -> String {
        let mut joined = chunks.concat();
        loop {
            let Some(idx) = joined.find("```\n```") else {
                break;
            };
            // Remove "```\n" and the following "```<lang>\n".
            let after_close = idx + 4;
            let Some(line_end) = joined[after_close..].find('\n') else {
                break;
            };
            joined.replace_range(idx..after_close + line_end + 1, "");
        }
        joined
    }

    #[test]
    fn open_fence_detects_language() {
        assert_eq!(open_fence("```python\ncode"), Some("python".into()));
        assert_eq!(open_fence("```python\ncode\n```\n"), None);
        assert_eq!(open_fence("plain text"), None);
        assert_eq!(open_fence("```\nanon"), Some(String::new()));
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello".to_string()]);
    }

    #[test]
    fn splits_prefer_blank_lines() {
        let text = "first paragraph.\n\nsecond paragraph that continues for a while";
        let chunks = split_message(text, 30);
        assert_eq!(chunks[0], "first paragraph.\n\n");
    }

    #[test]
    fn split_preserves_code_fence() {
        let text = "Here is code:\n```python\ndef f():\n    return 1\n```\nDone.";
        let chunks = split_message(text, 30);
        assert!(chunks.len() > 1);
        // Every chunk is fence-balanced on its own.
        for chunk in &chunks {
            assert!(open_fence(chunk).is_none(), "unbalanced chunk: {chunk:?}");
        }
        assert_eq!(unsplit(&chunks), text);
    }

    #[test]
    fn long_fenced_block_reopens_with_language() {
        let code = (0..40).map(|i| format!("line_{i} = {i}")).collect::<Vec<_>>();
        let text = format!("```rust\n{}\n```\n", code.join("\n"));
        let chunks = split_message(&text, 120);
        assert!(chunks.len() > 2);
        for chunk in &chunks[1..] {
            assert!(chunk.starts_with("```rust\n"), "chunk: {chunk:?}");
        }
        assert_eq!(unsplit(&chunks), text);
    }

    #[test]
    fn natural_break_detection() {
        assert!(ends_on_natural_break("Sentence over."));
        assert!(ends_on_natural_break("para\n\n"));
        assert!(!ends_on_natural_break("trailing words"));
    }

    fn responder(transport: &Arc<RecordingTransport>, max: usize) -> StreamingResponder {
        StreamingResponder::new(
            ChannelHandle::new(transport.clone(), "C1"),
            max,
            Duration::from_millis(0),
        )
    }

    #[tokio::test]
    async fn sends_on_sentence_boundary() {
        let transport = Arc::new(RecordingTransport::new("slack"));
        let mut r = responder(&transport, 1000);
        r.add_message_and_send("working on it").await.unwrap();
        assert!(!r.has_sent_messages(), "mid-sentence text stays buffered");
        r.add_message_and_send(", almost done.").await.unwrap();
        assert!(r.has_sent_messages());
        assert_eq!(transport.sent_texts(), vec!["working on it, almost done."]);
        r.add_message_and_send(" Next step").await.unwrap();
        r.flush().await.unwrap();
        assert_eq!(
            transport.sent_texts(),
            vec!["working on it, almost done.", " Next step"]
        );
    }

    #[tokio::test]
    async fn holds_inside_open_fence_until_closed() {
        let transport = Arc::new(RecordingTransport::new("slack"));
        let mut r = responder(&transport, 1000);
        r.add_message_and_send("```rust\nlet x = 1.").await.unwrap();
        assert!(!r.has_sent_messages(), "never flush mid-fence on a natural break");
        r.add_message_and_send("\n```\nDone.").await.unwrap();
        assert!(r.has_sent_messages());
    }

    #[tokio::test]
    async fn oversized_buffer_is_split_and_tail_buffered() {
        let transport = Arc::new(RecordingTransport::new("slack"));
        let mut r = responder(&transport, 40);
        let text = "one sentence here. two sentence here. three sentence tail";
        r.add_message_and_send(text).await.unwrap();
        assert!(r.has_sent_messages());
        r.flush().await.unwrap();
        let joined = transport.sent_texts().concat();
        assert_eq!(joined, text);
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_a_no_op() {
        let transport = Arc::new(RecordingTransport::new("slack"));
        let mut r = responder(&transport, 40);
        r.flush().await.unwrap();
        assert!(!r.has_sent_messages());
        assert!(transport.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn pacing_orders_sends() {
        tokio::time::pause();
        let transport = Arc::new(RecordingTransport::new("slack"));
        let mut r = StreamingResponder::new(
            ChannelHandle::new(transport.clone(), "C1"),
            1000,
            Duration::from_secs(2),
        );
        r.add_message_and_send("first.").await.unwrap();
        let before = Instant::now();
        r.add_message_and_send(" second.").await.unwrap();
        // The paused clock only advances through the responder's sleep.
        assert!(before.elapsed() >= Duration::from_secs(2));
        assert_eq!(transport.sent_texts().len(), 2);
    }
}
