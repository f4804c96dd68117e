// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-job tool server.
//!
//! Built fresh for every job from a capability record closing over the
//! job's live context (working directory, originating channel). There is
//! no global tool registry: the executor passes these tools into the
//! runtime request and they die with the job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use drover_channels::ChannelHandle;
use drover_runtime::{RuntimeTool, ToolResponse};

/// Capability record for one job.
#[derive(Clone)]
pub struct JobToolContext {
    pub job_id: String,
    pub agent_name: String,
    pub working_directory: PathBuf,
    /// Present for chat-triggered jobs: where replies and uploads go.
    pub channel: Option<ChannelHandle>,
}

/// Tools injected into the runtime for this job. Tools that need a
/// capability the job does not have are simply absent.
pub fn build_job_tools(ctx: &JobToolContext) -> Vec<Arc<dyn RuntimeTool>> {
    let mut tools: Vec<Arc<dyn RuntimeTool>> = Vec::new();
    if ctx.channel.is_some() {
        tools.push(Arc::new(SendFileTool { ctx: ctx.clone() }));
    }
    tools
}

// ─── send_file ────────────────────────────────────────────────────────────────

/// Upload a file from the job's working directory to the originating
/// chat channel.
struct SendFileTool {
    ctx: JobToolContext,
}

/// Resolve `file_path` against `root` and refuse anything that escapes it.
/// Canonicalisation resolves `..` and symlinks before the containment
/// check, so a symlink pointing outside the workspace is rejected too.
fn resolve_within(root: &Path, file_path: &str) -> Result<PathBuf, String> {
    let candidate = {
        let p = Path::new(file_path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    };
    let canonical_root = root
        .canonicalize()
        .map_err(|e| format!("working directory unavailable: {e}"))?;
    let canonical = candidate
        .canonicalize()
        .map_err(|e| format!("cannot resolve '{file_path}': {e}"))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(format!("'{file_path}' is outside the working directory"));
    }
    Ok(canonical)
}

#[async_trait]
impl RuntimeTool for SendFileTool {
    fn name(&self) -> &str {
        "send_file"
    }

    fn description(&self) -> &str {
        "Send a file from the working directory to the chat channel that triggered this job"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory"
                },
                "message": {
                    "type": "string",
                    "description": "Optional message posted with the file"
                },
                "filename": {
                    "type": "string",
                    "description": "Optional display name; defaults to the file's own name"
                }
            },
            "required": ["file_path"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> ToolResponse {
        let Some(file_path) = args["file_path"].as_str() else {
            return ToolResponse::err("send_file: 'file_path' is required");
        };
        let Some(channel) = &self.ctx.channel else {
            return ToolResponse::err("send_file: this job has no originating chat channel");
        };

        let resolved = match resolve_within(&self.ctx.working_directory, file_path) {
            Ok(p) => p,
            Err(e) => return ToolResponse::err(format!("send_file: {e}")),
        };
        let bytes = match tokio::fs::read(&resolved).await {
            Ok(b) => b,
            Err(e) => {
                return ToolResponse::err(format!("send_file: reading '{file_path}': {e}"))
            }
        };
        let filename = args["filename"]
            .as_str()
            .map(String::from)
            .or_else(|| {
                resolved
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "file".to_string());

        debug!(
            job = %self.ctx.job_id,
            file = %resolved.display(),
            bytes = bytes.len(),
            "uploading file to chat"
        );
        match channel
            .reply_with_file(&filename, bytes, args["message"].as_str())
            .await
        {
            Ok(()) => ToolResponse::ok(format!("uploaded '{filename}' to the channel")),
            Err(e) => ToolResponse::err(format!("send_file: upload failed: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
