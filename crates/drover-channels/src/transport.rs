// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The transport capability: the small surface a concrete platform SDK
//! binding must provide. Everything above it (routing, commands, pacing,
//! sessions) is platform-agnostic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::InboundMessage;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Platform name; doubles as the conversation-key-store namespace.
    fn platform(&self) -> &str;

    /// Open the connection and return the inbound message stream. The
    /// receiver closing signals disconnect.
    async fn connect(&self) -> anyhow::Result<mpsc::Receiver<InboundMessage>>;

    async fn disconnect(&self);

    async fn send_message(&self, channel_id: &str, text: &str) -> anyhow::Result<()>;

    async fn upload_file(
        &self,
        channel_id: &str,
        filename: &str,
        bytes: Vec<u8>,
        message: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Toggle the typing indicator. Platforms without one ignore this.
    async fn set_typing(&self, channel_id: &str, on: bool) -> anyhow::Result<()>;

    /// The connector's own user id, for self-message suppression.
    fn api_user_id(&self) -> Option<String> {
        None
    }
}

// ─── Channel handle ───────────────────────────────────────────────────────────

/// Reply capabilities bound to one originating channel. Cheap to clone;
/// handed to job executors and hooks so they can answer where the trigger
/// came from without knowing the platform.
#[derive(Clone)]
pub struct ChannelHandle {
    pub platform: String,
    pub channel_id: String,
    transport: Arc<dyn ChatTransport>,
}

impl ChannelHandle {
    pub fn new(transport: Arc<dyn ChatTransport>, channel_id: impl Into<String>) -> Self {
        Self {
            platform: transport.platform().to_string(),
            channel_id: channel_id.into(),
            transport,
        }
    }

    pub async fn reply(&self, text: &str) -> anyhow::Result<()> {
        self.transport.send_message(&self.channel_id, text).await
    }

    pub async fn reply_with_file(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        message: Option<&str>,
    ) -> anyhow::Result<()> {
        self.transport
            .upload_file(&self.channel_id, filename, bytes, message)
            .await
    }

    /// Start a typing indicator keepalive. Dropping the returned guard
    /// stops it.
    pub fn indicator(&self) -> IndicatorGuard {
        let transport = self.transport.clone();
        let channel = self.channel_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                let _ = transport.set_typing(&channel, true).await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
        IndicatorGuard {
            handle,
            transport: self.transport.clone(),
            channel_id: self.channel_id.clone(),
        }
    }

    pub fn transport(&self) -> Arc<dyn ChatTransport> {
        self.transport.clone()
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("platform", &self.platform)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

pub struct IndicatorGuard {
    handle: tokio::task::JoinHandle<()>,
    transport: Arc<dyn ChatTransport>,
    channel_id: String,
}

impl Drop for IndicatorGuard {
    fn drop(&mut self) {
        self.handle.abort();
        let transport = self.transport.clone();
        let channel = self.channel_id.clone();
        tokio::spawn(async move {
            let _ = transport.set_typing(&channel, false).await;
        });
    }
}

// ─── Test transport ───────────────────────────────────────────────────────────

/// In-memory transport used by tests across the workspace: records every
/// outgoing message and lets the test inject inbound ones.
pub struct RecordingTransport {
    platform: String,
    pub sent: std::sync::Mutex<Vec<(String, String)>>,
    pub uploads: std::sync::Mutex<Vec<(String, String)>>,
    inbound_tx: std::sync::Mutex<Option<mpsc::Sender<InboundMessage>>>,
    api_user_id: Option<String>,
}

impl RecordingTransport {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            sent: std::sync::Mutex::new(Vec::new()),
            uploads: std::sync::Mutex::new(Vec::new()),
            inbound_tx: std::sync::Mutex::new(None),
            api_user_id: None,
        }
    }

    pub fn with_api_user_id(mut self, id: impl Into<String>) -> Self {
        self.api_user_id = Some(id.into());
        self
    }

    /// Inject an inbound message as if the platform delivered it.
    pub async fn inject(&self, msg: InboundMessage) {
        let tx = self.inbound_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(msg).await;
        }
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn connect(&self) -> anyhow::Result<mpsc::Receiver<InboundMessage>> {
        let (tx, rx) = mpsc::channel(64);
        *self.inbound_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) {
        *self.inbound_tx.lock().unwrap() = None;
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn upload_file(
        &self,
        channel_id: &str,
        filename: &str,
        _bytes: Vec<u8>,
        _message: Option<&str>,
    ) -> anyhow::Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((channel_id.to_string(), filename.to_string()));
        Ok(())
    }

    async fn set_typing(&self, _channel_id: &str, _on: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn api_user_id(&self) -> Option<String> {
        self.api_user_id.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
