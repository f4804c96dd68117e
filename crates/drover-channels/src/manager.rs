// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Chat manager: owns one connector and routes platform messages to
//! agents.
//!
//! Two shapes share this type. A **shared** connector carries one
//! workspace identity and routes by a channel→agent map derived from
//! configuration; messages in unmapped channels are ignored. A
//! **per-agent** connector belongs to a single agent, which receives every
//! channel the connector sees (optionally restricted to its configured
//! channel list).
//!
//! Within one channel, messages are processed strictly in arrival order:
//! each channel gets a mailbox task that drains sequentially. The
//! conversation key is the channel id; threads group replies, nothing
//! else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use drover_config::FleetConfig;

use crate::{
    commands::{help_text, parse_command},
    ChannelHandle, ChatMessageMetadata, ChatTransport, ConnectorEvent, ConnectorState,
    InboundMessage, SessionLifecycle,
};

// ─── Routed event ─────────────────────────────────────────────────────────────

/// A platform message resolved to an agent, ready for the fleet.
#[derive(Debug, Clone)]
pub struct ChatMessageEvent {
    pub agent_name: String,
    pub prompt: String,
    pub metadata: ChatMessageMetadata,
    /// Reply/upload/indicator capabilities bound to the originating channel.
    pub channel: ChannelHandle,
}

/// What the manager needs from the fleet. Implemented by the fleet
/// manager; tests provide lightweight fakes.
#[async_trait]
pub trait ChatEventHandler: Send + Sync {
    /// Run the agent for one routed message. Errors are posted back to the
    /// channel as a short notice.
    async fn handle_message(&self, event: ChatMessageEvent) -> anyhow::Result<()>;

    /// Clear the conversation key for (platform, agent, channel).
    /// Returns whether a session existed.
    async fn clear_conversation(&self, platform: &str, agent: &str, channel_id: &str) -> bool;

    /// One-line fleet status for the `status` command.
    async fn status_summary(&self) -> String;
}

// ─── Routing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AgentRoute {
    pub agent_name: String,
    pub require_mention: bool,
    /// Per-agent connectors: restrict to these channels (empty = all).
    pub channels: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Routing {
    /// One identity, many agents: route by channel id.
    Shared {
        channel_to_agent: HashMap<String, AgentRoute>,
    },
    /// One identity per agent.
    PerAgent { route: AgentRoute },
}

impl Routing {
    /// Derive the shared-connector channel map for `platform` from agent
    /// chat configs.
    pub fn shared_from_config(platform: &str, config: &FleetConfig) -> Self {
        let mut channel_to_agent = HashMap::new();
        for (name, agent) in &config.agents {
            let Some(chat) = &agent.chat else { continue };
            let listens = chat.platforms.is_empty() || chat.platforms.iter().any(|p| p == platform);
            if !listens {
                continue;
            }
            for channel in &chat.channels {
                channel_to_agent.insert(
                    channel.clone(),
                    AgentRoute {
                        agent_name: name.clone(),
                        require_mention: chat.require_mention,
                        channels: chat.channels.clone(),
                    },
                );
            }
        }
        Self::Shared { channel_to_agent }
    }

    fn resolve(&self, msg: &InboundMessage) -> Result<AgentRoute, &'static str> {
        match self {
            Self::Shared { channel_to_agent } => channel_to_agent
                .get(&msg.channel_id)
                .cloned()
                .ok_or("unmapped_channel"),
            Self::PerAgent { route } => {
                if !route.channels.is_empty() && !route.channels.contains(&msg.channel_id) {
                    return Err("channel_not_listened");
                }
                Ok(route.clone())
            }
        }
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct ChatManager {
    platform: String,
    command_prefix: String,
    transport: Arc<dyn ChatTransport>,
    routing: Routing,
    handler: Arc<dyn ChatEventHandler>,
    state: Arc<StdMutex<ConnectorState>>,
    events: broadcast::Sender<ConnectorEvent>,
    mailboxes: Arc<Mutex<HashMap<String, mpsc::Sender<(AgentRoute, InboundMessage)>>>>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ChatManager {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        routing: Routing,
        handler: Arc<dyn ChatEventHandler>,
        command_prefix: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            platform: transport.platform().to_string(),
            command_prefix: command_prefix.into(),
            transport,
            routing,
            handler,
            state: Arc::new(StdMutex::new(ConnectorState::Disconnected)),
            events,
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn state(&self) -> ConnectorState {
        *self.state.lock().unwrap()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    fn transition(&self, next: ConnectorState) {
        let mut state = self.state.lock().unwrap();
        if state.can_transition_to(next) {
            *state = next;
        } else {
            warn!(platform = %self.platform, from = ?*state, to = ?next, "illegal connector transition");
        }
    }

    /// Connect the transport and start dispatching.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transition(ConnectorState::Connecting);
        let mut rx = match self.transport.connect().await {
            Ok(rx) => rx,
            Err(e) => {
                self.transition(ConnectorState::Disconnected);
                let _ = self.events.send(ConnectorEvent::Error(e.to_string()));
                return Err(e);
            }
        };
        self.transition(ConnectorState::Connected);
        let _ = self.events.send(ConnectorEvent::Ready);
        info!(platform = %self.platform, "chat connector ready");

        let manager = self.dispatch_context();
        let state = self.state.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                manager.dispatch(msg).await;
            }
            *state.lock().unwrap() = ConnectorState::Disconnected;
            let _ = events.send(ConnectorEvent::Disconnect);
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    pub async fn stop(&self) {
        self.transition(ConnectorState::Disconnecting);
        self.transport.disconnect().await;
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.mailboxes.lock().await.clear();
        // The dispatch task may already have observed the closed stream
        // and dropped the state to disconnected; setting directly avoids a
        // spurious illegal-transition warning in that race.
        *self.state.lock().unwrap() = ConnectorState::Disconnected;
        let _ = self.events.send(ConnectorEvent::Disconnect);
    }

    fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            platform: self.platform.clone(),
            command_prefix: self.command_prefix.clone(),
            transport: self.transport.clone(),
            routing: self.routing.clone(),
            handler: self.handler.clone(),
            events: self.events.clone(),
            mailboxes: self.mailboxes.clone(),
        }
    }
}

/// The clonable part of the manager the dispatch task runs on.
#[derive(Clone)]
struct DispatchContext {
    platform: String,
    command_prefix: String,
    transport: Arc<dyn ChatTransport>,
    routing: Routing,
    handler: Arc<dyn ChatEventHandler>,
    events: broadcast::Sender<ConnectorEvent>,
    mailboxes: Arc<Mutex<HashMap<String, mpsc::Sender<(AgentRoute, InboundMessage)>>>>,
}

impl DispatchContext {
    async fn dispatch(&self, msg: InboundMessage) {
        // Never react to our own posts.
        if let Some(self_id) = self.transport.api_user_id() {
            if msg.user_id == self_id {
                return;
            }
        }

        let route = match self.routing.resolve(&msg) {
            Ok(route) => route,
            Err(reason) => {
                debug!(platform = %self.platform, channel = %msg.channel_id, reason, "message ignored");
                let _ = self.events.send(ConnectorEvent::MessageIgnored {
                    channel_id: msg.channel_id.clone(),
                    reason: reason.to_string(),
                });
                return;
            }
        };

        if let Some(cmd) = parse_command(&self.command_prefix, &msg.text) {
            self.run_command(&route, &msg, &cmd.name).await;
            return;
        }

        if route.require_mention && !msg.was_mentioned && !msg.is_direct {
            let _ = self.events.send(ConnectorEvent::MessageIgnored {
                channel_id: msg.channel_id.clone(),
                reason: "mention_required".to_string(),
            });
            return;
        }

        self.enqueue(route, msg).await;
    }

    async fn run_command(&self, route: &AgentRoute, msg: &InboundMessage, name: &str) {
        let channel = ChannelHandle::new(self.transport.clone(), msg.channel_id.clone());
        let reply = match name {
            "help" => help_text(&self.command_prefix),
            "reset" => {
                let existed = self
                    .handler
                    .clear_conversation(&self.platform, &route.agent_name, &msg.channel_id)
                    .await;
                let _ = self.events.send(ConnectorEvent::SessionLifecycle {
                    agent_name: route.agent_name.clone(),
                    conversation_key: msg.channel_id.clone(),
                    event: SessionLifecycle::Cleared,
                });
                if existed {
                    "Conversation cleared. The next message starts fresh.".to_string()
                } else {
                    "No active conversation to clear.".to_string()
                }
            }
            "status" => self.handler.status_summary().await,
            unknown => format!("Unknown command `{unknown}`.\n{}", help_text(&self.command_prefix)),
        };
        if let Err(e) = channel.reply(&reply).await {
            warn!(platform = %self.platform, error = %e, "posting command reply failed");
        }
        let _ = self.events.send(ConnectorEvent::CommandExecuted {
            channel_id: msg.channel_id.clone(),
            command: name.to_string(),
        });
    }

    /// Hand the message to the channel's mailbox, creating the mailbox
    /// worker on first use. One worker per channel keeps per-channel
    /// ordering strict.
    async fn enqueue(&self, route: AgentRoute, msg: InboundMessage) {
        let mut mailboxes = self.mailboxes.lock().await;
        let tx = mailboxes
            .entry(msg.channel_id.clone())
            .or_insert_with(|| self.spawn_mailbox())
            .clone();
        drop(mailboxes);
        if tx.send((route, msg)).await.is_err() {
            warn!(platform = %self.platform, "mailbox worker gone, message dropped");
        }
    }

    fn spawn_mailbox(&self) -> mpsc::Sender<(AgentRoute, InboundMessage)> {
        let (tx, mut rx) = mpsc::channel::<(AgentRoute, InboundMessage)>(64);
        let ctx = self.clone();
        tokio::spawn(async move {
            while let Some((route, msg)) = rx.recv().await {
                ctx.process(route, msg).await;
            }
        });
        tx
    }

    async fn process(&self, route: AgentRoute, msg: InboundMessage) {
        let channel = ChannelHandle::new(self.transport.clone(), msg.channel_id.clone());
        let event = ChatMessageEvent {
            agent_name: route.agent_name.clone(),
            prompt: msg.text.clone(),
            metadata: ChatMessageMetadata {
                platform: self.platform.clone(),
                channel_id: msg.channel_id.clone(),
                message_id: msg.message_id.clone(),
                user_id: msg.user_id.clone(),
                was_mentioned: msg.was_mentioned,
                trigger_kind: msg.trigger_kind(),
            },
            channel: channel.clone(),
        };
        let _ = self.events.send(ConnectorEvent::Message {
            channel_id: msg.channel_id.clone(),
            agent_name: route.agent_name.clone(),
        });
        if let Err(e) = self.handler.handle_message(event).await {
            warn!(
                platform = %self.platform,
                agent = %route.agent_name,
                error = %e,
                "chat message handling failed"
            );
            let _ = channel
                .reply(&format!("⚠️ Something went wrong handling that: {e}"))
                .await;
            let _ = self.events.send(ConnectorEvent::Error(e.to_string()));
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
