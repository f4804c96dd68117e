// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Connector state machine ──────────────────────────────────────────────────

/// Connector lifecycle:
/// `disconnected → connecting → connected → disconnecting → disconnected`,
/// with an error edge from any state back to `disconnected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectorState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: ConnectorState) -> bool {
        use ConnectorState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
                // error edge
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

// ─── Typed connector events ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLifecycle {
    Created,
    Resumed,
    Expired,
    Cleared,
}

/// Events a connector publishes to observers (fleet manager, tests).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Ready,
    Disconnect,
    Error(String),
    Message {
        channel_id: String,
        agent_name: String,
    },
    MessageIgnored {
        channel_id: String,
        reason: String,
    },
    CommandExecuted {
        channel_id: String,
        command: String,
    },
    SessionLifecycle {
        agent_name: String,
        conversation_key: String,
        event: SessionLifecycle,
    },
}

// ─── Inbound messages ─────────────────────────────────────────────────────────

/// What triggered a chat message event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Mention,
    DirectMessage,
    ChannelMessage,
}

/// A raw message delivered by a transport, before routing.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    pub message_id: String,
    pub user_id: String,
    pub text: String,
    pub was_mentioned: bool,
    /// Thread identifier when the platform has threads. Used only for
    /// reply grouping; the conversation key is always the channel id.
    pub thread_id: Option<String>,
    pub is_direct: bool,
}

impl InboundMessage {
    pub fn trigger_kind(&self) -> TriggerKind {
        if self.is_direct {
            TriggerKind::DirectMessage
        } else if self.was_mentioned {
            TriggerKind::Mention
        } else {
            TriggerKind::ChannelMessage
        }
    }
}

/// Metadata attached to a routed chat message event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageMetadata {
    pub platform: String,
    pub channel_id: String,
    pub message_id: String,
    pub user_id: String,
    pub was_mentioned: bool,
    pub trigger_kind: TriggerKind,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        use ConnectorState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
    }

    #[test]
    fn error_edges_drop_to_disconnected() {
        use ConnectorState::*;
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use ConnectorState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnecting.can_transition_to(Connected));
    }

    #[test]
    fn trigger_kind_prefers_direct_over_mention() {
        let msg = InboundMessage {
            channel_id: "C1".into(),
            message_id: "m1".into(),
            user_id: "U1".into(),
            text: "hi".into(),
            was_mentioned: true,
            thread_id: None,
            is_direct: true,
        };
        assert_eq!(msg.trigger_kind(), TriggerKind::DirectMessage);
    }
}
