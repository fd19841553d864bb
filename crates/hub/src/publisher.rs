use std::sync::Arc;

use shared::{
    domain::{ConversationId, GroupId, MessageId, UserId},
    protocol::{MessageSummary, ServerEvent},
};

use crate::broadcast::GroupBroadcastHub;

/// Facade for services outside the hub core (message pipeline, conversation
/// management, friendship) to push events without depending on hub
/// internals.
#[derive(Clone)]
pub struct NotificationPublisher {
    hub: Arc<GroupBroadcastHub>,
}

impl NotificationPublisher {
    pub fn new(hub: Arc<GroupBroadcastHub>) -> Self {
        Self { hub }
    }

    pub fn message_received(&self, conversation_id: ConversationId, message: MessageSummary) {
        self.hub.broadcast_to_group(
            &GroupId::conversation(conversation_id),
            &ServerEvent::ReceiveMessage { message },
        );
    }

    /// Full refreshed projection after a mutation (translation applied,
    /// star/unstar). Clients subscribed to the conversation see the new
    /// state without polling.
    pub fn message_updated(&self, conversation_id: ConversationId, message: MessageSummary) {
        self.hub.broadcast_to_group(
            &GroupId::conversation(conversation_id),
            &ServerEvent::ReceiveMessage { message },
        );
    }

    /// Lightweight signal that one language finished; sent alongside the
    /// full update because a client may be subscribed to one without having
    /// fetched the other.
    pub fn message_translated(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        language: &str,
    ) {
        self.hub.broadcast_to_group(
            &GroupId::conversation(conversation_id),
            &ServerEvent::MessageTranslated {
                conversation_id,
                message_id,
                sender_id,
                language: language.to_string(),
            },
        );
    }

    pub fn member_joined(&self, conversation_id: ConversationId, user_id: UserId, username: &str) {
        self.hub.broadcast_to_group(
            &GroupId::conversation(conversation_id),
            &ServerEvent::UserJoined {
                conversation_id,
                user_id,
                username: username.to_string(),
            },
        );
    }

    pub fn member_left(&self, conversation_id: ConversationId, user_id: UserId, username: &str) {
        self.hub.broadcast_to_group(
            &GroupId::conversation(conversation_id),
            &ServerEvent::UserLeft {
                conversation_id,
                user_id,
                username: username.to_string(),
            },
        );
    }

    /// Training completion concerns exactly one user; delivered to all of
    /// their devices, nobody else.
    pub fn training_completed(&self, user_id: UserId, model_id: &str, success: bool) {
        self.hub.send_to_user(
            user_id,
            &ServerEvent::VoiceTrainingCompleted {
                user_id,
                model_id: model_id.to_string(),
                success,
            },
        );
    }
}
