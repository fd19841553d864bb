use std::sync::Arc;

use shared::{
    domain::{CallType, ConnectionId, ConversationId, GroupId, UserId},
    protocol::ServerEvent,
};

use crate::{broadcast::GroupBroadcastHub, registry::ConnectionRegistry};

/// Read-only view of an active call, computed from call-group membership.
/// There is no separately stored call entity; the call exists exactly as
/// long as its group has members.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub conversation_id: ConversationId,
    pub participants: Vec<UserId>,
}

impl CallSession {
    pub fn is_active(&self) -> bool {
        !self.participants.is_empty()
    }
}

/// WebRTC signaling over hub groups: call membership events, invitations,
/// and opaque offer/answer/ICE relay. Payloads are never inspected or
/// persisted. Conversation-membership authorization happens before these
/// calls; targeting a user with zero live connections silently reaches
/// nobody.
#[derive(Clone)]
pub struct CallSignalingRelay {
    hub: Arc<GroupBroadcastHub>,
    registry: Arc<ConnectionRegistry>,
}

impl CallSignalingRelay {
    pub fn new(hub: Arc<GroupBroadcastHub>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { hub, registry }
    }

    pub fn join_call(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) {
        let group = GroupId::call(conversation_id);
        self.registry.join_group(connection_id, group.clone());
        self.hub.broadcast_to_group_except(
            &group,
            user_id,
            &ServerEvent::UserJoinedCall {
                conversation_id,
                user_id,
            },
        );
    }

    /// Leaving does not end the call; the call ends by its group becoming
    /// empty, observable only through `session`.
    pub fn leave_call(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) {
        let group = GroupId::call(conversation_id);
        self.registry.leave_group(connection_id, &group);
        self.hub.broadcast_to_group_except(
            &group,
            user_id,
            &ServerEvent::UserLeftCall {
                conversation_id,
                user_id,
            },
        );
    }

    /// Multi-device ring: a direct, non-group send to every connection of
    /// the target.
    pub fn invite_to_call(
        &self,
        conversation_id: ConversationId,
        caller_id: UserId,
        target_user_id: UserId,
        call_type: CallType,
    ) {
        self.hub.send_to_user(
            target_user_id,
            &ServerEvent::CallInvitation {
                conversation_id,
                caller_id,
                call_type,
            },
        );
    }

    pub fn respond_to_call(
        &self,
        conversation_id: ConversationId,
        responder_id: UserId,
        caller_id: UserId,
        accepted: bool,
    ) {
        self.hub.send_to_user(
            caller_id,
            &ServerEvent::CallResponse {
                conversation_id,
                responder_id,
                accepted,
            },
        );
    }

    pub fn relay_offer(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        target_user_id: UserId,
        payload: serde_json::Value,
    ) {
        self.hub.send_to_user(
            target_user_id,
            &ServerEvent::ReceiveOffer {
                conversation_id,
                sender_id,
                payload,
            },
        );
    }

    pub fn relay_answer(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        target_user_id: UserId,
        payload: serde_json::Value,
    ) {
        self.hub.send_to_user(
            target_user_id,
            &ServerEvent::ReceiveAnswer {
                conversation_id,
                sender_id,
                payload,
            },
        );
    }

    pub fn relay_ice_candidate(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        target_user_id: UserId,
        payload: serde_json::Value,
    ) {
        self.hub.send_to_user(
            target_user_id,
            &ServerEvent::ReceiveIceCandidate {
                conversation_id,
                sender_id,
                payload,
            },
        );
    }

    /// Ends the call for everyone still in the group. Group cleanup is each
    /// member's own leave/disconnect path.
    pub fn end_call(&self, conversation_id: ConversationId, ended_by: UserId) {
        self.hub.broadcast_to_group(
            &GroupId::call(conversation_id),
            &ServerEvent::CallEnded {
                conversation_id,
                ended_by,
            },
        );
    }

    pub fn session(&self, conversation_id: ConversationId) -> CallSession {
        CallSession {
            conversation_id,
            participants: self.registry.users_in_group(&GroupId::call(conversation_id)),
        }
    }
}
