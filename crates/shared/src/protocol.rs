use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{CallType, ConversationId, DeliveryStatus, MemberId, MessageId, MessageKind, UserId},
    error::ApiError,
};

/// Placeholder content returned for soft-deleted messages.
pub const DELETED_MESSAGE_TOMBSTONE: &str = "This message was deleted";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    StartTyping {
        conversation_id: ConversationId,
    },
    StopTyping {
        conversation_id: ConversationId,
    },
    SetOnlineStatus {
        is_online: bool,
    },
    GetUsersOnlineStatus {
        user_ids: Vec<UserId>,
    },
    GetTypingUsers {
        conversation_id: ConversationId,
    },
    JoinCall {
        conversation_id: ConversationId,
    },
    LeaveCall {
        conversation_id: ConversationId,
    },
    SendOffer {
        conversation_id: ConversationId,
        target_user_id: UserId,
        payload: serde_json::Value,
    },
    SendAnswer {
        conversation_id: ConversationId,
        target_user_id: UserId,
        payload: serde_json::Value,
    },
    SendIceCandidate {
        conversation_id: ConversationId,
        target_user_id: UserId,
        payload: serde_json::Value,
    },
    InviteToCall {
        conversation_id: ConversationId,
        target_user_id: UserId,
        call_type: CallType,
    },
    RespondToCall {
        conversation_id: ConversationId,
        caller_id: UserId,
        accepted: bool,
    },
    EndCall {
        conversation_id: ConversationId,
    },
}

/// Client-facing projection of a stored message. Soft-deleted messages are
/// masked before this ever leaves the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_member_id: MemberId,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub translations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub translated_audio: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub starred_by: Vec<UserId>,
    pub status: DeliveryStatus,
    pub is_deleted: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatus {
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage {
        message: MessageSummary,
    },
    UserJoined {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
    },
    UserLeft {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
    },
    UserStatusChanged {
        user_id: UserId,
        is_online: bool,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },
    UserStartedTyping(TypingIndicator),
    UserStoppedTyping(TypingIndicator),
    OnlineStatusResponse {
        statuses: BTreeMap<UserId, UserStatus>,
        request_timestamp: DateTime<Utc>,
    },
    TypingUsersResponse {
        conversation_id: ConversationId,
        user_ids: Vec<UserId>,
        timestamp: DateTime<Utc>,
    },
    MessageTranslated {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        language: String,
    },
    UserJoinedCall {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    UserLeftCall {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    CallInvitation {
        conversation_id: ConversationId,
        caller_id: UserId,
        call_type: CallType,
    },
    CallResponse {
        conversation_id: ConversationId,
        responder_id: UserId,
        accepted: bool,
    },
    CallEnded {
        conversation_id: ConversationId,
        ended_by: UserId,
    },
    ReceiveOffer {
        conversation_id: ConversationId,
        sender_id: UserId,
        payload: serde_json::Value,
    },
    ReceiveAnswer {
        conversation_id: ConversationId,
        sender_id: UserId,
        payload: serde_json::Value,
    },
    ReceiveIceCandidate {
        conversation_id: ConversationId,
        sender_id: UserId,
        payload: serde_json::Value,
    },
    VoiceTrainingCompleted {
        user_id: UserId,
        model_id: String,
        success: bool,
    },
    Error(ApiError),
}
