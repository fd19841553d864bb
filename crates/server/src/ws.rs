use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use shared::{
    domain::{ConnectionId, ConversationId, GroupId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientCommand, ServerEvent, TypingIndicator},
};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    user_id: i64,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

/// One task per connection. Outbound delivery is decoupled through the
/// registered mpsc lane so a broadcast never blocks on this socket.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let connection_id = ConnectionId::new();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    state.registry.register(connection_id, user_id, outbound);
    info!(connection_id = %connection_id.0, user_id = user_id.0, "websocket connected");

    if let Some(change) = state.presence.on_connect(user_id) {
        state.hub.broadcast_all(&ServerEvent::UserStatusChanged {
            user_id: change.user_id,
            is_online: change.is_online,
            timestamp: change.timestamp,
            last_seen: change.last_seen,
        });
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(error) => {
                    warn!(%error, "failed to serialize outbound event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = ws_rx.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<ClientCommand>(&text) {
            Ok(command) => handle_command(&state, connection_id, user_id, command).await,
            Err(error) => {
                debug!(connection_id = %connection_id.0, %error, "malformed client frame");
                state.hub.send_to_connection(
                    connection_id,
                    &ServerEvent::Error(ApiError::new(
                        ErrorCode::Validation,
                        format!("malformed command: {error}"),
                    )),
                );
            }
        }
    }

    teardown(&state, connection_id, user_id).await;
    send_task.abort();
    info!(connection_id = %connection_id.0, user_id = user_id.0, "websocket disconnected");
}

async fn handle_command(
    state: &AppState,
    connection_id: ConnectionId,
    user_id: UserId,
    command: ClientCommand,
) {
    match command {
        ClientCommand::JoinConversation { conversation_id } => {
            match state.store.member_for_user(conversation_id, user_id).await {
                Ok(Some(_)) => state
                    .registry
                    .join_group(connection_id, GroupId::conversation(conversation_id)),
                Ok(None) => state.hub.send_to_connection(
                    connection_id,
                    &ServerEvent::Error(ApiError::new(
                        ErrorCode::Validation,
                        "not a member of the conversation",
                    )),
                ),
                Err(error) => {
                    warn!(%error, conversation_id = conversation_id.0, "membership lookup failed");
                    state.hub.send_to_connection(
                        connection_id,
                        &ServerEvent::Error(ApiError::new(
                            ErrorCode::Internal,
                            "failed to join conversation",
                        )),
                    );
                }
            }
        }
        ClientCommand::LeaveConversation { conversation_id } => {
            state
                .registry
                .leave_group(connection_id, &GroupId::conversation(conversation_id));
            if state.presence.stop_typing(user_id, conversation_id) {
                broadcast_typing(state, user_id, conversation_id, false);
            }
        }
        ClientCommand::StartTyping { conversation_id } => {
            if state.presence.start_typing(user_id, conversation_id) {
                broadcast_typing(state, user_id, conversation_id, true);
            }
        }
        ClientCommand::StopTyping { conversation_id } => {
            if state.presence.stop_typing(user_id, conversation_id) {
                broadcast_typing(state, user_id, conversation_id, false);
            }
        }
        ClientCommand::SetOnlineStatus { is_online } => {
            state.hub.broadcast_all(&ServerEvent::UserStatusChanged {
                user_id,
                is_online,
                timestamp: Utc::now(),
                last_seen: None,
            });
        }
        ClientCommand::GetUsersOnlineStatus { user_ids } => {
            let (statuses, request_timestamp) = state.presence.online_snapshot(&user_ids);
            state.hub.send_to_connection(
                connection_id,
                &ServerEvent::OnlineStatusResponse {
                    statuses,
                    request_timestamp,
                },
            );
        }
        ClientCommand::GetTypingUsers { conversation_id } => {
            state.hub.send_to_connection(
                connection_id,
                &ServerEvent::TypingUsersResponse {
                    conversation_id,
                    user_ids: state.presence.typing_users(conversation_id),
                    timestamp: Utc::now(),
                },
            );
        }
        ClientCommand::JoinCall { conversation_id } => {
            state.relay.join_call(connection_id, conversation_id, user_id);
        }
        ClientCommand::LeaveCall { conversation_id } => {
            state.relay.leave_call(connection_id, conversation_id, user_id);
        }
        ClientCommand::SendOffer {
            conversation_id,
            target_user_id,
            payload,
        } => {
            state
                .relay
                .relay_offer(conversation_id, user_id, target_user_id, payload);
        }
        ClientCommand::SendAnswer {
            conversation_id,
            target_user_id,
            payload,
        } => {
            state
                .relay
                .relay_answer(conversation_id, user_id, target_user_id, payload);
        }
        ClientCommand::SendIceCandidate {
            conversation_id,
            target_user_id,
            payload,
        } => {
            state
                .relay
                .relay_ice_candidate(conversation_id, user_id, target_user_id, payload);
        }
        ClientCommand::InviteToCall {
            conversation_id,
            target_user_id,
            call_type,
        } => {
            state
                .relay
                .invite_to_call(conversation_id, user_id, target_user_id, call_type);
        }
        ClientCommand::RespondToCall {
            conversation_id,
            caller_id,
            accepted,
        } => {
            state
                .relay
                .respond_to_call(conversation_id, user_id, caller_id, accepted);
        }
        ClientCommand::EndCall { conversation_id } => {
            state.relay.end_call(conversation_id, user_id);
        }
    }
}

fn broadcast_typing(
    state: &AppState,
    user_id: UserId,
    conversation_id: ConversationId,
    started: bool,
) {
    let indicator = TypingIndicator {
        conversation_id,
        user_id,
        timestamp: Utc::now(),
    };
    let event = if started {
        ServerEvent::UserStartedTyping(indicator)
    } else {
        ServerEvent::UserStoppedTyping(indicator)
    };
    state
        .hub
        .broadcast_to_group_except(&GroupId::conversation(conversation_id), user_id, &event);
}

/// Unregister first so the closing connection never hears its own teardown
/// broadcasts, then emit stop-typing for every conversation the user was
/// typing in, then the presence transition if this was the last connection.
async fn teardown(state: &AppState, connection_id: ConnectionId, user_id: UserId) {
    state.registry.unregister(connection_id);

    for conversation_id in state.presence.clear_typing(user_id) {
        broadcast_typing(state, user_id, conversation_id, false);
    }

    if let Some(change) = state.presence.on_disconnect(user_id) {
        state.hub.broadcast_all(&ServerEvent::UserStatusChanged {
            user_id: change.user_id,
            is_online: change.is_online,
            timestamp: change.timestamp,
            last_seen: change.last_seen,
        });
        if let Err(error) = state.store.update_last_seen(user_id, change.timestamp).await {
            warn!(%error, user_id = user_id.0, "failed to persist last-seen timestamp");
        }
    }
}
