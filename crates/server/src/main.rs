use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, info};

use hub::{
    CallSignalingRelay, ConnectionRegistry, GroupBroadcastHub, NotificationPublisher,
    PresenceTracker,
};
use pipeline::{
    MessageDispatcher, PendingTasks, PipelineError, SendMessageRequest, TranslationCoordinator,
    WebhookOutcome,
};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::MessageSummary,
};
use speech::{HttpSpeechService, InferenceCallback, SpeechConfig, SpeechService, TrainingCallback};
use storage::{ChatStore, LocalMediaStore, MediaStore, SqliteStore};

mod config;
mod ws;

use config::{load_settings, prepare_database_url};

struct AppState {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    hub: Arc<GroupBroadcastHub>,
    relay: CallSignalingRelay,
    publisher: NotificationPublisher,
    dispatcher: MessageDispatcher,
    coordinator: Arc<TranslationCoordinator>,
}

impl AppState {
    fn new(
        store: Arc<dyn ChatStore>,
        speech: Arc<dyn SpeechService>,
        media: Arc<dyn MediaStore>,
        task_ttl: Duration,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::new());
        let hub = Arc::new(GroupBroadcastHub::new(registry.clone()));
        let relay = CallSignalingRelay::new(hub.clone(), registry.clone());
        let publisher = NotificationPublisher::new(hub.clone());
        let tasks = Arc::new(PendingTasks::new(task_ttl));
        let coordinator = Arc::new(TranslationCoordinator::new(
            speech,
            store.clone(),
            media,
            tasks,
            publisher.clone(),
        ));
        let dispatcher =
            MessageDispatcher::standard(store.clone(), coordinator.clone(), publisher.clone());

        Self {
            store,
            registry,
            presence,
            hub,
            relay,
            publisher,
            dispatcher,
            coordinator,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    conversation_id: i64,
    sender_id: i64,
    #[serde(flatten)]
    request: SendMessageRequest,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AddMemberBody {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct TrainingQuery {
    language: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let store = SqliteStore::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let speech = HttpSpeechService::new(&SpeechConfig {
        base_url: settings.speech_base_url.clone(),
        request_timeout_secs: settings.speech_timeout_secs,
    })?;
    let media = LocalMediaStore::new(&settings.media_dir, &settings.media_public_base)?;

    let state = AppState::new(
        Arc::new(store),
        Arc::new(speech),
        Arc::new(media),
        Duration::from_secs(settings.task_ttl_minutes * 60),
    );
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, speech_base_url = %settings.speech_base_url, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/messages", post(http_send_message))
        .route(
            "/conversations/:conversation_id/messages",
            get(http_list_messages),
        )
        .route(
            "/conversations/:conversation_id/members",
            post(http_add_member),
        )
        .route(
            "/conversations/:conversation_id/members/:user_id",
            axum::routing::delete(http_remove_member),
        )
        .route(
            "/users/:user_id/voice-training",
            post(http_dispatch_training),
        )
        .route("/webhooks/inference-result", post(inference_webhook))
        .route("/webhooks/training-result", post(training_webhook))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::Unsupported => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn pipeline_rejection(error: PipelineError) -> (StatusCode, Json<ApiError>) {
    let api_error = ApiError::from(error);
    (status_for(api_error.code), Json(api_error))
}

fn internal_rejection(error: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, error.to_string())),
    )
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let message_id = state
        .dispatcher
        .process_message(
            &body.request,
            ConversationId(body.conversation_id),
            UserId(body.sender_id),
        )
        .await
        .map_err(pipeline_rejection)?;
    Ok(Json(serde_json::json!({ "message_id": message_id.0 })))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessageSummary>>, (StatusCode, Json<ApiError>)> {
    let limit = q.limit.unwrap_or(100).clamp(1, 100);
    let messages = state
        .store
        .list_conversation_messages(
            ConversationId(conversation_id),
            limit,
            q.before.map(MessageId),
        )
        .await
        .map_err(internal_rejection)?;
    Ok(Json(
        messages.iter().map(|message| message.summary()).collect(),
    ))
}

async fn http_add_member(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(body): Json<AddMemberBody>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let conversation_id = ConversationId(conversation_id);
    let user_id = UserId(body.user_id);

    let username = state
        .store
        .username_for_user(user_id)
        .await
        .map_err(internal_rejection)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ApiError::new(ErrorCode::NotFound, "user not found")),
            )
        })?;
    state
        .store
        .add_member(conversation_id, user_id)
        .await
        .map_err(internal_rejection)?;

    state
        .publisher
        .member_joined(conversation_id, user_id, &username);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_remove_member(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, user_id)): Path<(i64, i64)>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let conversation_id = ConversationId(conversation_id);
    let user_id = UserId(user_id);

    let removed = state
        .store
        .remove_member(conversation_id, user_id)
        .await
        .map_err(internal_rejection)?;
    if !removed {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new(
                ErrorCode::NotFound,
                "user is not a conversation member",
            )),
        ));
    }

    let username = state
        .store
        .username_for_user(user_id)
        .await
        .map_err(internal_rejection)?
        .unwrap_or_default();
    state
        .publisher
        .member_left(conversation_id, user_id, &username);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_dispatch_training(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Query(q): Query<TrainingQuery>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    if body.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(
                ErrorCode::Validation,
                "training sample body cannot be empty",
            )),
        ));
    }

    let task_id = state
        .coordinator
        .dispatch_training(UserId(user_id), body.to_vec(), &q.language)
        .await
        .map_err(pipeline_rejection)?;
    Ok(Json(serde_json::json!({ "task_id": task_id })))
}

async fn inference_webhook(
    State(state): State<Arc<AppState>>,
    Json(callback): Json<InferenceCallback>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    match state.coordinator.resolve_inference_webhook(&callback).await {
        Ok(WebhookOutcome::Applied | WebhookOutcome::Failed) => Ok(StatusCode::OK),
        Ok(WebhookOutcome::UnknownTask) => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new(
                ErrorCode::NotFound,
                "unknown or expired task id",
            )),
        )),
        Err(error) => {
            error!(%error, task_id = %callback.request_id, "failed to apply inference webhook");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, error.to_string())),
            ))
        }
    }
}

async fn training_webhook(
    State(state): State<Arc<AppState>>,
    Json(callback): Json<TrainingCallback>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    match state.coordinator.resolve_training_webhook(&callback).await {
        Ok(WebhookOutcome::Applied | WebhookOutcome::Failed) => Ok(StatusCode::OK),
        Ok(WebhookOutcome::UnknownTask) => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new(
                ErrorCode::NotFound,
                "unknown or expired task id",
            )),
        )),
        Err(error) => {
            error!(%error, task_id = %callback.request_id, "failed to apply training webhook");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, error.to_string())),
            ))
        }
    }
}
