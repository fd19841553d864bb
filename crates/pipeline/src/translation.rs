use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use uuid::Uuid;

use hub::NotificationPublisher;
use shared::domain::{MessageKind, UserId};
use speech::{InferenceCallback, SpeechService, TrainingCallback, VoiceProcessRequest};
use storage::{ChatStore, MediaStore, MessagePayload, StoredMessage};

use crate::{error::PipelineError, tasks::PendingTask, tasks::PendingTasks};

const DEFAULT_VOICE_MODEL: &str = "default";

/// What resolving a webhook amounted to. `UnknownTask` covers stale,
/// duplicate and never-issued task ids; it is reported to the webhook
/// sender and to nobody else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    Failed,
    UnknownTask,
}

/// Correlates outbound translation/training requests to the external speech
/// service and resolves its webhooks back onto stored messages and users.
pub struct TranslationCoordinator {
    speech: Arc<dyn SpeechService>,
    store: Arc<dyn ChatStore>,
    media: Arc<dyn MediaStore>,
    tasks: Arc<PendingTasks>,
    publisher: NotificationPublisher,
}

impl TranslationCoordinator {
    pub fn new(
        speech: Arc<dyn SpeechService>,
        store: Arc<dyn ChatStore>,
        media: Arc<dyn MediaStore>,
        tasks: Arc<PendingTasks>,
        publisher: NotificationPublisher,
    ) -> Self {
        Self {
            speech,
            store,
            media,
            tasks,
            publisher,
        }
    }

    pub fn tasks(&self) -> &Arc<PendingTasks> {
        &self.tasks
    }

    /// Issues one external request per target language and records the
    /// returned task ids. Best-effort per language: a failed dispatch is
    /// logged and skipped, the other languages proceed, and the already
    /// persisted message is never unwound.
    pub async fn dispatch_translation(
        &self,
        message: &StoredMessage,
        source_language: &str,
        target_languages: &[String],
    ) -> Vec<String> {
        let voice_model = match &message.payload {
            MessagePayload::Voice { .. } => Some(self.voice_model_for(message.sender_id).await),
            _ => None,
        };

        let mut task_ids = Vec::with_capacity(target_languages.len());
        for language in target_languages {
            let dispatched = match &message.payload {
                MessagePayload::Text { content, .. } => {
                    self.speech
                        .process_text(content, source_language, language)
                        .await
                }
                MessagePayload::Voice { audio_url, .. } => {
                    self.speech
                        .process_voice(VoiceProcessRequest {
                            audio_url: audio_url.clone(),
                            model_id: voice_model.clone().unwrap_or_default(),
                            source_language: source_language.to_string(),
                            target_language: language.clone(),
                            gender: None,
                        })
                        .await
                }
                MessagePayload::Image { .. } => {
                    warn!(message_id = message.message_id.0, "image messages are not translatable");
                    return task_ids;
                }
            };

            match dispatched {
                Ok(task_id) => {
                    self.tasks.insert_translation(
                        &task_id,
                        message.message_id,
                        language,
                        message.payload.kind(),
                    );
                    info!(
                        message_id = message.message_id.0,
                        %language,
                        %task_id,
                        "translation dispatched"
                    );
                    task_ids.push(task_id);
                }
                Err(dispatch_error) => {
                    warn!(
                        message_id = message.message_id.0,
                        %language,
                        error = %dispatch_error,
                        "translation dispatch failed"
                    );
                }
            }
        }
        task_ids
    }

    /// Resolves an `inference-result` webhook. Duplicate deliveries of the
    /// same task id resolve to `UnknownTask` because the first delivery
    /// consumed the correlation atomically.
    pub async fn resolve_inference_webhook(
        &self,
        callback: &InferenceCallback,
    ) -> Result<WebhookOutcome> {
        let Some(task) = self.tasks.take(&callback.request_id) else {
            warn!(task_id = %callback.request_id, "webhook for unknown or expired task");
            return Ok(WebhookOutcome::UnknownTask);
        };
        let PendingTask::Translation {
            message_id,
            language,
            kind,
        } = task
        else {
            error!(task_id = %callback.request_id, "training task delivered to inference webhook");
            return Ok(WebhookOutcome::UnknownTask);
        };

        if !callback.is_success() {
            warn!(
                message_id = message_id.0,
                %language,
                error = callback.error_message.as_deref().unwrap_or("unknown"),
                "translation failed"
            );
            return Ok(WebhookOutcome::Failed);
        }

        match kind {
            MessageKind::Text => {
                let text = match self.speech.fetch_text_result(&callback.request_id).await {
                    Ok(text) => text,
                    Err(fetch_error) => {
                        warn!(
                            message_id = message_id.0,
                            %language,
                            error = %fetch_error,
                            "failed to fetch text translation result"
                        );
                        return Ok(WebhookOutcome::Failed);
                    }
                };
                self.store
                    .set_text_translation(message_id, &language, &text)
                    .await?;
            }
            MessageKind::Voice => {
                let (bytes, content_type) =
                    match self.speech.fetch_voice_result(&callback.request_id).await {
                        Ok(result) => result,
                        Err(fetch_error) => {
                            warn!(
                                message_id = message_id.0,
                                %language,
                                error = %fetch_error,
                                "failed to fetch voice translation result"
                            );
                            return Ok(WebhookOutcome::Failed);
                        }
                    };
                let audio_url = self.media.store_audio(&bytes, &content_type).await?;
                self.store
                    .set_voice_translation(message_id, &language, &audio_url)
                    .await?;
            }
            MessageKind::Image => {
                error!(message_id = message_id.0, "image task in translation map");
                return Ok(WebhookOutcome::Failed);
            }
        }

        let Some(message) = self.store.message(message_id).await? else {
            warn!(message_id = message_id.0, "translated message no longer exists");
            return Ok(WebhookOutcome::Applied);
        };
        // Two distinct events: the lightweight completion signal and the
        // full refreshed projection.
        self.publisher.message_translated(
            message.conversation_id,
            message_id,
            message.sender_id,
            &language,
        );
        self.publisher
            .message_updated(message.conversation_id, message.summary());
        info!(message_id = message_id.0, %language, "translation applied");
        Ok(WebhookOutcome::Applied)
    }

    /// Per-user voice training: same correlation pattern, keyed to the
    /// user's voice model rather than a message. At most one outstanding
    /// training task per user.
    pub async fn dispatch_training(
        &self,
        user_id: UserId,
        audio: Vec<u8>,
        language: &str,
    ) -> Result<String, PipelineError> {
        if self.tasks.has_pending_training(user_id) {
            return Err(PipelineError::TrainingAlreadyPending(user_id));
        }

        let model_id = match self.store.voice_profile(user_id).await {
            Ok(Some(profile)) => profile
                .model_id
                .unwrap_or_else(|| format!("voice-{}", Uuid::new_v4())),
            _ => format!("voice-{}", Uuid::new_v4()),
        };

        let task_id = self
            .speech
            .train_voice(audio, &model_id, language)
            .await
            .map_err(PipelineError::Internal)?;
        self.tasks.insert_training(&task_id, user_id, &model_id)?;
        info!(user_id = user_id.0, %model_id, %task_id, "voice training dispatched");
        Ok(task_id)
    }

    pub async fn resolve_training_webhook(
        &self,
        callback: &TrainingCallback,
    ) -> Result<WebhookOutcome> {
        let Some(task) = self.tasks.take(&callback.request_id) else {
            warn!(task_id = %callback.request_id, "training webhook for unknown or expired task");
            return Ok(WebhookOutcome::UnknownTask);
        };
        let PendingTask::Training { user_id, model_id } = task else {
            error!(task_id = %callback.request_id, "translation task delivered to training webhook");
            return Ok(WebhookOutcome::UnknownTask);
        };

        let model_id = callback.model_id.clone().unwrap_or(model_id);
        if callback.is_success() {
            self.store.set_voice_model(user_id, &model_id, true).await?;
            self.publisher.training_completed(user_id, &model_id, true);
            info!(user_id = user_id.0, %model_id, "voice training completed");
            Ok(WebhookOutcome::Applied)
        } else {
            warn!(
                user_id = user_id.0,
                %model_id,
                error = callback.error_message.as_deref().unwrap_or("unknown"),
                "voice training failed"
            );
            self.publisher.training_completed(user_id, &model_id, false);
            Ok(WebhookOutcome::Failed)
        }
    }

    async fn voice_model_for(&self, user_id: UserId) -> String {
        match self.store.voice_profile(user_id).await {
            Ok(Some(profile)) if profile.trained => profile
                .model_id
                .unwrap_or_else(|| DEFAULT_VOICE_MODEL.to_string()),
            Ok(_) => DEFAULT_VOICE_MODEL.to_string(),
            Err(lookup_error) => {
                warn!(user_id = user_id.0, error = %lookup_error, "voice profile lookup failed");
                DEFAULT_VOICE_MODEL.to_string()
            }
        }
    }
}
