use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tracing::warn;

use shared::domain::{MessageId, MessageKind};
use storage::{ChatStore, MessagePayload, NewMessage};

use crate::{
    dispatch::{MessageContext, SendMessageRequest},
    error::PipelineError,
    translation::TranslationCoordinator,
};

/// One handler per message type. The first handler whose `can_handle`
/// accepts the request's kind performs validation and persistence.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn can_handle(&self, kind: MessageKind) -> bool;
    async fn handle(
        &self,
        ctx: &MessageContext,
        request: &SendMessageRequest,
    ) -> Result<MessageId, PipelineError>;
}

pub struct TextMessageHandler {
    store: Arc<dyn ChatStore>,
    translator: Arc<TranslationCoordinator>,
}

impl TextMessageHandler {
    pub fn new(store: Arc<dyn ChatStore>, translator: Arc<TranslationCoordinator>) -> Self {
        Self { store, translator }
    }
}

#[async_trait]
impl MessageHandler for TextMessageHandler {
    fn can_handle(&self, kind: MessageKind) -> bool {
        kind == MessageKind::Text
    }

    async fn handle(
        &self,
        ctx: &MessageContext,
        request: &SendMessageRequest,
    ) -> Result<MessageId, PipelineError> {
        let content = request
            .content
            .as_deref()
            .map(str::trim)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                PipelineError::Validation("text message requires non-empty content".into())
            })?;

        let message_id = self
            .store
            .insert_message(NewMessage {
                conversation_id: ctx.conversation_id,
                member_id: ctx.member_id,
                sender_id: ctx.sender_id,
                reply_to: request.reply_to,
                payload: MessagePayload::Text {
                    content: content.to_string(),
                    translations: BTreeMap::new(),
                },
            })
            .await
            .map_err(PipelineError::Internal)?;

        maybe_dispatch_translation(&self.store, &self.translator, message_id, request).await;
        Ok(message_id)
    }
}

pub struct VoiceMessageHandler {
    store: Arc<dyn ChatStore>,
    translator: Arc<TranslationCoordinator>,
}

impl VoiceMessageHandler {
    pub fn new(store: Arc<dyn ChatStore>, translator: Arc<TranslationCoordinator>) -> Self {
        Self { store, translator }
    }
}

#[async_trait]
impl MessageHandler for VoiceMessageHandler {
    fn can_handle(&self, kind: MessageKind) -> bool {
        kind == MessageKind::Voice
    }

    async fn handle(
        &self,
        ctx: &MessageContext,
        request: &SendMessageRequest,
    ) -> Result<MessageId, PipelineError> {
        let audio_url = request
            .audio_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                PipelineError::Validation("voice message requires a source audio reference".into())
            })?;

        let message_id = self
            .store
            .insert_message(NewMessage {
                conversation_id: ctx.conversation_id,
                member_id: ctx.member_id,
                sender_id: ctx.sender_id,
                reply_to: request.reply_to,
                payload: MessagePayload::Voice {
                    audio_url: audio_url.to_string(),
                    duration_secs: request.duration_secs.unwrap_or(0.0),
                    translated: false,
                    translated_audio: BTreeMap::new(),
                },
            })
            .await
            .map_err(PipelineError::Internal)?;

        maybe_dispatch_translation(&self.store, &self.translator, message_id, request).await;
        Ok(message_id)
    }
}

pub struct ImageMessageHandler {
    store: Arc<dyn ChatStore>,
}

impl ImageMessageHandler {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for ImageMessageHandler {
    fn can_handle(&self, kind: MessageKind) -> bool {
        kind == MessageKind::Image
    }

    async fn handle(
        &self,
        ctx: &MessageContext,
        request: &SendMessageRequest,
    ) -> Result<MessageId, PipelineError> {
        let image_url = request
            .image_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                PipelineError::Validation("image message requires an image reference".into())
            })?;

        self.store
            .insert_message(NewMessage {
                conversation_id: ctx.conversation_id,
                member_id: ctx.member_id,
                sender_id: ctx.sender_id,
                reply_to: request.reply_to,
                payload: MessagePayload::Image {
                    image_url: image_url.to_string(),
                },
            })
            .await
            .map_err(PipelineError::Internal)
    }
}

/// Translation is a best-effort enhancement: the message is already
/// persisted, so any failure here is logged and never unwinds the send.
async fn maybe_dispatch_translation(
    store: &Arc<dyn ChatStore>,
    translator: &Arc<TranslationCoordinator>,
    message_id: MessageId,
    request: &SendMessageRequest,
) {
    if request.translate_to.is_empty() {
        return;
    }
    let Some(source_language) = request.source_language.as_deref() else {
        warn!(
            message_id = message_id.0,
            "translation requested without a source language"
        );
        return;
    };

    let message = match store.message(message_id).await {
        Ok(Some(message)) => message,
        Ok(None) => {
            warn!(message_id = message_id.0, "message vanished before translation dispatch");
            return;
        }
        Err(load_error) => {
            warn!(message_id = message_id.0, error = %load_error, "failed to reload message for translation");
            return;
        }
    };

    translator
        .dispatch_translation(&message, source_language, &request.translate_to)
        .await;
}
