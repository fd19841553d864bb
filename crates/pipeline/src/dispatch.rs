use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use hub::NotificationPublisher;
use shared::domain::{ConversationId, MemberId, MessageId, MessageKind, UserId};
use storage::ChatStore;

use crate::{
    error::PipelineError,
    handlers::{ImageMessageHandler, MessageHandler, TextMessageHandler, VoiceMessageHandler},
    translation::TranslationCoordinator,
};

/// A client-submitted send request, before type dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub source_language: Option<String>,
    #[serde(default)]
    pub translate_to: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct MessageContext {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub member_id: MemberId,
}

/// Polymorphic dispatch over the registered message handlers: the first
/// handler accepting the request's kind persists the message, then the
/// dispatcher fans the stored projection out to the conversation group.
pub struct MessageDispatcher {
    handlers: Vec<Arc<dyn MessageHandler>>,
    store: Arc<dyn ChatStore>,
    publisher: NotificationPublisher,
}

impl MessageDispatcher {
    pub fn new(
        handlers: Vec<Arc<dyn MessageHandler>>,
        store: Arc<dyn ChatStore>,
        publisher: NotificationPublisher,
    ) -> Self {
        Self {
            handlers,
            store,
            publisher,
        }
    }

    /// The standard registration: one handler per supported type.
    pub fn standard(
        store: Arc<dyn ChatStore>,
        translator: Arc<TranslationCoordinator>,
        publisher: NotificationPublisher,
    ) -> Self {
        let handlers: Vec<Arc<dyn MessageHandler>> = vec![
            Arc::new(TextMessageHandler::new(store.clone(), translator.clone())),
            Arc::new(VoiceMessageHandler::new(store.clone(), translator)),
            Arc::new(ImageMessageHandler::new(store.clone())),
        ];
        Self::new(handlers, store, publisher)
    }

    pub async fn process_message(
        &self,
        request: &SendMessageRequest,
        conversation_id: ConversationId,
        sender_id: UserId,
    ) -> Result<MessageId, PipelineError> {
        let handler = self
            .handlers
            .iter()
            .find(|handler| handler.can_handle(request.kind))
            .ok_or(PipelineError::UnsupportedMessageType(request.kind))?;

        let member_id = self
            .store
            .member_for_user(conversation_id, sender_id)
            .await
            .map_err(PipelineError::Internal)?
            .ok_or_else(|| {
                PipelineError::Validation("sender is not a conversation member".into())
            })?;

        let ctx = MessageContext {
            conversation_id,
            sender_id,
            member_id,
        };
        let message_id = handler.handle(&ctx, request).await?;

        match self
            .store
            .message(message_id)
            .await
            .map_err(PipelineError::Internal)?
        {
            Some(message) => {
                self.publisher
                    .message_received(conversation_id, message.summary());
            }
            None => {
                warn!(message_id = message_id.0, "stored message missing after insert");
            }
        }
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use hub::{ConnectionRegistry, GroupBroadcastHub};
    use shared::{
        domain::{ConnectionId, GroupId},
        protocol::ServerEvent,
    };
    use speech::{
        InferenceCallback, SpeechService, TrainingCallback, VoiceProcessRequest,
    };
    use storage::{MediaStore, MessagePayload, SqliteStore};
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use uuid::Uuid;

    use crate::{tasks::PendingTasks, translation::WebhookOutcome};

    #[derive(Default)]
    struct MockSpeech {
        fail_languages: Mutex<HashSet<String>>,
        counter: AtomicUsize,
    }

    impl MockSpeech {
        fn fail_language(&self, language: &str) {
            self.fail_languages
                .lock()
                .expect("lock")
                .insert(language.to_string());
        }

        fn issue(&self, target_language: &str) -> Result<String> {
            if self
                .fail_languages
                .lock()
                .expect("lock")
                .contains(target_language)
            {
                bail!("service unavailable for '{target_language}'");
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("task-{target_language}-{n}"))
        }
    }

    #[async_trait]
    impl SpeechService for MockSpeech {
        async fn process_voice(&self, request: VoiceProcessRequest) -> Result<String> {
            self.issue(&request.target_language)
        }

        async fn process_text(
            &self,
            _text: &str,
            _source_language: &str,
            target_language: &str,
        ) -> Result<String> {
            self.issue(target_language)
        }

        async fn fetch_voice_result(&self, _task_id: &str) -> Result<(Vec<u8>, String)> {
            Ok((b"RIFF..".to_vec(), "audio/wav".to_string()))
        }

        async fn fetch_text_result(&self, task_id: &str) -> Result<String> {
            Ok(format!("translated:{task_id}"))
        }

        async fn train_voice(
            &self,
            _audio: Vec<u8>,
            _model_id: &str,
            _language: &str,
        ) -> Result<String> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("train-{n}"))
        }
    }

    struct MemoryMedia;

    #[async_trait]
    impl MediaStore for MemoryMedia {
        async fn store_audio(&self, _bytes: &[u8], _content_type: &str) -> Result<String> {
            Ok(format!("/media/{}.wav", Uuid::new_v4()))
        }
    }

    struct TestEnv {
        store: Arc<SqliteStore>,
        registry: Arc<ConnectionRegistry>,
        speech: Arc<MockSpeech>,
        tasks: Arc<PendingTasks>,
        coordinator: Arc<TranslationCoordinator>,
        dispatcher: MessageDispatcher,
        conversation: ConversationId,
        alice: UserId,
        bob: UserId,
    }

    async fn setup() -> TestEnv {
        let store = Arc::new(SqliteStore::new("sqlite::memory:").await.expect("db"));
        let registry = Arc::new(ConnectionRegistry::new());
        let hub = Arc::new(GroupBroadcastHub::new(registry.clone()));
        let publisher = NotificationPublisher::new(hub);
        let speech = Arc::new(MockSpeech::default());
        let tasks = Arc::new(PendingTasks::new(Duration::from_secs(60)));

        let chat_store: Arc<dyn ChatStore> = store.clone();
        let coordinator = Arc::new(TranslationCoordinator::new(
            speech.clone(),
            chat_store.clone(),
            Arc::new(MemoryMedia),
            tasks.clone(),
            publisher.clone(),
        ));
        let dispatcher =
            MessageDispatcher::standard(chat_store, coordinator.clone(), publisher);

        let alice = store.create_user("alice").await.expect("alice");
        let bob = store.create_user("bob").await.expect("bob");
        let conversation = store.create_conversation("general").await.expect("conv");
        store.add_member(conversation, alice).await.expect("alice in");
        store.add_member(conversation, bob).await.expect("bob in");

        TestEnv {
            store,
            registry,
            speech,
            tasks,
            coordinator,
            dispatcher,
            conversation,
            alice,
            bob,
        }
    }

    fn join_conversation(env: &TestEnv, user: UserId) -> UnboundedReceiver<ServerEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection_id = ConnectionId::new();
        env.registry.register(connection_id, user, sender);
        env.registry
            .join_group(connection_id, GroupId::conversation(env.conversation));
        receiver
    }

    fn text_request(content: &str) -> SendMessageRequest {
        SendMessageRequest {
            kind: MessageKind::Text,
            content: Some(content.to_string()),
            audio_url: None,
            duration_secs: None,
            image_url: None,
            reply_to: None,
            source_language: None,
            translate_to: Vec::new(),
        }
    }

    fn voice_request(translate_to: &[&str]) -> SendMessageRequest {
        SendMessageRequest {
            kind: MessageKind::Voice,
            content: None,
            audio_url: Some("/media/source.wav".to_string()),
            duration_secs: Some(3.2),
            image_url: None,
            reply_to: None,
            source_language: Some("en".to_string()),
            translate_to: translate_to.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn unregistered_message_type_fails_loudly() {
        let env = setup().await;
        let empty = MessageDispatcher::new(
            Vec::new(),
            env.store.clone(),
            NotificationPublisher::new(Arc::new(GroupBroadcastHub::new(env.registry.clone()))),
        );
        let err = empty
            .process_message(&text_request("hello"), env.conversation, env.alice)
            .await
            .expect_err("should fail");
        assert!(matches!(err, PipelineError::UnsupportedMessageType(MessageKind::Text)));
    }

    #[tokio::test]
    async fn non_member_cannot_send() {
        let env = setup().await;
        let outsider = env.store.create_user("mallory").await.expect("user");
        let err = env
            .dispatcher
            .process_message(&text_request("hi"), env.conversation, outsider)
            .await
            .expect_err("should fail");
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_payloads_are_rejected() {
        let env = setup().await;
        let mut request = text_request("  ");
        let err = env
            .dispatcher
            .process_message(&request, env.conversation, env.alice)
            .await
            .expect_err("blank text");
        assert!(matches!(err, PipelineError::Validation(_)));

        request = voice_request(&[]);
        request.audio_url = None;
        let err = env
            .dispatcher
            .process_message(&request, env.conversation, env.alice)
            .await
            .expect_err("missing audio");
        assert!(matches!(err, PipelineError::Validation(_)));

        request = text_request("x");
        request.kind = MessageKind::Image;
        request.content = None;
        let err = env
            .dispatcher
            .process_message(&request, env.conversation, env.alice)
            .await
            .expect_err("missing image");
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    // Scenario: a joined member's connection receives the persisted message.
    #[tokio::test]
    async fn text_send_fans_out_to_the_conversation_group() {
        let env = setup().await;
        let mut alice_rx = join_conversation(&env, env.alice);

        let message_id = env
            .dispatcher
            .process_message(&text_request("hello there"), env.conversation, env.bob)
            .await
            .expect("send");

        let ServerEvent::ReceiveMessage { message } = alice_rx.try_recv().expect("event") else {
            panic!("unexpected event");
        };
        assert_eq!(message.message_id, message_id);
        assert_eq!(message.kind, MessageKind::Text);
        assert_eq!(message.content.as_deref(), Some("hello there"));
        assert_eq!(message.sender_id, env.bob);
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn voice_translation_resolves_per_language() {
        let env = setup().await;
        let mut alice_rx = join_conversation(&env, env.alice);

        let message_id = env
            .dispatcher
            .process_message(&voice_request(&["es", "fr"]), env.conversation, env.bob)
            .await
            .expect("send");
        assert_eq!(env.tasks.len(), 2);

        // Original message fan-out.
        assert!(matches!(
            alice_rx.try_recv().expect("original"),
            ServerEvent::ReceiveMessage { .. }
        ));

        // The service completes Spanish only.
        let es_task = "task-es-0".to_string();
        let outcome = env
            .coordinator
            .resolve_inference_webhook(&InferenceCallback {
                request_id: es_task.clone(),
                model_id: None,
                success: "true".into(),
                error_message: None,
            })
            .await
            .expect("resolve");
        assert_eq!(outcome, WebhookOutcome::Applied);

        let stored = env
            .store
            .message(message_id)
            .await
            .expect("fetch")
            .expect("exists");
        let MessagePayload::Voice {
            translated_audio,
            translated,
            ..
        } = stored.payload
        else {
            panic!("expected voice payload");
        };
        assert!(translated);
        assert!(translated_audio.contains_key("es"));
        assert!(!translated_audio.contains_key("fr"));

        // Completion signal plus refreshed projection, in that order.
        assert!(matches!(
            alice_rx.try_recv().expect("signal"),
            ServerEvent::MessageTranslated { ref language, .. } if language == "es"
        ));
        assert!(matches!(
            alice_rx.try_recv().expect("refresh"),
            ServerEvent::ReceiveMessage { .. }
        ));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_webhook_is_a_noop() {
        let env = setup().await;
        let mut alice_rx = join_conversation(&env, env.alice);

        let message_id = env
            .dispatcher
            .process_message(&voice_request(&["es"]), env.conversation, env.bob)
            .await
            .expect("send");

        let callback = InferenceCallback {
            request_id: "task-es-0".into(),
            model_id: None,
            success: "true".into(),
            error_message: None,
        };
        let first = env
            .coordinator
            .resolve_inference_webhook(&callback)
            .await
            .expect("first");
        assert_eq!(first, WebhookOutcome::Applied);

        let second = env
            .coordinator
            .resolve_inference_webhook(&callback)
            .await
            .expect("second");
        assert_eq!(second, WebhookOutcome::UnknownTask);

        let stored = env
            .store
            .message(message_id)
            .await
            .expect("fetch")
            .expect("exists");
        let MessagePayload::Voice { translated_audio, .. } = stored.payload else {
            panic!("expected voice payload");
        };
        assert_eq!(translated_audio.len(), 1);

        // Exactly one original + one signal + one refresh; nothing more.
        let mut received = 0;
        while alice_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn one_language_failing_leaves_the_others_intact() {
        let env = setup().await;
        env.speech.fail_language("fr");

        let message_id = env
            .dispatcher
            .process_message(&voice_request(&["fr", "de"]), env.conversation, env.bob)
            .await
            .expect("message still sent");
        assert_eq!(env.tasks.len(), 1);

        let outcome = env
            .coordinator
            .resolve_inference_webhook(&InferenceCallback {
                request_id: "task-de-0".into(),
                model_id: None,
                success: "true".into(),
                error_message: None,
            })
            .await
            .expect("resolve");
        assert_eq!(outcome, WebhookOutcome::Applied);

        let stored = env
            .store
            .message(message_id)
            .await
            .expect("fetch")
            .expect("exists");
        let MessagePayload::Voice { translated_audio, .. } = stored.payload else {
            panic!("expected voice payload");
        };
        assert!(translated_audio.contains_key("de"));
        assert!(!translated_audio.contains_key("fr"));
    }

    #[tokio::test]
    async fn service_reported_failure_mutates_nothing() {
        let env = setup().await;
        let message_id = env
            .dispatcher
            .process_message(&voice_request(&["es"]), env.conversation, env.bob)
            .await
            .expect("send");

        let outcome = env
            .coordinator
            .resolve_inference_webhook(&InferenceCallback {
                request_id: "task-es-0".into(),
                model_id: None,
                success: "false".into(),
                error_message: Some("model crashed".into()),
            })
            .await
            .expect("resolve");
        assert_eq!(outcome, WebhookOutcome::Failed);

        let stored = env
            .store
            .message(message_id)
            .await
            .expect("fetch")
            .expect("exists");
        let MessagePayload::Voice { translated_audio, translated, .. } = stored.payload else {
            panic!("expected voice payload");
        };
        assert!(translated_audio.is_empty());
        assert!(!translated);
    }

    // Scenario: a webhook nobody asked for resolves to a structured
    // not-found and mutates nothing.
    #[tokio::test]
    async fn unknown_task_webhook_is_dropped() {
        let env = setup().await;
        let message_id = env
            .dispatcher
            .process_message(&text_request("untouched"), env.conversation, env.bob)
            .await
            .expect("send");

        let outcome = env
            .coordinator
            .resolve_inference_webhook(&InferenceCallback {
                request_id: "never-issued".into(),
                model_id: None,
                success: "true".into(),
                error_message: None,
            })
            .await
            .expect("resolve");
        assert_eq!(outcome, WebhookOutcome::UnknownTask);

        let stored = env
            .store
            .message(message_id)
            .await
            .expect("fetch")
            .expect("exists");
        let MessagePayload::Text { translations, .. } = stored.payload else {
            panic!("expected text payload");
        };
        assert!(translations.is_empty());
    }

    #[tokio::test]
    async fn all_dispatches_failing_does_not_unwind_the_send() {
        let env = setup().await;
        env.speech.fail_language("es");
        env.speech.fail_language("fr");

        let message_id = env
            .dispatcher
            .process_message(&voice_request(&["es", "fr"]), env.conversation, env.bob)
            .await
            .expect("message persisted regardless");
        assert!(env.tasks.is_empty());
        assert!(env
            .store
            .message(message_id)
            .await
            .expect("fetch")
            .is_some());
    }

    #[tokio::test]
    async fn text_translation_applies_fetched_result() {
        let env = setup().await;
        let mut request = text_request("good morning");
        request.source_language = Some("en".into());
        request.translate_to = vec!["es".into()];

        let message_id = env
            .dispatcher
            .process_message(&request, env.conversation, env.bob)
            .await
            .expect("send");

        let outcome = env
            .coordinator
            .resolve_inference_webhook(&InferenceCallback {
                request_id: "task-es-0".into(),
                model_id: None,
                success: "true".into(),
                error_message: None,
            })
            .await
            .expect("resolve");
        assert_eq!(outcome, WebhookOutcome::Applied);

        let stored = env
            .store
            .message(message_id)
            .await
            .expect("fetch")
            .expect("exists");
        let MessagePayload::Text { translations, .. } = stored.payload else {
            panic!("expected text payload");
        };
        assert_eq!(
            translations.get("es").map(String::as_str),
            Some("translated:task-es-0")
        );
    }

    #[tokio::test]
    async fn training_is_exclusive_and_notifies_only_the_trainee() {
        let env = setup().await;
        let (bob_sender, mut bob_rx) = mpsc::unbounded_channel();
        env.registry
            .register(ConnectionId::new(), env.bob, bob_sender);
        let (alice_sender, mut alice_rx) = mpsc::unbounded_channel();
        env.registry
            .register(ConnectionId::new(), env.alice, alice_sender);

        let task_id = env
            .coordinator
            .dispatch_training(env.bob, b"sample".to_vec(), "en")
            .await
            .expect("dispatch");

        let err = env
            .coordinator
            .dispatch_training(env.bob, b"sample".to_vec(), "en")
            .await
            .expect_err("second task rejected");
        assert!(matches!(err, PipelineError::TrainingAlreadyPending(_)));

        let outcome = env
            .coordinator
            .resolve_training_webhook(&TrainingCallback {
                request_id: task_id,
                model_id: Some("model-bob".into()),
                success: "true".into(),
                error_message: None,
            })
            .await
            .expect("resolve");
        assert_eq!(outcome, WebhookOutcome::Applied);

        let profile = env
            .store
            .voice_profile(env.bob)
            .await
            .expect("fetch")
            .expect("row");
        assert!(profile.trained);
        assert_eq!(profile.model_id.as_deref(), Some("model-bob"));

        assert!(matches!(
            bob_rx.try_recv().expect("notice"),
            ServerEvent::VoiceTrainingCompleted { success: true, .. }
        ));
        assert!(alice_rx.try_recv().is_err());
    }
}
