use std::{collections::BTreeMap, fs, path::Path, str::FromStr};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::{
    domain::{ConversationId, DeliveryStatus, MemberId, MessageId, MessageKind, UserId},
    protocol::{MessageSummary, DELETED_MESSAGE_TOMBSTONE},
};

pub mod media;

pub use media::{LocalMediaStore, MediaStore};

/// Variant-specific payload of a message. Exactly one variant per message,
/// enforced by the type.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Text {
        content: String,
        translations: BTreeMap<String, String>,
    },
    Voice {
        audio_url: String,
        duration_secs: f64,
        translated: bool,
        translated_audio: BTreeMap<String, String>,
    },
    Image {
        image_url: String,
    },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Text { .. } => MessageKind::Text,
            MessagePayload::Voice { .. } => MessageKind::Voice,
            MessagePayload::Image { .. } => MessageKind::Image,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub member_id: MemberId,
    pub sender_id: UserId,
    pub reply_to: Option<MessageId>,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub member_id: MemberId,
    pub sender_id: UserId,
    pub payload: MessagePayload,
    pub reply_to: Option<MessageId>,
    pub status: DeliveryStatus,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub starred_by: Vec<UserId>,
    pub sent_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Client projection. A soft-deleted message keeps its row but every
    /// caller sees the tombstone and empty payload fields.
    pub fn summary(&self) -> MessageSummary {
        let mut summary = MessageSummary {
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            sender_member_id: self.member_id,
            kind: self.payload.kind(),
            content: None,
            translations: BTreeMap::new(),
            audio_url: None,
            duration_secs: None,
            translated_audio: BTreeMap::new(),
            image_url: None,
            reply_to: self.reply_to,
            starred_by: self.starred_by.clone(),
            status: self.status,
            is_deleted: self.is_deleted,
            sent_at: self.sent_at,
        };

        if self.is_deleted {
            summary.content = Some(DELETED_MESSAGE_TOMBSTONE.to_string());
            return summary;
        }

        match &self.payload {
            MessagePayload::Text {
                content,
                translations,
            } => {
                summary.content = Some(content.clone());
                summary.translations = translations.clone();
            }
            MessagePayload::Voice {
                audio_url,
                duration_secs,
                translated_audio,
                ..
            } => {
                summary.audio_url = Some(audio_url.clone());
                summary.duration_secs = Some(*duration_secs);
                summary.translated_audio = translated_audio.clone();
            }
            MessagePayload::Image { image_url } => {
                summary.image_url = Some(image_url.clone());
            }
        }
        summary
    }
}

#[derive(Debug, Clone)]
pub struct VoiceProfile {
    pub model_id: Option<String>,
    pub trained: bool,
}

/// Persistence seam for users, conversation membership and messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_user(&self, username: &str) -> Result<UserId>;
    async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>>;
    async fn update_last_seen(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()>;
    async fn voice_profile(&self, user_id: UserId) -> Result<Option<VoiceProfile>>;
    async fn set_voice_model(&self, user_id: UserId, model_id: &str, trained: bool) -> Result<()>;

    async fn create_conversation(&self, name: &str) -> Result<ConversationId>;
    async fn add_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<MemberId>;
    async fn member_for_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<MemberId>>;
    async fn remove_member(&self, conversation_id: ConversationId, user_id: UserId)
        -> Result<bool>;

    async fn insert_message(&self, new: NewMessage) -> Result<MessageId>;
    async fn message(&self, message_id: MessageId) -> Result<Option<StoredMessage>>;
    async fn list_conversation_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>>;
    async fn set_text_translation(
        &self,
        message_id: MessageId,
        language: &str,
        text: &str,
    ) -> Result<()>;
    async fn set_voice_translation(
        &self,
        message_id: MessageId,
        language: &str,
        audio_url: &str,
    ) -> Result<()>;
    async fn set_delivery_status(&self, message_id: MessageId, status: DeliveryStatus)
        -> Result<()>;
    async fn soft_delete_message(&self, message_id: MessageId) -> Result<()>;
    async fn star_message(&self, message_id: MessageId, user_id: UserId) -> Result<()>;
    async fn unstar_message(&self, message_id: MessageId, user_id: UserId) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                username        TEXT NOT NULL UNIQUE,
                last_seen_at    TEXT,
                voice_model_id  TEXT,
                voice_trained   INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure users table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id    INTEGER PRIMARY KEY AUTOINCREMENT,
                name  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure conversations table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS members (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id  INTEGER NOT NULL REFERENCES conversations(id),
                user_id          INTEGER NOT NULL REFERENCES users(id),
                UNIQUE (conversation_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure members table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id   INTEGER NOT NULL REFERENCES conversations(id),
                member_id         INTEGER NOT NULL REFERENCES members(id),
                sender_user_id    INTEGER NOT NULL REFERENCES users(id),
                kind              TEXT NOT NULL,
                content           TEXT,
                translations      TEXT NOT NULL DEFAULT '{}',
                audio_url         TEXT,
                duration_secs     REAL,
                voice_translated  INTEGER NOT NULL DEFAULT 0,
                translated_audio  TEXT NOT NULL DEFAULT '{}',
                image_url         TEXT,
                reply_to          INTEGER REFERENCES messages(id),
                status            TEXT NOT NULL DEFAULT 'sent',
                is_deleted        INTEGER NOT NULL DEFAULT 0,
                deleted_at        TEXT,
                sent_at           TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure messages table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_stars (
                message_id  INTEGER NOT NULL REFERENCES messages(id),
                user_id     INTEGER NOT NULL REFERENCES users(id),
                PRIMARY KEY (message_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure message_stars table exists")?;

        Ok(())
    }

    async fn starred_by(&self, message_id: MessageId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM message_stars WHERE message_id = ?")
            .bind(message_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    fn message_from_row(row: &sqlx::sqlite::SqliteRow, starred_by: Vec<UserId>) -> Result<StoredMessage> {
        let kind: String = row.get("kind");
        let payload = match kind.as_str() {
            "text" => MessagePayload::Text {
                content: row.get::<Option<String>, _>("content").unwrap_or_default(),
                translations: decode_lang_map(row.get("translations"))?,
            },
            "voice" => MessagePayload::Voice {
                audio_url: row.get::<Option<String>, _>("audio_url").unwrap_or_default(),
                duration_secs: row.get::<Option<f64>, _>("duration_secs").unwrap_or(0.0),
                translated: row.get::<i64, _>("voice_translated") != 0,
                translated_audio: decode_lang_map(row.get("translated_audio"))?,
            },
            "image" => MessagePayload::Image {
                image_url: row.get::<Option<String>, _>("image_url").unwrap_or_default(),
            },
            other => bail!("unknown message kind '{other}' in storage"),
        };

        let status = match row.get::<String, _>("status").as_str() {
            "delivered" => DeliveryStatus::Delivered,
            "read" => DeliveryStatus::Read,
            _ => DeliveryStatus::Sent,
        };

        Ok(StoredMessage {
            message_id: MessageId(row.get("id")),
            conversation_id: ConversationId(row.get("conversation_id")),
            member_id: MemberId(row.get("member_id")),
            sender_id: UserId(row.get("sender_user_id")),
            payload,
            reply_to: row.get::<Option<i64>, _>("reply_to").map(MessageId),
            status,
            is_deleted: row.get::<i64, _>("is_deleted") != 0,
            deleted_at: row
                .get::<Option<String>, _>("deleted_at")
                .and_then(|raw| raw.parse().ok()),
            starred_by,
            sent_at: row
                .get::<String, _>("sent_at")
                .parse()
                .context("invalid sent_at timestamp in storage")?,
        })
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn update_last_seen(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn voice_profile(&self, user_id: UserId) -> Result<Option<VoiceProfile>> {
        let row = sqlx::query("SELECT voice_model_id, voice_trained FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| VoiceProfile {
            model_id: r.get::<Option<String>, _>(0),
            trained: r.get::<i64, _>(1) != 0,
        }))
    }

    async fn set_voice_model(&self, user_id: UserId, model_id: &str, trained: bool) -> Result<()> {
        sqlx::query("UPDATE users SET voice_model_id = ?, voice_trained = ? WHERE id = ?")
            .bind(model_id)
            .bind(trained)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_conversation(&self, name: &str) -> Result<ConversationId> {
        let rec = sqlx::query("INSERT INTO conversations (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(ConversationId(rec.get::<i64, _>(0)))
    }

    async fn add_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<MemberId> {
        let rec = sqlx::query(
            "INSERT INTO members (conversation_id, user_id) VALUES (?, ?)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET user_id=excluded.user_id
             RETURNING id",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(MemberId(rec.get::<i64, _>(0)))
    }

    async fn member_for_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<MemberId>> {
        let row = sqlx::query("SELECT id FROM members WHERE conversation_id = ? AND user_id = ?")
            .bind(conversation_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| MemberId(r.get::<i64, _>(0))))
    }

    async fn remove_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM members WHERE conversation_id = ? AND user_id = ?")
            .bind(conversation_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<MessageId> {
        let sent_at = Utc::now();

        // Replies only ever point to strictly earlier messages in the same
        // conversation; a dangling or newer target is a validation failure.
        if let Some(reply_to) = new.reply_to {
            let row = sqlx::query("SELECT conversation_id, sent_at FROM messages WHERE id = ?")
                .bind(reply_to.0)
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else {
                bail!("reply target message {} does not exist", reply_to.0);
            };
            if ConversationId(row.get("conversation_id")) != new.conversation_id {
                bail!("reply target belongs to a different conversation");
            }
            let target_sent_at: DateTime<Utc> = row
                .get::<String, _>("sent_at")
                .parse()
                .context("invalid sent_at timestamp in storage")?;
            if target_sent_at > sent_at {
                bail!("reply target is newer than the reply");
            }
        }

        let (kind, content, translations, audio_url, duration_secs, translated, translated_audio, image_url) =
            match &new.payload {
                MessagePayload::Text {
                    content,
                    translations,
                } => (
                    "text",
                    Some(content.clone()),
                    encode_lang_map(translations)?,
                    None,
                    None,
                    false,
                    encode_lang_map(&BTreeMap::new())?,
                    None,
                ),
                MessagePayload::Voice {
                    audio_url,
                    duration_secs,
                    translated,
                    translated_audio,
                } => (
                    "voice",
                    None,
                    encode_lang_map(&BTreeMap::new())?,
                    Some(audio_url.clone()),
                    Some(*duration_secs),
                    *translated,
                    encode_lang_map(translated_audio)?,
                    None,
                ),
                MessagePayload::Image { image_url } => (
                    "image",
                    None,
                    encode_lang_map(&BTreeMap::new())?,
                    None,
                    None,
                    false,
                    encode_lang_map(&BTreeMap::new())?,
                    Some(image_url.clone()),
                ),
            };

        let rec = sqlx::query(
            "INSERT INTO messages (
                conversation_id, member_id, sender_user_id, kind, content, translations,
                audio_url, duration_secs, voice_translated, translated_audio, image_url,
                reply_to, status, sent_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'sent', ?)
             RETURNING id",
        )
        .bind(new.conversation_id.0)
        .bind(new.member_id.0)
        .bind(new.sender_id.0)
        .bind(kind)
        .bind(content)
        .bind(translations)
        .bind(audio_url)
        .bind(duration_secs)
        .bind(translated)
        .bind(translated_audio)
        .bind(image_url)
        .bind(new.reply_to.map(|id| id.0))
        .bind(sent_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    async fn message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let starred_by = self.starred_by(message_id).await?;
        Ok(Some(Self::message_from_row(&row, starred_by)?))
    }

    async fn list_conversation_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = match before {
            Some(before) => {
                sqlx::query(
                    "SELECT * FROM messages WHERE conversation_id = ? AND id < ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(conversation_id.0)
                .bind(before.0)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM messages WHERE conversation_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(conversation_id.0)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let message_id = MessageId(row.get("id"));
            let starred_by = self.starred_by(message_id).await?;
            messages.push(Self::message_from_row(row, starred_by)?);
        }
        Ok(messages)
    }

    async fn set_text_translation(
        &self,
        message_id: MessageId,
        language: &str,
        text: &str,
    ) -> Result<()> {
        let row = sqlx::query("SELECT translations FROM messages WHERE id = ? AND kind = 'text'")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            bail!("text message {} not found", message_id.0);
        };
        let mut translations = decode_lang_map(row.get(0))?;
        translations.insert(language.to_string(), text.to_string());
        sqlx::query("UPDATE messages SET translations = ? WHERE id = ?")
            .bind(encode_lang_map(&translations)?)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_voice_translation(
        &self,
        message_id: MessageId,
        language: &str,
        audio_url: &str,
    ) -> Result<()> {
        let row =
            sqlx::query("SELECT translated_audio FROM messages WHERE id = ? AND kind = 'voice'")
                .bind(message_id.0)
                .fetch_optional(&self.pool)
                .await?;
        let Some(row) = row else {
            bail!("voice message {} not found", message_id.0);
        };
        let mut translated_audio = decode_lang_map(row.get(0))?;
        translated_audio.insert(language.to_string(), audio_url.to_string());
        sqlx::query("UPDATE messages SET translated_audio = ?, voice_translated = 1 WHERE id = ?")
            .bind(encode_lang_map(&translated_audio)?)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_delivery_status(
        &self,
        message_id: MessageId,
        status: DeliveryStatus,
    ) -> Result<()> {
        let status = match status {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        };
        sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn soft_delete_message(&self, message_id: MessageId) -> Result<()> {
        sqlx::query("UPDATE messages SET is_deleted = 1, deleted_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn star_message(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_stars (message_id, user_id) VALUES (?, ?)
             ON CONFLICT(message_id, user_id) DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unstar_message(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM message_stars WHERE message_id = ? AND user_id = ?")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn encode_lang_map(map: &BTreeMap<String, String>) -> Result<String> {
    serde_json::to_string(map).context("failed to encode language map")
}

fn decode_lang_map(raw: String) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(&raw).context("failed to decode language map")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for '{database_url}'")
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (SqliteStore, ConversationId, MemberId, UserId) {
        let store = SqliteStore::new("sqlite::memory:").await.expect("db");
        let user = store.create_user("alice").await.expect("user");
        let conversation = store.create_conversation("general").await.expect("conv");
        let member = store.add_member(conversation, user).await.expect("member");
        (store, conversation, member, user)
    }

    fn text_message(
        conversation_id: ConversationId,
        member_id: MemberId,
        sender_id: UserId,
        content: &str,
    ) -> NewMessage {
        NewMessage {
            conversation_id,
            member_id,
            sender_id,
            reply_to: None,
            payload: MessagePayload::Text {
                content: content.to_string(),
                translations: BTreeMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn round_trips_each_payload_variant() {
        let (store, conversation, member, user) = setup().await;

        let text = store
            .insert_message(text_message(conversation, member, user, "hello"))
            .await
            .expect("text");
        let voice = store
            .insert_message(NewMessage {
                conversation_id: conversation,
                member_id: member,
                sender_id: user,
                reply_to: None,
                payload: MessagePayload::Voice {
                    audio_url: "/media/a.wav".into(),
                    duration_secs: 2.5,
                    translated: false,
                    translated_audio: BTreeMap::new(),
                },
            })
            .await
            .expect("voice");

        let stored = store.message(text).await.expect("fetch").expect("exists");
        assert!(matches!(stored.payload, MessagePayload::Text { ref content, .. } if content == "hello"));

        let stored = store.message(voice).await.expect("fetch").expect("exists");
        match stored.payload {
            MessagePayload::Voice {
                audio_url,
                duration_secs,
                ..
            } => {
                assert_eq!(audio_url, "/media/a.wav");
                assert_eq!(duration_secs, 2.5);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_reply_to_missing_message() {
        let (store, conversation, member, user) = setup().await;
        let mut new = text_message(conversation, member, user, "reply");
        new.reply_to = Some(MessageId(999));
        let err = store.insert_message(new).await.expect_err("should fail");
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn rejects_reply_across_conversations() {
        let (store, conversation, member, user) = setup().await;
        let other_conversation = store.create_conversation("other").await.expect("conv");
        let other_member = store
            .add_member(other_conversation, user)
            .await
            .expect("member");
        let original = store
            .insert_message(text_message(other_conversation, other_member, user, "hi"))
            .await
            .expect("original");

        let mut new = text_message(conversation, member, user, "reply");
        new.reply_to = Some(original);
        let err = store.insert_message(new).await.expect_err("should fail");
        assert!(err.to_string().contains("different conversation"));
    }

    #[tokio::test]
    async fn accepts_reply_to_earlier_message() {
        let (store, conversation, member, user) = setup().await;
        let original = store
            .insert_message(text_message(conversation, member, user, "hi"))
            .await
            .expect("original");

        let mut new = text_message(conversation, member, user, "reply");
        new.reply_to = Some(original);
        let reply = store.insert_message(new).await.expect("reply");

        let stored = store.message(reply).await.expect("fetch").expect("exists");
        assert_eq!(stored.reply_to, Some(original));
    }

    #[tokio::test]
    async fn soft_deleted_summary_is_tombstoned_for_every_caller() {
        let (store, conversation, member, user) = setup().await;
        let id = store
            .insert_message(text_message(conversation, member, user, "secret"))
            .await
            .expect("insert");
        store.soft_delete_message(id).await.expect("delete");

        let stored = store.message(id).await.expect("fetch").expect("row kept");
        assert!(stored.is_deleted);

        let summary = stored.summary();
        assert_eq!(summary.content.as_deref(), Some(DELETED_MESSAGE_TOMBSTONE));
        assert!(summary.translations.is_empty());
        assert!(summary.audio_url.is_none());
        assert!(summary.image_url.is_none());
    }

    #[tokio::test]
    async fn translation_entries_accumulate_per_language() {
        let (store, conversation, member, user) = setup().await;
        let id = store
            .insert_message(text_message(conversation, member, user, "hello"))
            .await
            .expect("insert");

        store
            .set_text_translation(id, "es", "hola")
            .await
            .expect("es");
        store
            .set_text_translation(id, "fr", "bonjour")
            .await
            .expect("fr");

        let stored = store.message(id).await.expect("fetch").expect("exists");
        let MessagePayload::Text { translations, .. } = stored.payload else {
            panic!("expected text payload");
        };
        assert_eq!(translations.get("es").map(String::as_str), Some("hola"));
        assert_eq!(translations.get("fr").map(String::as_str), Some("bonjour"));
    }

    #[tokio::test]
    async fn starring_is_idempotent() {
        let (store, conversation, member, user) = setup().await;
        let id = store
            .insert_message(text_message(conversation, member, user, "hello"))
            .await
            .expect("insert");

        store.star_message(id, user).await.expect("star");
        store.star_message(id, user).await.expect("star again");

        let stored = store.message(id).await.expect("fetch").expect("exists");
        assert_eq!(stored.starred_by, vec![user]);

        store.unstar_message(id, user).await.expect("unstar");
        let stored = store.message(id).await.expect("fetch").expect("exists");
        assert!(stored.starred_by.is_empty());
    }

    #[tokio::test]
    async fn removing_a_member_revokes_lookup() {
        let (store, conversation, _, user) = setup().await;
        assert!(store
            .member_for_user(conversation, user)
            .await
            .expect("lookup")
            .is_some());

        assert!(store.remove_member(conversation, user).await.expect("remove"));
        assert!(store
            .member_for_user(conversation, user)
            .await
            .expect("lookup")
            .is_none());
        assert!(!store.remove_member(conversation, user).await.expect("second remove"));
    }

    #[tokio::test]
    async fn voice_profile_tracks_training_state() {
        let (store, _, _, user) = setup().await;
        let profile = store.voice_profile(user).await.expect("fetch").expect("row");
        assert!(!profile.trained);
        assert!(profile.model_id.is_none());

        store
            .set_voice_model(user, "model-1", true)
            .await
            .expect("set");
        let profile = store.voice_profile(user).await.expect("fetch").expect("row");
        assert!(profile.trained);
        assert_eq!(profile.model_id.as_deref(), Some("model-1"));
    }
}
