//! Conversation persistence: users' conversations, messages, and the mapping
//! from stored messages to the platform messages they were rendered into.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rb_channels::MessageId;
use rb_llm::{ChatMessage, Role};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub type ConversationId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&MessageRecord> for ChatMessage {
    fn from(record: &MessageRecord) -> Self {
        ChatMessage::new(record.role, record.content.clone())
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub role: Role,
    pub content: String,
}

/// Links one stored message to one platform message. A stored message may
/// have several (a long answer spans several platform messages); a platform
/// message belongs to at most one stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignMessageMapping {
    pub message_id: i64,
    pub channel_id: String,
    pub chat_id: String,
    pub external_id: i64,
}

impl ForeignMessageMapping {
    /// `None` when the platform id does not fit the mapping's integer column.
    pub fn new(
        message_id: i64,
        channel_id: &str,
        chat_id: &str,
        external_id: &MessageId,
    ) -> Option<Self> {
        let external_id = external_id.as_str().trim().parse::<i64>().ok()?;
        Some(Self {
            message_id,
            channel_id: channel_id.to_string(),
            chat_id: chat_id.to_string(),
            external_id,
        })
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// The user's current conversation, created on first use.
    async fn active_conversation(&self, user_id: &str) -> Result<ConversationId>;

    /// Close the current conversation (if any) and open a fresh one.
    async fn start_conversation(&self, user_id: &str) -> Result<ConversationId>;

    /// Up to `limit` most recent messages, oldest first.
    async fn history(&self, conversation_id: ConversationId, limit: usize)
    -> Result<Vec<MessageRecord>>;

    async fn create_message(&self, message: NewMessage) -> Result<MessageRecord>;

    async fn create_foreign_mapping(&self, mapping: ForeignMessageMapping) -> Result<()>;

    async fn model_override(&self, user_id: &str) -> Result<Option<String>>;

    async fn set_model_override(&self, user_id: &str, model: Option<String>) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || Connection::open(&path))
            .await
            .context("sqlite open task failed")??;
        Self::from_connection(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))?;
            Ok(f(&mut guard)?)
        })
        .await
        .context("sqlite task failed")?
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS conversations_user_active
    ON conversations (user_id, active);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations (id),
    user_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_conversation
    ON messages (conversation_id, id);

CREATE TABLE IF NOT EXISTS foreign_message_mappings (
    message_id INTEGER NOT NULL REFERENCES messages (id),
    channel_id TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    external_id INTEGER NOT NULL,
    PRIMARY KEY (channel_id, chat_id, external_id)
);

CREATE TABLE IF NOT EXISTS user_settings (
    user_id TEXT PRIMARY KEY,
    model_override TEXT,
    updated_at TEXT NOT NULL
);
"#,
            )
        })
        .await
        .context("ensure sqlite schema")
    }
}

fn insert_conversation(conn: &Connection, user_id: &str) -> rusqlite::Result<ConversationId> {
    conn.execute(
        "INSERT INTO conversations (user_id, active, created_at) VALUES (?1, 1, ?2)",
        params![user_id, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get("role")?;
    let created_at: String = row.get("created_at")?;
    Ok(MessageRecord {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        user_id: row.get("user_id")?,
        role: Role::parse(&role).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, format!("role={role}"), rusqlite::types::Type::Text)
        })?,
        content: row.get("content")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn active_conversation(&self, user_id: &str) -> Result<ConversationId> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<ConversationId> = tx
                .query_row(
                    "SELECT id FROM conversations WHERE user_id = ?1 AND active = 1 \
                     ORDER BY id DESC LIMIT 1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            let id = match existing {
                Some(id) => id,
                None => insert_conversation(&tx, &user_id)?,
            };
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn start_conversation(&self, user_id: &str) -> Result<ConversationId> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE conversations SET active = 0 WHERE user_id = ?1 AND active = 1",
                params![user_id],
            )?;
            let id = insert_conversation(&tx, &user_id)?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn history(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, user_id, role, content, created_at \
                   FROM messages WHERE conversation_id = ?1 \
                  ORDER BY id DESC LIMIT ?2",
            )?;
            let mut records = stmt
                .query_map(params![conversation_id, limit], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            records.reverse();
            Ok(records)
        })
        .await
    }

    async fn create_message(&self, message: NewMessage) -> Result<MessageRecord> {
        self.with_conn(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO messages (conversation_id, user_id, role, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.conversation_id,
                    message.user_id,
                    message.role.as_str(),
                    message.content,
                    created_at.to_rfc3339()
                ],
            )?;
            Ok(MessageRecord {
                id: conn.last_insert_rowid(),
                conversation_id: message.conversation_id,
                user_id: message.user_id,
                role: message.role,
                content: message.content,
                created_at,
            })
        })
        .await
    }

    async fn create_foreign_mapping(&self, mapping: ForeignMessageMapping) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO foreign_message_mappings (message_id, channel_id, chat_id, external_id) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    mapping.message_id,
                    mapping.channel_id,
                    mapping.chat_id,
                    mapping.external_id
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn model_override(&self, user_id: &str) -> Result<Option<String>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let value: Option<Option<String>> = conn
                .query_row(
                    "SELECT model_override FROM user_settings WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.flatten())
        })
        .await
    }

    async fn set_model_override(&self, user_id: &str, model: Option<String>) -> Result<()> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO user_settings (user_id, model_override, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT (user_id) DO UPDATE SET \
                   model_override = excluded.model_override, \
                   updated_at = excluded.updated_at",
                params![user_id, model, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::open_in_memory().await.expect("open sqlite")
    }

    fn new_message(conversation_id: ConversationId, role: Role, content: &str) -> NewMessage {
        NewMessage {
            conversation_id,
            user_id: "telegram:42".to_string(),
            role,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn active_conversation_is_stable_until_a_new_one_starts() {
        let store = store().await;
        let first = store.active_conversation("u").await.expect("conversation");
        assert_eq!(store.active_conversation("u").await.expect("again"), first);
        let other_user = store.active_conversation("v").await.expect("other");
        assert_ne!(other_user, first);

        let second = store.start_conversation("u").await.expect("new");
        assert_ne!(second, first);
        assert_eq!(store.active_conversation("u").await.expect("active"), second);
    }

    #[tokio::test]
    async fn history_returns_latest_messages_oldest_first() {
        let store = store().await;
        let conv = store.active_conversation("u").await.expect("conversation");
        for n in 0..5 {
            let role = if n % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .create_message(new_message(conv, role, &format!("m{n}")))
                .await
                .expect("insert");
        }
        let history = store.history(conv, 3).await.expect("history");
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(ChatMessage::from(&history[2]).content, "m4");
    }

    #[tokio::test]
    async fn one_message_maps_to_many_external_ids_but_not_the_reverse() {
        let store = store().await;
        let conv = store.active_conversation("u").await.expect("conversation");
        let first = store
            .create_message(new_message(conv, Role::Assistant, "long"))
            .await
            .expect("insert");
        let second = store
            .create_message(new_message(conv, Role::Assistant, "other"))
            .await
            .expect("insert");

        for external in ["100", "101"] {
            let mapping = ForeignMessageMapping::new(first.id, "telegram", "42", &external.into())
                .expect("numeric id");
            store.create_foreign_mapping(mapping).await.expect("map");
        }
        let clash = ForeignMessageMapping::new(second.id, "telegram", "42", &"100".into())
            .expect("numeric id");
        assert!(store.create_foreign_mapping(clash).await.is_err());
    }

    #[test]
    fn unrepresentable_external_ids_are_rejected() {
        assert!(ForeignMessageMapping::new(1, "telegram", "42", &"99999999999999999999".into()).is_none());
        assert!(ForeignMessageMapping::new(1, "telegram", "42", &"abc".into()).is_none());
        assert!(ForeignMessageMapping::new(1, "telegram", "42", &"7".into()).is_some());
    }

    #[tokio::test]
    async fn model_override_round_trips_and_clears() {
        let store = store().await;
        assert_eq!(store.model_override("u").await.expect("read"), None);
        store
            .set_model_override("u", Some("claude-3-5-haiku-latest".to_string()))
            .await
            .expect("set");
        assert_eq!(
            store.model_override("u").await.expect("read").as_deref(),
            Some("claude-3-5-haiku-latest")
        );
        store.set_model_override("u", None).await.expect("clear");
        assert_eq!(store.model_override("u").await.expect("read"), None);
    }
}
