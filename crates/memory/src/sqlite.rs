//! SQLite backend for both memory entries and conversation history.
//!
//! One database file, three tables:
//! - `conversations`: conversation metadata
//! - `messages`: append-only log; content blocks stored as JSON
//! - `memories`: key/value facts, unique per (conversation, key)
//!
//! The pool is opened once at startup and shared by both store traits.
//! Call [`SqliteStore::close`] during shutdown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grantwell_core::error::{HistoryError, MemoryError};
use grantwell_core::history::HistoryStore;
use grantwell_core::memory::{MemoryEntry, MemoryStore};
use grantwell_core::message::{ContentBlock, Conversation, ConversationId, Message, Role};
use grantwell_core::AgentType;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, info};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn connect(path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MemoryError::Storage(format!("Cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {}", path.display());
        Ok(store)
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("SQLite pool closed");
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        let statements = [
            (
                "conversations table",
                r#"
                CREATE TABLE IF NOT EXISTS conversations (
                    id          TEXT PRIMARY KEY,
                    user_id     TEXT NOT NULL,
                    agent_type  TEXT NOT NULL,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages table",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
                    id               TEXT UNIQUE NOT NULL,
                    conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    role             TEXT NOT NULL,
                    content          TEXT NOT NULL,
                    created_at       TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages index",
                "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq)",
            ),
            (
                "memories table",
                r#"
                CREATE TABLE IF NOT EXISTS memories (
                    iid              INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id  TEXT NOT NULL,
                    key              TEXT NOT NULL,
                    value            TEXT NOT NULL,
                    created_at       TEXT NOT NULL,
                    updated_at       TEXT NOT NULL,
                    UNIQUE(conversation_id, key)
                )
                "#,
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| MemoryError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryEntry, MemoryError> {
    let get = |col: &str| -> Result<String, MemoryError> {
        row.try_get(col)
            .map_err(|e| MemoryError::QueryFailed(format!("{col} column: {e}")))
    };

    Ok(MemoryEntry {
        conversation_id: ConversationId(get("conversation_id")?),
        key: get("key")?,
        value: get("value")?,
        created_at: parse_time(&get("created_at")?),
        updated_at: parse_time(&get("updated_at")?),
    })
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, HistoryError> {
    let get = |col: &str| -> Result<String, HistoryError> {
        row.try_get(col)
            .map_err(|e| HistoryError::QueryFailed(format!("{col} column: {e}")))
    };

    let agent_type: AgentType = get("agent_type")?
        .parse()
        .map_err(HistoryError::QueryFailed)?;

    Ok(Conversation {
        id: ConversationId(get("id")?),
        user_id: get("user_id")?,
        agent_type,
        created_at: parse_time(&get("created_at")?),
        updated_at: parse_time(&get("updated_at")?),
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, HistoryError> {
    let get = |col: &str| -> Result<String, HistoryError> {
        row.try_get(col)
            .map_err(|e| HistoryError::QueryFailed(format!("{col} column: {e}")))
    };

    let role: Role = get("role")?.parse().map_err(HistoryError::QueryFailed)?;
    let content: Vec<ContentBlock> = serde_json::from_str(&get("content")?)
        .map_err(|e| HistoryError::QueryFailed(format!("message content: {e}")))?;

    Ok(Message {
        id: get("id")?,
        conversation_id: ConversationId(get("conversation_id")?),
        role,
        content,
        created_at: parse_time(&get("created_at")?),
    })
}

#[async_trait]
impl MemoryStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn store(
        &self,
        conversation_id: &ConversationId,
        key: &str,
        value: &str,
    ) -> Result<MemoryEntry, MemoryError> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            r#"
            INSERT INTO memories (conversation_id, key, value, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(conversation_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            RETURNING conversation_id, key, value, created_at, updated_at
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(key)
        .bind(value)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("store: {e}")))?;

        row_to_entry(&row)
    }

    async fn recall(
        &self,
        conversation_id: &ConversationId,
        key: &str,
    ) -> Result<Option<MemoryEntry>, MemoryError> {
        let row = sqlx::query(
            "SELECT conversation_id, key, value, created_at, updated_at \
             FROM memories WHERE conversation_id = ?1 AND key = ?2",
        )
        .bind(conversation_id.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("recall: {e}")))?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn list(&self, conversation_id: &ConversationId) -> Result<Vec<MemoryEntry>, MemoryError> {
        let rows = sqlx::query(
            "SELECT conversation_id, key, value, created_at, updated_at \
             FROM memories WHERE conversation_id = ?1 ORDER BY iid ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("list: {e}")))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn clear(&self, conversation_id: &ConversationId) -> Result<usize, MemoryError> {
        let result = sqlx::query("DELETE FROM memories WHERE conversation_id = ?1")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("clear: {e}")))?;

        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, HistoryError> {
        let row = sqlx::query(
            "SELECT id, user_id, agent_type, created_at, updated_at \
             FROM conversations WHERE id = ?1",
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| HistoryError::QueryFailed(format!("get conversation: {e}")))?;

        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, agent_type, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(conversation.id.as_str())
        .bind(&conversation.user_id)
        .bind(conversation.agent_type.as_str())
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| HistoryError::Storage(format!("create conversation: {e}")))?;

        Ok(())
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, HistoryError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, created_at \
             FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HistoryError::QueryFailed(format!("get messages: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn save_message(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: Vec<ContentBlock>,
    ) -> Result<Message, HistoryError> {
        let message = Message::new(conversation_id.clone(), role, content);
        self.append(conversation_id, std::slice::from_ref(&message))
            .await?;
        Ok(message)
    }

    async fn save_exchange(
        &self,
        conversation_id: &ConversationId,
        user: Vec<ContentBlock>,
        assistant: Vec<ContentBlock>,
    ) -> Result<(Message, Message), HistoryError> {
        let user = Message::new(conversation_id.clone(), Role::User, user);
        let assistant = Message::new(conversation_id.clone(), Role::Assistant, assistant);
        self.append(conversation_id, &[user.clone(), assistant.clone()])
            .await?;
        Ok((user, assistant))
    }
}

impl SqliteStore {
    /// Insert `messages` in order and touch the conversation, all in one
    /// transaction. Either every row lands or none does.
    async fn append(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<(), HistoryError> {
        let Some(last) = messages.last() else {
            return Ok(());
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| HistoryError::Storage(format!("begin: {e}")))?;

        let touched = sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2")
            .bind(last.created_at.to_rfc3339())
            .bind(conversation_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| HistoryError::Storage(format!("touch conversation: {e}")))?;
        if touched.rows_affected() == 0 {
            return Err(HistoryError::ConversationNotFound(conversation_id.to_string()));
        }

        for message in messages {
            let content_json = serde_json::to_string(&message.content)
                .map_err(|e| HistoryError::Storage(format!("encode content: {e}")))?;
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&message.id)
            .bind(conversation_id.as_str())
            .bind(message.role.as_str())
            .bind(&content_json)
            .bind(message.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| HistoryError::Storage(format!("insert message: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| HistoryError::Storage(format!("commit: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(&dir.path().join("test.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn upsert_on_conflict() {
        let (db, _dir) = test_store().await;
        let conv = ConversationId::from("c1");

        let first = db.store(&conv, "company_name", "Acme").await.unwrap();
        db.store(&conv, "company_name", "Acme").await.unwrap();
        let latest = db.store(&conv, "company_name", "Acme Inc").await.unwrap();

        let all = db.list(&conv).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, "Acme Inc");
        assert_eq!(latest.created_at, first.created_at);
    }

    #[tokio::test]
    async fn recall_and_list_order() {
        let (db, _dir) = test_store().await;
        let conv = ConversationId::from("c1");
        db.store(&conv, "b", "2").await.unwrap();
        db.store(&conv, "a", "1").await.unwrap();
        db.store(&conv, "b", "3").await.unwrap();

        let keys: Vec<_> = db
            .list(&conv)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["b", "a"]);

        assert_eq!(db.recall(&conv, "a").await.unwrap().unwrap().value, "1");
        assert!(db.recall(&conv, "zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_is_scoped_to_conversation() {
        let (db, _dir) = test_store().await;
        let a = ConversationId::from("a");
        let b = ConversationId::from("b");
        db.store(&a, "k", "v").await.unwrap();
        db.store(&b, "k", "v").await.unwrap();

        assert_eq!(db.clear(&a).await.unwrap(), 1);
        assert!(db.list(&a).await.unwrap().is_empty());
        assert_eq!(db.list(&b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn messages_roundtrip_with_blocks() {
        let (db, _dir) = test_store().await;
        let conv = ConversationId::from("c1");
        db.ensure_conversation(&conv, "user-1", AgentType::CanexportClaims)
            .await
            .unwrap();

        db.save_message(
            &conv,
            Role::User,
            vec![
                ContentBlock::Image {
                    media_type: "image/jpeg".into(),
                    data: "/9j/4AAQ".into(),
                },
                ContentBlock::text("What is this receipt?"),
            ],
        )
        .await
        .unwrap();
        db.save_message(&conv, Role::Assistant, vec![ContentBlock::text("A hotel bill.")])
            .await
            .unwrap();

        let messages = db.get_conversation_messages(&conv).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].content[0], ContentBlock::Image { .. }));
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].text(), "A hotel bill.");

        let stored = db.get_conversation(&conv).await.unwrap().unwrap();
        assert_eq!(stored.agent_type, AgentType::CanexportClaims);
        assert!(stored.updated_at >= stored.created_at);
    }

    #[tokio::test]
    async fn save_to_unknown_conversation_fails() {
        let (db, _dir) = test_store().await;
        let err = db
            .save_message(
                &ConversationId::from("ghost"),
                Role::User,
                vec![ContentBlock::text("hi")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn exchange_is_saved_in_order() {
        let (db, _dir) = test_store().await;
        let conv = ConversationId::from("c1");
        db.ensure_conversation(&conv, "user-1", AgentType::GrantCards)
            .await
            .unwrap();

        db.save_exchange(
            &conv,
            vec![ContentBlock::text("question")],
            vec![ContentBlock::text("answer")],
        )
        .await
        .unwrap();

        let messages = db.get_conversation_messages(&conv).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].text(), "answer");
    }

    #[tokio::test]
    async fn failed_assistant_insert_rolls_back_the_exchange() {
        let (db, _dir) = test_store().await;
        let conv = ConversationId::from("c1");
        db.ensure_conversation(&conv, "user-1", AgentType::GrantCards)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_assistant BEFORE INSERT ON messages \
             WHEN NEW.role = 'assistant' \
             BEGIN SELECT RAISE(ABORT, 'assistant rejected'); END",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let err = db
            .save_exchange(
                &conv,
                vec![ContentBlock::text("question")],
                vec![ContentBlock::text("answer")],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HistoryError::Storage(_)));
        assert!(db.get_conversation_messages(&conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let conv = ConversationId::from("c1");

        let db = SqliteStore::connect(&path).await.unwrap();
        db.store(&conv, "province", "BC").await.unwrap();
        db.close().await;

        let reopened = SqliteStore::connect(&path).await.unwrap();
        assert_eq!(
            reopened.recall(&conv, "province").await.unwrap().unwrap().value,
            "BC"
        );
    }
}
