use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    QueryBuilder, Row, Sqlite,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use super::message_store::{
    DeleteMode, MessagePage, MessageStore, MessageStoreError, NewMessage, PageQuery, SortOrder,
    resolve_new_message, subtree_ids,
};
use crate::app::conversation::{Message, MessageContent, Role};
use crate::app::types::{ChatId, MessageId};

const MESSAGE_COLUMNS: &str = "id, chat_id, parent_id, role, content, created_at";

pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub async fn new(path: &Path) -> Result<Self, MessageStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MessageStoreError::connection(format!("Failed to create directory: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| MessageStoreError::connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        Self::connect(options).await
    }

    pub async fn new_in_memory() -> Result<Self, MessageStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| MessageStoreError::connection(format!("Invalid SQLite path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, MessageStoreError> {
        // A single connection keeps `sqlite::memory:` a single database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                MessageStoreError::connection(format!("Failed to connect to SQLite: {e}"))
            })?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), MessageStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MessageStoreError::Migration {
            message: format!("Failed to create chats table: {e}"),
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                parent_id TEXT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MessageStoreError::Migration {
            message: format!("Failed to create messages table: {e}"),
        })?;

        for (name, statement) in [
            (
                "idx_messages_chat_id",
                "CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id, id)",
            ),
            (
                "idx_messages_parent_id",
                "CREATE INDEX IF NOT EXISTS idx_messages_parent_id ON messages(parent_id)",
            ),
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| MessageStoreError::Migration {
                    message: format!("Failed to create index {name}: {e}"),
                })?;
        }

        Ok(())
    }

    fn message_from_row(row: &SqliteRow) -> Result<Message, MessageStoreError> {
        let column = |e: sqlx::Error| MessageStoreError::database(format!("Invalid row: {e}"));

        let role: String = row.try_get("role").map_err(column)?;
        let role = Role::from_str(&role)
            .map_err(|e| MessageStoreError::serialization(format!("Invalid role {role}: {e}")))?;
        let content: String = row.try_get("content").map_err(column)?;
        let content: MessageContent = serde_json::from_str(&content).map_err(|e| {
            MessageStoreError::serialization(format!("Invalid message content: {e}"))
        })?;
        let created_at: String = row.try_get("created_at").map_err(column)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| MessageStoreError::serialization(format!("Invalid timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(Message {
            id: MessageId::from_string(row.try_get::<String, _>("id").map_err(column)?),
            chat_id: ChatId::from_string(row.try_get::<String, _>("chat_id").map_err(column)?),
            parent_id: row
                .try_get::<Option<String>, _>("parent_id")
                .map_err(column)?
                .map(MessageId::from_string),
            role,
            content,
            created_at,
        })
    }

    async fn load_chat(&self, chat_id: &str) -> Result<Vec<Message>, MessageStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 ORDER BY id ASC"
        ))
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MessageStoreError::database(format!("Failed to load messages: {e}")))?;

        rows.iter().map(Self::message_from_row).collect()
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn fetch_page(
        &self,
        chat_id: &ChatId,
        query: PageQuery,
    ) -> Result<MessagePage, MessageStoreError> {
        query.validate()?;
        if !self.chat_exists(chat_id).await? {
            return Err(MessageStoreError::chat_not_found(chat_id));
        }

        let limit = query.effective_limit();
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = "));
        builder.push_bind(chat_id.as_str());
        if let Some(after) = &query.after {
            builder.push(" AND id > ").push_bind(after.as_str());
        }
        if let Some(before) = &query.before {
            builder.push(" AND id < ").push_bind(before.as_str());
        }
        builder.push(match query.order {
            SortOrder::Asc => " ORDER BY id ASC",
            SortOrder::Desc => " ORDER BY id DESC",
        });
        builder
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit + 1).unwrap_or(i64::MAX));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to fetch page: {e}")))?;
        let messages = rows
            .iter()
            .map(Self::message_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MessagePage::from_rows(messages, limit))
    }

    async fn list_by_ids(
        &self,
        chat_id: &ChatId,
        ids: &[MessageId],
    ) -> Result<Vec<Message>, MessageStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = "));
        builder.push_bind(chat_id.as_str());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(") ORDER BY id ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to list messages: {e}")))?;

        rows.iter().map(Self::message_from_row).collect()
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>, MessageStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MessageStoreError::database(format!("Failed to get message: {e}")))?;

        row.as_ref().map(Self::message_from_row).transpose()
    }

    async fn create(&self, message: NewMessage) -> Result<Message, MessageStoreError> {
        let mut tx =
            self.pool.begin().await.map_err(|e| {
                MessageStoreError::database(format!("Failed to begin transaction: {e}"))
            })?;

        let chat_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chats WHERE id = ?1")
            .bind(message.chat_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to check chat: {e}")))?;
        if chat_count == 0 {
            return Err(MessageStoreError::chat_not_found(&message.chat_id));
        }

        let parent_exists = match &message.parent_id {
            Some(parent_id) => {
                let count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM messages WHERE id = ?1 AND chat_id = ?2",
                )
                .bind(parent_id.as_str())
                .bind(message.chat_id.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    MessageStoreError::database(format!("Failed to check parent: {e}"))
                })?;
                count > 0
            }
            None => false,
        };

        let newest: Option<String> =
            sqlx::query_scalar("SELECT MAX(id) FROM messages WHERE chat_id = ?1")
                .bind(message.chat_id.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    MessageStoreError::database(format!("Failed to find newest message: {e}"))
                })?;
        let newest = newest.map(MessageId::from_string);

        let (id, parent_id) = resolve_new_message(&message, newest.as_ref(), parent_exists)?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE id = ?1")
            .bind(id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to check id: {e}")))?;
        if existing > 0 {
            return Err(MessageStoreError::invalid_request(format!(
                "Message {id} already exists"
            )));
        }

        let created = Message {
            id,
            chat_id: message.chat_id,
            parent_id,
            role: message.role,
            content: message.content,
            created_at: message.created_at.unwrap_or_else(Utc::now),
        };
        let content = serde_json::to_string(&created.content).map_err(|e| {
            MessageStoreError::serialization(format!("Failed to serialize content: {e}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_id, parent_id, role, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(created.id.as_str())
        .bind(created.chat_id.as_str())
        .bind(created.parent_id.as_deref())
        .bind(created.role.to_string())
        .bind(&content)
        .bind(created.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| MessageStoreError::database(format!("Failed to insert message: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to commit: {e}")))?;

        debug!(target: "message_store::create", id = %created.id, "Created message");
        Ok(created)
    }

    async fn update(
        &self,
        id: &MessageId,
        content: MessageContent,
    ) -> Result<Message, MessageStoreError> {
        let serialized = serde_json::to_string(&content).map_err(|e| {
            MessageStoreError::serialization(format!("Failed to serialize content: {e}"))
        })?;

        let result = sqlx::query("UPDATE messages SET content = ?1 WHERE id = ?2")
            .bind(&serialized)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to update message: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(MessageStoreError::message_not_found(id));
        }

        self.get(id)
            .await?
            .ok_or_else(|| MessageStoreError::message_not_found(id))
    }

    async fn delete(
        &self,
        id: &MessageId,
        mode: DeleteMode,
    ) -> Result<Vec<MessageId>, MessageStoreError> {
        let target = self
            .get(id)
            .await?
            .ok_or_else(|| MessageStoreError::message_not_found(id))?;
        // Loaded before the transaction takes the only pooled connection.
        let chat = match mode {
            DeleteMode::Single => Vec::new(),
            DeleteMode::Trailing { .. } => self.load_chat(&target.chat_id).await?,
        };

        let mut tx =
            self.pool.begin().await.map_err(|e| {
                MessageStoreError::database(format!("Failed to begin transaction: {e}"))
            })?;

        let removed = match mode {
            DeleteMode::Single => {
                let children: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE parent_id = ?1")
                        .bind(id.as_str())
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| {
                            MessageStoreError::database(format!("Failed to count children: {e}"))
                        })?;
                if target.parent_id.is_none() && children > 1 {
                    return Err(MessageStoreError::invalid_request(
                        "Cannot delete a root message with more than one child",
                    ));
                }

                sqlx::query("UPDATE messages SET parent_id = ?1 WHERE parent_id = ?2")
                    .bind(target.parent_id.as_deref())
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        MessageStoreError::database(format!("Failed to re-parent children: {e}"))
                    })?;
                vec![id.clone()]
            }
            DeleteMode::Trailing { exclude_self } => {
                let mut subtree = subtree_ids(chat.iter(), id);
                if exclude_self {
                    subtree.retain(|member| member != id);
                }
                subtree
            }
        };

        if !removed.is_empty() {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM messages WHERE id IN (");
            let mut separated = builder.separated(", ");
            for member in &removed {
                separated.push_bind(member.as_str());
            }
            separated.push_unseparated(")");
            builder.build().execute(&mut *tx).await.map_err(|e| {
                MessageStoreError::database(format!("Failed to delete messages: {e}"))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to commit: {e}")))?;

        debug!(target: "message_store::delete", id = %id, ?mode, removed = removed.len(), "Deleted messages");
        Ok(removed)
    }

    async fn create_chat(&self, chat_id: &ChatId) -> Result<(), MessageStoreError> {
        sqlx::query("INSERT OR IGNORE INTO chats (id) VALUES (?1)")
            .bind(chat_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to create chat: {e}")))?;
        Ok(())
    }

    async fn delete_chat(&self, chat_id: &ChatId) -> Result<(), MessageStoreError> {
        sqlx::query("DELETE FROM chats WHERE id = ?1")
            .bind(chat_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to delete chat: {e}")))?;
        Ok(())
    }

    async fn chat_exists(&self, chat_id: &ChatId) -> Result<bool, MessageStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chats WHERE id = ?1")
            .bind(chat_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MessageStoreError::database(format!("Failed to check chat: {e}")))?;
        Ok(count > 0)
    }
}
