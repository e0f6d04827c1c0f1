use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::app::conversation::{Message, MessageContent, Role};
use crate::app::types::{ChatId, MessageId};

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageStoreError {
    #[error("Chat not found: {chat_id}")]
    ChatNotFound { chat_id: String },

    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("Parent message not found: {parent_id}")]
    ParentNotFound { parent_id: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl MessageStoreError {
    pub fn chat_not_found(chat_id: &ChatId) -> Self {
        Self::ChatNotFound {
            chat_id: chat_id.to_string(),
        }
    }

    pub fn message_not_found(message_id: &str) -> Self {
        Self::MessageNotFound {
            message_id: message_id.to_string(),
        }
    }

    pub fn parent_not_found(parent_id: &str) -> Self {
        Self::ParentNotFound {
            parent_id: parent_id.to_string(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Cursor query over the messages of one chat, keyed by message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    /// Only ids strictly greater than this cursor
    pub after: Option<MessageId>,
    /// Only ids strictly smaller than this cursor
    pub before: Option<MessageId>,
    pub limit: usize,
    pub order: SortOrder,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            limit: DEFAULT_PAGE_LIMIT,
            order: SortOrder::default(),
        }
    }
}

impl PageQuery {
    /// First ascending page.
    pub fn first(limit: usize) -> Self {
        Self {
            limit,
            order: SortOrder::Asc,
            ..Self::default()
        }
    }

    /// Ascending page following `cursor`.
    pub fn after(cursor: MessageId, limit: usize) -> Self {
        Self {
            after: Some(cursor),
            ..Self::first(limit)
        }
    }

    pub fn validate(&self) -> Result<(), MessageStoreError> {
        if self.after.is_some() && self.before.is_some() {
            return Err(MessageStoreError::invalid_request(
                "Cannot use 'after' and 'before' simultaneously",
            ));
        }
        Ok(())
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn matches(&self, id: &str) -> bool {
        self.after.as_deref().is_none_or(|after| id > after)
            && self.before.as_deref().is_none_or(|before| id < before)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub first: Option<MessageId>,
    pub last: Option<MessageId>,
}

impl MessagePage {
    /// Builds a page from up to `limit + 1` ordered rows.
    pub fn from_rows(mut rows: Vec<Message>, limit: usize) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        Self {
            first: rows.first().map(|message| message.id.clone()),
            last: rows.last().map(|message| message.id.clone()),
            messages: rows,
            has_more,
        }
    }

    pub fn next_cursor(&self) -> Option<&MessageId> {
        if self.has_more {
            self.last.as_ref()
        } else {
            None
        }
    }
}

/// Input for [`MessageStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub id: Option<MessageId>,
    pub chat_id: ChatId,
    pub parent_id: Option<MessageId>,
    /// Explicitly starts a new root. Without it a missing parent means
    /// "append after the newest message of the chat".
    pub is_root: bool,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: Some(message.id.clone()),
            chat_id: message.chat_id.clone(),
            parent_id: message.parent_id.clone(),
            is_root: message.parent_id.is_none(),
            role: message.role,
            content: message.content.clone(),
            created_at: Some(message.created_at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Remove one message; its children move up to its parent.
    Single,
    /// Remove the message's whole subtree.
    Trailing { exclude_self: bool },
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn fetch_page(
        &self,
        chat_id: &ChatId,
        query: PageQuery,
    ) -> Result<MessagePage, MessageStoreError>;

    async fn list_by_ids(
        &self,
        chat_id: &ChatId,
        ids: &[MessageId],
    ) -> Result<Vec<Message>, MessageStoreError>;

    async fn get(&self, id: &MessageId) -> Result<Option<Message>, MessageStoreError>;

    async fn create(&self, message: NewMessage) -> Result<Message, MessageStoreError>;

    async fn update(
        &self,
        id: &MessageId,
        content: MessageContent,
    ) -> Result<Message, MessageStoreError>;

    /// Deletes according to `mode` and returns the ids that were removed.
    async fn delete(
        &self,
        id: &MessageId,
        mode: DeleteMode,
    ) -> Result<Vec<MessageId>, MessageStoreError>;

    async fn create_chat(&self, chat_id: &ChatId) -> Result<(), MessageStoreError>;

    async fn delete_chat(&self, chat_id: &ChatId) -> Result<(), MessageStoreError>;

    async fn chat_exists(&self, chat_id: &ChatId) -> Result<bool, MessageStoreError>;
}

/// Resolves the parent and id of a new message against the current newest
/// message and parent lookup of its chat.
pub(crate) fn resolve_new_message(
    message: &NewMessage,
    newest: Option<&MessageId>,
    parent_exists: bool,
) -> Result<(MessageId, Option<MessageId>), MessageStoreError> {
    let parent_id = match (&message.parent_id, message.is_root) {
        (Some(_), true) => {
            return Err(MessageStoreError::invalid_request(
                "A root message cannot have a parent",
            ));
        }
        (Some(parent_id), false) => {
            if !parent_exists {
                return Err(MessageStoreError::parent_not_found(parent_id));
            }
            Some(parent_id.clone())
        }
        (None, true) => None,
        (None, false) => newest.cloned(),
    };

    let id = match &message.id {
        Some(id) => {
            if let Some(parent_id) = parent_id.as_ref().filter(|parent_id| id <= *parent_id) {
                return Err(MessageStoreError::invalid_request(format!(
                    "Message id {id} must sort after its parent {parent_id}"
                )));
            }
            id.clone()
        }
        None => MessageId::generate_after(parent_id.as_ref()),
    };

    Ok((id, parent_id))
}

#[derive(Default)]
struct InMemoryState {
    chats: HashMap<ChatId, BTreeMap<MessageId, Message>>,
    owners: HashMap<MessageId, ChatId>,
}

impl InMemoryState {
    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        let chat_id = self.owners.get(id)?;
        self.chats.get_mut(chat_id)?.get_mut(id)
    }
}

pub struct InMemoryMessageStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(InMemoryState::default()),
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn fetch_page(
        &self,
        chat_id: &ChatId,
        query: PageQuery,
    ) -> Result<MessagePage, MessageStoreError> {
        query.validate()?;
        let state = self
            .state
            .read()
            .map_err(|_| MessageStoreError::lock_poisoned("messages"))?;
        let messages = state
            .chats
            .get(chat_id)
            .ok_or_else(|| MessageStoreError::chat_not_found(chat_id))?;

        let limit = query.effective_limit();
        let matching = messages
            .values()
            .filter(|message| query.matches(&message.id));
        let rows: Vec<Message> = match query.order {
            SortOrder::Asc => matching.take(limit + 1).cloned().collect(),
            SortOrder::Desc => matching.rev().take(limit + 1).cloned().collect(),
        };
        Ok(MessagePage::from_rows(rows, limit))
    }

    async fn list_by_ids(
        &self,
        chat_id: &ChatId,
        ids: &[MessageId],
    ) -> Result<Vec<Message>, MessageStoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| MessageStoreError::lock_poisoned("messages"))?;
        let Some(messages) = state.chats.get(chat_id) else {
            return Ok(Vec::new());
        };
        let wanted: HashSet<&MessageId> = ids.iter().collect();
        Ok(messages
            .values()
            .filter(|message| wanted.contains(&message.id))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>, MessageStoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| MessageStoreError::lock_poisoned("messages"))?;
        Ok(state
            .owners
            .get(id)
            .and_then(|chat_id| state.chats.get(chat_id))
            .and_then(|messages| messages.get(id))
            .cloned())
    }

    async fn create(&self, message: NewMessage) -> Result<Message, MessageStoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| MessageStoreError::lock_poisoned("messages"))?;
        let messages = state
            .chats
            .get(&message.chat_id)
            .ok_or_else(|| MessageStoreError::chat_not_found(&message.chat_id))?;

        let parent_exists = message
            .parent_id
            .as_ref()
            .is_some_and(|parent_id| messages.contains_key(parent_id));
        let newest = messages.keys().next_back();
        let (id, parent_id) = resolve_new_message(&message, newest, parent_exists)?;

        if state.owners.contains_key(&id) {
            return Err(MessageStoreError::invalid_request(format!(
                "Message {id} already exists"
            )));
        }

        let created = Message {
            id: id.clone(),
            chat_id: message.chat_id.clone(),
            parent_id,
            role: message.role,
            content: message.content,
            created_at: message.created_at.unwrap_or_else(Utc::now),
        };
        state.owners.insert(id.clone(), message.chat_id.clone());
        state
            .chats
            .entry(message.chat_id)
            .or_default()
            .insert(id, created.clone());

        debug!(target: "message_store::create", id = %created.id, "Created message");
        Ok(created)
    }

    async fn update(
        &self,
        id: &MessageId,
        content: MessageContent,
    ) -> Result<Message, MessageStoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| MessageStoreError::lock_poisoned("messages"))?;
        let message = state
            .message_mut(id)
            .ok_or_else(|| MessageStoreError::message_not_found(id))?;
        message.content = content;
        Ok(message.clone())
    }

    async fn delete(
        &self,
        id: &MessageId,
        mode: DeleteMode,
    ) -> Result<Vec<MessageId>, MessageStoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| MessageStoreError::lock_poisoned("messages"))?;
        let chat_id = state
            .owners
            .get(id)
            .cloned()
            .ok_or_else(|| MessageStoreError::message_not_found(id))?;
        let messages = state
            .chats
            .get_mut(&chat_id)
            .ok_or_else(|| MessageStoreError::chat_not_found(&chat_id))?;
        let parent_id = messages
            .get(id)
            .ok_or_else(|| MessageStoreError::message_not_found(id))?
            .parent_id
            .clone();

        let removed = match mode {
            DeleteMode::Single => {
                let children: Vec<MessageId> = messages
                    .values()
                    .filter(|message| message.parent_id.as_ref() == Some(id))
                    .map(|message| message.id.clone())
                    .collect();
                if parent_id.is_none() && children.len() > 1 {
                    return Err(MessageStoreError::invalid_request(
                        "Cannot delete a root message with more than one child",
                    ));
                }
                for child in &children {
                    if let Some(message) = messages.get_mut(child) {
                        message.parent_id.clone_from(&parent_id);
                    }
                }
                messages.remove(id);
                vec![id.clone()]
            }
            DeleteMode::Trailing { exclude_self } => {
                let mut subtree = subtree_ids(messages.values(), id);
                if exclude_self {
                    subtree.retain(|member| member != id);
                }
                for member in &subtree {
                    messages.remove(member);
                }
                subtree
            }
        };

        for member in &removed {
            state.owners.remove(member);
        }
        debug!(target: "message_store::delete", id = %id, ?mode, removed = removed.len(), "Deleted messages");
        Ok(removed)
    }

    async fn create_chat(&self, chat_id: &ChatId) -> Result<(), MessageStoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| MessageStoreError::lock_poisoned("messages"))?;
        state.chats.entry(chat_id.clone()).or_default();
        Ok(())
    }

    async fn delete_chat(&self, chat_id: &ChatId) -> Result<(), MessageStoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| MessageStoreError::lock_poisoned("messages"))?;
        if let Some(messages) = state.chats.remove(chat_id) {
            for id in messages.keys() {
                state.owners.remove(id);
            }
        }
        Ok(())
    }

    async fn chat_exists(&self, chat_id: &ChatId) -> Result<bool, MessageStoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| MessageStoreError::lock_poisoned("messages"))?;
        Ok(state.chats.contains_key(chat_id))
    }
}

/// Ids of `root` and everything below it, root first.
pub(crate) fn subtree_ids<'a>(
    messages: impl Iterator<Item = &'a Message>,
    root: &MessageId,
) -> Vec<MessageId> {
    let mut children: HashMap<&MessageId, Vec<&MessageId>> = HashMap::new();
    for message in messages {
        if let Some(parent_id) = &message.parent_id {
            children.entry(parent_id).or_default().push(&message.id);
        }
    }

    let mut collected = vec![root.clone()];
    let mut seen: HashSet<MessageId> = HashSet::from([root.clone()]);
    let mut index = 0;
    while index < collected.len() {
        if let Some(next) = children.get(&collected[index]) {
            for child in next {
                if seen.insert((*child).clone()) {
                    collected.push((*child).clone());
                }
            }
        }
        index += 1;
    }
    collected
}
