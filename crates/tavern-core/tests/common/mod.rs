use std::sync::Arc;
use tavern_core::app::conversation::Message;
use tavern_core::store::{InMemoryMessageStore, MessageStore, NewMessage, SqliteMessageStore};
use tavern_core::test_utils::{chat_id, message};

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

pub async fn open_store(backend: Backend) -> Arc<dyn MessageStore> {
    let store: Arc<dyn MessageStore> = match backend {
        Backend::Memory => Arc::new(InMemoryMessageStore::new()),
        Backend::Sqlite => Arc::new(SqliteMessageStore::new_in_memory().await.unwrap()),
    };
    store.create_chat(&chat_id()).await.unwrap();
    store
}

/// Creates `(id, parent)` pairs in order.
pub async fn seed(store: &Arc<dyn MessageStore>, messages: &[(&str, Option<&str>)]) -> Vec<Message> {
    let mut created = Vec::with_capacity(messages.len());
    for (id, parent) in messages {
        let stored = store
            .create(NewMessage::from_message(&message(id, *parent)))
            .await
            .unwrap();
        created.push(stored);
    }
    created
}
