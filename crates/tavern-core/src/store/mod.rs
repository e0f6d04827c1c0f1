mod message_store;
mod sqlite_message_store;
mod store_config;

pub use message_store::{
    DEFAULT_PAGE_LIMIT, DeleteMode, InMemoryMessageStore, MAX_PAGE_LIMIT, MessagePage,
    MessageStore, MessageStoreError, NewMessage, PageQuery, SortOrder,
};
pub use sqlite_message_store::SqliteMessageStore;
pub use store_config::StoreConfig;
