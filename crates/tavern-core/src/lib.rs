// Conversation tree and branch core for Tavern chats, without UI dependencies

pub mod app;
pub mod config;
pub mod error;
pub mod store;
pub mod test_utils;
pub mod utils;
