pub mod chat;
pub mod conversation;
pub mod types;

pub use chat::{ChatSession, FailedMutation, MessagePager};
pub use conversation::{
    Branch, BranchNavigator, Direction, Message, MessageContent, MessageTree, NavigationOutcome,
    Role,
};
pub use types::{ChatId, MessageId};

#[cfg(test)]
mod tests;
