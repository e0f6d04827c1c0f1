//! Fixtures shared by unit and integration tests.

use crate::app::conversation::{Message, MessageContent, Role};
use crate::app::types::{ChatId, MessageId};

pub fn chat_id() -> ChatId {
    ChatId::from("chat_test")
}

/// A user message whose text is its own id.
pub fn message(id: &str, parent: Option<&str>) -> Message {
    Message::new(
        MessageId::from(id),
        chat_id(),
        parent.map(MessageId::from),
        Role::User,
        MessageContent::text(id),
    )
}

pub fn ids(values: &[&str]) -> Vec<MessageId> {
    values.iter().map(|value| MessageId::from(*value)).collect()
}
