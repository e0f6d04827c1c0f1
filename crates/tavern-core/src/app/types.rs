use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

/// Identifier of a chat message.
///
/// Ids are compared byte-wise as strings. Generated ids embed a UUIDv7, so a
/// greater id always means a message created later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(format!("msg_{}", Uuid::now_v7()))
    }

    /// Generates an id that sorts after `floor`.
    ///
    /// Pass the greatest of the parent id and the existing sibling ids to get
    /// a message that becomes the latest of its level. Ids coming from other
    /// schemes may already sort after any generated id, in which case `floor`
    /// is used as a prefix.
    pub fn generate_after(floor: Option<&MessageId>) -> Self {
        let id = Self::generate();
        match floor {
            Some(floor) if id <= *floor => Self(format!("{}_{}", floor.0, Uuid::now_v7().simple())),
            _ => id,
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for MessageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Deref for MessageId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn generate() -> Self {
        Self(format!("chat_{}", Uuid::now_v7()))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for ChatId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Deref for ChatId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}
