//! Message types for conversation representation.
//!
//! This module contains the core message types used throughout the crate:
//! - `Message` - A persisted (or optimistically created) chat message
//! - `MessageContent` - The structured payload compared by value
//! - Part, attachment and annotation types carried by the content

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::app::types::{ChatId, MessageId};

/// Role in the conversation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single rendered part of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        reasoning: String,
        #[serde(default)]
        details: Vec<ReasoningDetail>,
    },
    ToolInvocation {
        tool_invocation: ToolInvocation,
    },
    Source {
        source: Source,
    },
    File {
        mime_type: String,
        data: String,
    },
    /// Marks the start of a model step in a multi-step reply
    StepStart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReasoningDetail {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Redacted {
        data: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ToolInvocationState {
    PartialCall,
    Call,
    Result,
}

/// A tool call made by the model and, once `state` is `result`, its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub state: ToolInvocationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Url,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub source_type: SourceType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub url: String,
}

/// Who produced a message: the character and model for assistant turns,
/// the persona for user turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Any JSON value attached to a message. Objects are read as an
/// [`Attribution`], everything else is kept as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Annotation {
    Attribution(Attribution),
    Value(serde_json::Value),
}

impl Annotation {
    pub fn attribution(&self) -> Option<&Attribution> {
        match self {
            Self::Attribution(attribution) => Some(attribution),
            Self::Value(_) => None,
        }
    }
}

impl From<Attribution> for Annotation {
    fn from(attribution: Attribution) -> Self {
        Self::Attribution(attribution)
    }
}

impl From<serde_json::Value> for Annotation {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    pub parts: Vec<MessagePart>,
    #[serde(
        default,
        rename = "experimental_attachments",
        alias = "attachments",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![MessagePart::Text { text: text.into() }],
            ..Self::default()
        }
    }

    pub fn with_annotation(mut self, annotation: impl Into<Annotation>) -> Self {
        self.annotations.push(annotation.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty() && self.attachments.is_empty()
    }

    /// Extract the text parts, joined by newlines
    pub fn extract_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    /// Only empty for the root messages of a chat
    pub parent_id: Option<MessageId>,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        id: MessageId,
        chat_id: ChatId,
        parent_id: Option<MessageId>,
        role: Role,
        content: MessageContent,
    ) -> Self {
        Self {
            id,
            chat_id,
            parent_id,
            role,
            content,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&MessageId> {
        self.parent_id.as_ref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether two messages agree on everything the tree depends on: id,
    /// parent link, role and content. Timestamps are ignored.
    pub fn same_shape(&self, other: &Message) -> bool {
        self.id == other.id
            && self.parent_id == other.parent_id
            && self.role == other.role
            && self.content == other.content
    }

    pub fn extract_text(&self) -> String {
        self.content.extract_text()
    }
}
