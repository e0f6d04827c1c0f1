//! Optimistic merge of locally composed and streamed messages.
//!
//! The engine never talks to the store itself. Every transition returns the
//! [`StoreEffect`]s the caller should execute; failures of those effects are
//! reported by the caller and never roll back local content.

use std::collections::HashMap;
use strum_macros::Display;
use tracing::debug;

use super::message::{Message, MessageContent, Role};
use crate::app::types::{ChatId, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PendingState {
    /// Composed locally, not sent.
    Drafting,
    /// Submitted; waiting for the store to echo the same id back.
    SentPendingEcho,
    /// Assistant output still arriving.
    Streaming,
    /// Terminal content received; replaced by the store copy once it matches.
    Finalized,
}

/// A store mutation requested by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEffect {
    Create(Message),
    Update {
        id: MessageId,
        content: MessageContent,
    },
}

impl StoreEffect {
    pub fn message_id(&self) -> &MessageId {
        match self {
            StoreEffect::Create(message) => &message.id,
            StoreEffect::Update { id, .. } => id,
        }
    }
}

/// A message composed locally but not yet sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub chat_id: ChatId,
    pub parent_id: Option<MessageId>,
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    message: Message,
    state: PendingState,
    /// The store is known (or expected) to hold a row with this id.
    remote: bool,
    /// Content last sent with an update, so a differing store copy is
    /// answered once per local content.
    last_pushed: Option<MessageContent>,
}

impl PendingMessage {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn state(&self) -> PendingState {
        self.state
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    draft: Option<Draft>,
    pending: Vec<PendingMessage>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draft(&self) -> Option<&Draft> {
        self.draft.as_ref()
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    pub fn pending_state(&self, id: &str) -> Option<PendingState> {
        self.find(id).map(|pending| pending.state)
    }

    pub fn is_streaming(&self) -> bool {
        self.pending
            .iter()
            .any(|pending| pending.state == PendingState::Streaming)
    }

    pub fn start_draft(
        &mut self,
        chat_id: ChatId,
        parent_id: Option<MessageId>,
        role: Role,
        content: MessageContent,
    ) {
        self.draft = Some(Draft {
            chat_id,
            parent_id,
            role,
            content,
        });
    }

    pub fn update_draft(&mut self, content: MessageContent) -> bool {
        match self.draft.as_mut() {
            Some(draft) => {
                draft.content = content;
                true
            }
            None => false,
        }
    }

    pub fn discard_draft(&mut self) -> Option<Draft> {
        self.draft.take()
    }

    /// Sends the draft under `id`, or a fresh id after its parent: it joins
    /// the overlay and a create is requested.
    pub fn send_draft(&mut self, id: Option<MessageId>) -> Option<(MessageId, Vec<StoreEffect>)> {
        let draft = self.draft.take()?;
        let id = id.unwrap_or_else(|| MessageId::generate_after(draft.parent_id.as_ref()));
        let message = Message::new(
            id.clone(),
            draft.chat_id,
            draft.parent_id,
            draft.role,
            draft.content,
        );
        Some((id, self.send(message)))
    }

    /// Tracks an already built message as sent and requests its creation.
    pub fn send(&mut self, message: Message) -> Vec<StoreEffect> {
        debug!(target: "merge_engine::send", id = %message.id, "Sending message");
        let effect = StoreEffect::Create(message.clone());
        self.upsert(PendingMessage {
            last_pushed: None,
            message,
            state: PendingState::SentPendingEcho,
            remote: true,
        });
        vec![effect]
    }

    /// Optimistically replaces the content of an existing message.
    pub fn edit(&mut self, message: &Message, content: MessageContent) -> Vec<StoreEffect> {
        if let Some(pending) = self.find_mut(&message.id) {
            pending.message.content = content.clone();
            if pending.state == PendingState::Streaming {
                return Vec::new();
            }
            pending.state = PendingState::SentPendingEcho;
            if !pending.remote {
                return Vec::new();
            }
            pending.last_pushed = Some(content.clone());
            return vec![StoreEffect::Update {
                id: message.id.clone(),
                content,
            }];
        }

        let mut edited = message.clone();
        edited.content = content.clone();
        self.pending.push(PendingMessage {
            message: edited,
            state: PendingState::SentPendingEcho,
            remote: true,
            last_pushed: Some(content.clone()),
        });
        vec![StoreEffect::Update {
            id: message.id.clone(),
            content,
        }]
    }

    /// Starts an assistant message below `parent_id`. Nothing is persisted
    /// until the stream finishes.
    pub fn begin_stream(
        &mut self,
        chat_id: ChatId,
        parent_id: Option<MessageId>,
        id: Option<MessageId>,
    ) -> MessageId {
        let id = id.unwrap_or_else(|| MessageId::generate_after(parent_id.as_ref()));
        debug!(target: "merge_engine::begin_stream", id = %id, parent = ?parent_id, "Stream started");
        self.upsert(PendingMessage {
            message: Message::new(
                id.clone(),
                chat_id,
                parent_id,
                Role::Assistant,
                MessageContent::default(),
            ),
            state: PendingState::Streaming,
            remote: false,
            last_pushed: None,
        });
        id
    }

    /// Replaces the streamed content wholesale. Ignored unless `id` is
    /// streaming.
    pub fn push_stream(&mut self, id: &str, content: MessageContent) -> bool {
        match self.find_mut(id) {
            Some(pending) if pending.state == PendingState::Streaming => {
                pending.message.content = content;
                true
            }
            _ => false,
        }
    }

    pub fn finish_stream(&mut self, id: &str) -> Vec<StoreEffect> {
        self.finalize(id, "finished")
    }

    /// Stops a stream, keeping whatever content has arrived.
    pub fn cancel_stream(&mut self, id: &str) -> Vec<StoreEffect> {
        self.finalize(id, "cancelled")
    }

    /// Effective message set: `authoritative` with every sent or streaming
    /// message laid over it by id, sorted by id.
    pub fn overlay(&self, authoritative: &[Message]) -> Vec<Message> {
        let local: HashMap<&MessageId, &Message> = self
            .pending
            .iter()
            .map(|pending| (&pending.message.id, &pending.message))
            .collect();

        let mut merged: Vec<Message> = authoritative
            .iter()
            .map(|message| {
                local
                    .get(&message.id)
                    .map_or_else(|| message.clone(), |local| (*local).clone())
            })
            .collect();

        let known: std::collections::HashSet<&MessageId> =
            authoritative.iter().map(|message| &message.id).collect();
        merged.extend(
            self.pending
                .iter()
                .filter(|pending| !known.contains(&pending.message.id))
                .map(|pending| pending.message.clone()),
        );
        merged.sort_by(|a, b| a.id.cmp(&b.id));
        merged
    }

    /// Compares pending messages with their authoritative copies. Matching
    /// copies retire the pending entry; differing copies of settled messages
    /// get the local content pushed once.
    pub fn reconcile(&mut self, authoritative: &[Message]) -> Vec<StoreEffect> {
        let by_id: HashMap<&MessageId, &Message> = authoritative
            .iter()
            .map(|message| (&message.id, message))
            .collect();

        let mut effects = Vec::new();
        self.pending.retain_mut(|pending| {
            let Some(stored) = by_id.get(&pending.message.id) else {
                return true;
            };
            pending.remote = true;

            match pending.state {
                PendingState::Streaming | PendingState::Drafting => true,
                PendingState::SentPendingEcho | PendingState::Finalized => {
                    if stored.content == pending.message.content {
                        debug!(
                            target: "merge_engine::reconcile",
                            id = %pending.message.id,
                            state = %pending.state,
                            "Store copy matches, retiring pending message"
                        );
                        return false;
                    }
                    if pending.last_pushed.as_ref() != Some(&pending.message.content) {
                        pending.last_pushed = Some(pending.message.content.clone());
                        effects.push(StoreEffect::Update {
                            id: pending.message.id.clone(),
                            content: pending.message.content.clone(),
                        });
                    }
                    true
                }
            }
        });
        effects
    }

    /// Drops pending messages, e.g. after they were deleted from the store.
    pub fn forget(&mut self, ids: &[MessageId]) {
        self.pending
            .retain(|pending| !ids.contains(&pending.message.id));
    }

    fn finalize(&mut self, id: &str, reason: &str) -> Vec<StoreEffect> {
        let Some(pending) = self.find_mut(id) else {
            return Vec::new();
        };
        if pending.state != PendingState::Streaming {
            return Vec::new();
        }

        debug!(target: "merge_engine::finalize", id, reason, "Stream finalized");
        pending.state = PendingState::Finalized;
        let content = pending.message.content.clone();
        let effect = if pending.remote {
            if pending.last_pushed.as_ref() == Some(&content) {
                return Vec::new();
            }
            StoreEffect::Update {
                id: pending.message.id.clone(),
                content: content.clone(),
            }
        } else {
            StoreEffect::Create(pending.message.clone())
        };
        if matches!(effect, StoreEffect::Update { .. }) {
            pending.last_pushed = Some(content);
        }
        pending.remote = true;
        vec![effect]
    }

    fn upsert(&mut self, pending: PendingMessage) {
        match self.find_mut(&pending.message.id) {
            Some(existing) => *existing = pending,
            None => self.pending.push(pending),
        }
    }

    fn find(&self, id: &str) -> Option<&PendingMessage> {
        self.pending
            .iter()
            .find(|pending| pending.message.id.as_str() == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut PendingMessage> {
        self.pending
            .iter_mut()
            .find(|pending| pending.message.id.as_str() == id)
    }
}
