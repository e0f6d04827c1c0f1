//! Per-chat driver: pages messages in from the store, merges local pending
//! messages over them and keeps the navigator's tree and branch current.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::conversation::{
    Branch, BranchNavigator, Direction, Draft, MergeEngine, Message, MessageContent, MessageTree,
    NavigationOutcome, PendingMessage, Role, SiblingPosition, StoreEffect, TreeUpdate,
};
use super::types::{ChatId, MessageId};
use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::store::{DeleteMode, MessagePage, MessageStore, MessageStoreError, NewMessage, PageQuery};

/// Reconcile can push local content back to the store, which changes the
/// authoritative set again. Two rounds settle every pending message.
const MAX_SYNC_ROUNDS: usize = 2;

/// Accumulates the pages of one chat. At most one fetch is in flight.
#[derive(Debug, Clone)]
pub struct MessagePager {
    messages: BTreeMap<MessageId, Message>,
    cursor: Option<MessageId>,
    page_size: usize,
    in_flight: bool,
    complete: bool,
}

impl MessagePager {
    pub fn new(page_size: usize) -> Self {
        Self {
            messages: BTreeMap::new(),
            cursor: None,
            page_size,
            in_flight: false,
            complete: false,
        }
    }

    /// Query for the next page, or `None` while a fetch is outstanding or
    /// once every page has arrived.
    pub fn begin_fetch(&mut self) -> Option<PageQuery> {
        if self.in_flight || self.complete {
            return None;
        }
        self.in_flight = true;
        Some(match &self.cursor {
            Some(cursor) => PageQuery::after(cursor.clone(), self.page_size),
            None => PageQuery::first(self.page_size),
        })
    }

    pub fn complete_fetch(&mut self, page: MessagePage) {
        self.in_flight = false;
        self.complete = !page.has_more;
        if let Some(last) = page.last {
            self.cursor = Some(last);
        }
        for message in page.messages {
            self.messages.insert(message.id.clone(), message);
        }
    }

    pub fn fail_fetch(&mut self) {
        self.in_flight = false;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages received so far, ordered by id.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Records a store copy returned by a mutation.
    pub fn upsert(&mut self, message: Message) {
        self.messages.insert(message.id.clone(), message);
    }

    pub fn remove(&mut self, ids: &[MessageId]) {
        for id in ids {
            self.messages.remove(id);
        }
    }
}

/// Clears the pager's in-flight flag when a page fetch ends, including when
/// its future is dropped before the store answers.
struct FetchGuard<'a> {
    pager: &'a mut MessagePager,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if self.pager.in_flight {
            self.pager.fail_fetch();
        }
    }
}

/// A store mutation that failed. The local content it carried stays visible.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMutation {
    pub effect: StoreEffect,
    pub error: MessageStoreError,
}

/// Keeps one chat's message tree and selected branch in step with the store
/// and with local drafts, sends and streams.
pub struct ChatSession {
    chat_id: ChatId,
    store: Arc<dyn MessageStore>,
    config: ChatConfig,
    pager: MessagePager,
    navigator: BranchNavigator,
    merge: MergeEngine,
    failed: Vec<FailedMutation>,
}

impl ChatSession {
    pub fn new(chat_id: ChatId, store: Arc<dyn MessageStore>, config: ChatConfig) -> Self {
        let pager = MessagePager::new(config.effective_page_size());
        Self {
            chat_id,
            store,
            config,
            pager,
            navigator: BranchNavigator::new(),
            merge: MergeEngine::new(),
            failed: Vec::new(),
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    /// True once every page has been received and the tree is available.
    pub fn is_loaded(&self) -> bool {
        self.pager.is_complete()
    }

    /// Fetches the first page and, with `auto_fetch`, every following page.
    pub async fn load(&mut self) -> Result<()> {
        if !self.store.chat_exists(&self.chat_id).await? {
            return Err(MessageStoreError::chat_not_found(&self.chat_id).into());
        }
        while self.fetch_next_page().await? {
            if !self.config.auto_fetch {
                return Ok(());
            }
        }
        if self.pager.is_complete() {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "Chat {} stopped loading before its last page",
                self.chat_id
            )))
        }
    }

    /// Requests the next page. Returns false once the chat is complete.
    /// Dropping the returned future before it resolves abandons the fetch
    /// and a later call requests the same page again.
    pub async fn fetch_next_page(&mut self) -> Result<bool> {
        let Some(query) = self.pager.begin_fetch() else {
            return Ok(false);
        };

        let fetched = {
            let _guard = FetchGuard {
                pager: &mut self.pager,
            };
            self.store.fetch_page(&self.chat_id, query).await
        };
        match fetched {
            Ok(page) => {
                debug!(
                    target: "chat_session::fetch",
                    chat_id = %self.chat_id,
                    received = page.messages.len(),
                    has_more = page.has_more,
                    "Received message page"
                );
                self.pager.complete_fetch(page);
            }
            Err(error) => {
                self.pager.fail_fetch();
                return Err(error.into());
            }
        }

        if self.pager.is_complete() {
            info!(
                target: "chat_session::fetch",
                chat_id = %self.chat_id,
                messages = self.pager.len(),
                "Chat fully loaded"
            );
            self.sync().await?;
        }
        Ok(!self.pager.is_complete())
    }

    /// Reloads every page from the store, replacing what was loaded before.
    pub async fn refresh(&mut self) -> Result<()> {
        let mut pager = MessagePager::new(self.config.effective_page_size());
        while let Some(query) = pager.begin_fetch() {
            let page = self.store.fetch_page(&self.chat_id, query).await?;
            pager.complete_fetch(page);
        }
        self.pager = pager;
        self.sync().await
    }

    pub fn tree(&self) -> Option<&Arc<MessageTree>> {
        self.navigator.tree()
    }

    pub fn branch(&self) -> &Branch {
        self.navigator.branch()
    }

    /// Messages of the current branch in order, with pending content applied.
    pub fn branch_messages(&self) -> Vec<&Message> {
        self.navigator.branch_messages()
    }

    pub fn navigate(&mut self, current: &str, direction: Direction) -> NavigationOutcome {
        self.navigator.navigate(current, direction)
    }

    pub fn checkout(&mut self, id: &str) -> bool {
        self.navigator.checkout(id)
    }

    pub fn sibling_position(&self, id: &str) -> Option<SiblingPosition> {
        self.navigator.sibling_position(id)
    }

    pub fn pending(&self) -> &[PendingMessage] {
        self.merge.pending()
    }

    pub fn draft(&self) -> Option<&Draft> {
        self.merge.draft()
    }

    pub fn failed_mutations(&self) -> &[FailedMutation] {
        &self.failed
    }

    /// Starts a draft replying to the tail of the current branch.
    pub fn start_draft(&mut self, role: Role, content: MessageContent) {
        let parent_id = self.navigator.branch().tail().cloned();
        self.merge
            .start_draft(self.chat_id.clone(), parent_id, role, content);
    }

    pub fn update_draft(&mut self, content: MessageContent) -> bool {
        self.merge.update_draft(content)
    }

    pub fn discard_draft(&mut self) -> Option<Draft> {
        self.merge.discard_draft()
    }

    /// Sends the current draft. `Ok(None)` when there is no draft.
    pub async fn send_draft(&mut self) -> Result<Option<MessageId>> {
        self.ensure_loaded()?;
        let id = self
            .merge
            .draft()
            .map(|draft| self.child_id(draft.parent_id.as_ref()));
        let Some((id, effects)) = self.merge.send_draft(id) else {
            return Ok(None);
        };
        let result = self.commit(effects).await;
        self.navigator.checkout(&id);
        result.map(|()| Some(id))
    }

    pub async fn send_message(&mut self, role: Role, content: MessageContent) -> Result<MessageId> {
        self.start_draft(role, content);
        self.send_draft()
            .await?
            .ok_or_else(|| Error::InvalidOperation("No draft to send".to_string()))
    }

    /// Starts an assistant reply to the tail of the current branch.
    pub async fn begin_stream(&mut self) -> Result<MessageId> {
        let parent_id = self.navigator.branch().tail().cloned();
        self.start_stream(parent_id).await
    }

    /// Replaces the content of a streaming message.
    pub async fn push_stream(&mut self, id: &str, content: MessageContent) -> Result<bool> {
        if !self.merge.push_stream(id, content) {
            return Ok(false);
        }
        self.sync().await?;
        Ok(true)
    }

    pub async fn finish_stream(&mut self, id: &str) -> Result<()> {
        let effects = self.merge.finish_stream(id);
        self.commit(effects).await
    }

    /// Stops a stream and persists what has arrived so far.
    pub async fn cancel_stream(&mut self, id: &str) -> Result<()> {
        let effects = self.merge.cancel_stream(id);
        self.commit(effects).await
    }

    /// Streams a new assistant message next to `assistant_id`.
    pub async fn regenerate(&mut self, assistant_id: &str) -> Result<MessageId> {
        let message = self.message(assistant_id)?;
        if message.role != Role::Assistant {
            return Err(Error::InvalidOperation(format!(
                "Only assistant messages can be regenerated, {assistant_id} is a {} message",
                message.role
            )));
        }
        self.start_stream(message.parent_id).await
    }

    /// Replaces the content of `id` in place.
    pub async fn edit(&mut self, id: &str, content: MessageContent) -> Result<()> {
        let message = self.message(id)?;
        let effects = self.merge.edit(&message, content);
        self.commit(effects).await
    }

    /// Sends `content` as a new sibling of `id`, leaving `id` untouched.
    pub async fn edit_as_branch(&mut self, id: &str, content: MessageContent) -> Result<MessageId> {
        let original = self.message(id)?;
        let new_id = self.child_id(original.parent_id.as_ref());
        let effects = self.merge.send(Message::new(
            new_id.clone(),
            self.chat_id.clone(),
            original.parent_id,
            original.role,
            content,
        ));
        let result = self.commit(effects).await;
        self.navigator.checkout(&new_id);
        result.map(|()| new_id)
    }

    /// Deletes from the store, then reloads the chat. Returns the removed ids.
    pub async fn delete(&mut self, id: &MessageId, mode: DeleteMode) -> Result<Vec<MessageId>> {
        let removed = self.store.delete(id, mode).await?;
        self.merge.forget(&removed);
        self.pager.remove(&removed);
        self.failed
            .retain(|failed| !removed.contains(failed.effect.message_id()));
        self.refresh().await?;
        Ok(removed)
    }

    /// Executes the recorded failed mutations again with their original
    /// payloads.
    pub async fn retry_failed_mutations(&mut self) -> Result<()> {
        let effects: Vec<StoreEffect> = self.failed.drain(..).map(|failed| failed.effect).collect();
        if effects.is_empty() {
            return Ok(());
        }
        info!(
            target: "chat_session::retry",
            chat_id = %self.chat_id,
            count = effects.len(),
            "Retrying failed store mutations"
        );
        self.commit(effects).await
    }

    async fn start_stream(&mut self, parent_id: Option<MessageId>) -> Result<MessageId> {
        self.ensure_loaded()?;
        let id = self.child_id(parent_id.as_ref());
        let id = self
            .merge
            .begin_stream(self.chat_id.clone(), parent_id, Some(id));
        self.sync().await?;
        self.navigator.checkout(&id);
        Ok(id)
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.pager.is_complete() {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "Chat {} is not fully loaded",
                self.chat_id
            )))
        }
    }

    /// Fresh id for a new child of `parent` that sorts after the parent and
    /// every existing sibling, so the new message is the latest of its level.
    fn child_id(&self, parent: Option<&MessageId>) -> MessageId {
        let sibling = self
            .navigator
            .tree()
            .and_then(|tree| tree.greatest_child(parent.map(MessageId::as_str)));
        MessageId::generate_after(parent.into_iter().chain(sibling).max())
    }

    /// Current rendered copy of `id`, pending content included.
    fn message(&self, id: &str) -> Result<Message> {
        self.navigator
            .tree()
            .and_then(|tree| tree.node(id))
            .map(|node| node.message().clone())
            .ok_or_else(|| Error::NotFound(format!("Message {id}")))
    }

    /// Applies `effects` and rebuilds. The tree is rebuilt even when a
    /// mutation fails; the first failure is returned.
    async fn commit(&mut self, effects: Vec<StoreEffect>) -> Result<()> {
        let applied = self.apply_effects(effects).await;
        let synced = self.sync().await;
        applied.and(synced)
    }

    async fn sync(&mut self) -> Result<()> {
        let mut outcome = Ok(());
        let mut effects = self.rebuild();
        let mut rounds = 0;
        while !effects.is_empty() && rounds < MAX_SYNC_ROUNDS {
            let applied = self.apply_effects(effects).await;
            if outcome.is_ok() {
                outcome = applied;
            }
            effects = self.rebuild();
            rounds += 1;
        }
        if !effects.is_empty() {
            warn!(
                target: "chat_session::sync",
                chat_id = %self.chat_id,
                dropped = effects.len(),
                "Store did not settle, leaving remaining updates for the next sync"
            );
        }
        outcome
    }

    /// Rebuilds the tree from the loaded pages and pending messages. Does
    /// nothing until every page has been received.
    fn rebuild(&mut self) -> Vec<StoreEffect> {
        if !self.pager.is_complete() {
            return Vec::new();
        }

        let authoritative: Vec<Message> = self.pager.messages().cloned().collect();
        let effects = self.merge.reconcile(&authoritative);
        let tree = MessageTree::build(self.merge.overlay(&authoritative));
        let update = self.navigator.set_tree(tree);

        if update != TreeUpdate::Unchanged {
            if let Some(tree) = self.navigator.tree() {
                for issue in tree.dangling_parents() {
                    warn!(
                        target: "chat_session::rebuild",
                        chat_id = %self.chat_id,
                        issue = ?issue,
                        "Message tree integrity problem, message shown as a root"
                    );
                }
            }
            debug!(
                target: "chat_session::rebuild",
                chat_id = %self.chat_id,
                ?update,
                branch_len = self.navigator.branch().len(),
                pending = self.merge.pending().len(),
                "Rebuilt conversation tree"
            );
        }
        effects
    }

    async fn apply_effects(&mut self, effects: Vec<StoreEffect>) -> Result<()> {
        let mut first_error = None;
        for effect in effects {
            let result = match &effect {
                StoreEffect::Create(message) => {
                    self.store.create(NewMessage::from_message(message)).await
                }
                StoreEffect::Update { id, content } => {
                    self.store.update(id, content.clone()).await
                }
            };

            match result {
                Ok(stored) => self.pager.upsert(stored),
                Err(error) => {
                    warn!(
                        target: "chat_session::apply_effects",
                        chat_id = %self.chat_id,
                        id = %effect.message_id(),
                        %error,
                        "Store mutation failed, keeping local content"
                    );
                    if first_error.is_none() {
                        first_error = Some(error.clone());
                    }
                    self.failed.push(FailedMutation { effect, error });
                }
            }
        }

        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}
