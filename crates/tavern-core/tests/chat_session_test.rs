mod common;

use async_trait::async_trait;
use common::{Backend, open_store, seed};
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tavern_core::app::ChatSession;
use tavern_core::app::conversation::{
    Direction, MessageContent, NavigationOutcome, Role, SiblingPosition,
};
use tavern_core::app::types::{ChatId, MessageId};
use tavern_core::config::ChatConfig;
use tavern_core::error::Error;
use tavern_core::store::{
    DeleteMode, InMemoryMessageStore, MessagePage, MessageStore, MessageStoreError, NewMessage,
    PageQuery,
};
use tavern_core::test_utils::{chat_id, ids};

fn config(page_size: usize, auto_fetch: bool) -> ChatConfig {
    ChatConfig {
        page_size,
        auto_fetch,
    }
}

async fn loaded_session(store: &Arc<dyn MessageStore>) -> ChatSession {
    let mut session = ChatSession::new(chat_id(), store.clone(), config(2, true));
    session.load().await.unwrap();
    assert!(session.is_loaded());
    session
}

fn branch_ids(session: &ChatSession) -> Vec<MessageId> {
    session.branch().ids().to_vec()
}

fn last_text(session: &ChatSession) -> String {
    session
        .branch_messages()
        .last()
        .map(|message| message.extract_text())
        .unwrap_or_default()
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_load_selects_latest_branch_and_navigates(#[case] backend: Backend) {
    let store = open_store(backend).await;
    seed(
        &store,
        &[
            ("0001", None),
            ("0002", Some("0001")),
            ("0003", Some("0001")),
            ("0004", Some("0002")),
        ],
    )
    .await;

    let mut session = loaded_session(&store).await;
    assert_eq!(session.tree().unwrap().len(), 4);
    assert_eq!(branch_ids(&session), ids(&["0001", "0003"]));
    assert_eq!(
        session.sibling_position("0003"),
        Some(SiblingPosition { index: 2, count: 2 })
    );

    assert_eq!(
        session.navigate("0003", Direction::Previous),
        NavigationOutcome::Moved
    );
    assert_eq!(branch_ids(&session), ids(&["0001", "0002", "0004"]));

    assert_eq!(
        session.navigate("0002", Direction::Previous),
        NavigationOutcome::OutOfRange
    );
    assert_eq!(branch_ids(&session), ids(&["0001", "0002", "0004"]));
}

#[tokio::test]
async fn test_tree_waits_for_the_last_page() {
    let store = open_store(Backend::Memory).await;
    seed(
        &store,
        &[
            ("0001", None),
            ("0002", Some("0001")),
            ("0003", Some("0002")),
            ("0004", Some("0003")),
            ("0005", Some("0004")),
        ],
    )
    .await;

    let mut session = ChatSession::new(chat_id(), store.clone(), config(2, false));
    session.load().await.unwrap();
    assert!(!session.is_loaded());
    assert!(session.tree().is_none());
    assert_eq!(
        session.navigate("0001", Direction::Next),
        NavigationOutcome::NoTree
    );

    assert!(session.fetch_next_page().await.unwrap());
    assert!(session.tree().is_none());
    assert!(!session.fetch_next_page().await.unwrap());

    assert!(session.is_loaded());
    assert_eq!(
        branch_ids(&session),
        ids(&["0001", "0002", "0003", "0004", "0005"])
    );
    assert!(!session.fetch_next_page().await.unwrap());
}

#[tokio::test]
async fn test_load_unknown_chat_fails() {
    let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
    let mut session = ChatSession::new(ChatId::from("chat_missing"), store, config(2, true));

    assert!(matches!(
        session.load().await,
        Err(Error::Store(MessageStoreError::ChatNotFound { .. }))
    ));
    assert!(matches!(
        session.begin_stream().await,
        Err(Error::InvalidOperation(_))
    ));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_send_message_extends_branch(#[case] backend: Backend) {
    let store = open_store(backend).await;
    seed(&store, &[("0001", None), ("0002", Some("0001"))]).await;
    let mut session = loaded_session(&store).await;

    let id = session
        .send_message(Role::User, MessageContent::text("hello"))
        .await
        .unwrap();

    assert_eq!(session.branch().tail(), Some(&id));
    assert_eq!(last_text(&session), "hello");
    assert!(session.pending().is_empty(), "echo retires the pending copy");

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.parent_id.as_deref(), Some("0002"));
    assert_eq!(stored.extract_text(), "hello");
}

#[tokio::test]
async fn test_draft_is_not_rendered_until_sent() {
    let store = open_store(Backend::Memory).await;
    seed(&store, &[("0001", None)]).await;
    let mut session = loaded_session(&store).await;

    session.start_draft(Role::User, MessageContent::text("hel"));
    assert!(session.update_draft(MessageContent::text("hello")));
    assert_eq!(branch_ids(&session), ids(&["0001"]));

    let discarded = session.discard_draft().unwrap();
    assert_eq!(discarded.content, MessageContent::text("hello"));
    assert_eq!(session.send_draft().await.unwrap(), None);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_stream_is_persisted_when_finished(#[case] backend: Backend) {
    let store = open_store(backend).await;
    seed(&store, &[("0001", None)]).await;
    let mut session = loaded_session(&store).await;

    let id = session.begin_stream().await.unwrap();
    assert_eq!(branch_ids(&session), vec![MessageId::from("0001"), id.clone()]);

    for text in ["Hel", "Hello", "Hello there"] {
        assert!(session
            .push_stream(&id, MessageContent::text(text))
            .await
            .unwrap());
        assert_eq!(last_text(&session), text);
    }
    assert!(store.get(&id).await.unwrap().is_none());

    session.finish_stream(&id).await.unwrap();
    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.role, Role::Assistant);
    assert_eq!(stored.extract_text(), "Hello there");
    assert!(session.pending().is_empty());
    assert!(!session
        .push_stream(&id, MessageContent::text("late"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_cancelled_stream_keeps_partial_content() {
    let store = open_store(Backend::Memory).await;
    seed(&store, &[("0001", None)]).await;
    let mut session = loaded_session(&store).await;

    let id = session.begin_stream().await.unwrap();
    session
        .push_stream(&id, MessageContent::text("partial"))
        .await
        .unwrap();
    session.cancel_stream(&id).await.unwrap();

    assert_eq!(
        store.get(&id).await.unwrap().unwrap().extract_text(),
        "partial"
    );
    assert_eq!(last_text(&session), "partial");
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_regenerate_adds_sibling_and_switches_branch(#[case] backend: Backend) {
    let store = open_store(backend).await;
    seed(&store, &[("0001", None)]).await;
    let mut session = loaded_session(&store).await;

    let first = session.begin_stream().await.unwrap();
    session
        .push_stream(&first, MessageContent::text("first answer"))
        .await
        .unwrap();
    session.finish_stream(&first).await.unwrap();

    let second = session.regenerate(&first).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(
        branch_ids(&session),
        vec![MessageId::from("0001"), second.clone()]
    );
    assert_eq!(
        session.sibling_position(&second),
        Some(SiblingPosition { index: 2, count: 2 })
    );

    session
        .push_stream(&second, MessageContent::text("second answer"))
        .await
        .unwrap();
    session.finish_stream(&second).await.unwrap();

    assert_eq!(
        session.navigate(&second, Direction::Previous),
        NavigationOutcome::Moved
    );
    assert_eq!(last_text(&session), "first answer");

    assert!(matches!(
        session.regenerate("0001").await,
        Err(Error::InvalidOperation(_))
    ));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_edit_in_place(#[case] backend: Backend) {
    let store = open_store(backend).await;
    seed(
        &store,
        &[("0001", None), ("0002", Some("0001")), ("0003", Some("0002"))],
    )
    .await;
    let mut session = loaded_session(&store).await;

    session
        .edit("0002", MessageContent::text("edited"))
        .await
        .unwrap();

    assert_eq!(branch_ids(&session), ids(&["0001", "0002", "0003"]));
    assert_eq!(session.branch_messages()[1].extract_text(), "edited");
    assert_eq!(
        store.get(&"0002".into()).await.unwrap().unwrap().extract_text(),
        "edited"
    );
    assert!(session.pending().is_empty());

    assert!(matches!(
        session.edit("0042", MessageContent::text("x")).await,
        Err(Error::NotFound(_))
    ));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_edit_as_branch_keeps_original(#[case] backend: Backend) {
    let store = open_store(backend).await;
    seed(
        &store,
        &[("0001", None), ("0002", Some("0001")), ("0003", Some("0002"))],
    )
    .await;
    let mut session = loaded_session(&store).await;

    let id = session
        .edit_as_branch("0002", MessageContent::text("rephrased"))
        .await
        .unwrap();

    assert_eq!(branch_ids(&session), vec![MessageId::from("0001"), id.clone()]);
    assert_eq!(
        session.sibling_position(&id),
        Some(SiblingPosition { index: 2, count: 2 })
    );
    assert_eq!(
        store.get(&"0002".into()).await.unwrap().unwrap().extract_text(),
        "0002"
    );
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().parent_id.as_deref(),
        Some("0001")
    );
}

#[tokio::test]
async fn test_delete_trailing_reloads_tree() {
    let store = open_store(Backend::Memory).await;
    seed(
        &store,
        &[
            ("0001", None),
            ("0002", Some("0001")),
            ("0003", Some("0002")),
            ("0004", Some("0001")),
        ],
    )
    .await;
    let mut session = loaded_session(&store).await;
    session.checkout("0003");
    assert_eq!(branch_ids(&session), ids(&["0001", "0002", "0003"]));

    let removed = session
        .delete(&"0002".into(), DeleteMode::Trailing { exclude_self: false })
        .await
        .unwrap();

    assert_eq!(removed.len(), 2);
    assert_eq!(session.tree().unwrap().len(), 2);
    assert_eq!(branch_ids(&session), ids(&["0001", "0004"]));
}

#[tokio::test]
async fn test_selected_branch_survives_foreign_replies() {
    let store = open_store(Backend::Memory).await;
    seed(
        &store,
        &[("0001", None), ("0002", Some("0001")), ("0003", Some("0001"))],
    )
    .await;
    let mut session = loaded_session(&store).await;
    session.navigate("0003", Direction::Previous);
    assert_eq!(branch_ids(&session), ids(&["0001", "0002"]));

    // Another client answers on the branch this session is not looking at.
    seed(&store, &[("0004", Some("0003"))]).await;
    session.refresh().await.unwrap();
    assert_eq!(branch_ids(&session), ids(&["0001", "0002"]));

    // A reply below the selected tail is followed.
    seed(&store, &[("0005", Some("0002"))]).await;
    session.refresh().await.unwrap();
    assert_eq!(branch_ids(&session), ids(&["0001", "0002", "0005"]));
}

#[tokio::test]
async fn test_newer_foreign_sibling_supersedes_stream() {
    let store = open_store(Backend::Memory).await;
    seed(&store, &[("0001", None)]).await;
    let mut session = loaded_session(&store).await;

    let stream = session.begin_stream().await.unwrap();
    session
        .push_stream(&stream, MessageContent::text("local answer"))
        .await
        .unwrap();

    // Another client regenerates the same reply with a later id.
    let foreign = "msg_zzzz";
    assert!(foreign > stream.as_str());
    seed(&store, &[(foreign, Some("0001"))]).await;
    session.refresh().await.unwrap();

    assert_eq!(branch_ids(&session), ids(&["0001", foreign]));
    assert_eq!(
        session.sibling_position(&stream),
        Some(SiblingPosition { index: 1, count: 2 })
    );

    session.finish_stream(&stream).await.unwrap();
    assert_eq!(
        store.get(&stream).await.unwrap().unwrap().extract_text(),
        "local answer"
    );
    assert_eq!(branch_ids(&session), ids(&["0001", foreign]));
    assert!(session.pending().is_empty());
}

#[tokio::test]
async fn test_new_branch_sorts_after_foreign_sibling_ids() {
    let store = open_store(Backend::Memory).await;
    seed(
        &store,
        &[("0001", None), ("0002", Some("0001")), ("zzzz", Some("0001"))],
    )
    .await;
    let mut session = loaded_session(&store).await;

    let id = session
        .edit_as_branch("0002", MessageContent::text("rephrased"))
        .await
        .unwrap();
    assert!(id.as_str() > "zzzz");

    let reloaded = loaded_session(&store).await;
    assert_eq!(reloaded.branch().tail(), Some(&id));
}

/// In-memory store whose writes can be switched off and whose next page
/// fetch can be made to hang.
struct FlakyStore {
    inner: InMemoryMessageStore,
    offline: AtomicBool,
    stall_next_fetch: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryMessageStore::new(),
            offline: AtomicBool::new(false),
            stall_next_fetch: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), MessageStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(MessageStoreError::connection("store offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn fetch_page(
        &self,
        chat_id: &ChatId,
        query: PageQuery,
    ) -> Result<MessagePage, MessageStoreError> {
        if self.stall_next_fetch.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.fetch_page(chat_id, query).await
    }

    async fn list_by_ids(
        &self,
        chat_id: &ChatId,
        ids: &[MessageId],
    ) -> Result<Vec<tavern_core::app::conversation::Message>, MessageStoreError> {
        self.inner.list_by_ids(chat_id, ids).await
    }

    async fn get(
        &self,
        id: &MessageId,
    ) -> Result<Option<tavern_core::app::conversation::Message>, MessageStoreError> {
        self.inner.get(id).await
    }

    async fn create(
        &self,
        message: NewMessage,
    ) -> Result<tavern_core::app::conversation::Message, MessageStoreError> {
        self.check()?;
        self.inner.create(message).await
    }

    async fn update(
        &self,
        id: &MessageId,
        content: MessageContent,
    ) -> Result<tavern_core::app::conversation::Message, MessageStoreError> {
        self.check()?;
        self.inner.update(id, content).await
    }

    async fn delete(
        &self,
        id: &MessageId,
        mode: DeleteMode,
    ) -> Result<Vec<MessageId>, MessageStoreError> {
        self.inner.delete(id, mode).await
    }

    async fn create_chat(&self, chat_id: &ChatId) -> Result<(), MessageStoreError> {
        self.inner.create_chat(chat_id).await
    }

    async fn delete_chat(&self, chat_id: &ChatId) -> Result<(), MessageStoreError> {
        self.inner.delete_chat(chat_id).await
    }

    async fn chat_exists(&self, chat_id: &ChatId) -> Result<bool, MessageStoreError> {
        self.inner.chat_exists(chat_id).await
    }
}

#[tokio::test]
async fn test_failed_mutation_keeps_optimistic_content_and_retries() {
    let flaky = Arc::new(FlakyStore::new());
    let store: Arc<dyn MessageStore> = flaky.clone();
    store.create_chat(&chat_id()).await.unwrap();
    seed(&store, &[("0001", None)]).await;
    let mut session = loaded_session(&store).await;

    flaky.offline.store(true, Ordering::SeqCst);
    let result = session
        .send_message(Role::User, MessageContent::text("hello"))
        .await;
    assert!(matches!(
        result,
        Err(Error::Store(MessageStoreError::Connection { .. }))
    ));

    assert_eq!(last_text(&session), "hello");
    assert_eq!(session.failed_mutations().len(), 1);
    assert_eq!(session.pending().len(), 1);
    let id = session.branch().tail().unwrap().clone();
    assert!(store.get(&id).await.unwrap().is_none());

    flaky.offline.store(false, Ordering::SeqCst);
    session.retry_failed_mutations().await.unwrap();

    assert!(session.failed_mutations().is_empty());
    assert!(session.pending().is_empty());
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().extract_text(),
        "hello"
    );
    assert_eq!(branch_ids(&session), vec![MessageId::from("0001"), id]);
}

#[tokio::test]
async fn test_abandoned_page_fetch_does_not_block_loading() {
    let flaky = Arc::new(FlakyStore::new());
    let store: Arc<dyn MessageStore> = flaky.clone();
    store.create_chat(&chat_id()).await.unwrap();
    seed(&store, &[("0001", None), ("0002", Some("0001"))]).await;
    let mut session = ChatSession::new(chat_id(), store.clone(), config(2, true));

    flaky.stall_next_fetch.store(true, Ordering::SeqCst);
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), session.fetch_next_page()).await;
    assert!(abandoned.is_err(), "the stalled fetch should time out");
    assert!(session.tree().is_none());

    session.load().await.unwrap();
    assert!(session.is_loaded());
    assert_eq!(branch_ids(&session), ids(&["0001", "0002"]));
}
