//! Message store client
//!
//! [`MessageClient`] loads the ordered history of one conversation, keeps
//! it live-updated from the change feed, and owns the "viewing implies
//! reading" side effect. The locally materialized sequence is managed by
//! [`ConversationView`], an explicit reducer over tagged change events
//! applied to an ordered, identity-keyed collection, so the ordering
//! tolerance rules are testable without a live network:
//!
//! - an update arriving before its insert is stashed and folded in when
//!   the insert arrives;
//! - an insert for a known identity is a duplicate no-op;
//! - the sequence always reflects ascending creation time.
//!
//! History is loaded in windows (default 50 messages, the newest window
//! first) with [`MessageClient::load_older`] walking backwards, instead of
//! an unbounded full fetch.

use crate::feed::{ChangeEvent, ChangeOp, FeedScope, RecordStore, Subscription};
use crate::types::{ConversationId, Message, MessageId, UserId, MAX_MESSAGE_LEN};
use crate::{Result, SyncError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default history window size
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Ordered, identity-keyed view of one conversation's messages
///
/// The reducer behind [`MessageClient`]. Maintains ascending
/// `(created_at, id)` order on every apply.
#[derive(Debug, Default)]
pub struct ConversationView {
    ordered: Vec<Message>,
    pending_updates: HashMap<MessageId, Message>,
}

impl ConversationView {
    /// Create an empty view
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a tagged change event to the view
    pub fn apply(&mut self, event: &ChangeEvent) -> Result<()> {
        match event.op {
            ChangeOp::Insert => {
                self.insert(event.message()?);
            }
            ChangeOp::Update => {
                self.update(event.message()?);
            }
            ChangeOp::Delete => {
                if let Some(id) = event.record_id() {
                    self.remove(id);
                }
            }
        }
        Ok(())
    }

    /// Insert a message, keeping ascending order
    ///
    /// A known identity is a duplicate no-op. A stashed early update for
    /// this identity is folded in. Returns whether the view changed.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.position(message.id).is_some() {
            debug!("Duplicate insert for message {}, ignoring", message.id);
            return false;
        }
        let message = match self.pending_updates.remove(&message.id) {
            Some(mut update) => {
                // The stashed update is the later image; keep any
                // read-state the insert already carried.
                update.merge_read_state(&message);
                update
            }
            None => message,
        };
        let at = self
            .ordered
            .partition_point(|m| (m.created_at, m.id) < (message.created_at, message.id));
        self.ordered.insert(at, message);
        true
    }

    /// Replace the record matching by identity
    ///
    /// An update for an unknown identity is stashed until its insert
    /// arrives (network reordering tolerance). Returns whether a known
    /// record was replaced.
    pub fn update(&mut self, message: Message) -> bool {
        match self.position(message.id) {
            Some(index) => {
                let mut replacement = message;
                // Read-state timestamps never move backward locally even
                // if a stale image arrives late.
                replacement.merge_read_state(&self.ordered[index]);
                self.ordered[index] = replacement;
                true
            }
            None => {
                debug!(
                    "Update before insert for message {}, stashing",
                    message.id
                );
                self.pending_updates.insert(message.id, message);
                false
            }
        }
    }

    /// Remove the record matching by identity
    pub fn remove(&mut self, id: MessageId) -> bool {
        self.pending_updates.remove(&id);
        match self.position(id) {
            Some(index) => {
                self.ordered.remove(index);
                true
            }
            None => false,
        }
    }

    /// The materialized sequence, ascending by creation time
    pub fn messages(&self) -> &[Message] {
        &self.ordered
    }

    /// Look up one message by identity
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.position(id).map(|i| &self.ordered[i])
    }

    /// The oldest loaded message, if any
    pub fn oldest(&self) -> Option<&Message> {
        self.ordered.first()
    }

    /// Number of materialized messages
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the view holds no messages
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.ordered.iter().position(|m| m.id == id)
    }
}

/// Client for one conversation's message history and live feed
pub struct MessageClient {
    store: Arc<dyn RecordStore>,
    viewer: UserId,
    conversation: ConversationId,
    page_size: usize,
    view: RwLock<ConversationView>,
}

impl MessageClient {
    /// Create a client for one conversation
    pub fn new(store: Arc<dyn RecordStore>, viewer: UserId, conversation: ConversationId) -> Self {
        Self::with_page_size(store, viewer, conversation, DEFAULT_PAGE_SIZE)
    }

    /// Create a client with a custom history window size
    pub fn with_page_size(
        store: Arc<dyn RecordStore>,
        viewer: UserId,
        conversation: ConversationId,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            viewer,
            conversation,
            page_size: page_size.max(1),
            view: RwLock::new(ConversationView::new()),
        }
    }

    /// The conversation this client is bound to
    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// Load the newest history window and mark fetched messages read
    ///
    /// Every fetched message not sent by the viewer and not yet read is
    /// transitioned through the conditional mark-read write; re-invoking
    /// on an already-read set performs no writes.
    pub async fn load_history(&self) -> Result<Vec<Message>> {
        let fetched = self
            .store
            .fetch_messages(self.conversation, None, self.page_size)
            .await?;
        info!(
            "Loaded {} messages for conversation {}",
            fetched.len(),
            self.conversation
        );
        self.absorb(fetched).await?;
        Ok(self.snapshot().await)
    }

    /// Load the window preceding the oldest loaded message
    ///
    /// Pages on the `(created_at, id)` cursor of the oldest loaded message
    /// so ties on the timestamp are never skipped. Returns the number of
    /// messages fetched; zero once history is exhausted. Falls back to
    /// [`load_history`](Self::load_history) semantics when nothing is
    /// loaded yet.
    pub async fn load_older(&self) -> Result<usize> {
        let before = self
            .view
            .read()
            .await
            .oldest()
            .map(|m| (m.created_at, m.id));
        let fetched = self
            .store
            .fetch_messages(self.conversation, before, self.page_size)
            .await?;
        let count = fetched.len();
        debug!(
            "Loaded {} older messages for conversation {}",
            count, self.conversation
        );
        self.absorb(fetched).await?;
        Ok(count)
    }

    /// Validate and send a message
    ///
    /// Content is trimmed, must be non-empty and at most 2000 characters.
    /// Validation failures are surfaced before any network call; a
    /// transport failure is surfaced once with no retry, and the caller
    /// keeps the content for a manual resend.
    pub async fn send(&self, content: &str) -> Result<Message> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SyncError::validation("message content is empty"));
        }
        if trimmed.chars().count() > MAX_MESSAGE_LEN {
            return Err(SyncError::validation(format!(
                "message content exceeds {} characters",
                MAX_MESSAGE_LEN
            )));
        }

        let message = Message::new(self.conversation, self.viewer, trimmed.to_string());
        self.store.insert_message(message.clone()).await?;

        // Optimistic local append; the feed echo is a duplicate no-op.
        self.view.write().await.insert(message.clone());
        Ok(message)
    }

    /// Open the live change feed for this conversation
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.store
            .subscribe(FeedScope::Conversation(self.conversation))
            .await
    }

    /// Apply one live event to the view
    ///
    /// A foreign insert is auto-marked read: the client is only live while
    /// the viewer has the conversation open, so observing the insert is
    /// taken as viewing it.
    pub async fn handle_event(&self, event: &ChangeEvent) -> Result<()> {
        self.view.write().await.apply(event)?;

        if event.op == ChangeOp::Insert {
            let message = event.message()?;
            if message.sender_id != self.viewer && message.read_at.is_none() {
                self.mark_one_read(message.id).await;
            }
        }
        Ok(())
    }

    /// Current materialized sequence, ascending by creation time
    pub async fn snapshot(&self) -> Vec<Message> {
        self.view.read().await.messages().to_vec()
    }

    /// Count of loaded messages still unread by the viewer
    pub async fn local_unread(&self) -> usize {
        self.view
            .read()
            .await
            .messages()
            .iter()
            .filter(|m| m.is_unread_for(self.viewer))
            .count()
    }

    async fn absorb(&self, fetched: Vec<Message>) -> Result<()> {
        let mut to_mark = Vec::new();
        {
            let mut view = self.view.write().await;
            for message in fetched {
                if message.is_unread_for(self.viewer) {
                    to_mark.push(message.id);
                }
                view.insert(message);
            }
        }
        for id in to_mark {
            self.mark_one_read(id).await;
        }
        Ok(())
    }

    async fn mark_one_read(&self, id: MessageId) {
        let at = Utc::now();
        match self.store.mark_read(id, at).await {
            Ok(true) => {
                // Reflect the transition locally; the feed echo merges
                // idempotently.
                let mut view = self.view.write().await;
                if let Some(mut updated) = view.get(id).cloned() {
                    updated.mark_read(at);
                    view.update(updated);
                }
            }
            Ok(false) => {}
            Err(e) => {
                // Best-effort side effect; the next view re-attempts it.
                warn!("Failed to mark message {} read: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::EntityKind;
    use crate::store::MemoryStore;
    use crate::types::{Conversation, ListingRef};
    use serde_json::json;
    use uuid::Uuid;

    fn message_at(conversation: ConversationId, sender: UserId, offset_secs: i64) -> Message {
        let mut msg = Message::new(conversation, sender, format!("t+{}", offset_secs));
        msg.created_at = Utc::now() + chrono::Duration::seconds(offset_secs);
        msg
    }

    #[test]
    fn test_view_orders_by_creation_time() {
        let conversation = ConversationId::new();
        let sender = UserId::new();
        let mut view = ConversationView::new();

        view.insert(message_at(conversation, sender, 2));
        view.insert(message_at(conversation, sender, 0));
        view.insert(message_at(conversation, sender, 1));

        let contents: Vec<_> = view.messages().iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["t+0", "t+1", "t+2"]);
    }

    #[test]
    fn test_view_duplicate_insert_is_noop() {
        let msg = Message::new(ConversationId::new(), UserId::new(), "once".to_string());
        let mut view = ConversationView::new();

        assert!(view.insert(msg.clone()));
        assert!(!view.insert(msg));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_view_update_before_insert_folds_in() {
        let msg = Message::new(ConversationId::new(), UserId::new(), "hello".to_string());
        let mut view = ConversationView::new();

        // Update arrives first: the read receipt for a not-yet-seen insert.
        let mut updated = msg.clone();
        updated.mark_read(Utc::now());
        assert!(!view.update(updated));
        assert!(view.is_empty());

        // The insert eventually arrives; final state reflects the update.
        assert!(view.insert(msg.clone()));
        let materialized = view.get(msg.id).unwrap();
        assert!(materialized.read_at.is_some());
        assert!(view.pending_updates.is_empty());
    }

    #[test]
    fn test_view_update_never_moves_read_state_backward() {
        let mut msg = Message::new(ConversationId::new(), UserId::new(), "m".to_string());
        let mut view = ConversationView::new();
        view.insert(msg.clone());

        let mut read = msg.clone();
        read.mark_read(Utc::now());
        view.update(read.clone());

        // A stale image with null read_at arrives late.
        msg.content = "m (edited)".to_string();
        view.update(msg.clone());

        let materialized = view.get(msg.id).unwrap();
        assert_eq!(materialized.content, "m (edited)");
        assert_eq!(materialized.read_at, read.read_at);
    }

    #[test]
    fn test_view_delete_removes_by_identity() {
        let msg = Message::new(ConversationId::new(), UserId::new(), "gone".to_string());
        let mut view = ConversationView::new();
        view.insert(msg.clone());

        assert!(view.remove(msg.id));
        assert!(view.is_empty());
        assert!(!view.remove(msg.id));
    }

    #[test]
    fn test_view_apply_delete_event() {
        let msg = Message::new(ConversationId::new(), UserId::new(), "gone".to_string());
        let mut view = ConversationView::new();
        view.insert(msg.clone());

        let event = ChangeEvent::delete(EntityKind::Messages, json!({ "id": msg.id }));
        view.apply(&event).unwrap();
        assert!(view.is_empty());
    }

    async fn client_fixture() -> (Arc<MemoryStore>, Conversation, UserId, UserId) {
        let store = Arc::new(MemoryStore::new());
        let a = UserId::new();
        let b = UserId::new();
        let conversation = Conversation::new(a, b, ListingRef::Trip(Uuid::new_v4()));
        store.add_conversation(conversation.clone()).await;
        (store, conversation, a, b)
    }

    #[tokio::test]
    async fn test_send_validation() {
        let (store, conversation, a, _b) = client_fixture().await;
        let client = MessageClient::new(store, a, conversation.id);

        assert!(matches!(
            client.send("   ").await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            client.send(&"x".repeat(2001)).await,
            Err(SyncError::Validation(_))
        ));

        // Exactly at the limit, after trimming, is accepted.
        let at_limit = format!("  {}  ", "x".repeat(2000));
        let sent = client.send(&at_limit).await.unwrap();
        assert_eq!(sent.content.chars().count(), 2000);
        assert!(sent.read_at.is_none());
        assert!(sent.delivered_at.is_none());
    }

    #[tokio::test]
    async fn test_send_transport_failure_is_surfaced_once() {
        let (store, conversation, a, _b) = client_fixture().await;
        let client = MessageClient::new(store.clone(), a, conversation.id);

        store.set_offline(true);
        assert!(matches!(
            client.send("please arrive").await,
            Err(SyncError::Transport(_))
        ));
        // Nothing was appended locally; the user resends manually.
        assert!(client.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_history_marks_foreign_messages_read() {
        let (store, conversation, a, b) = client_fixture().await;
        for i in 0..3 {
            store
                .insert_message(message_at(conversation.id, a, i))
                .await
                .unwrap();
        }

        let reader = MessageClient::new(store.clone(), b, conversation.id);
        let history = reader.load_history().await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(store.count_unread(b).await.unwrap(), 0);
        assert_eq!(reader.local_unread().await, 0);
    }

    #[tokio::test]
    async fn test_load_history_is_idempotent() {
        let (store, conversation, a, b) = client_fixture().await;
        store
            .insert_message(message_at(conversation.id, a, 0))
            .await
            .unwrap();

        let reader = MessageClient::new(store.clone(), b, conversation.id);
        reader.load_history().await.unwrap();

        // Watch the feed: a second load must perform no writes.
        let mut sub = store
            .subscribe(FeedScope::Conversation(conversation.id))
            .await
            .unwrap();
        reader.load_history().await.unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_load_history_never_marks_own_messages() {
        let (store, conversation, a, _b) = client_fixture().await;
        store
            .insert_message(message_at(conversation.id, a, 0))
            .await
            .unwrap();

        let sender = MessageClient::new(store.clone(), a, conversation.id);
        sender.load_history().await.unwrap();

        let history = sender.snapshot().await;
        assert!(history[0].read_at.is_none());
    }

    #[tokio::test]
    async fn test_load_older_walks_backwards() {
        let (store, conversation, a, _b) = client_fixture().await;
        for i in 0..5 {
            store
                .insert_message(message_at(conversation.id, a, i))
                .await
                .unwrap();
        }

        let client = MessageClient::with_page_size(store.clone(), a, conversation.id, 2);
        client.load_history().await.unwrap();
        assert_eq!(client.snapshot().await.len(), 2);

        assert_eq!(client.load_older().await.unwrap(), 2);
        assert_eq!(client.load_older().await.unwrap(), 1);
        assert_eq!(client.load_older().await.unwrap(), 0);

        let contents: Vec<_> = client
            .snapshot()
            .await
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["t+0", "t+1", "t+2", "t+3", "t+4"]);
    }

    #[tokio::test]
    async fn test_load_older_does_not_skip_timestamp_ties() {
        let (store, conversation, a, _b) = client_fixture().await;
        let at = Utc::now();
        for i in 0..3 {
            let mut msg = Message::new(conversation.id, a, format!("tied {}", i));
            msg.created_at = at;
            store.insert_message(msg).await.unwrap();
        }

        let client = MessageClient::with_page_size(store.clone(), a, conversation.id, 1);
        client.load_history().await.unwrap();
        assert_eq!(client.load_older().await.unwrap(), 1);
        assert_eq!(client.load_older().await.unwrap(), 1);
        assert_eq!(client.load_older().await.unwrap(), 0);
        assert_eq!(client.snapshot().await.len(), 3);
    }

    #[tokio::test]
    async fn test_live_insert_auto_marks_read() {
        let (store, conversation, a, b) = client_fixture().await;
        let reader = MessageClient::new(store.clone(), b, conversation.id);
        let mut sub = reader.subscribe().await.unwrap();

        store
            .insert_message(message_at(conversation.id, a, 0))
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        reader.handle_event(&event).await.unwrap();

        assert_eq!(store.count_unread(b).await.unwrap(), 0);
        assert_eq!(reader.local_unread().await, 0);
    }

    #[tokio::test]
    async fn test_own_echo_is_not_marked_read() {
        let (store, conversation, a, _b) = client_fixture().await;
        let sender = MessageClient::new(store.clone(), a, conversation.id);
        let mut sub = sender.subscribe().await.unwrap();

        sender.send("Bonjour").await.unwrap();
        let event = sub.recv().await.unwrap();
        sender.handle_event(&event).await.unwrap();

        let history = sender.snapshot().await;
        assert_eq!(history.len(), 1);
        assert!(history[0].read_at.is_none());
    }
}
