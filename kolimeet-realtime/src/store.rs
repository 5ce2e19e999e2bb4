//! In-process record store
//!
//! [`MemoryStore`] implements the [`RecordStore`] contract over shared
//! in-memory state. It backs the daemon's loopback mode and the test
//! suite, and it models the two behaviors the synchronization layer leans
//! on:
//!
//! - the conditional mark-read write: the null-check and the timestamp
//!   write happen under one write lock, so of two concurrent readers
//!   exactly one performs the write;
//! - commit-order fan-out: change events are published to matching
//!   subscribers before the write lock is released, so subscribers of one
//!   conversation observe events in commit order.
//!
//! `set_offline(true)` makes reads and writes fail with a transport error,
//! which is how tests exercise the surfaced-once, no-retry failure path.

use crate::feed::{
    ChangeEvent, EntityKind, FeedScope, RecordStore, SubscriberEntry, Subscription,
};
use crate::types::{
    Conversation, ConversationId, ConversationSummary, CounterpartProfile, Message, MessageId,
    UserId,
};
use crate::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// A stored user profile
#[derive(Debug, Clone)]
pub struct Profile {
    /// Profile owner
    pub user_id: UserId,
    /// Public display name
    pub display_name: String,
    /// Optional avatar URL
    pub avatar_url: Option<String>,
}

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<MessageId, Message>,
    profiles: HashMap<UserId, Profile>,
}

/// In-memory implementation of [`RecordStore`]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    subscribers: Arc<Mutex<Vec<SubscriberEntry>>>,
    next_subscription: AtomicU64,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscription: AtomicU64::new(0),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate loss or restoration of connectivity
    ///
    /// While offline, every read and write fails with a transport error
    /// and no change events are delivered.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        info!("Store connectivity changed: offline={}", offline);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SyncError::transport("store unreachable"))
        } else {
            Ok(())
        }
    }

    /// Register a conversation record
    pub async fn add_conversation(&self, conversation: Conversation) {
        let mut inner = self.inner.write().await;
        let event = ChangeEvent::insert(
            EntityKind::Conversations,
            serde_json::to_value(&conversation).unwrap_or(Value::Null),
        );
        inner.conversations.insert(conversation.id, conversation);
        self.publish(event, None);
    }

    /// Register a user profile
    pub async fn add_profile(&self, profile: Profile) {
        let mut inner = self.inner.write().await;
        inner.profiles.insert(profile.user_id, profile);
    }

    /// Emit a change event for a non-message entity
    ///
    /// Listings, profiles, reviews, and flags are owned by the backend;
    /// this hook stands in for their server-side writes when exercising
    /// the change router.
    pub async fn emit(&self, event: ChangeEvent) {
        // Take the write lock so emitted events serialize with commits.
        let _inner = self.inner.write().await;
        self.publish(event, None);
    }

    /// Fan out an event to every matching subscriber
    ///
    /// Called with the write lock held so delivery order matches commit
    /// order. Message events carry the conversation they were committed
    /// against so user- and conversation-scoped feeds filter server-side.
    fn publish(&self, event: ChangeEvent, conversation: Option<&Conversation>) {
        if self.offline.load(Ordering::SeqCst) {
            debug!("Dropping {} event while offline", event.table);
            return;
        }
        let subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for entry in subscribers.iter() {
            if entry.scope.accepts(&event, conversation) {
                // A closed receiver is cleaned up by its guard; ignore.
                let _ = entry.sender.send(event.clone());
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_messages(
        &self,
        conversation: ConversationId,
        before: Option<(DateTime<Utc>, MessageId)>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.check_online()?;
        let inner = self.inner.read().await;

        let mut messages: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation)
            .filter(|m| before.map_or(true, |cursor| (m.created_at, m.id) < cursor))
            .cloned()
            .collect();
        messages.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        // Newest window, still ascending.
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    async fn insert_message(&self, message: Message) -> Result<()> {
        self.check_online()?;
        let mut inner = self.inner.write().await;

        let conversation_id = message.conversation_id;
        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| SyncError::not_found(format!("conversation {}", conversation_id)))?;
        if !conversation.has_participant(message.sender_id) {
            return Err(SyncError::Auth(format!(
                "user {} is not a participant of {}",
                message.sender_id, conversation_id
            )));
        }

        let old_conversation = serde_json::to_value(&*conversation)?;
        conversation.note_last_message(&message);
        let new_conversation = serde_json::to_value(&*conversation)?;
        let committed_in = conversation.clone();

        let record = serde_json::to_value(&message)?;
        inner.messages.insert(message.id, message);
        debug!("Committed message in conversation {}", conversation_id);

        self.publish(
            ChangeEvent::insert(EntityKind::Messages, record),
            Some(&committed_in),
        );
        self.publish(
            ChangeEvent::update(EntityKind::Conversations, new_conversation, old_conversation),
            None,
        );
        Ok(())
    }

    async fn mark_read(&self, message: MessageId, at: DateTime<Utc>) -> Result<bool> {
        self.check_online()?;
        let mut inner = self.inner.write().await;

        let record = inner
            .messages
            .get_mut(&message)
            .ok_or_else(|| SyncError::not_found(format!("message {}", message)))?;

        let old = serde_json::to_value(&*record)?;
        if !record.mark_read(at) {
            // Already read; the second writer's attempt is a safe no-op.
            return Ok(false);
        }
        let new = serde_json::to_value(&*record)?;
        let conversation_id = record.conversation_id;
        debug!("Marked message {} read", message);

        let committed_in = inner.conversations.get(&conversation_id).cloned();
        self.publish(
            ChangeEvent::update(EntityKind::Messages, new, old),
            committed_in.as_ref(),
        );
        Ok(true)
    }

    async fn count_unread(&self, user: UserId) -> Result<u64> {
        self.check_online()?;
        let inner = self.inner.read().await;

        let count = inner
            .messages
            .values()
            .filter(|m| {
                inner
                    .conversations
                    .get(&m.conversation_id)
                    .is_some_and(|c| c.has_participant(user))
            })
            .filter(|m| m.is_unread_for(user))
            .count();
        Ok(count as u64)
    }

    async fn fetch_conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>> {
        self.check_online()?;
        let inner = self.inner.read().await;

        let mut summaries: Vec<ConversationSummary> = inner
            .conversations
            .values()
            .filter(|c| c.has_participant(user))
            .map(|c| {
                let counterpart_id = c.other_participant(user).unwrap_or(user);
                let counterpart = match inner.profiles.get(&counterpart_id) {
                    Some(profile) => CounterpartProfile {
                        user_id: profile.user_id,
                        display_name: Some(profile.display_name.clone()),
                        avatar_url: profile.avatar_url.clone(),
                    },
                    None => {
                        warn!(
                            "Profile {} missing for conversation {}, using placeholder",
                            counterpart_id, c.id
                        );
                        CounterpartProfile::placeholder(counterpart_id)
                    }
                };
                ConversationSummary {
                    conversation: c.clone(),
                    counterpart,
                }
            })
            .collect();

        // Most recent activity first.
        summaries.sort_by(|a, b| {
            let a_at = a.conversation.last_message_at.unwrap_or(a.conversation.created_at);
            let b_at = b.conversation.last_message_at.unwrap_or(b.conversation.created_at);
            b_at.cmp(&a_at)
        });
        Ok(summaries)
    }

    async fn subscribe(&self, scope: FeedScope) -> Result<Subscription> {
        self.check_online()?;
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| SyncError::invalid_state("subscriber registry poisoned"))?;
        subscribers.push(SubscriberEntry {
            id,
            scope,
            sender: tx,
        });
        debug!("Opened change subscription {} for {:?}", id, scope);

        Ok(Subscription::new(rx, Arc::clone(&self.subscribers), id))
    }
}
