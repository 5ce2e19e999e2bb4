//! Change-feed contract with the hosted backend
//!
//! The backend is consumed as a black box: a queryable record store plus a
//! per-scope change feed. Each feed event is a JSON envelope:
//!
//! ```json
//! {
//!     "event": "update",
//!     "table": "messages",
//!     "record": { "id": "...", "read_at": "2026-08-29T10:00:00Z", ... },
//!     "old_record": { "id": "...", "read_at": null, ... }
//! }
//! ```
//!
//! `old_record` is present on updates and deletes, which is what lets the
//! unread counter detect the null→non-null `read_at` transition without
//! re-aggregating.
//!
//! ## Ordering
//!
//! Events within one conversation are delivered in server-commit order.
//! No cross-conversation ordering is guaranteed or required.
//!
//! ## Subscriptions as scoped resources
//!
//! [`RecordStore::subscribe`] returns a [`Subscription`]: a handle owning
//! both the event receiver and an unsubscribe guard. Dropping the handle
//! releases the channel on every exit path; no call site carries manual
//! cleanup code.

use crate::types::{Conversation, ConversationId, ConversationSummary, Message, MessageId, UserId};
use crate::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Change operation carried by a feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// A new record was committed
    Insert,
    /// An existing record changed
    Update,
    /// A record was removed
    Delete,
}

/// Entity types the application subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Two-party message threads
    Conversations,
    /// Messages within threads
    Messages,
    /// Trip and parcel listings
    Listings,
    /// User profiles
    Profiles,
    /// Reviews between users
    Reviews,
    /// Moderation flags
    Flags,
}

impl EntityKind {
    /// Every entity kind the application observes
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Conversations,
        EntityKind::Messages,
        EntityKind::Listings,
        EntityKind::Profiles,
        EntityKind::Reviews,
        EntityKind::Flags,
    ];
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Conversations => "conversations",
            EntityKind::Messages => "messages",
            EntityKind::Listings => "listings",
            EntityKind::Profiles => "profiles",
            EntityKind::Reviews => "reviews",
            EntityKind::Flags => "flags",
        };
        f.write_str(name)
    }
}

/// A single change-feed event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The change operation
    #[serde(rename = "event")]
    pub op: ChangeOp,

    /// The entity type the record belongs to
    pub table: EntityKind,

    /// The record after the change (before, for deletes)
    pub record: Value,

    /// The record before the change (updates and deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    /// Create an insert event
    pub fn insert(table: EntityKind, record: Value) -> Self {
        Self {
            op: ChangeOp::Insert,
            table,
            record,
            old_record: None,
        }
    }

    /// Create an update event with before/after payloads
    pub fn update(table: EntityKind, record: Value, old_record: Value) -> Self {
        Self {
            op: ChangeOp::Update,
            table,
            record,
            old_record: Some(old_record),
        }
    }

    /// Create a delete event
    pub fn delete(table: EntityKind, record: Value) -> Self {
        Self {
            op: ChangeOp::Delete,
            table,
            record,
            old_record: None,
        }
    }

    /// Parse the record payload as a [`Message`]
    pub fn message(&self) -> Result<Message> {
        if self.table != EntityKind::Messages {
            return Err(SyncError::invalid_state(format!(
                "expected a messages event, got {}",
                self.table
            )));
        }
        Ok(serde_json::from_value(self.record.clone())?)
    }

    /// Parse the before-image payload as a [`Message`], if present
    pub fn old_message(&self) -> Result<Option<Message>> {
        match &self.old_record {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Parse the record payload as a [`Conversation`]
    pub fn conversation(&self) -> Result<Conversation> {
        if self.table != EntityKind::Conversations {
            return Err(SyncError::invalid_state(format!(
                "expected a conversations event, got {}",
                self.table
            )));
        }
        Ok(serde_json::from_value(self.record.clone())?)
    }

    /// The `id` field of the record payload, if it carries one
    pub fn record_id(&self) -> Option<MessageId> {
        self.record
            .get("id")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Server-side filter predicate for a change subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedScope {
    /// All changes to one entity kind visible to the subscriber
    Entity(EntityKind),
    /// Message changes within a single conversation
    Conversation(ConversationId),
    /// Message changes in every conversation `user` takes part in
    UserMessages(UserId),
}

impl FeedScope {
    /// Whether an event committed against `conversation` matches this scope
    pub(crate) fn accepts(&self, event: &ChangeEvent, conversation: Option<&Conversation>) -> bool {
        match self {
            FeedScope::Entity(kind) => event.table == *kind,
            FeedScope::Conversation(id) => {
                event.table == EntityKind::Messages && conversation.map(|c| c.id) == Some(*id)
            }
            FeedScope::UserMessages(user) => {
                event.table == EntityKind::Messages
                    && conversation.is_some_and(|c| c.has_participant(*user))
            }
        }
    }
}

type SubscriberRegistry = Arc<Mutex<Vec<SubscriberEntry>>>;

pub(crate) struct SubscriberEntry {
    pub(crate) id: u64,
    pub(crate) scope: FeedScope,
    pub(crate) sender: mpsc::UnboundedSender<ChangeEvent>,
}

/// Live change subscription for one [`FeedScope`]
///
/// Owns the event receiver and the unsubscribe guard. The channel is
/// released when the handle drops, whatever the exit path.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        registry: SubscriberRegistry,
        id: u64,
    ) -> Self {
        Self {
            events,
            _guard: SubscriptionGuard { registry, id },
        }
    }

    /// Receive the next event, or `None` once the feed closes
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Receive without waiting; `None` when no event is queued
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }
}

struct SubscriptionGuard {
    registry: SubscriberRegistry,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.registry.lock() {
            subscribers.retain(|entry| entry.id != self.id);
            debug!("Released change subscription {}", self.id);
        }
    }
}

/// The hosted persistence/auth/realtime collaborator
///
/// Implementations provide ordered windowed queries, the conditional
/// mark-read write that arbitrates concurrent readers, exact-count
/// aggregation, and per-scope change feeds delivered in commit order.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch up to `limit` messages of one conversation, ascending by
    /// creation time
    ///
    /// With `before` set, returns the window strictly older than that
    /// `(created_at, id)` cursor; otherwise the newest window. The cursor
    /// is composite so messages sharing a timestamp paginate without gaps.
    async fn fetch_messages(
        &self,
        conversation: ConversationId,
        before: Option<(DateTime<Utc>, MessageId)>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Commit a new message
    ///
    /// Transport failures are surfaced to the caller without retry.
    async fn insert_message(&self, message: Message) -> Result<()>;

    /// Conditionally transition `read_at` (and `delivered_at`) from null
    ///
    /// Returns `true` if this call performed the write, `false` if the
    /// message was already read. The null-check and the write happen under
    /// one commit, so concurrent callers race safely.
    async fn mark_read(&self, message: MessageId, at: DateTime<Utc>) -> Result<bool>;

    /// Exact count of messages unread by `user` across all conversations
    async fn count_unread(&self, user: UserId) -> Result<u64>;

    /// Conversations `user` takes part in, enriched with counterpart
    /// display data
    ///
    /// A missing counterpart profile yields a placeholder, never an error
    /// and never a dropped conversation.
    async fn fetch_conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>>;

    /// Open a live change feed for `scope`
    ///
    /// Returns immediately; events arrive through the handle in
    /// server-commit order per conversation.
    async fn subscribe(&self, scope: FeedScope) -> Result<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let event = ChangeEvent::update(
            EntityKind::Messages,
            json!({"id": "abc", "read_at": "2026-08-29T10:00:00Z"}),
            json!({"id": "abc", "read_at": null}),
        );

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["event"], "update");
        assert_eq!(wire["table"], "messages");
        assert_eq!(wire["old_record"]["read_at"], Value::Null);
    }

    #[test]
    fn test_insert_omits_old_record() {
        let event = ChangeEvent::insert(EntityKind::Listings, json!({"id": 1}));
        let wire = serde_json::to_string(&event).unwrap();
        assert!(!wire.contains("old_record"));
    }

    #[test]
    fn test_entity_kind_names() {
        assert_eq!(
            serde_json::to_string(&EntityKind::Conversations).unwrap(),
            "\"conversations\""
        );
        assert_eq!(EntityKind::Flags.to_string(), "flags");
        assert_eq!(EntityKind::ALL.len(), 6);
    }

    #[test]
    fn test_typed_accessor_rejects_wrong_table() {
        let event = ChangeEvent::insert(EntityKind::Profiles, json!({}));
        assert!(matches!(event.message(), Err(SyncError::InvalidState(_))));
    }

    #[test]
    fn test_scope_matching() {
        let a = UserId::new();
        let b = UserId::new();
        let conversation =
            Conversation::new(a, b, crate::types::ListingRef::Trip(uuid::Uuid::new_v4()));
        let event = ChangeEvent::insert(EntityKind::Messages, json!({}));

        assert!(FeedScope::Entity(EntityKind::Messages).accepts(&event, Some(&conversation)));
        assert!(!FeedScope::Entity(EntityKind::Reviews).accepts(&event, Some(&conversation)));
        assert!(FeedScope::Conversation(conversation.id).accepts(&event, Some(&conversation)));
        assert!(
            !FeedScope::Conversation(ConversationId::new()).accepts(&event, Some(&conversation))
        );
        assert!(FeedScope::UserMessages(a).accepts(&event, Some(&conversation)));
        assert!(!FeedScope::UserMessages(UserId::new()).accepts(&event, Some(&conversation)));
        // Without a committed conversation there is no participant to match.
        assert!(!FeedScope::UserMessages(a).accepts(&event, None));
    }

    #[tokio::test]
    async fn test_subscription_guard_releases_on_drop() {
        let registry: SubscriberRegistry = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        registry.lock().unwrap().push(SubscriberEntry {
            id: 7,
            scope: FeedScope::Entity(EntityKind::Messages),
            sender: tx,
        });

        let subscription = Subscription::new(rx, registry.clone(), 7);
        assert_eq!(registry.lock().unwrap().len(), 1);

        drop(subscription);
        assert!(registry.lock().unwrap().is_empty());
    }
}
