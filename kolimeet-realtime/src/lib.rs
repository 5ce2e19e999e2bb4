//! Kolimeet Realtime Messaging Synchronization Layer
//!
//! Keeps the messaging surface of the Kolimeet parcel-transport
//! marketplace consistent across tabs and devices without full resyncs:
//! per-conversation message history with read receipts, ephemeral typing
//! presence, a global unread counter, and broadcast cache invalidation
//! driven by the backend's change feeds.
//!
//! The hosted backend is consumed through two seams: [`RecordStore`]
//! (queries, the conditional mark-read write, change feeds) and
//! [`PresenceTransport`] (ephemeral per-user state fan-out). In-process
//! implementations of both back the test suite and the daemon's loopback
//! mode.

pub mod error;
pub mod feed;
pub mod messages;
pub mod orchestrator;
pub mod presence;
pub mod router;
pub mod store;
pub mod types;
pub mod typing;
pub mod unread;

pub use error::{Result, SyncError};
pub use feed::{ChangeEvent, ChangeOp, EntityKind, FeedScope, RecordStore, Subscription};
pub use messages::{ConversationView, MessageClient, DEFAULT_PAGE_SIZE};
pub use orchestrator::{Connectivity, SessionConfig, SyncSession};
pub use presence::{MemoryPresence, PresenceEntry, PresenceHandle, PresenceState, PresenceTransport};
pub use router::{dependent_keys, CacheKey, ChangeRouter, Invalidation, RouterConfig};
pub use store::{MemoryStore, Profile};
pub use types::{
    Conversation, ConversationId, ConversationSummary, CounterpartProfile, ListingRef, Message,
    MessageId, UserId, MAX_MESSAGE_LEN,
};
pub use typing::{TypingObserver, TypingPublisher, TYPING_DEBOUNCE, TYPING_TTL};
pub use unread::UnreadCounter;
