//! Domain model for the Kolimeet messaging layer
//!
//! A [`Conversation`] is a two-party thread scoped to the listing (a trip
//! with spare luggage capacity, or a parcel needing transport) that
//! originated contact. [`Message`]s carry three mutually-ordered read-state
//! timestamps:
//!
//! ```text
//! created_at  ≤  delivered_at  ≤  read_at
//! (always set)   (set once)       (set once, by the non-sender)
//! ```
//!
//! Read-state transitions are monotonic: once set, `delivered_at` and
//! `read_at` are never cleared or moved. The transition methods on
//! [`Message`] are conditional no-ops when the timestamp is already set,
//! which is what makes concurrent mark-read attempts safe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum message content length, in characters, after trimming
pub const MAX_MESSAGE_LEN: usize = 2000;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(
    /// Stable opaque identifier of an authenticated user
    UserId
);
id_newtype!(
    /// Identifier of a two-party conversation thread
    ConversationId
);
id_newtype!(
    /// Identifier of a single message
    MessageId
);

/// The listing that originated contact between two users
///
/// Either a traveler's trip (spare luggage capacity) or a sender's parcel.
/// Carried as an opaque reference; listing content lives with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum ListingRef {
    /// A published trip with spare capacity
    Trip(Uuid),
    /// A parcel needing transport
    Parcel(Uuid),
}

/// A two-party message thread scoped to one originating listing
///
/// Created on first contact between two users about one listing and
/// immutable thereafter, except for the denormalized last-message
/// metadata. Conversations are never hard-deleted by users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identifier
    pub id: ConversationId,

    /// The two participants (order carries no meaning)
    pub participants: [UserId; 2],

    /// The listing that originated contact
    pub listing: ListingRef,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Denormalized preview of the most recent message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,

    /// Timestamp of the most recent message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Create a new conversation between two users about one listing
    pub fn new(a: UserId, b: UserId, listing: ListingRef) -> Self {
        Self {
            id: ConversationId::new(),
            participants: [a, b],
            listing,
            created_at: Utc::now(),
            last_message_preview: None,
            last_message_at: None,
        }
    }

    /// Whether `user` is one of the two participants
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participants.contains(&user)
    }

    /// The participant facing `viewer`, if `viewer` takes part at all
    pub fn other_participant(&self, viewer: UserId) -> Option<UserId> {
        match self.participants {
            [a, b] if a == viewer => Some(b),
            [a, b] if b == viewer => Some(a),
            _ => None,
        }
    }

    /// Update the denormalized last-message metadata
    pub fn note_last_message(&mut self, message: &Message) {
        self.last_message_preview = Some(truncate_preview(&message.content));
        self.last_message_at = Some(message.created_at);
    }
}

fn truncate_preview(content: &str) -> String {
    const PREVIEW_LEN: usize = 80;
    if content.chars().count() <= PREVIEW_LEN {
        content.to_string()
    } else {
        content.chars().take(PREVIEW_LEN).collect()
    }
}

/// A single message inside one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier
    pub id: MessageId,

    /// Conversation this message belongs to
    pub conversation_id: ConversationId,

    /// The sending participant
    pub sender_id: UserId,

    /// Textual content
    pub content: String,

    /// Creation timestamp (always set)
    pub created_at: DateTime<Utc>,

    /// When a recipient-side process first observed the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,

    /// When the non-sender first viewed the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a new outgoing message with both read-state timestamps null
    pub fn new(conversation_id: ConversationId, sender_id: UserId, content: String) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id,
            content,
            created_at: Utc::now(),
            delivered_at: None,
            read_at: None,
        }
    }

    /// Transition `delivered_at` from null to `at`
    ///
    /// Returns `true` if the write happened, `false` if the timestamp was
    /// already set (the concurrent-writer no-op).
    pub fn mark_delivered(&mut self, at: DateTime<Utc>) -> bool {
        if self.delivered_at.is_some() {
            return false;
        }
        self.delivered_at = Some(at);
        true
    }

    /// Transition `read_at` from null to `at`, backfilling `delivered_at`
    ///
    /// Maintains the invariant that a read message is always delivered.
    /// Returns `true` if the write happened, `false` if the message was
    /// already read.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.mark_delivered(at);
        self.read_at = Some(at);
        true
    }

    /// Whether this message counts as unread for `viewer`
    ///
    /// A viewer's own messages never count as unread.
    pub fn is_unread_for(&self, viewer: UserId) -> bool {
        self.sender_id != viewer && self.read_at.is_none()
    }

    /// Merge read-state from another copy of the same message
    ///
    /// Keeps timestamps monotonic: a copy with a null timestamp never
    /// clears one already set locally. Used when live updates race with
    /// local mark-read writes.
    pub fn merge_read_state(&mut self, other: &Message) {
        if self.delivered_at.is_none() {
            self.delivered_at = other.delivered_at;
        }
        if self.read_at.is_none() {
            self.read_at = other.read_at;
        }
    }
}

/// Display data for the participant facing the viewer
///
/// When the referenced profile no longer exists, the conversation is still
/// shown with a placeholder rather than dropped (soft failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterpartProfile {
    /// The counterpart's user id
    pub user_id: UserId,

    /// Display name, if the profile could be loaded
    pub display_name: Option<String>,

    /// Avatar URL, if the profile could be loaded
    pub avatar_url: Option<String>,
}

impl CounterpartProfile {
    /// Placeholder for a counterpart whose profile is missing
    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: None,
            avatar_url: None,
        }
    }

    /// Whether this is a placeholder for a missing profile
    pub fn is_placeholder(&self) -> bool {
        self.display_name.is_none() && self.avatar_url.is_none()
    }
}

/// A conversation enriched with counterpart display data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// The conversation record
    pub conversation: Conversation,

    /// Display data for the other participant
    pub counterpart: CounterpartProfile,
}
