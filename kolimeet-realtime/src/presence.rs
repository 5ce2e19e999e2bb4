//! Presence channel abstraction
//!
//! An ephemeral, non-persisted broadcast medium for per-user state.
//! Clients track a small payload under their own identity on a named
//! channel; every channel member receives the full membership-state map on
//! every change:
//!
//! ```json
//! {
//!     "channel": "typing:7c9e...",
//!     "identity": "b2a1...",
//!     "payload": { "isTyping": true },
//!     "timestamp": "2026-08-29T10:00:00Z"
//! }
//! ```
//!
//! Each fanned-out entry also carries a server-assigned change ordinal
//! (`revision`) so observers can tell a refreshed entry from map churn
//! caused by other members. Nothing on this channel survives a disconnect;
//! consumers enforce their own time-to-live over what they observe.

use crate::types::UserId;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// One member's tracked state on a presence channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// The payload last tracked by this member
    pub payload: Value,

    /// When the payload was last tracked
    pub timestamp: DateTime<Utc>,

    /// Server-assigned change ordinal, strictly increasing per channel
    pub revision: u64,
}

/// Full membership-state map of one channel, keyed by identity
pub type PresenceState = HashMap<UserId, PresenceEntry>;

/// The ephemeral presence collaborator
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    /// Publish `payload` under `identity` on `channel`
    ///
    /// Suspends until the channel accepts the publish, not until observers
    /// receive it. Redundant publishes are allowed.
    async fn track(&self, channel: &str, identity: UserId, payload: Value) -> Result<()>;

    /// Join `channel` and start observing its membership state
    ///
    /// The returned handle yields the full state map on every change and
    /// removes `identity`'s tracked state when dropped.
    async fn join(&self, channel: &str, identity: UserId) -> Result<PresenceHandle>;
}

/// Membership observation handle for one (channel, identity) pair
///
/// Dropping the handle leaves the channel: the member's tracked state is
/// removed and remaining members are notified.
pub struct PresenceHandle {
    state: watch::Receiver<PresenceState>,
    _guard: PresenceGuard,
}

impl PresenceHandle {
    /// The current membership-state map
    pub fn current(&self) -> PresenceState {
        self.state.borrow().clone()
    }

    /// Wait for the next membership change
    ///
    /// Errors when the channel itself is gone; consumers degrade rather
    /// than surface this.
    pub async fn changed(&mut self) -> std::result::Result<(), watch::error::RecvError> {
        self.state.changed().await
    }
}

struct PresenceGuard {
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    channel: String,
    identity: UserId,
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        if let Ok(mut channels) = self.channels.lock() {
            if let Some(state) = channels.get_mut(&self.channel) {
                if state.members.remove(&self.identity).is_some() {
                    debug!(
                        "Presence: {} left channel {}",
                        self.identity, self.channel
                    );
                    state.tx.send_replace(state.members.clone());
                }
            }
        }
    }
}

struct ChannelState {
    members: PresenceState,
    tx: watch::Sender<PresenceState>,
    next_revision: u64,
}

impl ChannelState {
    fn new() -> Self {
        let (tx, _) = watch::channel(PresenceState::new());
        Self {
            members: PresenceState::new(),
            tx,
            next_revision: 0,
        }
    }
}

/// In-process presence hub
///
/// Stands in for the hosted realtime collaborator's presence channels in
/// the daemon's loopback mode and in tests.
pub struct MemoryPresence {
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
}

impl MemoryPresence {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceTransport for MemoryPresence {
    async fn track(&self, channel: &str, identity: UserId, payload: Value) -> Result<()> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = channels
            .entry(channel.to_string())
            .or_insert_with(ChannelState::new);

        let revision = state.next_revision;
        state.next_revision += 1;
        state.members.insert(
            identity,
            PresenceEntry {
                payload,
                timestamp: Utc::now(),
                revision,
            },
        );
        state.tx.send_replace(state.members.clone());
        Ok(())
    }

    async fn join(&self, channel: &str, identity: UserId) -> Result<PresenceHandle> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = channels
            .entry(channel.to_string())
            .or_insert_with(ChannelState::new);
        debug!("Presence: {} joined channel {}", identity, channel);

        Ok(PresenceHandle {
            state: state.tx.subscribe(),
            _guard: PresenceGuard {
                channels: Arc::clone(&self.channels),
                channel: channel.to_string(),
                identity,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_members_receive_full_state_map() {
        let hub = MemoryPresence::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let mut bob_handle = hub.join("typing:c1", bob).await.unwrap();
        hub.track("typing:c1", alice, json!({"isTyping": true}))
            .await
            .unwrap();

        bob_handle.changed().await.unwrap();
        let state = bob_handle.current();
        assert_eq!(state.len(), 1);
        assert_eq!(state[&alice].payload["isTyping"], true);
    }

    #[tokio::test]
    async fn test_revision_advances_on_redundant_track() {
        let hub = MemoryPresence::new();
        let alice = UserId::new();

        hub.track("c", alice, json!({"isTyping": true})).await.unwrap();
        let mut handle = hub.join("c", UserId::new()).await.unwrap();
        let first = handle.current()[&alice].revision;

        hub.track("c", alice, json!({"isTyping": true})).await.unwrap();
        handle.changed().await.unwrap();
        let second = handle.current()[&alice].revision;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_leaving_removes_tracked_state() {
        let hub = MemoryPresence::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let alice_handle = hub.join("c", alice).await.unwrap();
        hub.track("c", alice, json!({"isTyping": true})).await.unwrap();

        let mut bob_handle = hub.join("c", bob).await.unwrap();
        assert_eq!(bob_handle.current().len(), 1);

        drop(alice_handle);
        bob_handle.changed().await.unwrap();
        assert!(bob_handle.current().is_empty());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = MemoryPresence::new();
        let alice = UserId::new();

        hub.track("typing:c1", alice, json!({"isTyping": true}))
            .await
            .unwrap();

        let handle = hub.join("typing:c2", UserId::new()).await.unwrap();
        assert!(handle.current().is_empty());
    }
}
