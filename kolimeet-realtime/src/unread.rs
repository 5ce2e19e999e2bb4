//! Global unread counter
//!
//! A single derived integer: the count of messages where the current user
//! is not the sender and `read_at` is null, across all conversations. The
//! counter is reconstructed once with an aggregate query and then
//! maintained incrementally from the user-scoped message feed
//! ([`FeedScope::UserMessages`](crate::FeedScope)), the same participant
//! scoping the aggregate uses. No event ever triggers a re-aggregation.
//!
//! Drift from missed events during a disconnect is an accepted risk,
//! corrected by [`UnreadCounter::resync`] at the reconnect
//! resynchronization point.

use crate::feed::{ChangeEvent, ChangeOp, RecordStore, Subscription};
use crate::types::UserId;
use crate::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Incrementally maintained unread-message counter for one user
pub struct UnreadCounter {
    store: Arc<dyn RecordStore>,
    user: UserId,
    tx: watch::Sender<u64>,
}

impl UnreadCounter {
    /// Compute the initial aggregate and start maintaining it
    pub async fn start(store: Arc<dyn RecordStore>, user: UserId) -> Result<Self> {
        let initial = store.count_unread(user).await?;
        info!("Unread counter initialized at {} for {}", initial, user);
        let (tx, _) = watch::channel(initial);
        Ok(Self { store, user, tx })
    }

    /// Subscribe to counter updates
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    /// Current counter value
    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Fold one message-feed event into the counter
    ///
    /// Foreign inserts increment; a foreign null→non-null `read_at`
    /// transition decrements, floored at zero. Everything else is ignored.
    pub fn handle_event(&self, event: &ChangeEvent) {
        match event.op {
            ChangeOp::Insert => {
                let Ok(message) = event.message() else { return };
                if message.sender_id != self.user && message.read_at.is_none() {
                    let value = self.current() + 1;
                    debug!("Unread counter incremented to {}", value);
                    self.tx.send_replace(value);
                }
            }
            ChangeOp::Update => {
                let Ok(message) = event.message() else { return };
                let Ok(Some(old)) = event.old_message() else { return };
                if message.sender_id != self.user
                    && old.read_at.is_none()
                    && message.read_at.is_some()
                {
                    let value = self.current().saturating_sub(1);
                    debug!("Unread counter decremented to {}", value);
                    self.tx.send_replace(value);
                }
            }
            ChangeOp::Delete => {}
        }
    }

    /// Re-run the full aggregate to correct accumulated drift
    ///
    /// The one sanctioned recomputation, invoked on reconnect.
    pub async fn resync(&self) -> Result<u64> {
        let value = self.store.count_unread(self.user).await?;
        info!("Unread counter resynced to {}", value);
        self.tx.send_replace(value);
        Ok(value)
    }

    /// Drive the counter from a live message subscription
    ///
    /// Runs until the feed closes.
    pub async fn run(&self, mut subscription: Subscription) {
        while let Some(event) = subscription.recv().await {
            self.handle_event(&event);
        }
        debug!("Unread counter feed closed");
    }
}
