//! Typing presence tracker
//!
//! Broadcasts and observes per-conversation composing state without
//! persistence, over one presence channel per conversation
//! (`typing:<conversation-id>`).
//!
//! The protocol assumes a fresh `true` arrives at least every 3 seconds
//! while the other party is typing. The time-to-live is enforced by the
//! observer, not the producer: if no refresh arrives within the window —
//! a tab crash, a dropped presence channel — the observer locally decays
//! to "not typing" with zero further events. Channel loss is never
//! surfaced as an error.
//!
//! On the producing side, [`TypingPublisher`] announces `true` on every
//! content change and arms a 2-second debounce that announces `false`;
//! submit and teardown announce `false` immediately (best-effort — the
//! observer timeout is the backstop for an abrupt unmount).

use crate::presence::{PresenceHandle, PresenceTransport};
use crate::types::{ConversationId, UserId};
use crate::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

/// Observer-enforced freshness window for a `true` announcement
pub const TYPING_TTL: Duration = Duration::from_secs(3);

/// Producer-side idle window before announcing `false`
pub const TYPING_DEBOUNCE: Duration = Duration::from_secs(2);

fn typing_channel(conversation: ConversationId) -> String {
    format!("typing:{}", conversation)
}

fn typing_payload(is_typing: bool) -> serde_json::Value {
    json!({ "isTyping": is_typing })
}

/// Continuously updated "is the other party typing" signal
///
/// Spawns a background task that folds presence changes and the TTL into
/// a `watch` channel of `bool`. Dropping the observer tears the task and
/// the presence membership down.
pub struct TypingObserver {
    rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl TypingObserver {
    /// Start observing `conversation` as `viewer`
    pub async fn start(
        transport: Arc<dyn PresenceTransport>,
        conversation: ConversationId,
        viewer: UserId,
    ) -> Result<Self> {
        Self::start_with_ttl(transport, conversation, viewer, TYPING_TTL).await
    }

    /// Start with a custom freshness window
    pub async fn start_with_ttl(
        transport: Arc<dyn PresenceTransport>,
        conversation: ConversationId,
        viewer: UserId,
        ttl: Duration,
    ) -> Result<Self> {
        let handle = transport.join(&typing_channel(conversation), viewer).await?;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(observe_loop(handle, viewer, ttl, tx));
        Ok(Self { rx, task })
    }

    /// Subscribe to the typing signal
    pub fn observe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Current value of the signal
    pub fn is_typing(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Drop for TypingObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Last-observed announcement per other participant
struct Observed {
    revision: u64,
    seen_at: Instant,
    is_typing: bool,
}

async fn observe_loop(
    mut handle: PresenceHandle,
    viewer: UserId,
    ttl: Duration,
    tx: watch::Sender<bool>,
) {
    let mut observed: HashMap<UserId, Observed> = HashMap::new();

    loop {
        let now = Instant::now();
        {
            let state = handle.current();
            for (user, entry) in &state {
                if *user == viewer {
                    continue;
                }
                let refreshed = observed
                    .get(user)
                    .map_or(true, |seen| seen.revision != entry.revision);
                if refreshed {
                    // Only a refreshed entry restarts the TTL; map churn
                    // caused by other members must not keep a stale
                    // "typing" alive.
                    let is_typing = entry
                        .payload
                        .get("isTyping")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    observed.insert(
                        *user,
                        Observed {
                            revision: entry.revision,
                            seen_at: now,
                            is_typing,
                        },
                    );
                }
            }
            // A member that left is no longer typing.
            observed.retain(|user, _| state.contains_key(user));
        }

        // Deadlines still in the future; expired announcements count as
        // "not typing" already.
        let deadline = observed
            .values()
            .filter(|seen| seen.is_typing)
            .map(|seen| seen.seen_at + ttl)
            .filter(|at| *at > now)
            .min();

        tx.send_replace(deadline.is_some());

        tokio::select! {
            changed = handle.changed() => {
                if changed.is_err() {
                    // Presence channel gone: degrade, never error.
                    debug!("Presence channel closed, typing signal decays to false");
                    tx.send_replace(false);
                    return;
                }
            }
            _ = sleep_until_opt(deadline) => {}
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

/// Local producer feeding the typing announcements
pub struct TypingPublisher {
    transport: Arc<dyn PresenceTransport>,
    channel: String,
    viewer: UserId,
    debounce: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TypingPublisher {
    /// Create a publisher for `conversation`
    pub fn new(
        transport: Arc<dyn PresenceTransport>,
        conversation: ConversationId,
        viewer: UserId,
    ) -> Self {
        Self::with_debounce(transport, conversation, viewer, TYPING_DEBOUNCE)
    }

    /// Create a publisher with a custom idle window
    pub fn with_debounce(
        transport: Arc<dyn PresenceTransport>,
        conversation: ConversationId,
        viewer: UserId,
        debounce: Duration,
    ) -> Self {
        Self {
            transport,
            channel: typing_channel(conversation),
            viewer,
            debounce,
            pending: Mutex::new(None),
        }
    }

    /// The composer content changed
    ///
    /// Announces `true` (redundant announcements are allowed) and re-arms
    /// the idle debounce that will announce `false`.
    pub async fn input_changed(&self) -> Result<()> {
        self.cancel_debounce();
        self.announce(true).await?;

        let transport = Arc::clone(&self.transport);
        let channel = self.channel.clone();
        let viewer = self.viewer;
        let debounce = self.debounce;
        let timer = tokio::spawn(async move {
            time::sleep(debounce).await;
            let _ = transport
                .track(&channel, viewer, typing_payload(false))
                .await;
        });
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(timer);
        }
        Ok(())
    }

    /// The composer was submitted; announce `false` immediately
    pub async fn submitted(&self) -> Result<()> {
        self.cancel_debounce();
        self.announce(false).await
    }

    /// Leaving the conversation view; best-effort `false`
    pub async fn close(&self) -> Result<()> {
        self.cancel_debounce();
        self.announce(false).await
    }

    async fn announce(&self, is_typing: bool) -> Result<()> {
        self.transport
            .track(&self.channel, self.viewer, typing_payload(is_typing))
            .await
    }

    fn cancel_debounce(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(timer) = pending.take() {
                timer.abort();
            }
        }
    }
}

impl Drop for TypingPublisher {
    fn drop(&mut self) {
        // An abrupt unmount cannot announce; the observer TTL covers it.
        self.cancel_debounce();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresence;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn fixture() -> (Arc<MemoryPresence>, ConversationId, UserId, UserId) {
        (
            Arc::new(MemoryPresence::new()),
            ConversationId::new(),
            UserId::new(),
            UserId::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_true_announcement_is_observed() {
        let (hub, conversation, alice, bob) = fixture();
        let observer = TypingObserver::start(hub.clone(), conversation, bob)
            .await
            .unwrap();
        settle().await;
        assert!(!observer.is_typing());

        hub.track(&typing_channel(conversation), alice, typing_payload(true))
            .await
            .unwrap();
        settle().await;
        assert!(observer.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_decays_with_zero_further_events() {
        let (hub, conversation, alice, bob) = fixture();
        let observer = TypingObserver::start(hub.clone(), conversation, bob)
            .await
            .unwrap();
        settle().await;

        hub.track(&typing_channel(conversation), alice, typing_payload(true))
            .await
            .unwrap();
        settle().await;
        assert!(observer.is_typing());

        // Just inside the window: still typing.
        time::advance(Duration::from_millis(2900)).await;
        settle().await;
        assert!(observer.is_typing());

        // Past the window, no explicit false ever arrived.
        time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert!(!observer.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_true_extends_the_window() {
        let (hub, conversation, alice, bob) = fixture();
        let observer = TypingObserver::start(hub.clone(), conversation, bob)
            .await
            .unwrap();
        settle().await;

        hub.track(&typing_channel(conversation), alice, typing_payload(true))
            .await
            .unwrap();
        settle().await;

        time::advance(Duration::from_millis(2500)).await;
        hub.track(&typing_channel(conversation), alice, typing_payload(true))
            .await
            .unwrap();
        settle().await;

        // 3s past the first announce, but the refresh restarted the TTL.
        time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert!(observer.is_typing());

        time::advance(Duration::from_millis(2100)).await;
        settle().await;
        assert!(!observer.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_announcements_are_ignored() {
        let (hub, conversation, _alice, bob) = fixture();
        let observer = TypingObserver::start(hub.clone(), conversation, bob)
            .await
            .unwrap();
        settle().await;

        hub.track(&typing_channel(conversation), bob, typing_payload(true))
            .await
            .unwrap();
        settle().await;
        assert!(!observer.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_false_transitions_immediately() {
        let (hub, conversation, alice, bob) = fixture();
        let observer = TypingObserver::start(hub.clone(), conversation, bob)
            .await
            .unwrap();
        settle().await;

        hub.track(&typing_channel(conversation), alice, typing_payload(true))
            .await
            .unwrap();
        settle().await;
        assert!(observer.is_typing());

        hub.track(&typing_channel(conversation), alice, typing_payload(false))
            .await
            .unwrap();
        settle().await;
        assert!(!observer.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_leaving_decays_to_false() {
        let (hub, conversation, alice, bob) = fixture();
        let observer = TypingObserver::start(hub.clone(), conversation, bob)
            .await
            .unwrap();
        settle().await;

        let alice_handle = hub
            .join(&typing_channel(conversation), alice)
            .await
            .unwrap();
        hub.track(&typing_channel(conversation), alice, typing_payload(true))
            .await
            .unwrap();
        settle().await;
        assert!(observer.is_typing());

        drop(alice_handle);
        settle().await;
        assert!(!observer.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_announces_false_before_ttl() {
        let (hub, conversation, alice, bob) = fixture();
        let observer = TypingObserver::start(hub.clone(), conversation, bob)
            .await
            .unwrap();
        settle().await;

        let publisher = TypingPublisher::new(hub.clone(), conversation, alice);
        publisher.input_changed().await.unwrap();
        settle().await;
        assert!(observer.is_typing());

        // Just inside the producer idle window.
        time::advance(Duration::from_millis(1900)).await;
        settle().await;
        assert!(observer.is_typing());

        // The debounce-fired false lands at 2s, a full second before the
        // observer's TTL would have expired the last true.
        time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert!(!observer.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystrokes_rearm_the_debounce() {
        let (hub, conversation, alice, bob) = fixture();
        let observer = TypingObserver::start(hub.clone(), conversation, bob)
            .await
            .unwrap();
        settle().await;

        let publisher = TypingPublisher::new(hub.clone(), conversation, alice);
        publisher.input_changed().await.unwrap();
        settle().await;

        time::advance(Duration::from_millis(1500)).await;
        publisher.input_changed().await.unwrap();
        settle().await;

        // 2s past the first keystroke: the first debounce was re-armed.
        time::advance(Duration::from_millis(600)).await;
        settle().await;
        assert!(observer.is_typing());

        time::advance(Duration::from_millis(1500)).await;
        settle().await;
        assert!(!observer.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_announces_false_immediately() {
        let (hub, conversation, alice, bob) = fixture();
        let observer = TypingObserver::start(hub.clone(), conversation, bob)
            .await
            .unwrap();
        settle().await;

        let publisher = TypingPublisher::new(hub.clone(), conversation, alice);
        publisher.input_changed().await.unwrap();
        settle().await;
        assert!(observer.is_typing());

        publisher.submitted().await.unwrap();
        settle().await;
        assert!(!observer.is_typing());
    }
}
