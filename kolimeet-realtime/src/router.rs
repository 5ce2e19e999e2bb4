//! Realtime change router
//!
//! One subscription manager multiplexing the change feeds of every entity
//! type into cache-invalidation signals. The mapping from entity type to
//! dependent cache keys is static and hand-maintained; any change event
//! invalidates every dependent key. This is broadcast invalidation, not a
//! precise patch — correctness favors over-invalidation (extra refetches)
//! over under-invalidation (stale views).
//!
//! Delete events can additionally surface a user-visible toast per entity
//! kind, configured through [`RouterConfig`].

use crate::feed::{ChangeOp, EntityKind, FeedScope, RecordStore};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A cache key the application tags queries with
pub type CacheKey = &'static str;

/// Static dependency map: which cached queries each entity type feeds
pub fn dependent_keys(kind: EntityKind) -> &'static [CacheKey] {
    match kind {
        EntityKind::Conversations => &["conversations", "unread-count"],
        EntityKind::Messages => &["conversations", "messages", "unread-count"],
        EntityKind::Listings => &["listing-search", "listing-detail", "my-listings"],
        EntityKind::Profiles => &["profile", "conversations", "reviews"],
        EntityKind::Reviews => &["reviews", "profile"],
        EntityKind::Flags => &["moderation-flags"],
    }
}

/// A cache-invalidation signal fanned out to the application
#[derive(Debug, Clone)]
pub struct Invalidation {
    /// The entity kind that changed
    pub kind: EntityKind,

    /// The change operation observed
    pub op: ChangeOp,

    /// Every cache key to invalidate
    pub keys: Vec<CacheKey>,

    /// User-visible notice, set for configured delete events
    pub toast: Option<String>,
}

/// Router configuration
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    delete_toasts: HashMap<EntityKind, String>,
}

impl RouterConfig {
    /// Create a configuration with no toasts
    pub fn new() -> Self {
        Self::default()
    }

    /// Surface a toast when a record of `kind` is deleted
    pub fn with_delete_toast(mut self, kind: EntityKind, message: impl Into<String>) -> Self {
        self.delete_toasts.insert(kind, message.into());
        self
    }
}

/// Single subscription manager for all entity feeds
pub struct ChangeRouter {
    store: Arc<dyn RecordStore>,
    config: RouterConfig,
    tx: broadcast::Sender<Invalidation>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChangeRouter {
    /// Create a router over `store`
    pub fn new(store: Arc<dyn RecordStore>, config: RouterConfig) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            store,
            config,
            tx,
            tasks: Vec::new(),
        }
    }

    /// Subscribe to invalidation signals
    pub fn invalidations(&self) -> broadcast::Receiver<Invalidation> {
        self.tx.subscribe()
    }

    /// Open one change feed per entity kind and start routing
    ///
    /// Idempotent across [`stop`](Self::stop)/`start` cycles; reconnection
    /// re-invokes this to re-establish every subscription.
    pub async fn start(&mut self) -> Result<()> {
        self.stop();
        for kind in EntityKind::ALL {
            let mut subscription = self.store.subscribe(FeedScope::Entity(kind)).await?;
            let tx = self.tx.clone();
            let toast = self.config.delete_toasts.get(&kind).cloned();

            self.tasks.push(tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    let invalidation = Invalidation {
                        kind,
                        op: event.op,
                        keys: dependent_keys(kind).to_vec(),
                        toast: match event.op {
                            ChangeOp::Delete => toast.clone(),
                            _ => None,
                        },
                    };
                    debug!(
                        "Invalidating {:?} after {:?} on {}",
                        invalidation.keys, event.op, kind
                    );
                    // No receivers is fine; signals are fire-and-forget.
                    let _ = tx.send(invalidation);
                }
                debug!("Change feed for {} closed", kind);
            }));
        }
        info!("Change router started ({} feeds)", self.tasks.len());
        Ok(())
    }

    /// Tear down every feed task and release the subscriptions
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChangeRouter {
    fn drop(&mut self) {
        self.stop();
    }
}
