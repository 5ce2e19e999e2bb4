//! Notification orchestrator
//!
//! [`SyncSession`] is the one process-wide connection object: constructed
//! at application start, injected into every consumer, and owning the
//! change router, the unread counter, and the connectivity banner state.
//! Nothing in this crate reaches for a module-global handle.
//!
//! Connectivity is a three-state banner signal:
//!
//! ```text
//! Online ──loss──▶ Offline ──reconnect()──▶ Reconnecting ──▶ Online
//! ```
//!
//! Reconnection is the single resynchronization point of the protocol:
//! every active subscription is re-established and the unread aggregate is
//! re-run to correct drift accumulated while disconnected.

use crate::feed::{FeedScope, RecordStore};
use crate::messages::{MessageClient, DEFAULT_PAGE_SIZE};
use crate::router::{ChangeRouter, Invalidation, RouterConfig};
use crate::types::{ConversationId, ConversationSummary, UserId};
use crate::unread::UnreadCounter;
use crate::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Connectivity banner state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Realtime feeds are live
    Online,
    /// Transient connectivity loss; a persistent banner is shown
    Offline,
    /// Re-establishing subscriptions and resyncing
    Reconnecting,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The authenticated user
    pub user: UserId,

    /// History window size for conversation views
    pub page_size: usize,

    /// Change-router configuration
    pub router: RouterConfig,
}

impl SessionConfig {
    /// Default configuration for `user`
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            page_size: DEFAULT_PAGE_SIZE,
            router: RouterConfig::new(),
        }
    }
}

/// Process-wide, lifecycle-managed synchronization session
pub struct SyncSession {
    store: Arc<dyn RecordStore>,
    user: UserId,
    page_size: usize,
    router: Mutex<ChangeRouter>,
    unread: Arc<UnreadCounter>,
    connectivity: watch::Sender<Connectivity>,
    unread_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    /// Construct the session and bring every feed live
    pub async fn start(store: Arc<dyn RecordStore>, config: SessionConfig) -> Result<Arc<Self>> {
        let unread = Arc::new(UnreadCounter::start(Arc::clone(&store), config.user).await?);

        let mut router = ChangeRouter::new(Arc::clone(&store), config.router);
        router.start().await?;

        let (connectivity, _) = watch::channel(Connectivity::Online);
        let session = Arc::new(Self {
            store,
            user: config.user,
            page_size: config.page_size,
            router: Mutex::new(router),
            unread,
            connectivity,
            unread_task: std::sync::Mutex::new(None),
        });
        session.spawn_unread_feed().await?;

        info!("Sync session started for {}", session.user);
        Ok(session)
    }

    /// The authenticated user this session belongs to
    pub fn user(&self) -> UserId {
        self.user
    }

    /// Subscribe to the connectivity banner state
    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    /// Subscribe to the global unread counter
    pub fn unread(&self) -> watch::Receiver<u64> {
        self.unread.watch()
    }

    /// Subscribe to cache-invalidation signals
    pub async fn invalidations(&self) -> broadcast::Receiver<Invalidation> {
        self.router.lock().await.invalidations()
    }

    /// Open a client for one conversation
    pub fn open_conversation(&self, conversation: ConversationId) -> MessageClient {
        MessageClient::with_page_size(
            Arc::clone(&self.store),
            self.user,
            conversation,
            self.page_size,
        )
    }

    /// The user's conversation list with counterpart display data
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.store.fetch_conversations(self.user).await
    }

    /// Record loss of connectivity; the offline banner goes up
    pub fn connection_lost(&self) {
        warn!("Connectivity lost for session {}", self.user);
        self.connectivity.send_replace(Connectivity::Offline);
    }

    /// Re-establish every subscription and correct unread drift
    pub async fn reconnect(&self) -> Result<()> {
        self.connectivity.send_replace(Connectivity::Reconnecting);

        let outcome = async {
            self.router.lock().await.start().await?;
            self.spawn_unread_feed().await?;
            self.unread.resync().await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                info!("Session {} reconnected", self.user);
                self.connectivity.send_replace(Connectivity::Online);
                Ok(())
            }
            Err(e) => {
                // Still offline; the caller retries the reconnect.
                self.connectivity.send_replace(Connectivity::Offline);
                Err(e)
            }
        }
    }

    /// Tear down every feed and timer
    pub async fn shutdown(&self) {
        self.router.lock().await.stop();
        if let Ok(mut task) = self.unread_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        self.connectivity.send_replace(Connectivity::Offline);
        info!("Sync session for {} shut down", self.user);
    }

    async fn spawn_unread_feed(&self) -> Result<()> {
        // User-scoped so conversations the user takes no part in never
        // touch the counter; the aggregate query is scoped the same way.
        let subscription = self
            .store
            .subscribe(FeedScope::UserMessages(self.user))
            .await?;
        let unread = Arc::clone(&self.unread);
        let task = tokio::spawn(async move {
            unread.run(subscription).await;
        });
        if let Ok(mut slot) = self.unread_task.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
        Ok(())
    }
}
