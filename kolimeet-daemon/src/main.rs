//! Kolimeet headless sync agent
//!
//! Hosts one process-wide [`SyncSession`] and logs its signals:
//! connectivity banner transitions, cache invalidations, and unread
//! counter updates. Runs over an in-process loopback store until a hosted
//! realtime transport is wired in; `--demo` seeds a counterpart that
//! sends messages so the signal flow is visible.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use kolimeet_realtime::{
    Conversation, EntityKind, ListingRef, MemoryPresence, MemoryStore, Message, PresenceTransport,
    Profile, RecordStore, RouterConfig, SessionConfig, SyncSession, TypingObserver,
    TypingPublisher, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Command-line interface
#[derive(Parser, Debug)]
#[command(name = "kolimeet-daemon", about = "Kolimeet headless sync agent")]
struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true")]
    timestamps: bool,

    /// Config file path override
    #[arg(long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Seed a demo counterpart that generates traffic
    #[arg(long)]
    demo: bool,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );
    Ok(())
}

/// Counterpart traffic for `--demo` mode
///
/// Types for a moment before each message so the typing signal is visible
/// alongside the message flow.
async fn run_demo_peer(
    store: Arc<MemoryStore>,
    presence: Arc<MemoryPresence>,
    conversation: Conversation,
    peer: UserId,
    debounce: Duration,
) {
    let publisher = TypingPublisher::with_debounce(presence, conversation.id, peer, debounce);
    let lines = [
        "Hello! I saw your trip to Dakar next week.",
        "Could you take a 2 kg parcel? Documents only.",
        "Great, I'll bring it to the airport.",
    ];
    for line in lines {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if let Err(e) = publisher.input_changed().await {
            warn!("Demo peer typing announcement failed: {}", e);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Err(e) = publisher.submitted().await {
            warn!("Demo peer typing announcement failed: {}", e);
        }
        let message = Message::new(conversation.id, peer, line.to_string());
        if let Err(e) = store.insert_message(message).await {
            warn!("Demo peer failed to send: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli).context("Failed to initialize logging")?;

    info!("Starting Kolimeet sync agent...");

    let config = Config::load(cli.config.clone()).context("Failed to load configuration")?;
    let user = UserId(
        config
            .session
            .user_id
            .context("Configuration is missing a user id")?,
    );
    info!("Configuration loaded");
    info!("User id: {}", user);
    info!("History page size: {}", config.session.page_size);

    // Loopback backing until a hosted transport is wired in.
    let store = Arc::new(MemoryStore::new());
    let peer = UserId::new();
    let conversation = Conversation::new(user, peer, ListingRef::Trip(Uuid::new_v4()));
    store.add_conversation(conversation.clone()).await;
    store
        .add_profile(Profile {
            user_id: peer,
            display_name: "Demo counterpart".to_string(),
            avatar_url: None,
        })
        .await;

    let mut router_config = RouterConfig::new();
    if config.router.listing_delete_toast {
        router_config = router_config
            .with_delete_toast(EntityKind::Listings, "A listing you follow was removed");
    }

    let session = SyncSession::start(
        Arc::clone(&store) as Arc<dyn RecordStore>,
        SessionConfig {
            user,
            page_size: config.session.page_size,
            router: router_config,
        },
    )
    .await
    .context("Failed to start sync session")?;

    // Log the session's signals.
    let mut connectivity = session.connectivity();
    tokio::spawn(async move {
        loop {
            info!("Connectivity: {:?}", *connectivity.borrow());
            if connectivity.changed().await.is_err() {
                break;
            }
        }
    });

    let mut unread = session.unread();
    tokio::spawn(async move {
        loop {
            info!("Unread messages: {}", *unread.borrow());
            if unread.changed().await.is_err() {
                break;
            }
        }
    });

    // Observe the counterpart's typing signal with the configured window.
    let presence = Arc::new(MemoryPresence::new());
    let observer = TypingObserver::start_with_ttl(
        Arc::clone(&presence) as Arc<dyn PresenceTransport>,
        conversation.id,
        user,
        config.typing.ttl(),
    )
    .await
    .context("Failed to start typing observer")?;
    tokio::spawn(async move {
        let mut typing = observer.observe();
        loop {
            if *typing.borrow() {
                info!("Counterpart is typing...");
            }
            if typing.changed().await.is_err() {
                break;
            }
        }
    });

    let mut invalidations = session.invalidations().await;
    tokio::spawn(async move {
        while let Ok(invalidation) = invalidations.recv().await {
            info!(
                "Invalidated {:?} ({:?} on {})",
                invalidation.keys, invalidation.op, invalidation.kind
            );
            if let Some(toast) = invalidation.toast {
                info!("Toast: {}", toast);
            }
        }
    });

    if cli.demo {
        info!("Demo mode: counterpart will type and send messages");
        tokio::spawn(run_demo_peer(
            Arc::clone(&store),
            Arc::clone(&presence),
            conversation.clone(),
            peer,
            config.typing.debounce(),
        ));
    }

    info!("Sync agent running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    session.shutdown().await;
    Ok(())
}
