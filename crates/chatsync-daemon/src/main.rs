//! chatsync daemon - turns chat database changes into typed events

use anyhow::{Context, Result};
use chatsync_core::config::{ConfigOverrides, resolve_config};
use chatsync_daemon::listener::{self, CoordinatorSettings, PollCoordinator};
use chatsync_daemon::poller::{ChatDatabase, ChatUpdatePoller, EventType, MessagePoller};
use chatsync_daemon::sink::EventBus;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// chatsync daemon - turns chat database changes into typed events
#[derive(Parser, Debug)]
#[command(name = "chatsync-daemon")]
#[command(about = "Watch a chat database and emit new and updated messages as events")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Chat database to read from
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// File to watch for changes (repeatable; default: database and its -wal)
    #[arg(long = "watch", value_name = "PATH")]
    watch: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        chatsync_core::logging::init_with_level(tracing::Level::DEBUG);
    } else {
        chatsync_core::logging::init();
    }

    info!("chatsync daemon starting...");

    let home_dir =
        chatsync_core::home::get_home_dir().context("Failed to determine home directory")?;

    let overrides = ConfigOverrides {
        config_path: args.config.clone(),
        database: args.database.clone(),
        watch_paths: args.watch.clone(),
    };
    let config = resolve_config(&overrides, &home_dir).context("Failed to resolve configuration")?;

    info!("Chat database: {}", config.listener.database.display());

    // Event consumers live outside this daemon; log everything that is emitted.
    let bus = Arc::new(EventBus::new());
    for event_type in EventType::ALL {
        bus.subscribe(event_type, |result| {
            info!("event {}: {}", result.event_type, result.payload);
        });
    }

    let db = ChatDatabase::new(config.listener.database.clone());
    let mut coordinator = PollCoordinator::new(
        CoordinatorSettings::from_config(&config.listener),
        bus.clone(),
    );
    if config.pollers.messages {
        coordinator.register(MessagePoller::new(db.clone(), config.cache.capacity));
    }
    if config.pollers.chat_read_status {
        coordinator.register(ChatUpdatePoller::new(db, config.cache.capacity));
    }
    if coordinator.poller_count() == 0 {
        warn!("No pollers enabled; changes will be observed but produce no events");
    }

    let cancel_token = CancellationToken::new();

    // Set up signal handlers
    let cancel_for_signals = cancel_token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {
                            info!("Received SIGINT (Ctrl+C)");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM");
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    if ctrl_c.await.is_ok() {
                        info!("Received SIGINT (Ctrl+C)");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if ctrl_c.await.is_ok() {
                info!("Received Ctrl+C");
            }
        }

        cancel_for_signals.cancel();
    });

    listener::run(Arc::new(coordinator), &config.listener, cancel_token)
        .await
        .context("Chat listener failed")?;

    info!("chatsync daemon shutdown complete");
    Ok(())
}
