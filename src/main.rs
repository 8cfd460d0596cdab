//! mailbridge-sync - Background mailbox sync for connected email providers
//!
//! This is the main entry point for the mailbridge-sync worker.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use mailbridge_sync::config::Config;
use mailbridge_sync::crypto::{rotate_credentials, Keyring, SecretCodec};
use mailbridge_sync::database::{ProviderStore, SqliteDatabase};
use mailbridge_sync::lease::LeaseCoordinator;
use mailbridge_sync::notify;
use mailbridge_sync::oauth::{HttpTokenExchanger, TokenRefresher};
use mailbridge_sync::sync::{HttpProviderSyncer, SyncScheduler, SyncServices};
use mailbridge_sync::telemetry::init_tracing;

/// mailbridge-sync - Background mailbox sync for connected email providers
#[derive(Parser, Debug)]
#[command(name = "mailbridge-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "MAILBRIDGE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync scheduler until interrupted (default)
    Run,

    /// Re-encrypt stored credentials under the active encryption key
    RotateKeys {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Initialize tracing/logging
    init_tracing(&config.logging)?;

    let command = args.command.unwrap_or(Command::Run);

    // The scheduler must not start on the development key by accident
    let environment = match command {
        Command::Run => config.require_environment()?,
        Command::RotateKeys { .. } => {
            if config.environment.is_none() {
                error!("No environment configured, assuming development");
            }
            config.effective_environment()
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        ?environment,
        "Starting mailbridge-sync"
    );

    // Keyring and secret codec
    let keyring = Keyring::resolve(&config.encryption, environment)?;
    info!(
        active_key_id = %keyring.active_key_id(),
        keys = keyring.len(),
        "Keyring loaded"
    );
    let codec = SecretCodec::new(Arc::new(keyring));

    // Initialize database
    let database = SqliteDatabase::new(&config.database.path).await?;
    let store: Arc<dyn ProviderStore> = Arc::new(database);
    info!(path = %config.database.path, "Database initialized");

    match command {
        Command::Run => run(config, store, codec).await,
        Command::RotateKeys { dry_run } => {
            let report = rotate_credentials(store.as_ref(), &codec, dry_run).await?;
            info!(
                scanned = report.scanned,
                rotated = report.rotated,
                failed = report.failed.len(),
                conflicted = report.conflicted.len(),
                dry_run,
                "Key rotation finished"
            );
            if !report.failed.is_empty() {
                anyhow::bail!(
                    "{} provider(s) could not be re-encrypted: {}",
                    report.failed.len(),
                    report.failed.join(", ")
                );
            }
            if !report.conflicted.is_empty() {
                anyhow::bail!(
                    "{} provider(s) changed during rotation, run rotate-keys again: {}",
                    report.conflicted.len(),
                    report.conflicted.join(", ")
                );
            }
            Ok(())
        }
    }
}

/// Wire the collaborators and run the scheduler until a shutdown signal
async fn run(
    config: Config,
    store: Arc<dyn ProviderStore>,
    codec: SecretCodec,
) -> anyhow::Result<()> {
    let leases = LeaseCoordinator::new(Arc::clone(&store), config.lease.ttl());

    let exchanger = Arc::new(HttpTokenExchanger::new(&config.oauth)?);
    let refresher = TokenRefresher::new(Arc::clone(&store), codec, exchanger);

    let syncer = HttpProviderSyncer::from_config(&config.sync_api)
        .ok_or_else(|| anyhow::anyhow!("sync_api.base_url is not configured"))?;
    info!(
        base_url = config.sync_api.base_url.as_deref().unwrap_or_default(),
        "Provider sync API configured"
    );

    let notifier: Arc<dyn notify::NotificationPublisher> =
        Arc::from(notify::from_config(&config.notifications)?);
    if config.notifications.webhook_url.is_none() {
        warn!("No notification webhook configured, sync failures are only logged");
    }

    let services = SyncServices {
        store,
        leases,
        refresher,
        syncer: Arc::new(syncer),
        notifier,
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = SyncScheduler::new(config.scheduler.clone(), services, shutdown_rx);
    let handle = tokio::spawn(scheduler.run());

    info!(
        interval_secs = config.scheduler.interval_secs,
        max_retries = config.scheduler.bounded_max_retries(),
        "Sync scheduler started"
    );

    shutdown_signal().await;
    // The scheduler may already have stopped on its own
    let _ = shutdown_tx.send(());

    if let Err(e) = handle.await {
        error!(error = %e, "Sync scheduler task failed");
    }

    info!("mailbridge-sync shutdown complete");
    Ok(())
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
