//! redcast-send - Background daemon for scheduled Reddit posting
//!
//! Polls the campaign queue, publishes due posts through the linked
//! credential pool, and hosts the operator control surface.

use clap::Parser;
use libredcast::reddit::client::RedditClient;
use libredcast::reddit::RedditApi;
use libredcast::server::{self, ServerState};
use libredcast::tokens::API_EXPIRY_MARGIN_SECS;
use libredcast::{
    AccountSelector, Cache, Config, Database, PostSync, RateTracker, RedcastError, Result,
    Scheduler, TokenManager,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// How long in-flight work may drain during shutdown before the process
/// exits anyway
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "redcast-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled Reddit posting")]
#[command(long_about = "\
redcast-send - Background daemon for scheduled Reddit posting

DESCRIPTION:
    redcast-send is a long-running daemon that monitors the redcast campaign
    queue and automatically publishes scheduled posts at the right time.

    It polls the database at regular intervals, checks for posts that are
    due, keeps each linked account's OAuth token fresh, respects per-account
    rate windows, retries transient upstream failures, and updates post
    status after each attempt. Published content is periodically synced back
    into local storage.

USAGE:
    # Run in foreground (logs to stderr)
    redcast-send

    # Run with custom poll interval
    redcast-send --poll-interval 30

    # Enable verbose logging
    redcast-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes current tick)

CONFIGURATION:
    Configuration file: ~/.config/redcast/config.toml
    Override with the REDCAST_CONFIG environment variable.

    [database]
    path = \"~/.local/share/redcast/redcast.db\"

    [reddit]
    client_id = \"...\"
    client_secret = \"...\"

    [scheduler]
    poll_interval_secs = 60
    requests_per_window = 60
    sync_interval_secs = 3600

    [server]
    bind = \"127.0.0.1:8787\"
    auth_token = \"...\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
    3 - Authentication error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to check for scheduled posts (default: 60)")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run once and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Process due posts once and exit (for testing)")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;

    info!("redcast-send daemon starting");

    // One orchestrator's worth of shared state, passed by handle everywhere
    let cache = Arc::new(Cache::new());
    let api: Arc<dyn RedditApi> =
        Arc::new(RedditClient::new(&config.reddit, Arc::clone(&cache))?);
    let rate = Arc::new(RateTracker::new(
        db.clone(),
        config.scheduler.requests_per_window,
    ));
    let selector = Arc::new(AccountSelector::new(db.clone(), Arc::clone(&rate)));
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        Arc::clone(&api),
        Arc::clone(&rate),
    ));
    let sync = Arc::new(PostSync::new(
        db.clone(),
        Arc::clone(&api),
        Arc::clone(&selector),
        Arc::clone(&rate),
    ));

    if cli.once {
        // Run one tick for testing and exit
        let summary = scheduler.tick().await?;
        info!(
            "redcast-send: processed {} due post(s) once, exiting",
            summary.due
        );
        return Ok(());
    }

    // Set up graceful shutdown
    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    // Startup identity check: confirm the pool can reach the upstream before
    // the first tick. Failure is logged, not fatal; the per-post path
    // reports its own errors.
    startup_identity_check(&db, &api, &selector).await;

    // Control surface
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::watch::channel(false);
    if let Some(server_config) = config.server.clone() {
        let state = ServerState {
            db: db.clone(),
            scheduler: Arc::clone(&scheduler),
            sync: Arc::clone(&sync),
            auth_token: server_config.auth_token.clone(),
        };
        let app = server::router(state);

        let listener = tokio::net::TcpListener::bind(&server_config.bind)
            .await
            .map_err(|e| {
                RedcastError::InvalidInput(format!(
                    "failed to bind control surface on {}: {}",
                    server_config.bind, e
                ))
            })?;
        info!("Control surface listening on {}", server_config.bind);

        let mut rx = server_shutdown_rx.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await;
            if let Err(e) = result {
                error!("Control surface stopped with error: {}", e);
            }
        });
    }

    let poll_interval = cli
        .poll_interval
        .unwrap_or(config.scheduler.poll_interval_secs);
    info!("Poll interval: {}s", poll_interval);

    run_daemon_loop(
        &scheduler,
        &sync,
        poll_interval,
        config.scheduler.sync_interval_secs,
        shutdown,
    )
    .await;

    // Stop accepting new work, then give in-flight work a bounded drain
    let _ = server_shutdown_tx.send(true);
    if !scheduler.wait_idle(SHUTDOWN_GRACE).await {
        warn!(
            "Tick still in flight after {:?}; forcing shutdown",
            SHUTDOWN_GRACE
        );
    }

    info!("redcast-send daemon stopped");
    Ok(())
}

/// Resolve one credential and ask the upstream who it is.
async fn startup_identity_check(
    db: &Database,
    api: &Arc<dyn RedditApi>,
    selector: &Arc<AccountSelector>,
) {
    let tokens = TokenManager::new(db.clone(), Arc::clone(api));

    let credential = match selector.acquire().await {
        Ok(Some(credential)) => credential,
        Ok(None) => {
            warn!("No usable credential in the pool; posts will fail until one is linked");
            return;
        }
        Err(e) => {
            warn!("Credential pool check failed: {}", e);
            return;
        }
    };

    let fresh = match tokens.ensure_valid(&credential, API_EXPIRY_MARGIN_SECS).await {
        Ok(fresh) => fresh,
        Err(e) => {
            warn!("Could not prepare credential {} for the identity check: {}", credential.id, e);
            return;
        }
    };

    let Some(token) = fresh.access_token.as_deref() else {
        return;
    };
    match api.me(token).await {
        Ok(identity) => {
            let name = identity
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(&fresh.username);
            info!("Upstream reachable as u/{}", name);
        }
        Err(e) => warn!("Upstream identity check failed: {}", e),
    }
}

fn init_logging(verbose: bool) {
    use libredcast::logging::{LogFormat, LoggingConfig};

    let format = std::env::var("REDCAST_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogFormat::Text);
    let level = std::env::var("REDCAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    LoggingConfig::new(format, level, verbose).init();
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| RedcastError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    // Spawn thread to handle signals
    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}

/// Main daemon loop: an immediate tick on startup, then fixed-interval
/// polling with a periodic full sync.
async fn run_daemon_loop(
    scheduler: &Scheduler,
    sync: &PostSync,
    poll_interval: u64,
    sync_interval: u64,
    shutdown: Arc<AtomicBool>,
) {
    let mut last_sync: Option<Instant> = None;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        match scheduler.tick().await {
            Ok(summary) if summary.ran && summary.due > 0 => {
                info!(
                    "Tick processed {} post(s): {} posted, {} failed",
                    summary.due, summary.posted, summary.failed
                );
            }
            Ok(_) => {}
            Err(e) => error!("Error processing posts: {}", e),
        }

        let sync_due = sync_interval > 0
            && last_sync.map_or(true, |t| t.elapsed() >= Duration::from_secs(sync_interval));
        if sync_due && !shutdown.load(Ordering::Relaxed) {
            match sync.sync_all().await {
                Ok(count) => info!("Post sync covered {} account(s)", count),
                Err(e) => warn!("Post sync failed: {}", e),
            }
            last_sync = Some(Instant::now());
        }

        // Sleep until next poll (check shutdown every second)
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}
