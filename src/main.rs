use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upwatch::broadcast::LiveBroadcaster;
use upwatch::notify::Dispatcher;
use upwatch::probe::NetProber;
use upwatch::scheduler::Scheduler;
use upwatch::store::Store;
use upwatch::web::{self, AppState};

#[derive(Debug, Parser)]
#[command(name = "upwatch", version, about = "Uptime pinger with alert fan-out")]
struct Args {
    /// Working directory; relative paths below resolve against it
    #[arg(short = 'd', long = "dir", env = "UPWATCH_DIR")]
    dir: Option<PathBuf>,

    /// Targets, channels and settings document
    #[arg(short = 'c', long = "config", env = "UPWATCH_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Result snapshot written on shutdown and restored on start
    #[arg(long, env = "UPWATCH_CACHE", default_value = "cache.json")]
    cache: PathBuf,

    #[arg(long, env = "UPWATCH_LISTEN", default_value = "0.0.0.0:3000")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "upwatch=info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(dir) = &args.dir {
        std::env::set_current_dir(dir)
            .map_err(|e| anyhow::anyhow!("Failed to change directory to {}: {}", dir.display(), e))?;
    }

    // 1. Load config and restore results
    let store = Arc::new(Store::open(&args.config)?);
    match store.load_results_cache(&args.cache) {
        Ok(0) => {}
        Ok(n) => tracing::info!("Restored {} cached results from {}", n, args.cache.display()),
        Err(e) => tracing::error!("Failed to load result cache: {}", e),
    }

    // 2. Outbound plumbing
    let dispatcher = Arc::new(Dispatcher::from_settings(&store.settings()));
    let live = LiveBroadcaster::new(100);
    let (shutdown_tx, _) = broadcast::channel(1);

    // 3. Scheduler
    let scheduler = Scheduler::new(
        store.clone(),
        store.clone(),
        Arc::new(NetProber),
        dispatcher.clone(),
        Arc::new(live.clone()),
    );
    tokio::spawn(scheduler.run());

    // 4. Web
    let app = web::app(AppState {
        store: store.clone(),
        dispatcher,
        live,
        shutdown_tx: shutdown_tx.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!("Web Server listening on http://{}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    if let Err(e) = store.save_results_cache(&args.cache) {
        tracing::error!("Failed to write result cache: {}", e);
    }
    tracing::info!("Goodbye!");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, saving cache...");
    // Close all SSE connections so graceful shutdown can finish
    let _ = shutdown_tx.send(());
}
