//! distbuild API server

use std::path::PathBuf;

use clap::Parser;
use distbuild_api::{AppState, Backends, Workers, routes};
use distbuild_config::{LogFormat, SystemConfig, load_system_config};
use distbuild_db::{create_pool, run_migrations};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "distbuild-server")]
#[command(about = "distbuild orchestration server", long_about = None)]
struct Args {
    /// Path to the KDL system configuration
    #[arg(long, env = "DISTBUILD_CONFIG")]
    config: Option<PathBuf>,

    /// Keep all state in process memory instead of PostgreSQL
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_system_config(path)?,
        None => SystemConfig::default(),
    };
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database.url = url;
    }

    init_tracing(config.server.log_format);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let backends = if args.in_memory {
        info!("Using in-memory backends");
        Backends::memory()
    } else {
        info!("Connecting to database...");
        let pool = create_pool(&config.database.url, config.database.max_connections).await?;
        run_migrations(&pool).await?;
        info!("Database connected");
        Backends::postgres(pool, &config)
    };

    let (state, workers) = AppState::new(backends, &config, shutdown_rx.clone());
    let Workers {
        background,
        jobs,
        sweeper,
    } = workers;
    let background = tokio::spawn(async move { background.run(jobs).await });
    let sweeper = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "Starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stops the sweeper and any sign node sessions; the background worker
    // drains its queue once the last session lets go of the state.
    let _ = shutdown_tx.send(true);
    sweeper.await?;
    background.await?;
    info!("Server stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
