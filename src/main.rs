//! Logbill Binary Entry Point
//!
//! Runs the listeners, batch consumers, retention sweeper and HTTP server.
//! Core functionality is provided by the `logbill` library crate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser;
use logbill::{
    billing::{BillingConfigCache, BillingEngine, DayZone, UnmatchedRing},
    config::{AppConfig, ListenerConfig},
    ingest::{
        BatchConsumer, BatchProcessor, RawEvent, SharedSecret, TcpListenerTask, Transport,
        UdpListenerTask,
    },
    ratelimit::DualRateLimiter,
    registry::{Registry, backfill_tag_log_counts},
    retention::RetentionSweeper,
    server::{AppState, create_router},
    storage::StorageBuilder,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logbill - log ingestion with billing classification
#[derive(Parser, Debug)]
#[command(name = "logbill", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "LOGBILL_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "LOGBILL_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "LOGBILL_SERVER_PORT")]
    server_port: Option<u16>,

    /// SQLite database path (overrides config file)
    #[arg(long, env = "LOGBILL_DB_PATH")]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,logbill=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Logbill - log ingestion with billing classification");

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }
    config.validate()?;

    tracing::info!(
        "Server: {}:{}, Database: {}",
        config.server.bind,
        config.server.port,
        config.database.path,
    );

    // Build storage layer
    let handles = StorageBuilder::new(config.database.connection_url())
        .max_connections(config.database.max_connections)
        .build()
        .await?;
    tracing::info!("Storage initialized");

    // Warm the registries from their tables, then from historical rows
    let tags = Registry::tags(handles.registry.clone());
    let rule_names = Registry::rule_names(handles.registry.clone());
    for registry in [&tags, &rule_names] {
        registry.load().await?;
        if let Err(e) = registry.backfill().await {
            tracing::warn!(kind = ?registry.kind(), error = %e, "Registry backfill failed");
        }
    }
    if let Err(e) = backfill_tag_log_counts(&handles.registry).await {
        tracing::warn!(error = %e, "Tag log count backfill failed");
    }

    let zone = DayZone::from_offset(config.billing.fixed_offset()?);
    let cache = Arc::new(BillingConfigCache::new(
        handles.billing.clone(),
        config.billing.cache_ttl,
    ));
    let unmatched = Arc::new(UnmatchedRing::new(config.billing.unmatched_capacity));
    let engine = Arc::new(
        BillingEngine::new(handles.ingest.clone(), cache, tags, rule_names, unmatched)
            .with_zone(zone),
    );

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    if config.tcp.enabled {
        let (tx, rx) = queue_for(&config.tcp);
        let listener = TcpListenerTask::bind(
            &config.tcp.bind_addr(),
            tx,
            SharedSecret::new(&config.tcp.secret),
            cancel.clone(),
        )
        .await?;
        tracing::info!("TCP listener on: {}", listener.local_addr()?);
        tasks.spawn(listener.run());
        tasks.spawn(consumer_for(Transport::Tcp, &config.tcp, rx, &engine, &cancel).run());
    }

    let mut udp_dropped = None;
    if config.udp.enabled {
        let (tx, rx) = queue_for(&config.udp);
        let listener = UdpListenerTask::bind(
            &config.udp.bind_addr(),
            tx,
            SharedSecret::new(&config.udp.secret),
            cancel.clone(),
        )
        .await?;
        tracing::info!("UDP listener on: {}", listener.local_addr()?);
        udp_dropped = Some(listener.dropped_counter());
        tasks.spawn(listener.run());
        tasks.spawn(consumer_for(Transport::Udp, &config.udp, rx, &engine, &cancel).run());
    }

    let sweeper = RetentionSweeper::new(handles.retention.clone(), config.retention_days);
    tasks.spawn(sweeper.run(cancel.clone()));

    let app_state = AppState {
        engine,
        ingest: handles.ingest.clone(),
        billing: handles.billing.clone(),
        metrics: handles.metrics.clone(),
        limiter: Arc::new(DualRateLimiter::from_config(&config.rate_limit)),
    };
    let app = create_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    tracing::info!("Web server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // The server may also stop on its own error path; stop the rest either way
    cancel.cancel();
    tracing::info!("Waiting for listeners and consumers to drain...");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Background task failed: {}", e);
        }
    }
    if let Some(dropped) = udp_dropped {
        tracing::info!(
            dropped = dropped.load(Ordering::Relaxed),
            "UDP events dropped on full queue"
        );
    }

    tracing::info!("Shutting down storage...");
    handles.shutdown().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn queue_for(config: &ListenerConfig) -> (mpsc::Sender<RawEvent>, mpsc::Receiver<RawEvent>) {
    mpsc::channel(config.buffer_size.max(1))
}

fn consumer_for(
    transport: Transport,
    config: &ListenerConfig,
    rx: mpsc::Receiver<RawEvent>,
    engine: &Arc<BillingEngine>,
    cancel: &CancellationToken,
) -> BatchConsumer {
    let processor: Arc<dyn BatchProcessor> = engine.clone();
    BatchConsumer::new(
        transport,
        rx,
        processor,
        config.flush_size,
        config.flush_interval,
        cancel.clone(),
    )
}

/// Resolve on Ctrl+C or SIGTERM and cancel every background task.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    cancel.cancel();
}
