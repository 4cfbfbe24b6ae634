//! fedcourier binary entry point

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use fedcourier::{Courier, config, federation::PublicKeyCache};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize queue, keys and verifier
/// 4. Start delivery workers and background tasks
/// 5. Serve inboxes until SIGINT/SIGTERM, then drain workers
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEDCOURIER__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "fedcourier=info,tower_http=debug".into())
    };

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting fedcourier...");

    // 2. Initialize metrics
    fedcourier::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load().context("Failed to load configuration")?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        key_id = %config.actor.key_id,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let courier = Courier::new(config.clone())
        .await
        .context("Failed to initialize fedcourier")?;
    let app = fedcourier::build_router(courier.state.clone());

    // 5. Start background tasks
    let shutdown = Arc::new(AtomicBool::new(false));
    let worker_handles: Vec<_> = courier
        .delivery_workers()
        .context("Failed to build delivery workers")?
        .into_iter()
        .map(|worker| tokio::spawn(worker.run(shutdown.clone())))
        .collect();
    tracing::info!(workers = worker_handles.len(), "Delivery workers spawned");

    let sweeper_handle = tokio::spawn(courier.retry_sweeper().run());
    let prune_handle = spawn_key_cache_prune_task(
        courier.key_cache.clone(),
        Duration::from_secs(config.key_cache.ttl_seconds),
    );

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    let shutdown_flag = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            shutdown_flag.store(true, Ordering::SeqCst);
        })
        .await?;

    // 7. Let in-flight deliveries settle; unsettled leases expire and are retried
    sweeper_handle.abort();
    prune_handle.abort();
    for handle in worker_handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Delivery worker exited abnormally");
        }
    }

    tracing::info!("fedcourier stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("SIGTERM received, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("SIGINT received, initiating graceful shutdown...");
                    }
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Ctrl-C received, initiating graceful shutdown...");
}

/// Spawn background key cache pruning task
fn spawn_key_cache_prune_task(
    key_cache: PublicKeyCache,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);

        // Consume the immediate first tick; the cache starts empty.
        interval.tick().await;

        loop {
            interval.tick().await;
            key_cache.prune_expired().await;
        }
    })
}
