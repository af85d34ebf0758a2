//! Bazaar server entry point.

mod observer;
mod processors;

use std::net::SocketAddr;
use std::sync::Arc;

use bazaar_api::{AppState, SlidingWindowRateLimiter, router};
use bazaar_common::{Config, KeyValueStore, Metrics, RedisStore};
use bazaar_queue::JobQueue;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
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
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "bazaar=info,bazaar_api=info,bazaar_queue=info,bazaar_common=info,tower_http=info".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting bazaar server...");

    // Load configuration
    let config = Config::load()?;

    // Connect to Redis
    info!("Connecting to Redis...");
    let redis = RedisStore::connect(&config.redis.url).await?;
    let store: Arc<dyn KeyValueStore> = Arc::new(redis.clone());

    let metrics = Arc::new(Metrics::new());
    let limiter =
        SlidingWindowRateLimiter::with_policies(store.clone(), &config.redis.prefix, config.rate_limits.clone())
            .with_metrics(metrics.clone());
    let queue = JobQueue::new(store, &config.redis.prefix, config.queue.clone());

    processors::register(&queue).await;
    let observer = observer::spawn(queue.subscribe(), metrics.clone());

    for name in processors::QUEUES {
        queue.start_processing(name).await;
    }
    info!(queues = ?processors::QUEUES, "Job workers started");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(AppState {
        queue: queue.clone(),
        limiter,
        metrics,
    })
    .layer(TraceLayer::new_for_http())
    .layer(cors);

    // Start server with graceful shutdown
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Waiting for in-flight jobs...");
    queue.stop_processing().await;
    observer.abort();

    if let Err(e) = redis.quit().await {
        error!(error = %e, "Failed to close Redis connection");
    }

    info!("Server shutdown complete");
    Ok(())
}
