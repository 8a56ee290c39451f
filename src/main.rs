//! Comet backend binary entry point

use comet_backend::{config, AppContext};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Initialize metrics
/// 3. Load configuration from file and environment
/// 4. Initialize shared state
/// 5. Spawn the enqueuer and worker fleets
/// 6. Serve health/metrics until interrupted, then drain
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("COMET__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "comet_backend=info,tower_http=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "comet_backend=info,tower_http=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Comet backend...");

    // 2. Initialize metrics
    comet_backend::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;

    // 4. Initialize shared state
    let context = AppContext::new(config).await?;

    // 5. Spawn background fleets
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut handles = context.spawn_workers(shutdown_rx.clone());
    if context.config.workers.enqueuer {
        handles.extend(context.spawn_enqueuer(shutdown_rx));
    }

    // 6. Serve health/metrics until interrupted
    let app = comet_backend::build_router();
    let addr = format!(
        "{}:{}",
        context.config.server.host, context.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(error) = result {
                tracing::error!(%error, "HTTP server exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received");
        }
    }

    // Graceful drain: stop accepting deliveries, let in-flight ones finish.
    tracing::info!("Shutting down, draining consumers...");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(error) = handle.await {
            tracing::error!(%error, "Background task panicked");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
