use anyhow::{Context, Result};
use photoid_service::{
    cleanup_worker::{spawn_periodic_sweep, CleanupQueue},
    photo_handlers, HttpBackgroundRemover, HttpFaceDetector, RateLimiter, RequestOrchestrator,
    ServiceConfig, TempFileManager,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// How often idle rate-limit entries are dropped
const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Check if we should enable tokio-console
    if std::env::var("TOKIO_CONSOLE").is_ok() {
        console_subscriber::init();
        info!("tokio-console enabled on port 6669");
    } else {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,photoid_service=debug"));
        fmt().with_env_filter(env_filter).with_target(true).init();
    }

    let config = ServiceConfig::from_env();

    // Create task tracker and cancellation token for coordinated shutdown
    let cancellation_token = CancellationToken::new();
    let task_tracker = TaskTracker::new();

    let temp_files = Arc::new(TempFileManager::new(config.temp_dir.clone()));
    temp_files
        .ensure_dir()
        .await
        .with_context(|| format!("Failed to create temp dir {}", config.temp_dir.display()))?;

    // Anything left over from a previous crash
    let startup_sweep = temp_files.sweep(config.cleanup_max_age).await;
    info!(
        "Startup sweep removed {} stale files from {}",
        startup_sweep.removed,
        config.temp_dir.display()
    );

    let cleanup_queue = CleanupQueue::spawn(
        temp_files.clone(),
        config.cleanup_queue_size,
        cancellation_token.clone(),
        &task_tracker,
    );
    spawn_periodic_sweep(
        cleanup_queue.clone(),
        config.cleanup_interval,
        config.cleanup_max_age,
        cancellation_token.clone(),
        &task_tracker,
    );

    let detector_url = config
        .face_detector_url
        .clone()
        .context("FACE_DETECTOR_URL must be set")?;
    let remover_url = config
        .background_remover_url
        .clone()
        .context("BACKGROUND_REMOVER_URL must be set")?;

    let detector = HttpFaceDetector::new(detector_url.clone(), config.upstream_timeout)
        .map_err(|e| anyhow::anyhow!("Failed to create face detector client: {e}"))?;
    let remover = HttpBackgroundRemover::new(remover_url.clone(), config.upstream_timeout)
        .map_err(|e| anyhow::anyhow!("Failed to create background remover client: {e}"))?;

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));

    // Drop rate-limit entries for clients that have gone quiet
    let prune_limiter = rate_limiter.clone();
    let prune_token = cancellation_token.clone();
    task_tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = prune_token.cancelled() => {
                    info!("Rate limit pruner cancelled, exiting");
                    break;
                }
                _ = tokio::time::sleep(RATE_LIMIT_PRUNE_INTERVAL) => {
                    let removed = prune_limiter.prune_idle(Instant::now());
                    if removed > 0 {
                        info!("Pruned {} idle rate limit entries", removed);
                    }
                }
            }
        }
    });

    let orchestrator = Arc::new(RequestOrchestrator::new(
        &config,
        rate_limiter,
        temp_files,
        cleanup_queue,
        Arc::new(detector),
        Arc::new(remover),
    ));

    let app = photo_handlers::router(orchestrator);

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid BIND_ADDR {}", config.bind_addr))?;

    println!("\nPhotoID preview service starting");
    println!("HTTP: http://{addr}");
    println!("\nConfiguration:");
    println!("- Max file size: {} bytes", config.max_file_size);
    println!("- Temp dir: {}", config.temp_dir.display());
    println!(
        "- Cleanup: max age {}s, probability {}, interval {}s",
        config.cleanup_max_age.as_secs(),
        config.cleanup_probability,
        config.cleanup_interval.as_secs()
    );
    println!(
        "- Rate limits: {}/hour, {}/day{}",
        config.rate_limit.hourly_limit,
        config.rate_limit.daily_limit,
        if config.rate_limit.bypass {
            " (bypassed, TEST_MODE)"
        } else {
            ""
        }
    );
    println!("- Face detector: {detector_url}");
    println!("- Background remover: {remover_url}");
    println!("- Upstream timeout: {}s", config.upstream_timeout.as_secs());

    // Handle shutdown signal
    let shutdown_token = cancellation_token.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutdown signal received, stopping services...");
        shutdown_token.cancel();
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run server with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("Server stopped, shutting down services...");

    // Signal all services to shutdown
    cancellation_token.cancel();

    // Close the task tracker to prevent new tasks from being spawned
    task_tracker.close();

    info!("Waiting for background tasks...");
    match tokio::time::timeout(Duration::from_secs(30), task_tracker.wait()).await {
        Ok(()) => info!("All background tasks completed successfully"),
        Err(_) => {
            error!("Timeout waiting for background tasks to complete");
            std::process::exit(1);
        }
    }

    info!("Clean shutdown complete");

    Ok(())
}
