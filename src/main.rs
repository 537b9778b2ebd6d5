use clap::Parser;
use renderd::{
    setup_logging, AppState, BrowserPool, Cli, Config, ContextBroker, RateLimiter,
    RenderMetrics, RenderPipeline,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();
    setup_logging(args.verbose)?;

    info!("starting renderd v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env();
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(1);
    }
    info!(
        host = %config.host,
        port = config.port,
        min_browsers = config.pool.min_browsers,
        max_browsers = config.pool.max_browsers,
        max_contexts = config.pool.max_contexts_per_browser,
        "configuration loaded"
    );

    let pool = BrowserPool::new(config.clone());
    if let Err(e) = pool.initialize().await {
        error!("browser pool failed to start: {e}");
        std::process::exit(1);
    }

    let metrics = Arc::new(RenderMetrics::new());
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let _sweep = limiter.start_eviction_task();

    let broker = ContextBroker::new(pool.clone());
    let pipeline = Arc::new(RenderPipeline::new(
        broker,
        config.clone(),
        metrics.clone(),
    ));

    let state = AppState {
        pipeline,
        pool: pool.clone(),
        limiter,
        metrics,
        config: config.clone(),
        started_at: Instant::now(),
    };

    let result = renderd::server::serve(state, shutdown_signal()).await;

    info!("draining browser pool");
    pool.shutdown().await;

    if let Err(e) = result {
        error!("server error: {e}");
        std::process::exit(1);
    }

    info!("renderd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to install SIGINT handler");
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {
            info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
    }
}
