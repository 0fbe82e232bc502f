use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use metrics_dashboard::config::Cli;
use metrics_dashboard::sampler::SystemSampler;
use metrics_dashboard::{server, AppState, MetricsEngine, SystemClock};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,metrics_dashboard=debug")),
        )
        .init();

    // ── 1. Configuration ─────────────────────────────────────────
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // ── 2. Engine + system sampler ───────────────────────────────
    let engine = Arc::new(MetricsEngine::start(config, Arc::new(SystemClock)).await?);
    let sampler = tokio::spawn(SystemSampler::new().run(
        engine.clone(),
        engine.config().system_sample_interval(),
        engine.shutdown_signal(),
    ));

    // ── 3. Build Axum router ─────────────────────────────────────
    let state = Arc::new(AppState {
        metrics: engine.clone(),
    });
    let app = server::create_router(state);

    // ── 4. Bind & serve until Ctrl-C ─────────────────────────────
    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!(addr = %cli.listen, "dashboard JSON at /metrics/json, SSE at /metrics/stream");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    // ── 5. Flush outstanding buckets before the backend closes ───
    engine.shutdown().await?;
    let _ = sampler.await;
    Ok(())
}
