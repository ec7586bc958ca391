//! Synthesis worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use echo_queue::{open_job_queue, QueueConfig};
use echo_storage::open_blob_store;
use echo_synthesis::{HttpSynthesizer, Synthesizer};
use echo_worker::{WorkerConfig, WorkerPool};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing()?;

    info!("Starting echo-worker");

    let config = WorkerConfig::from_env();
    config
        .pipeline
        .validate()
        .context("invalid pipeline configuration")?;
    info!("Worker config: {:?}", config);

    if let Some(addr) = metrics_addr()? {
        echo_worker::metrics::init_metrics(addr).context("failed to start metrics exporter")?;
        info!("Metrics exporter listening on {}", addr);
    }

    let queue = open_job_queue(
        &config.pipeline.queue_backend_address,
        QueueConfig::from_pipeline(&config.pipeline),
    )
    .context("failed to open job queue")?;
    queue.ping().await.context("job queue unreachable")?;

    let store = open_blob_store(&config.pipeline.blob_store_backend_address)
        .await
        .context("failed to open blob store")?;

    let synthesizer = HttpSynthesizer::from_env().context("failed to configure synthesizer")?;
    match synthesizer.health_check().await {
        Ok(true) => info!("Synthesis service is healthy"),
        Ok(false) => error!("Synthesis service reported unhealthy; continuing"),
        Err(e) => error!("Synthesis health check failed: {}; continuing", e),
    }

    let pool = Arc::new(WorkerPool::new(config, queue, store, Arc::new(synthesizer)));

    let signal_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_pool.shutdown();
    });

    pool.run().await?;

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("echo=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
    Ok(())
}

/// `METRICS_ADDR` enables the Prometheus endpoint (e.g. `0.0.0.0:9100`).
fn metrics_addr() -> anyhow::Result<Option<SocketAddr>> {
    match std::env::var("METRICS_ADDR") {
        Ok(addr) if !addr.is_empty() => Ok(Some(
            addr.parse()
                .with_context(|| format!("invalid METRICS_ADDR: {}", addr))?,
        )),
        _ => Ok(None),
    }
}
