//! flowgate data plane host.
//!
//! This process:
//! - Loads tunables and services from the service file
//! - Builds the data plane context
//! - Runs the connection sweeper
//! - Logs statistics periodically
//! - Flushes connections on shutdown
//!
//! Packet I/O is attached by the embedding network stack through
//! [`flowgate_dataplane::Pipeline`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use flowgate_dataplane::conn::sweep::spawn_sweeper;
use flowgate_dataplane::{Context, ServiceFile};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod settings;

#[tokio::main]
async fn main() -> Result<()> {
    let config = settings::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLOWGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting flowgate data plane");

    let services = config.load_services()?;
    info!(
        service_file = ?config.service_file,
        service_count = services.services.len(),
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        "Configuration loaded"
    );

    let ctx = Context::init(services.tunables.clone()).context("Failed to initialize data plane")?;
    apply_services(&ctx, &services)?;

    let sweeper = spawn_sweeper(Arc::clone(&ctx), config.sweep_interval);
    if !config.stats_interval.is_zero() {
        spawn_stats_logger(Arc::clone(&ctx), config.stats_interval);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    ctx.shutdown();
    if let Err(e) = sweeper.await {
        error!(error = %e, "Sweeper task failed");
    }
    log_stats(&ctx);
    Ok(())
}

fn apply_services(ctx: &Context, file: &ServiceFile) -> Result<()> {
    for entry in &file.services {
        let config = entry.to_config().context("Invalid service entry")?;
        ctx.apply_service(&config, &entry.destinations)
            .with_context(|| format!("Failed to apply service {}", config.key))?;
    }
    Ok(())
}

fn spawn_stats_logger(ctx: Arc<Context>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if ctx.is_shut_down() {
                break;
            }
            log_stats(&ctx);
        }
    });
}

fn log_stats(ctx: &Context) {
    let snapshot = ctx.stats_snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(stats) => info!(
            connections = ctx.conns().len(),
            services = ctx.services().len(),
            stats = %stats,
            "Data plane statistics"
        ),
        Err(e) => error!(error = %e, "Failed to serialize statistics"),
    }
}
