//! Herald notification delivery service.
//!
//! Loads configuration, connects to PostgreSQL, wires one HTTP adapter per
//! configured provider into the delivery engine and runs until a shutdown
//! signal arrives.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::{storage::Storage, time::RealClock};
use herald_delivery::{
    client::HttpChannelAdapter,
    store::{PostgresDeliveryStore, PostgresReminderStore},
    AppContext,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_format)?;

    info!(
        database_url = %config.database_url_masked(),
        workers_per_channel = config.workers_per_channel,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    let storage = Arc::new(Storage::new(db_pool.clone()));
    storage.health_check().await.context("database health check failed")?;
    storage.ensure_schema().await.context("failed to ensure database schema")?;
    info!("database ready");

    let endpoints = config.provider_endpoints();
    if endpoints.is_empty() {
        anyhow::bail!("no provider endpoints configured, set HERALD_<CHANNEL>_PROVIDER_URL");
    }

    let mut context = AppContext::new(
        config.to_context_config(),
        Arc::new(PostgresDeliveryStore::new(storage.clone())),
        Arc::new(PostgresReminderStore::new(storage)),
        Arc::new(RealClock::new()),
    );
    for (channel, url) in endpoints {
        let adapter = HttpChannelAdapter::new(
            channel,
            format!("http-{channel}"),
            url.clone(),
            config.to_client_config(),
        )?;
        info!(channel = %channel, endpoint = %url, "provider adapter registered");
        context = context.with_adapter(Arc::new(adapter));
    }
    context.initialize().await?;

    if let Some(secs) = config.recover_stale_sending_after_secs {
        let recovered = context.recover_stale_sending(Duration::from_secs(secs)).await?;
        if recovered > 0 {
            warn!(recovered, "closed out records left in sending by a previous run");
        }
    }

    let mut engine = context.engine().await?;
    engine.start()?;
    info!("Herald is delivering notifications");

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight deliveries");

    context.close().await;
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not shut down cleanly");
    }

    for (channel, health) in context.breaker_health().await? {
        info!(
            channel = %channel,
            state = %health.state,
            total_successes = health.total_successes,
            total_opens = health.total_opens,
            "final breaker state"
        );
    }

    db_pool.close().await;
    info!("Herald shutdown complete");
    Ok(())
}

/// Initializes tracing; `RUST_LOG` overrides the default filter.
fn init_tracing(log_format: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,herald=debug,herald_delivery=debug"))
        .context("invalid RUST_LOG filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    if log_format == "json" {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        registry.with(fmt_layer).init();
    }
    Ok(())
}

/// Creates the database connection pool, retrying while the database
/// comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
