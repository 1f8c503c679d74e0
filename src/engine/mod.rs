pub mod api;
pub mod assembler;
pub mod bootstrap;
pub mod config;
pub mod environment;
pub mod error;
pub mod language;
pub mod metrics;
pub mod models;
pub mod runner;
pub mod sandbox;
pub mod service;
pub mod stager;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    api::routes, config::EngineConfig, language::LanguageRegistry, metrics::MetricsRegistry,
    sandbox::ProviderFactory, service::ExecutionService,
};

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);

    let registry = Arc::new(LanguageRegistry::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let provider =
        ProviderFactory::from_config(&config).context("environment provider init failed")?;
    let service = ExecutionService::new(&config, provider, metrics.clone());
    tracing::info!(
        provider = service.provider_name(),
        languages = registry.supported().len(),
        "execution service configured"
    );

    let app: Router = routes(registry, service, metrics);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, "sandbox runner ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested, draining in-flight requests");
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
