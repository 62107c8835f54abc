//! Actuation engine
//!
//! Runs the auto-mode scheduler against the kit database and serves
//! health and metrics endpoints.

use actuation_engine::{api, config::EngineConfig};
use anyhow::{Context, Result};
use engine_lib::{
    engine::DecisionEngine,
    health::{components, HealthRegistry},
    observability::{EngineMetrics, StructuredLogger},
    predictor::{DisabledPredictor, HttpPredictor, Predictor},
    scheduler::AutoModeScheduler,
    store::PgStore,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting actuation-engine");

    let config = EngineConfig::load()?;
    info!(
        service_name = %config.service_name,
        predictor = config.predictor_url.as_deref().unwrap_or("disabled"),
        "Engine configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::PREDICTOR).await;
    health_registry.register(components::STORE).await;

    let metrics = EngineMetrics::new();
    let logger = StructuredLogger::new(&config.service_name);

    let store = Arc::new(
        PgStore::connect(&config.database_url, config.database_max_connections)
            .await
            .context("Failed to connect to database")?,
    );
    store
        .run_migrations()
        .await
        .context("Failed to apply migrations")?;

    let predictor: Arc<dyn Predictor> = match &config.predictor_url {
        Some(url) => Arc::new(HttpPredictor::new(url, config.predictor_timeout())?),
        None => Arc::new(DisabledPredictor),
    };

    let engine = DecisionEngine::builder()
        .store(store.clone())
        .predictor(predictor)
        .cooldown_config(config.cooldown_config())
        .recorder_config(config.recorder_config())
        .settings(config.engine_settings())
        .health(health_registry.clone())
        .service_name(config.service_name.clone())
        .build()?;
    let engine = Arc::new(engine);
    logger.log_startup(ENGINE_VERSION, engine.predictor_name());

    let scheduler = Arc::new(AutoModeScheduler::new(
        engine,
        store.clone(),
        store,
        config.scheduler_config(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
