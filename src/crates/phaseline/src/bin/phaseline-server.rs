//! phaseline server binary
//!
//! Serves the REST, WebSocket and SSE API over one task engine.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use phaseline::api::{create_router, AppState};
use phaseline::config::{ServerConfig, StorageBackend};
use phaseline::engine::CommandRunner;
use phaseline::project::{ProjectCache, ProjectRegistry, SqliteOpener};
use phaseline::storage::{MemoryStore, SqliteStore, TaskStore, UsageStore};
use phaseline::{EventBus, EventPublisher, Publisher, SessionBroadcaster, TaskEngine, WorkflowRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Loading server configuration...");
    let mut config = match ServerConfig::load() {
        Ok(cfg) => {
            tracing::info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            tracing::warn!("Failed to load configuration file: {}. Using defaults.", e);
            ServerConfig::default()
        }
    };
    config.apply_env_overrides()?;

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address()))?;

    let (store, usage): (Arc<dyn TaskStore>, Arc<dyn UsageStore>) = match config.database.backend {
        StorageBackend::Sqlite => {
            tracing::info!("Connecting to database: {}", config.database_url());
            let store = SqliteStore::connect(&config.database_url()).await?;
            store.health_check().await?;
            let store = Arc::new(store);
            (store.clone() as Arc<dyn TaskStore>, store as Arc<dyn UsageStore>)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; tasks are lost on exit");
            let store = Arc::new(MemoryStore::new());
            (store.clone() as Arc<dyn TaskStore>, store as Arc<dyn UsageStore>)
        }
    };

    let bus = Arc::new(EventBus::with_buffer_size(config.engine.event_buffer));
    let publisher: Arc<dyn Publisher> = bus.clone();
    let events = EventPublisher::new(publisher.clone());

    let mut workflows = WorkflowRegistry::with_builtins()?
        .with_default_max_iterations(config.engine.default_max_iterations);
    if let Some(dir) = &config.workflows.dir {
        workflows = workflows.with_custom_dir(dir)?;
    }
    let workflows = Arc::new(workflows);
    tracing::info!("Registered {} workflows", workflows.list().len());

    let session = Arc::new(
        SessionBroadcaster::new(events.clone(), Some(usage.clone()))
            .with_tick_interval(config.session.tick_interval()),
    );
    session.start();
    tracing::info!("Session {} started", session.session_id());

    let runner = Arc::new(CommandRunner::from_config(&config.agent));
    tracing::info!("Agent command: {}", config.agent.program);

    let engine = TaskEngine::builder(store, workflows, runner)
        .events(events)
        .usage(usage)
        .session(session.clone())
        .weights(config.weights.clone())
        .build();

    let mut state = AppState::new(engine, publisher);
    let projects = match &config.projects.registry {
        Some(path) => {
            let registry = ProjectRegistry::from_file(path)?;
            tracing::info!("Loaded {} projects from {}", registry.len(), path);
            let cache = Arc::new(ProjectCache::new(
                Arc::new(registry),
                SqliteOpener,
                config.projects.cache_capacity,
            ));
            state = state.with_projects(cache.clone());
            Some(cache)
        }
        None => None,
    };

    tracing::info!("Building API router");
    let app = create_router(state, &config.server.cors_origins);

    tracing::info!("Starting {} on {}", config.server.name, addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    session.stop();
    if let Some(cache) = projects {
        cache.close().await;
    }
    bus.close();
    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install CTRL-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received CTRL-C signal, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal, shutting down");
        }
    }
}
