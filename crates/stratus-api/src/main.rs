// Stratus orchestrator server

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratus_api::{router, AppState};
use stratus_core::{Config, FsObjectStore, ObjectStore};
use stratus_engine::{CompletionHub, Dispatcher, LeaseReaper, ProgressEngine};
use stratus_storage::{PgStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;
    config.validate().context("invalid configuration")?;

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let store: Arc<dyn Store> = Arc::new(
        PgStore::connect(&database_url)
            .await
            .context("database connection failed")?,
    );

    let object_root =
        std::env::var("OBJECT_STORE_ROOT").unwrap_or_else(|_| "./data/objects".to_string());
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(object_root));

    let hub = Arc::new(CompletionHub::new());
    let engine = Arc::new(ProgressEngine::new(
        store.clone(),
        objects,
        config.clone(),
        hub,
    ));
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), config.clone()));

    // Lease reaper runs for the life of the process.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = LeaseReaper::new(store, engine.clone(), config.clone(), shutdown_rx);
    let reaper_handle = tokio::spawn(reaper.run());

    let app = router(AppState { dispatcher, engine });

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("stratus orchestrator listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("server error")?;

    shutdown_tx.send(true).ok();
    reaper_handle.await.ok();
    Ok(())
}
