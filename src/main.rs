use anyhow::{Context, Result};
use axum::Router;
use files_store::{
    config::AppConfig,
    db,
    errors::FilesError,
    routes,
    services::{
        FilesStore,
        jobs::{ChecksumVerifier, Migrator, OrphanCleaner},
        tasks::{Scheduler, TaskQueue, TaskRunner, WorkerPool},
    },
    storage::{BackendRegistry, memory::MemoryStore},
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Pending background tasks before producers see a full queue.
const TASK_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting files-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }
    let storage_dir = fs::canonicalize(&cfg.storage_dir)
        .with_context(|| format!("resolving storage directory {}", cfg.storage_dir))?;

    // Create the database's parent directory if needed
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // --- Initialize SQLite connection ---
    let pool = db::connect(&cfg.database_url, 5)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;
    db::run_migrations(&pool).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let db = Arc::new(pool);
    let backends = Arc::new(BackendRegistry::with_defaults(
        cfg.checksum_algorithm,
        MemoryStore::new(),
    ));
    let store = FilesStore::new(db.clone(), backends, cfg.multipart(), &storage_dir);
    ensure_default_location(&store, &cfg.default_location, &storage_dir.to_string_lossy())
        .await?;

    // --- Background jobs ---
    let mut jobs = None;
    let store = if cfg.jobs_enabled {
        let (queue, receiver) = TaskQueue::new(TASK_QUEUE_CAPACITY);
        let runner = TaskRunner::new(
            store.files.clone(),
            ChecksumVerifier::new(db.clone(), store.files.clone()),
            OrphanCleaner::new(db.clone(), store.files.clone()),
            Migrator::new(db.clone(), store.files.clone(), store.objects.clone()),
            store.multipart.clone(),
        );
        let pool = WorkerPool::spawn(runner, receiver, cfg.workers);
        let scheduler = Scheduler::new(queue.clone(), cfg.jobs()).spawn();
        tracing::info!(workers = cfg.workers, "background jobs started");
        jobs = Some((pool, scheduler));
        store.with_tasks(queue)
    } else {
        tracing::info!("background jobs disabled");
        store
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(store);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", err);
            }
        })
        .await?;

    // The router and its queue handles are gone; stopping the scheduler drops
    // the last producer so the workers drain what is queued and exit.
    if let Some((pool, scheduler)) = jobs {
        scheduler.abort();
        let _ = scheduler.await;
        pool.join().await;
    }
    tracing::info!("Shut down cleanly");

    Ok(())
}

/// Make sure a default location exists, creating `name` at `uri` on first
/// start.
async fn ensure_default_location(store: &FilesStore, name: &str, uri: &str) -> Result<()> {
    match store.objects.default_location().await {
        Ok(location) => {
            tracing::info!(name = %location.name, uri = %location.uri, "default location");
            Ok(())
        }
        Err(FilesError::NotFound { .. }) => {
            let location = match store.objects.get_location(name).await {
                Ok(_) => store.objects.set_default_location(name).await?,
                Err(FilesError::NotFound { .. }) => {
                    store.objects.create_location(name, uri, true).await?
                }
                Err(err) => return Err(err.into()),
            };
            tracing::info!(name = %location.name, uri = %location.uri, "default location created");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
