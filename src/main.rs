use anyhow::{Context, Result};
use axum::Router;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::StartupTask;
use services::{
    cleanup::spawn_periodic,
    ledger::sqlite::{SqliteLedger, run_migrations},
    resource_manager::FileResourceManager,
    storage::{local::LocalStorageBackend, storage_key_for},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + startup task ---
    let (cfg, task) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting resource-store with config: {:?}", cfg);

    // --- Ensure storage and staging directories exist ---
    for dir in [
        &cfg.storage_dir,
        &cfg.download_temp_folder,
        &cfg.upload_temp_folder,
    ] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir))?;
            tracing::info!("Created directory {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("invalid database url {}", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Schema ---
    let applied = run_migrations(&db).await?;
    tracing::info!("Applied {} migration statements", applied);
    if task == StartupTask::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let storage = Arc::new(LocalStorageBackend::new(
        &cfg.storage_dir,
        cfg.public_base_url.clone(),
        cfg.link_secret.clone(),
    ));
    let ledger = Arc::new(SqliteLedger::new(db.clone()));
    let manager = Arc::new(FileResourceManager::new(
        ledger,
        storage.clone(),
        cfg.resource_config(),
    ));

    // --- One-shot import ---
    if let StartupTask::Import {
        path,
        key,
        is_public,
    } = task
    {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?;
        let key = key.unwrap_or_else(|| storage_key_for(file_name, Utc::now()));
        let resource = manager.upload_local(&path, &key, is_public).await?;
        tracing::info!("Imported {} as resource {} ({})", path.display(), resource.id, key);
        println!("{}", resource.id);
        return Ok(());
    }

    // --- Background temp cleanup ---
    let sweeper = manager.clone();
    let interval = Duration::from_secs(u64::from(cfg.cleanup_interval_minutes) * 60);
    spawn_periodic(interval, move || {
        let manager = sweeper.clone();
        async move { manager.cleanup_temp_files().await }
    });

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state::AppState {
        manager,
        storage,
        db,
    });

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
    axum::serve(listener, app).await?;

    Ok(())
}
