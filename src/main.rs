use anyhow::Result;
use file_store::{
    config::AppConfig,
    services::{
        blob_store::FsBlobStore,
        file_service::FileService,
        metadata_index::{SqliteMetadataIndex, connect_pool, run_migrations},
    },
};
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + startup flags ---
    let (cfg, flags) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir).await?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).await?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    tracing::debug!("Connecting to {}", cfg.database_url);
    let db = connect_pool(&cfg.database_url, 5).await?;

    // --- Schema ---
    let statements = run_migrations(&db).await?;
    tracing::info!("Applied {} migration statements.", statements);
    if flags.migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let blobs = Arc::new(FsBlobStore::new(&cfg.storage_dir));
    let swept = blobs.sweep_temp_files().await?;
    if swept > 0 {
        tracing::info!("Removed {} leftover temp files", swept);
    }

    let service = FileService::new(blobs, Arc::new(SqliteMetadataIndex::new(db)))
        .with_retry(cfg.retry_policy())
        .with_lock_wait(cfg.lock_timeout());

    // --- Startup reconciliation ---
    let report = service.reconcile().await?;
    for id in &report.dangling_records {
        tracing::error!("record {} points at a missing blob", id);
    }
    for (id, recorded, actual) in &report.size_mismatches {
        tracing::error!(
            "record {} says {} bytes but its blob has {}",
            id,
            recorded,
            actual
        );
    }
    if !report.orphan_blobs.is_empty() {
        if flags.remove_orphans {
            let removed = service.remove_orphans(&report).await;
            tracing::info!("Removed {} orphan blobs", removed);
        } else {
            tracing::warn!(
                "{} orphan blobs found; restart with --remove-orphans to delete them",
                report.orphan_blobs.len()
            );
        }
    }

    // --- Build router ---
    let app = file_store::app(service, cfg.max_body_bytes);

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
