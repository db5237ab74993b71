use backup_engine::config::EngineConfig;
use backup_engine::db::connection::create_pool;
use backup_engine::db::migrate::migrate;
use backup_engine::destination::FilesystemDestination;
use backup_engine::engine::BackupEngine;
use backup_engine::observers::{TracingAuditSink, TracingNotifier};
use backup_engine::services::db_backup::backup_record_store;
use backup_engine::services::retention;
use backup_engine::services::scheduler::Scheduler;
use backup_engine::source::SqliteDataSource;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = EngineConfig::from_env()?;
    tracing::info!("Starting backup engine");

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    // Initialize the record store
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path);
    migrate(&pool, &config.data_dir)?;

    // Daily record store self-backup
    if let Err(e) = backup_record_store(&db_path, &config.data_dir) {
        tracing::warn!("Failed to back up record store: {}", e);
    }

    // The daemon exports the application database living next to the engine
    // store; override with STORE_DB_PATH.
    let store_db_path = std::env::var("STORE_DB_PATH")
        .unwrap_or_else(|_| config.data_dir.join("store.db").to_string_lossy().to_string());
    let source_pool = create_pool(&store_db_path);
    let source = Arc::new(SqliteDataSource::new(source_pool));

    let destination = Arc::new(FilesystemDestination::new(config.data_dir.join("artifacts")));

    let engine = BackupEngine::new(
        config,
        pool,
        source,
        destination,
        Arc::new(TracingAuditSink),
        Arc::new(TracingNotifier),
    );

    // Rehydrate before accepting triggers
    engine.rehydrate().await?;

    // Periodic loops
    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(engine.clone()).spawn(cancel.clone());
    let sweeper = retention::spawn(engine.clone(), cancel.clone());

    shutdown_signal().await;

    // Cleanup
    tracing::info!("Shutting down...");
    cancel.cancel();
    let _ = scheduler.await;
    let _ = sweeper.await;

    // Close the record store
    backup_engine::db::connection::close_pool(&engine.db);
    tracing::info!("Engine stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
