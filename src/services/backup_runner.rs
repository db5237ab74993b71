use crate::engine::BackupEngine;
use crate::error::{EngineError, Result};
use crate::models::backup_config::BackupConfig;
use crate::models::backup_job::{BackupJob, CompletionData, JobStatus};
use crate::observers::{audit, notify, AuditEntry, Notification, Severity};
use crate::pipeline::checksum::digest_stream;
use crate::pipeline::crypto::FrameEncryptWriter;
use crate::pipeline::sql::render_insert;
use async_compression::tokio::write::ZstdEncoder;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Rows pulled from the source per page; also the cancellation check
/// granularity during export.
const ROW_BATCH: u64 = 500;

struct Outcome {
    total_records: i64,
    file_path: String,
    file_size: i64,
    checksum: String,
}

/// Execute one backup job to a terminal state. Every failure inside the
/// pipeline is caught here, recorded on the job, and kept out of the
/// scheduler loop.
pub async fn execute(engine: Arc<BackupEngine>, job: BackupJob, config: BackupConfig) {
    let start = std::time::Instant::now();
    let job_id = job.id.clone();
    let config_id = config.id.clone();

    tracing::info!(job_id = %job_id, config_id = %config_id, "Starting backup job");

    let result = run_inner(&engine, &job, &config, start).await;
    let duration_secs = start.elapsed().as_secs() as i64;

    match result {
        Ok(outcome) => {
            let completion = CompletionData {
                total_records: outcome.total_records,
                processed_records: outcome.total_records,
                file_size: outcome.file_size,
                file_path: outcome.file_path.clone(),
                checksum: outcome.checksum.clone(),
                duration_secs,
            };
            match engine.registry.complete_backup(&job_id, completion).await {
                Ok(_) => {
                    tracing::info!(
                        job_id = %job_id,
                        config_id = %config_id,
                        records = outcome.total_records,
                        file_size = outcome.file_size,
                        duration_secs,
                        "Backup job completed"
                    );
                    report(&engine, &job, &config, ReportKind::Completed(&outcome), duration_secs)
                        .await;
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record backup completion");
                }
            }
        }
        Err(EngineError::Cancelled) => {
            if let Err(e) = engine.registry.cancel_backup(&job_id, duration_secs).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record backup cancellation");
            }
            tracing::info!(job_id = %job_id, config_id = %config_id, "Backup job cancelled");
            report(&engine, &job, &config, ReportKind::Cancelled, duration_secs).await;
        }
        Err(e) => {
            let message = e.to_string();
            if let Err(e) = engine.registry.fail_backup(&job_id, &message, duration_secs).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record backup failure");
            }
            tracing::error!(job_id = %job_id, config_id = %config_id, error = %message, "Backup job failed");
            report(&engine, &job, &config, ReportKind::Failed(&message), duration_secs).await;
        }
    }

    engine.finish_backup_run(&config_id, &job_id);
}

async fn run_inner(
    engine: &Arc<BackupEngine>,
    job: &BackupJob,
    config: &BackupConfig,
    start: std::time::Instant,
) -> Result<Outcome> {
    let _permit = engine
        .job_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| EngineError::Scheduling(e.to_string()))?;

    engine
        .registry
        .set_backup_status(&job.id, JobStatus::Running)
        .await
        .map_err(EngineError::Internal)?;

    let cancel = engine.cancel_token(&job.id);
    let lock = engine.artifact_lock(&config.id, &job.id);
    let _artifact_guard = lock.lock().await;

    let budget = std::time::Duration::from_secs(engine.config.job_timeout_secs);
    let elapsed = start.elapsed();
    let remaining = budget
        .checked_sub(elapsed)
        .ok_or_else(|| EngineError::Scheduling("job exceeded wall-clock timeout".into()))?;

    tokio::time::timeout(remaining, write_artifact(engine, job, config, &cancel))
        .await
        .map_err(|_| {
            EngineError::Scheduling(format!(
                "job exceeded wall-clock timeout of {}s",
                engine.config.job_timeout_secs
            ))
        })?
}

async fn write_artifact(
    engine: &Arc<BackupEngine>,
    job: &BackupJob,
    config: &BackupConfig,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    let available = engine.source.list_tables().await?;
    let tables = config.resolve_tables(&available);
    if tables.is_empty() {
        return Err(EngineError::Configuration(format!(
            "config {} resolves to an empty table set",
            config.id
        )));
    }

    let stamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
    // Job id suffix keeps two runs of one config in the same second from
    // colliding on the artifact path
    let run_tag = job.id.get(..8).unwrap_or(&job.id);
    let mut file_name = format!("{}_{}.sql", stamp, run_tag);
    if config.compression {
        file_name.push_str(".zst");
    }
    if config.encryption {
        file_name.push_str(".enc");
    }
    let file_path = format!(
        "{}/{}/{}",
        config.destination.path.trim_end_matches('/'),
        config.id,
        file_name
    );

    // Recorded up front so retention can clean partial artifacts of failed runs
    engine
        .registry
        .set_backup_file_path(&job.id, &file_path)
        .await
        .map_err(EngineError::Internal)?;

    // Stage order is fixed: statements → compress → encrypt → destination.
    // Encrypted bytes do not compress, so the encoder sits closest to the data.
    let mut writer: Box<dyn AsyncWrite + Send + Unpin> =
        engine.destination.open_write(&file_path).await?;
    if config.encryption {
        let key = engine.encryption_key()?;
        writer = Box::new(FrameEncryptWriter::new(writer, &key));
    }
    if config.compression {
        writer = Box::new(ZstdEncoder::new(writer));
    }

    let mut total_records: i64 = 0;
    for table in &tables {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let columns = engine.source.table_columns(table).await?;
        let schema = engine.source.schema_statement(table).await?;
        write_stmt(&mut writer, &schema).await?;

        let mut offset = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let rows = engine.source.read_rows(table, offset, ROW_BATCH).await?;
            if rows.is_empty() {
                break;
            }
            for row in &rows {
                write_stmt(&mut writer, &render_insert(table, &columns, row)).await?;
            }
            offset += rows.len() as u64;
            total_records += rows.len() as i64;
            engine
                .registry
                .update_backup_counts(&job.id, total_records, total_records)
                .await
                .map_err(EngineError::Internal)?;
        }
        tracing::debug!(job_id = %job.id, table = %table, records = offset, "Table exported");
    }

    writer.shutdown().await.map_err(map_write_err)?;
    drop(writer);

    // The checksum covers the final on-disk bytes, after compression and
    // encryption, so a restore can validate the artifact before decoding it.
    let mut reader = engine.destination.open_read(&file_path).await?;
    let (checksum, file_size) = digest_stream(&mut reader).await?;

    Ok(Outcome {
        total_records,
        file_path,
        file_size: file_size as i64,
        checksum,
    })
}

async fn write_stmt(writer: &mut (dyn AsyncWrite + Send + Unpin), stmt: &str) -> Result<()> {
    writer.write_all(stmt.as_bytes()).await.map_err(map_write_err)?;
    writer.write_all(b"\n").await.map_err(map_write_err)?;
    Ok(())
}

/// Write failures surface as io errors from any stage of the stack; the
/// transform stages tag theirs as InvalidData.
fn map_write_err(e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::InvalidData {
        EngineError::Pipeline(e.to_string())
    } else {
        EngineError::DestinationWrite(e.to_string())
    }
}

enum ReportKind<'a> {
    Completed(&'a Outcome),
    Failed(&'a str),
    Cancelled,
}

/// One notification and one audit entry per run, success or failure.
/// Failures in either are logged and never alter the job outcome.
async fn report(
    engine: &Arc<BackupEngine>,
    job: &BackupJob,
    config: &BackupConfig,
    kind: ReportKind<'_>,
    duration_secs: i64,
) {
    let (action, severity, title, message, details) = match kind {
        ReportKind::Completed(outcome) => (
            "backup.completed",
            Severity::Info,
            "Backup completed".to_string(),
            format!(
                "Backup '{}' finished: {} records, {} bytes in {}s",
                config.name, outcome.total_records, outcome.file_size, duration_secs
            ),
            serde_json::json!({
                "job_id": job.id,
                "config_id": config.id,
                "records": outcome.total_records,
                "file_size": outcome.file_size,
                "file_path": outcome.file_path,
                "checksum": outcome.checksum,
                "duration_secs": duration_secs,
            }),
        ),
        ReportKind::Failed(error) => (
            "backup.failed",
            Severity::Error,
            "Backup failed".to_string(),
            format!("Backup '{}' failed: {}", config.name, error),
            serde_json::json!({
                "job_id": job.id,
                "config_id": config.id,
                "error": error,
                "duration_secs": duration_secs,
            }),
        ),
        ReportKind::Cancelled => (
            "backup.cancelled",
            Severity::Warning,
            "Backup cancelled".to_string(),
            format!("Backup '{}' was cancelled", config.name),
            serde_json::json!({
                "job_id": job.id,
                "config_id": config.id,
                "duration_secs": duration_secs,
            }),
        ),
    };

    let priority = match severity {
        Severity::Error => "high",
        Severity::Warning => "medium",
        Severity::Info => "low",
    };

    notify(
        engine.notifier.as_ref(),
        job.user_id.as_deref(),
        Notification {
            kind: action.replace('.', "_"),
            title,
            message,
            category: "backup".into(),
            module: "backup".into(),
            priority: priority.into(),
            channels: vec!["system".into()],
        },
    )
    .await;

    audit(
        engine.audit.as_ref(),
        AuditEntry::new(action, "backup", details)
            .with_user(job.user_id.clone())
            .with_severity(severity),
    )
    .await;
}
