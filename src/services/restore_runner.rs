use crate::engine::BackupEngine;
use crate::error::{EngineError, Result};
use crate::models::backup_job::{BackupJob, JobStatus, TriggeredBy};
use crate::models::restore_job::{RestoreJob, RestoreProgress, RestoreType};
use crate::observers::{audit, notify, AuditEntry, Notification, Severity};
use crate::pipeline::checksum::digest_stream;
use crate::pipeline::crypto::FrameDecryptReader;
use crate::pipeline::sql::{quote_ident, table_of_schema_statement, StatementSplitter};
use crate::source::module_of;
use async_compression::tokio::bufread::ZstdDecoder;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Progress rows are persisted at most once per this many statements so a
/// large restore does not hammer the record store.
const PROGRESS_PERSIST_EVERY: i64 = 250;

/// Execute one restore job to a terminal state. Mirrors the backup runner's
/// boundary: every failure is caught, recorded, and isolated.
pub async fn execute(engine: Arc<BackupEngine>, job: RestoreJob, backup: BackupJob) {
    let start = std::time::Instant::now();
    let job_id = job.id.clone();

    tracing::info!(
        job_id = %job_id,
        backup_job_id = %backup.id,
        restore_type = job.restore_type.as_str(),
        "Starting restore job"
    );

    let result = run_inner(&engine, &job, &backup, start).await;
    let duration_secs = start.elapsed().as_secs() as i64;

    match result {
        Ok(progress) => {
            match engine.registry.complete_restore(&job_id, progress.clone()).await {
                Ok(_) => {
                    tracing::info!(
                        job_id = %job_id,
                        records = progress.records_completed,
                        tables = progress.tables_completed,
                        duration_secs,
                        "Restore job completed"
                    );
                    report(&engine, &job, &backup, ReportKind::Completed(&progress), duration_secs)
                        .await;
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record restore completion");
                }
            }
        }
        Err(EngineError::Cancelled) => {
            if let Err(e) = engine.registry.cancel_restore(&job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record restore cancellation");
            }
            tracing::info!(job_id = %job_id, "Restore job cancelled");
            report(&engine, &job, &backup, ReportKind::Cancelled, duration_secs).await;
        }
        Err(e) => {
            let message = e.to_string();
            if let Err(e) = engine.registry.fail_restore(&job_id, &message).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record restore failure");
            }
            tracing::error!(job_id = %job_id, error = %message, "Restore job failed");
            report(&engine, &job, &backup, ReportKind::Failed(&message), duration_secs).await;
        }
    }

    engine.finish_restore_run(&job_id);
}

async fn run_inner(
    engine: &Arc<BackupEngine>,
    job: &RestoreJob,
    backup: &BackupJob,
    start: std::time::Instant,
) -> Result<RestoreProgress> {
    engine
        .registry
        .set_restore_status(&job.id, JobStatus::Running)
        .await
        .map_err(EngineError::Internal)?;

    if backup.status != JobStatus::Completed {
        return Err(EngineError::Configuration(format!(
            "backup job {} is {}, only completed backups can be restored",
            backup.id,
            backup.status.as_str()
        )));
    }

    // Safety snapshot before touching the target, independent of the
    // restore's own selection.
    if job.create_backup_before {
        let snapshot = engine
            .clone()
            .run_backup_and_wait(
                &backup.config_id,
                TriggeredBy::Api,
                Some(job.user_id.clone()),
            )
            .await?;
        if snapshot.status != JobStatus::Completed {
            return Err(EngineError::Configuration(format!(
                "safety backup {} did not complete: {}",
                snapshot.id,
                snapshot.error_message.unwrap_or_else(|| snapshot.status.as_str().into())
            )));
        }
        tracing::info!(job_id = %job.id, snapshot_job_id = %snapshot.id, "Safety backup completed");
    }

    // Acquired after the safety snapshot so the snapshot's own permit never
    // deadlocks against this one when the pool is size 1
    let _permit = engine
        .job_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| EngineError::Scheduling(e.to_string()))?;

    // Serialize against any backup or sweep touching the same artifact
    let lock = engine.artifact_lock(&backup.config_id, &backup.id);
    let _artifact_guard = lock.lock().await;

    let cancel = engine.cancel_token(&job.id);
    let budget = std::time::Duration::from_secs(engine.config.job_timeout_secs);
    let remaining = budget
        .checked_sub(start.elapsed())
        .ok_or_else(|| EngineError::Scheduling("job exceeded wall-clock timeout".into()))?;

    tokio::time::timeout(remaining, apply_artifact(engine, job, backup, &cancel))
        .await
        .map_err(|_| {
            EngineError::Scheduling(format!(
                "job exceeded wall-clock timeout of {}s",
                engine.config.job_timeout_secs
            ))
        })?
}

async fn apply_artifact(
    engine: &Arc<BackupEngine>,
    job: &RestoreJob,
    backup: &BackupJob,
    cancel: &CancellationToken,
) -> Result<RestoreProgress> {
    // Integrity gate: recompute the digest of the stored bytes and compare
    // before any statement is applied.
    let mut reader = engine.destination.open_read(&backup.file_path).await?;
    let (actual, _) = digest_stream(&mut reader).await?;
    if actual != backup.checksum {
        return Err(EngineError::Integrity {
            expected: backup.checksum.clone(),
            actual,
        });
    }
    drop(reader);

    // Inverse pipeline: destination → decrypt → decompress → statements
    let mut reader: Box<dyn AsyncRead + Send + Unpin> =
        engine.destination.open_read(&backup.file_path).await?;
    if backup.metadata.encrypted {
        let key = engine.encryption_key()?;
        reader = Box::new(FrameDecryptReader::new(reader, &key));
    }
    if backup.metadata.compressed {
        reader = Box::new(ZstdDecoder::new(BufReader::new(reader)));
    }

    let mut state = ApplyState {
        progress: RestoreProgress {
            total_records: backup.total_records,
            ..Default::default()
        },
        current_included: false,
        table_open: false,
        since_persist: 0,
    };

    let mut splitter = StatementSplitter::new();
    let mut buf = vec![0u8; 8192];
    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let n = reader.read(&mut buf).await.map_err(map_read_err)?;
        if n == 0 {
            break;
        }
        for stmt in splitter.push(&buf[..n])? {
            apply_statement(engine, job, &mut state, &stmt).await?;
        }
    }
    if let Some(stmt) = splitter.finish()? {
        apply_statement(engine, job, &mut state, &stmt).await?;
    }

    // Close out the last table
    if state.table_open && state.current_included {
        state.progress.tables_completed += 1;
    }
    if job.restore_type != RestoreType::Full {
        // Selection pruned the stream; totals reflect what was replayed
        state.progress.total_records = state.progress.records_completed;
    }

    Ok(state.progress)
}

struct ApplyState {
    progress: RestoreProgress,
    current_included: bool,
    table_open: bool,
    since_persist: i64,
}

fn table_selected(job: &RestoreJob, table: &str) -> bool {
    if job.restore_type == RestoreType::Full {
        return true;
    }
    let by_table = job
        .selected_tables
        .as_ref()
        .map(|tables| tables.iter().any(|t| t == table))
        .unwrap_or(false);
    let by_module = job
        .selected_modules
        .as_ref()
        .map(|modules| modules.contains(&module_of(table)))
        .unwrap_or(false);
    by_table || by_module
}

async fn apply_statement(
    engine: &Arc<BackupEngine>,
    job: &RestoreJob,
    state: &mut ApplyState,
    stmt: &str,
) -> Result<()> {
    if let Some(table) = table_of_schema_statement(stmt) {
        if state.table_open && state.current_included {
            state.progress.tables_completed += 1;
        }
        state.table_open = true;
        state.current_included = table_selected(job, &table);
        if !state.current_included {
            tracing::debug!(job_id = %job.id, table = %table, "Table not selected, skipping");
            return Ok(());
        }

        state.progress.current_table = table.clone();
        state.progress.total_tables += 1;

        if job.overwrite_existing {
            engine
                .source
                .execute_statement(&format!("DROP TABLE IF EXISTS {};", quote_ident(&table)))
                .await?;
        }
        execute_tolerant(engine, job, stmt).await?;
        persist_progress(engine, job, state, true).await;
        return Ok(());
    }

    if !state.current_included {
        return Ok(());
    }
    execute_tolerant(engine, job, stmt).await?;
    state.progress.records_completed += 1;
    persist_progress(engine, job, state, false).await;
    Ok(())
}

/// Apply one statement under the conflict policy: with overwrite disabled an
/// "already exists" failure is skipped, anything else is fatal.
async fn execute_tolerant(
    engine: &Arc<BackupEngine>,
    job: &RestoreJob,
    stmt: &str,
) -> Result<()> {
    match engine.source.execute_statement(stmt).await {
        Ok(()) => Ok(()),
        Err(e) if !job.overwrite_existing && e.is_already_exists() => {
            tracing::debug!(job_id = %job.id, "Skipping statement, target already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn persist_progress(
    engine: &Arc<BackupEngine>,
    job: &RestoreJob,
    state: &mut ApplyState,
    table_boundary: bool,
) {
    state.since_persist += 1;
    if !table_boundary && state.since_persist < PROGRESS_PERSIST_EVERY {
        return;
    }
    state.since_persist = 0;
    if let Err(e) = engine
        .registry
        .update_restore_progress(&job.id, state.progress.clone())
        .await
    {
        tracing::warn!(job_id = %job.id, error = %e, "Failed to persist restore progress");
    }
}

fn map_read_err(e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::InvalidData {
        EngineError::Pipeline(e.to_string())
    } else {
        EngineError::DestinationWrite(format!("artifact read failed: {}", e))
    }
}

enum ReportKind<'a> {
    Completed(&'a RestoreProgress),
    Failed(&'a str),
    Cancelled,
}

/// One notification and one audit entry per run, success or failure.
async fn report(
    engine: &Arc<BackupEngine>,
    job: &RestoreJob,
    backup: &BackupJob,
    kind: ReportKind<'_>,
    duration_secs: i64,
) {
    let (action, severity, title, message, details) = match kind {
        ReportKind::Completed(progress) => (
            "restore.completed",
            Severity::Info,
            "Restore completed".to_string(),
            format!(
                "Restore of backup {} finished: {} records across {} tables in {}s",
                backup.id, progress.records_completed, progress.tables_completed, duration_secs
            ),
            serde_json::json!({
                "job_id": job.id,
                "backup_job_id": backup.id,
                "records": progress.records_completed,
                "tables": progress.tables_completed,
                "duration_secs": duration_secs,
            }),
        ),
        ReportKind::Failed(error) => (
            "restore.failed",
            Severity::Error,
            "Restore failed".to_string(),
            format!("Restore of backup {} failed: {}", backup.id, error),
            serde_json::json!({
                "job_id": job.id,
                "backup_job_id": backup.id,
                "error": error,
                "duration_secs": duration_secs,
            }),
        ),
        ReportKind::Cancelled => (
            "restore.cancelled",
            Severity::Warning,
            "Restore cancelled".to_string(),
            format!("Restore of backup {} was cancelled", backup.id),
            serde_json::json!({
                "job_id": job.id,
                "backup_job_id": backup.id,
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
        Some(job.user_id.as_str()),
        Notification {
            kind: action.replace('.', "_"),
            title,
            message,
            category: "backup".into(),
            module: "restore".into(),
            priority: priority.into(),
            channels: vec!["system".into()],
        },
    )
    .await;

    audit(
        engine.audit.as_ref(),
        AuditEntry::new(action, "restore", details)
            .with_user(Some(job.user_id.clone()))
            .with_severity(severity),
    )
    .await;
}
