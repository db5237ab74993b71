use crate::engine::BackupEngine;
use crate::error::EngineError;
use crate::observers::{audit, AuditEntry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepSummary {
    pub configs_swept: usize,
    pub jobs_deleted: usize,
    pub artifacts_deleted: usize,
}

/// Delete artifacts and job records older than each config's retention
/// window. Per-file failures are logged and never abort the sweep; a job
/// whose artifact could not be deleted keeps its record so the next sweep
/// retries it.
pub async fn sweep(engine: &Arc<BackupEngine>) -> SweepSummary {
    let configs = match engine.list_configs().await {
        Ok(configs) => configs,
        Err(e) => {
            tracing::error!(error = %e, "Retention sweep could not load configs");
            return SweepSummary::default();
        }
    };

    let mut summary = SweepSummary::default();
    for config in configs {
        summary.configs_swept += 1;
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(config.retention_days)).to_rfc3339();

        let jobs = match engine
            .registry
            .backup_jobs_older_than(&config.id, &cutoff)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(config_id = %config.id, error = %e, "Retention query failed");
                continue;
            }
        };

        let mut deleted = 0usize;
        for job in jobs {
            if !job.status.is_terminal() {
                continue;
            }

            // Do not pull an artifact out from under an in-progress restore
            let lock = engine.artifact_lock(&config.id, &job.id);
            let _guard = lock.lock().await;

            if !job.file_path.is_empty() {
                match engine.destination.delete(&job.file_path).await {
                    Ok(()) => summary.artifacts_deleted += 1,
                    Err(EngineError::NotFound(_)) => {}
                    Err(e) => {
                        tracing::warn!(
                            job_id = %job.id,
                            file_path = %job.file_path,
                            error = %e,
                            "Artifact deletion failed, keeping job record for next sweep"
                        );
                        continue;
                    }
                }
            }

            match engine.registry.delete_backup_job(&job.id).await {
                Ok(_) => {
                    deleted += 1;
                    tracing::info!(job_id = %job.id, config_id = %config.id, "Expired backup deleted");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to delete expired job record");
                }
            }
        }
        summary.jobs_deleted += deleted;

        audit(
            engine.audit.as_ref(),
            AuditEntry::new(
                "retention.sweep",
                "backup",
                serde_json::json!({
                    "config_id": config.id,
                    "retention_days": config.retention_days,
                    "cutoff": cutoff,
                    "deleted": deleted,
                }),
            ),
        )
        .await;
    }

    tracing::info!(
        configs = summary.configs_swept,
        deleted = summary.jobs_deleted,
        "Retention sweep finished"
    );
    summary
}

pub fn spawn(engine: Arc<BackupEngine>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let period = std::time::Duration::from_secs(engine.config.retention_sweep_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The immediate first tick would sweep at boot; skip it
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    sweep(&engine).await;
                }
            }
        }
        tracing::info!("Retention sweeper stopped");
    })
}
