use crate::config::EngineConfig;
use crate::db::connection::DbPool;
use crate::destination::Destination;
use crate::error::{EngineError, Result};
use crate::models::backup_config::{
    self, BackupConfig, CreateBackupConfigRequest, UpdateBackupConfigRequest,
};
use crate::models::backup_job::{BackupJob, JobMetadata, JobStatus, TriggeredBy};
use crate::models::restore_job::CreateRestoreRequest;
use crate::observers::{AuditSink, Notifier};
use crate::registry::JobRegistry;
use crate::services::{backup_runner, restore_runner};
use crate::source::DataSource;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The engine instance. Holds the durable record store and all collaborators,
/// handed in at construction so tests can substitute doubles; no global state.
pub struct BackupEngine {
    pub config: EngineConfig,
    pub db: DbPool,
    pub registry: JobRegistry,
    pub source: Arc<dyn DataSource>,
    pub destination: Arc<dyn Destination>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
    /// Bounds concurrently running jobs
    pub job_semaphore: Arc<tokio::sync::Semaphore>,
    /// Per-config in-flight marker; a scheduled trigger that finds its config
    /// here is skipped instead of overlapping
    running_configs: DashMap<String, String>,
    /// Cooperative cancellation, one token per in-flight job
    cancel_tokens: DashMap<String, CancellationToken>,
    /// Named locks keyed by (config_id, backup_job_id) serializing artifact
    /// access between backup, restore and retention
    artifact_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Last fired minute per config, for tick idempotence
    pub(crate) last_fired: DashMap<String, String>,
}

impl BackupEngine {
    pub fn new(
        config: EngineConfig,
        db: DbPool,
        source: Arc<dyn DataSource>,
        destination: Arc<dyn Destination>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let max_jobs = config.max_concurrent_jobs.max(1);
        Arc::new(Self {
            registry: JobRegistry::new(db.clone()),
            db,
            source,
            destination,
            audit,
            notifier,
            job_semaphore: Arc::new(tokio::sync::Semaphore::new(max_jobs)),
            running_configs: DashMap::new(),
            cancel_tokens: DashMap::new(),
            artifact_locks: DashMap::new(),
            last_fired: DashMap::new(),
            config,
        })
    }

    /// Prime caches and fail interrupted jobs. Must run before the scheduler
    /// starts accepting triggers.
    pub async fn rehydrate(&self) -> anyhow::Result<()> {
        let (backups, restores) = self.registry.rehydrate().await?;
        tracing::info!(backups, restores, "Job registry rehydrated");
        Ok(())
    }

    // ── ConfigStore ──

    pub async fn create_config(&self, data: CreateBackupConfigRequest) -> Result<BackupConfig> {
        backup_config::validate(&data.schedule, data.retention_days, &data.destination)?;
        let db = self.db.clone();
        let config = tokio::task::spawn_blocking(move || {
            let conn = db.get().map_err(anyhow::Error::from)?;
            backup_config::create(&conn, &data)
        })
        .await
        .map_err(anyhow::Error::from)??;
        tracing::info!(config_id = %config.id, name = %config.name, "Backup config created");
        Ok(config)
    }

    /// Update a config. Clearing the last-fired marker under the same map
    /// entry re-arms the schedule atomically: no tick can fire the old and
    /// new schedule for the same config.
    pub async fn update_config(
        &self,
        id: &str,
        data: UpdateBackupConfigRequest,
    ) -> Result<BackupConfig> {
        let existing = self
            .get_config(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("config {}", id)))?;

        let schedule = data.schedule.clone().unwrap_or(existing.schedule);
        let retention_days = data.retention_days.unwrap_or(existing.retention_days);
        let destination = data.destination.clone().unwrap_or(existing.destination);
        backup_config::validate(&schedule, retention_days, &destination)?;

        let db = self.db.clone();
        let id2 = id.to_string();
        let updated = tokio::task::spawn_blocking(move || {
            let conn = db.get().map_err(anyhow::Error::from)?;
            backup_config::update(&conn, &id2, &data)
        })
        .await
        .map_err(anyhow::Error::from)??
        .ok_or_else(|| EngineError::NotFound(format!("config {}", id)))?;

        self.last_fired.remove(id);
        tracing::info!(config_id = %id, "Backup config updated, schedule re-armed");
        Ok(updated)
    }

    pub async fn get_config(&self, id: &str) -> Result<Option<BackupConfig>> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let config = tokio::task::spawn_blocking(move || {
            let conn = db.get().map_err(anyhow::Error::from)?;
            backup_config::find_by_id(&conn, &id2)
        })
        .await
        .map_err(anyhow::Error::from)??;
        Ok(config)
    }

    pub async fn list_configs(&self) -> Result<Vec<BackupConfig>> {
        let db = self.db.clone();
        let configs = tokio::task::spawn_blocking(move || {
            let conn = db.get().map_err(anyhow::Error::from)?;
            backup_config::find_all(&conn)
        })
        .await
        .map_err(anyhow::Error::from)??;
        Ok(configs)
    }

    pub async fn active_configs(&self) -> Result<Vec<BackupConfig>> {
        let db = self.db.clone();
        let configs = tokio::task::spawn_blocking(move || {
            let conn = db.get().map_err(anyhow::Error::from)?;
            backup_config::find_active(&conn)
        })
        .await
        .map_err(anyhow::Error::from)??;
        Ok(configs)
    }

    pub async fn delete_config(&self, id: &str) -> Result<bool> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let deleted = tokio::task::spawn_blocking(move || {
            let conn = db.get().map_err(anyhow::Error::from)?;
            backup_config::delete(&conn, &id2)
        })
        .await
        .map_err(anyhow::Error::from)??;
        self.last_fired.remove(id);
        Ok(deleted)
    }

    // ── Job entry points ──

    /// Start a backup for a config. Returns the job id immediately; the run
    /// proceeds as an independent task. A config with a run already in
    /// flight is skipped (overlap policy).
    pub async fn start_backup(
        self: Arc<Self>,
        config_id: &str,
        triggered_by: TriggeredBy,
        user_id: Option<String>,
    ) -> Result<String> {
        let (job, config) = self.prepare_backup(config_id, triggered_by, user_id).await?;
        let job_id = job.id.clone();
        tokio::spawn(async move {
            backup_runner::execute(self, job, config).await;
        });
        Ok(job_id)
    }

    /// Run a backup for a config and wait for its terminal state. Used by
    /// the restore runner's safety snapshot.
    pub async fn run_backup_and_wait(
        self: Arc<Self>,
        config_id: &str,
        triggered_by: TriggeredBy,
        user_id: Option<String>,
    ) -> Result<BackupJob> {
        let (job, config) = self.prepare_backup(config_id, triggered_by, user_id).await?;
        let job_id = job.id.clone();
        backup_runner::execute(self.clone(), job, config).await;
        let finished = self
            .registry
            .backup_job(&job_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::NotFound(format!("backup job {}", job_id)))?;
        Ok(finished)
    }

    async fn prepare_backup(
        &self,
        config_id: &str,
        triggered_by: TriggeredBy,
        user_id: Option<String>,
    ) -> Result<(BackupJob, BackupConfig)> {
        let config = self
            .get_config(config_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("config {}", config_id)))?;

        if config.encryption && self.config.encryption_key.is_none() {
            return Err(EngineError::Configuration(
                "config enables encryption but BACKUP_ENCRYPTION_KEY is not set".into(),
            ));
        }

        let metadata = JobMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            schema: "1".to_string(),
            modules: config.included_modules.clone(),
            compressed: config.compression,
            encrypted: config.encryption,
        };

        // Overlap policy: one run per config at a time. The marker is
        // claimed before any await so concurrent triggers cannot both pass.
        match self.running_configs.entry(config_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                tracing::warn!(
                    config_id = %config_id,
                    running_job_id = %e.get(),
                    "Skipping backup trigger: previous run still in flight"
                );
                return Err(EngineError::Scheduling(format!(
                    "backup already running for config {}",
                    config_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(String::new());
            }
        }

        let job = match self
            .registry
            .create_backup_job(config_id, triggered_by, user_id, metadata)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                self.running_configs.remove(config_id);
                return Err(EngineError::Internal(e));
            }
        };
        self.running_configs
            .insert(config_id.to_string(), job.id.clone());
        self.cancel_tokens
            .insert(job.id.clone(), CancellationToken::new());
        Ok((job, config))
    }

    /// Start a restore. The referenced backup job must already be completed.
    pub async fn start_restore(self: Arc<Self>, request: CreateRestoreRequest) -> Result<String> {
        let backup = self
            .registry
            .backup_job(&request.backup_job_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("backup job {}", request.backup_job_id))
            })?;
        if backup.status != JobStatus::Completed {
            return Err(EngineError::Configuration(format!(
                "backup job {} is {}, only completed backups can be restored",
                backup.id,
                backup.status.as_str()
            )));
        }
        if backup.metadata.encrypted && self.config.encryption_key.is_none() {
            return Err(EngineError::Configuration(
                "artifact is encrypted but BACKUP_ENCRYPTION_KEY is not set".into(),
            ));
        }

        let job = self
            .registry
            .create_restore_job(request)
            .await
            .map_err(EngineError::Internal)?;
        self.cancel_tokens
            .insert(job.id.clone(), CancellationToken::new());

        let job_id = job.id.clone();
        tokio::spawn(async move {
            restore_runner::execute(self, job, backup).await;
        });
        Ok(job_id)
    }

    /// Request cooperative cancellation of an in-flight job. The owning
    /// runner observes the token at its next chunk boundary.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        match self.cancel_tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(job_id = %job_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    // ── Runner support ──

    pub(crate) fn cancel_token(&self, job_id: &str) -> CancellationToken {
        self.cancel_tokens
            .get(job_id)
            .map(|t| t.value().clone())
            .unwrap_or_default()
    }

    /// Release per-run bookkeeping once a backup reaches a terminal state.
    pub(crate) fn finish_backup_run(&self, config_id: &str, job_id: &str) {
        self.running_configs.remove(config_id);
        self.cancel_tokens.remove(job_id);
    }

    pub(crate) fn finish_restore_run(&self, job_id: &str) {
        self.cancel_tokens.remove(job_id);
    }

    pub(crate) fn artifact_lock(
        &self,
        config_id: &str,
        backup_job_id: &str,
    ) -> Arc<tokio::sync::Mutex<()>> {
        self.artifact_locks
            .entry(format!("{}:{}", config_id, backup_job_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub(crate) fn encryption_key(&self) -> Result<[u8; 32]> {
        self.config.encryption_key.ok_or_else(|| {
            EngineError::Configuration("BACKUP_ENCRYPTION_KEY is not set".into())
        })
    }

    // ── Stats ──

    pub async fn stats(&self) -> Result<EngineStats> {
        let backups = self.registry.backup_jobs().await.map_err(EngineError::Internal)?;
        let restores = self.registry.restore_jobs().await.map_err(EngineError::Internal)?;

        let mut stats = EngineStats::default();
        for job in &backups {
            stats.backup_jobs += 1;
            match job.status {
                JobStatus::Completed => {
                    stats.backups_completed += 1;
                    stats.artifact_bytes += job.file_size;
                }
                JobStatus::Failed => stats.backups_failed += 1,
                JobStatus::Cancelled => stats.backups_cancelled += 1,
                JobStatus::Pending | JobStatus::Running => stats.backups_in_flight += 1,
            }
        }
        for job in &restores {
            stats.restore_jobs += 1;
            match job.status {
                JobStatus::Completed => stats.restores_completed += 1,
                JobStatus::Failed => stats.restores_failed += 1,
                JobStatus::Cancelled => stats.restores_cancelled += 1,
                JobStatus::Pending | JobStatus::Running => stats.restores_in_flight += 1,
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStats {
    pub backup_jobs: i64,
    pub backups_completed: i64,
    pub backups_failed: i64,
    pub backups_cancelled: i64,
    pub backups_in_flight: i64,
    pub restore_jobs: i64,
    pub restores_completed: i64,
    pub restores_failed: i64,
    pub restores_cancelled: i64,
    pub restores_in_flight: i64,
    pub artifact_bytes: i64,
}
