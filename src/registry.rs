use crate::db::connection::DbPool;
use crate::models::backup_job::{self, BackupJob, CompletionData, JobMetadata, JobStatus, TriggeredBy};
use crate::models::restore_job::{self, CreateRestoreRequest, RestoreJob, RestoreProgress};
use dashmap::DashMap;

/// Authoritative record of job state.
///
/// The durable store is the source of truth; the dashmap is a read-through
/// cache primed on startup and on every write. Jobs follow single-writer
/// discipline: only the owning runner mutates a job's record.
pub struct JobRegistry {
    db: DbPool,
    backup_cache: DashMap<String, BackupJob>,
    restore_cache: DashMap<String, RestoreJob>,
}

impl JobRegistry {
    pub fn new(db: DbPool) -> Self {
        Self {
            db,
            backup_cache: DashMap::new(),
            restore_cache: DashMap::new(),
        }
    }

    /// Prime the cache from the durable store. Jobs left pending/running by
    /// a previous process are failed first so no phantom in-flight work
    /// survives a restart.
    pub async fn rehydrate(&self) -> anyhow::Result<(usize, usize)> {
        let db = self.db.clone();
        let (backups, restores) = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            for job in backup_job::find_in_flight(&conn)? {
                if job.status == JobStatus::Pending {
                    backup_job::update_status(&conn, &job.id, JobStatus::Running)?;
                }
                backup_job::fail(&conn, &job.id, "interrupted by engine restart", 0)?;
                tracing::warn!(job_id = %job.id, "Failed interrupted backup job on startup");
            }
            for job in restore_job::find_in_flight(&conn)? {
                if job.status == JobStatus::Pending {
                    restore_job::update_status(&conn, &job.id, JobStatus::Running)?;
                }
                restore_job::fail(&conn, &job.id, "interrupted by engine restart")?;
                tracing::warn!(job_id = %job.id, "Failed interrupted restore job on startup");
            }
            let backups = backup_job::find_all(&conn)?;
            let restores = restore_job::find_all(&conn)?;
            Ok::<_, anyhow::Error>((backups, restores))
        })
        .await??;

        let counts = (backups.len(), restores.len());
        for job in backups {
            self.backup_cache.insert(job.id.clone(), job);
        }
        for job in restores {
            self.restore_cache.insert(job.id.clone(), job);
        }
        Ok(counts)
    }

    // ── Backup jobs ──

    pub async fn create_backup_job(
        &self,
        config_id: &str,
        triggered_by: TriggeredBy,
        user_id: Option<String>,
        metadata: JobMetadata,
    ) -> anyhow::Result<BackupJob> {
        let db = self.db.clone();
        let config_id = config_id.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::create(&conn, &config_id, triggered_by, user_id.as_deref(), &metadata)
        })
        .await??;
        self.backup_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn backup_job(&self, id: &str) -> anyhow::Result<Option<BackupJob>> {
        if let Some(job) = self.backup_cache.get(id) {
            return Ok(Some(job.clone()));
        }
        let db = self.db.clone();
        let id2 = id.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::find_by_id(&conn, &id2)
        })
        .await??;
        if let Some(ref j) = job {
            self.backup_cache.insert(j.id.clone(), j.clone());
        }
        Ok(job)
    }

    pub async fn backup_jobs(&self) -> anyhow::Result<Vec<BackupJob>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::find_all(&conn)
        })
        .await?
    }

    pub async fn set_backup_status(&self, id: &str, next: JobStatus) -> anyhow::Result<BackupJob> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::update_status(&conn, &id2, next)
        })
        .await??;
        self.backup_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn update_backup_counts(
        &self,
        id: &str,
        total_records: i64,
        processed_records: i64,
    ) -> anyhow::Result<()> {
        let db = self.db.clone();
        let id2 = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::update_counts(&conn, &id2, total_records, processed_records)
        })
        .await??;
        if let Some(mut job) = self.backup_cache.get_mut(id) {
            job.total_records = total_records;
            job.processed_records = processed_records;
        }
        Ok(())
    }

    pub async fn set_backup_file_path(&self, id: &str, file_path: &str) -> anyhow::Result<()> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let fp = file_path.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::set_file_path(&conn, &id2, &fp)
        })
        .await??;
        if let Some(mut job) = self.backup_cache.get_mut(id) {
            job.file_path = file_path.to_string();
        }
        Ok(())
    }

    pub async fn complete_backup(&self, id: &str, data: CompletionData) -> anyhow::Result<BackupJob> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::complete(&conn, &id2, &data)
        })
        .await??;
        self.backup_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn fail_backup(
        &self,
        id: &str,
        error_message: &str,
        duration_secs: i64,
    ) -> anyhow::Result<BackupJob> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let msg = error_message.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::fail(&conn, &id2, &msg, duration_secs)
        })
        .await??;
        self.backup_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn cancel_backup(&self, id: &str, duration_secs: i64) -> anyhow::Result<BackupJob> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::cancel(&conn, &id2, duration_secs)
        })
        .await??;
        self.backup_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn backup_jobs_older_than(
        &self,
        config_id: &str,
        cutoff: &str,
    ) -> anyhow::Result<Vec<BackupJob>> {
        let db = self.db.clone();
        let config_id = config_id.to_string();
        let cutoff = cutoff.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::find_older_than(&conn, &config_id, &cutoff)
        })
        .await?
    }

    pub async fn delete_backup_job(&self, id: &str) -> anyhow::Result<bool> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let deleted = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_job::delete(&conn, &id2)
        })
        .await??;
        self.backup_cache.remove(id);
        Ok(deleted)
    }

    // ── Restore jobs ──

    pub async fn create_restore_job(&self, request: CreateRestoreRequest) -> anyhow::Result<RestoreJob> {
        let db = self.db.clone();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            restore_job::create(&conn, &request)
        })
        .await??;
        self.restore_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn restore_job(&self, id: &str) -> anyhow::Result<Option<RestoreJob>> {
        if let Some(job) = self.restore_cache.get(id) {
            return Ok(Some(job.clone()));
        }
        let db = self.db.clone();
        let id2 = id.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            restore_job::find_by_id(&conn, &id2)
        })
        .await??;
        if let Some(ref j) = job {
            self.restore_cache.insert(j.id.clone(), j.clone());
        }
        Ok(job)
    }

    pub async fn restore_jobs(&self) -> anyhow::Result<Vec<RestoreJob>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            restore_job::find_all(&conn)
        })
        .await?
    }

    pub async fn set_restore_status(&self, id: &str, next: JobStatus) -> anyhow::Result<RestoreJob> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            restore_job::update_status(&conn, &id2, next)
        })
        .await??;
        self.restore_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn update_restore_progress(
        &self,
        id: &str,
        progress: RestoreProgress,
    ) -> anyhow::Result<()> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let p = progress.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            restore_job::update_progress(&conn, &id2, &p)
        })
        .await??;
        if let Some(mut job) = self.restore_cache.get_mut(id) {
            job.progress = progress;
        }
        Ok(())
    }

    pub async fn complete_restore(
        &self,
        id: &str,
        progress: RestoreProgress,
    ) -> anyhow::Result<RestoreJob> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            restore_job::complete(&conn, &id2, &progress)
        })
        .await??;
        self.restore_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn cancel_restore(&self, id: &str) -> anyhow::Result<RestoreJob> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            restore_job::cancel(&conn, &id2)
        })
        .await??;
        self.restore_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn fail_restore(&self, id: &str, error_message: &str) -> anyhow::Result<RestoreJob> {
        let db = self.db.clone();
        let id2 = id.to_string();
        let msg = error_message.to_string();
        let job = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            restore_job::fail(&conn, &id2, &msg)
        })
        .await??;
        self.restore_cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }
}
