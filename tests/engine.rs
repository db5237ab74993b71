//! End-to-end engine behavior against real SQLite stores and a temp-dir
//! filesystem destination.

use backup_engine::config::EngineConfig;
use backup_engine::db::connection::{create_memory_pool, DbPool};
use backup_engine::db::migrate::migrate_schema_only;
use backup_engine::destination::FilesystemDestination;
use backup_engine::engine::BackupEngine;
use backup_engine::error::EngineError;
use backup_engine::models::backup_config::{
    CreateBackupConfigRequest, DestinationSpec, Frequency, Schedule,
};
use backup_engine::models::backup_job::{BackupJob, JobStatus, TriggeredBy};
use backup_engine::models::restore_job::{CreateRestoreRequest, RestoreType};
use backup_engine::observers::{AuditEntry, AuditSink, Notification, Notifier};
use backup_engine::pipeline::checksum::digest_stream;
use backup_engine::services::retention;
use backup_engine::services::scheduler::{Clock, Scheduler};
use chrono::{DateTime, Local, TimeZone};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ── Doubles ──

#[derive(Default)]
struct RecordingAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

#[async_trait::async_trait]
impl AuditSink for RecordingAudit {
    async fn log_activity(&self, entry: AuditEntry) -> anyhow::Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send_notification(
        &self,
        _user_id: Option<&str>,
        notification: Notification,
    ) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

struct FailingAudit;

#[async_trait::async_trait]
impl AuditSink for FailingAudit {
    async fn log_activity(&self, _entry: AuditEntry) -> anyhow::Result<()> {
        anyhow::bail!("audit backend down")
    }
}

struct FailingNotifier;

#[async_trait::async_trait]
impl Notifier for FailingNotifier {
    async fn send_notification(
        &self,
        _user_id: Option<&str>,
        _notification: Notification,
    ) -> anyhow::Result<()> {
        anyhow::bail!("notification backend down")
    }
}

struct FixedClock {
    now: Mutex<DateTime<Local>>,
}

impl FixedClock {
    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()),
        })
    }

    fn set(&self, y: i32, mo: u32, d: u32, h: u32, mi: u32) {
        *self.now.lock().unwrap() = Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap()
    }
}

// ── Harness ──

struct Harness {
    engine: Arc<BackupEngine>,
    source_pool: DbPool,
    records_pool: DbPool,
    audit: Arc<RecordingAudit>,
    notifier: Arc<RecordingNotifier>,
    dir: TempDir,
}

fn engine_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: dir.join("data"),
        db_path: dir.join("data/backup-engine.db"),
        log_level: "info".into(),
        encryption_key: Some([7u8; 32]),
        scheduler_tick_secs: 60,
        retention_sweep_secs: 86_400,
        max_concurrent_jobs: 2,
        job_timeout_secs: 120,
    }
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let records_pool = create_memory_pool();
    migrate_schema_only(&records_pool).unwrap();
    let source_pool = create_memory_pool();

    let audit = Arc::new(RecordingAudit::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = BackupEngine::new(
        engine_config(dir.path()),
        records_pool.clone(),
        Arc::new(backup_engine::source::SqliteDataSource::new(source_pool.clone())),
        Arc::new(FilesystemDestination::new(dir.path().to_path_buf())),
        audit.clone(),
        notifier.clone(),
    );

    Harness {
        engine,
        source_pool,
        records_pool,
        audit,
        notifier,
        dir,
    }
}

/// A second engine over the same record store and destination, but applying
/// statements to a different (initially empty) target database.
fn target_engine(h: &Harness) -> (Arc<BackupEngine>, DbPool) {
    let target_pool = create_memory_pool();
    let engine = BackupEngine::new(
        engine_config(h.dir.path()),
        h.records_pool.clone(),
        Arc::new(backup_engine::source::SqliteDataSource::new(target_pool.clone())),
        Arc::new(FilesystemDestination::new(h.dir.path().to_path_buf())),
        Arc::new(RecordingAudit::default()),
        Arc::new(RecordingNotifier::default()),
    );
    (engine, target_pool)
}

fn seed_store(pool: &DbPool) {
    let conn = pool.get().unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE inventory_items (id INTEGER PRIMARY KEY, name TEXT, qty INTEGER, photo BLOB);
        CREATE TABLE pos_sales (id INTEGER PRIMARY KEY, total REAL, note TEXT);
        INSERT INTO inventory_items (name, qty, photo) VALUES
            ('O''Brien; widget', 3, X'DEADBEEF'),
            ('line
break', 0, NULL),
            ('plain', 7, NULL);
        INSERT INTO pos_sales (total, note) VALUES (19.5, 'cash'), (100, NULL);
        "#,
    )
    .unwrap();
}

fn count(pool: &DbPool, table: &str) -> i64 {
    let conn = pool.get().unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |r| r.get(0))
        .unwrap()
}

fn config_request(compression: bool, encryption: bool) -> CreateBackupConfigRequest {
    CreateBackupConfigRequest {
        name: "nightly".into(),
        schedule: Schedule::default(),
        included_modules: vec![],
        included_tables: vec![],
        excluded_tables: vec![],
        compression,
        encryption,
        retention_days: 30,
        destination: DestinationSpec {
            kind: "filesystem".into(),
            path: "backups".into(),
            credentials: None,
        },
        active: true,
        created_by: "admin".into(),
    }
}

async fn run_backup(h: &Harness, compression: bool, encryption: bool) -> BackupJob {
    let config = h.engine.create_config(config_request(compression, encryption)).await.unwrap();
    let job = h
        .engine
        .clone()
        .run_backup_and_wait(&config.id, TriggeredBy::Manual, Some("admin".into()))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    job
}

async fn wait_restore_terminal(
    engine: &Arc<BackupEngine>,
    id: &str,
) -> backup_engine::models::restore_job::RestoreJob {
    for _ in 0..1000 {
        if let Some(job) = engine.registry.restore_job(id).await.unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("restore job {} did not reach a terminal state", id);
}

// ── Backup properties ──

#[tokio::test]
async fn completed_backup_has_consistent_counters_and_checksum() {
    let h = harness();
    seed_store(&h.source_pool);

    let job = run_backup(&h, true, true).await;

    assert_eq!(job.total_records, 5);
    assert_eq!(job.processed_records, job.total_records);
    assert!(job.file_size > 0);
    assert!(job.metadata.compressed);
    assert!(job.metadata.encrypted);
    assert!(job.file_path.ends_with(".sql.zst.enc"));
    assert!(job.end_time.is_some());

    // Recomputing the digest of the artifact on disk matches the record
    let mut file = tokio::fs::File::open(h.dir.path().join(&job.file_path))
        .await
        .unwrap();
    let (digest, size) = digest_stream(&mut file).await.unwrap();
    assert_eq!(digest, job.checksum);
    assert_eq!(size as i64, job.file_size);

    // Exactly one notification and one audit entry for the run
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    let audits = h.audit.entries.lock().unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].action, "backup.completed");
}

#[tokio::test]
async fn backup_failure_is_recorded_not_thrown() {
    let h = harness();
    // No tables at all: the run must fail with a recorded error
    let config = h.engine.create_config(config_request(false, false)).await.unwrap();
    let job = h
        .engine
        .clone()
        .run_backup_and_wait(&config.id, TriggeredBy::Manual, None)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("empty table set"));

    let audits = h.audit.entries.lock().unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].action, "backup.failed");
}

#[tokio::test]
async fn observer_failures_never_change_job_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let records_pool = create_memory_pool();
    migrate_schema_only(&records_pool).unwrap();
    let source_pool = create_memory_pool();
    seed_store(&source_pool);

    let engine = BackupEngine::new(
        engine_config(dir.path()),
        records_pool,
        Arc::new(backup_engine::source::SqliteDataSource::new(source_pool)),
        Arc::new(FilesystemDestination::new(dir.path().to_path_buf())),
        Arc::new(FailingAudit),
        Arc::new(FailingNotifier),
    );

    let config = engine.create_config(config_request(true, false)).await.unwrap();
    let job = engine
        .clone()
        .run_backup_and_wait(&config.id, TriggeredBy::Manual, None)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn overlapping_trigger_for_same_config_is_skipped() {
    let h = harness();
    seed_store(&h.source_pool);
    let config = h.engine.create_config(config_request(false, false)).await.unwrap();

    // First run claims the in-flight marker for its config
    let first = h
        .engine
        .clone()
        .start_backup(&config.id, TriggeredBy::Schedule, None)
        .await;
    assert!(first.is_ok());
    let second = h
        .engine
        .clone()
        .start_backup(&config.id, TriggeredBy::Schedule, None)
        .await;
    // Either the first already finished (fast) or the second is skipped
    if let Err(e) = second {
        assert!(matches!(e, EngineError::Scheduling(_)));
    }
}

// ── Restore properties ──

#[tokio::test]
async fn roundtrip_restores_all_rows_into_empty_target() {
    let h = harness();
    seed_store(&h.source_pool);
    let backup = run_backup(&h, true, true).await;

    let (target, target_pool) = target_engine(&h);
    let restore_id = target
        .clone()
        .start_restore(CreateRestoreRequest {
            backup_job_id: backup.id.clone(),
            restore_type: RestoreType::Full,
            selected_tables: None,
            selected_modules: None,
            target_database: None,
            overwrite_existing: true,
            create_backup_before: false,
            user_id: "admin".into(),
        })
        .await
        .unwrap();
    let restore = wait_restore_terminal(&target, &restore_id).await;

    assert_eq!(restore.status, JobStatus::Completed, "error: {:?}", restore.error_message);
    assert_eq!(restore.progress.records_completed, 5);
    assert_eq!(restore.progress.records_completed, restore.progress.total_records);
    assert_eq!(restore.progress.tables_completed, 2);

    assert_eq!(count(&target_pool, "inventory_items"), 3);
    assert_eq!(count(&target_pool, "pos_sales"), 2);

    // Data with quotes, semicolons, newlines and blobs survives the trip
    let conn = target_pool.get().unwrap();
    let name: String = conn
        .query_row("SELECT name FROM inventory_items WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(name, "O'Brien; widget");
    let photo: Vec<u8> = conn
        .query_row("SELECT photo FROM inventory_items WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(photo, vec![0xde, 0xad, 0xbe, 0xef]);
    let name: String = conn
        .query_row("SELECT name FROM inventory_items WHERE id = 2", [], |r| r.get(0))
        .unwrap();
    assert_eq!(name, "line\nbreak");
}

#[tokio::test]
async fn restore_without_overwrite_leaves_existing_rows_untouched() {
    let h = harness();
    seed_store(&h.source_pool);
    let backup = run_backup(&h, false, false).await;

    // Mutate a row after the backup; a non-overwriting restore into the same
    // store must not clobber it.
    {
        let conn = h.source_pool.get().unwrap();
        conn.execute("UPDATE inventory_items SET qty = 99 WHERE id = 3", [])
            .unwrap();
    }

    let restore_id = h
        .engine
        .clone()
        .start_restore(CreateRestoreRequest {
            backup_job_id: backup.id.clone(),
            restore_type: RestoreType::Full,
            selected_tables: None,
            selected_modules: None,
            target_database: None,
            overwrite_existing: false,
            create_backup_before: false,
            user_id: "admin".into(),
        })
        .await
        .unwrap();
    let restore = wait_restore_terminal(&h.engine, &restore_id).await;

    assert_eq!(restore.status, JobStatus::Completed, "error: {:?}", restore.error_message);
    assert_eq!(count(&h.source_pool, "inventory_items"), 3);
    let qty: i64 = {
        let conn = h.source_pool.get().unwrap();
        conn.query_row("SELECT qty FROM inventory_items WHERE id = 3", [], |r| r.get(0))
            .unwrap()
    };
    assert_eq!(qty, 99);
}

#[tokio::test]
async fn selective_restore_applies_only_selected_tables() {
    let h = harness();
    seed_store(&h.source_pool);
    let backup = run_backup(&h, true, false).await;

    let (target, target_pool) = target_engine(&h);
    let restore_id = target
        .clone()
        .start_restore(CreateRestoreRequest {
            backup_job_id: backup.id.clone(),
            restore_type: RestoreType::Selective,
            selected_tables: Some(vec!["pos_sales".into()]),
            selected_modules: None,
            target_database: None,
            overwrite_existing: true,
            create_backup_before: false,
            user_id: "admin".into(),
        })
        .await
        .unwrap();
    let restore = wait_restore_terminal(&target, &restore_id).await;

    assert_eq!(restore.status, JobStatus::Completed, "error: {:?}", restore.error_message);
    assert_eq!(restore.progress.tables_completed, 1);
    assert_eq!(restore.progress.records_completed, 2);
    assert_eq!(restore.progress.total_records, 2);
    assert_eq!(count(&target_pool, "pos_sales"), 2);

    let conn = target_pool.get().unwrap();
    let missing = conn
        .query_row("SELECT COUNT(*) FROM inventory_items", [], |r| r.get::<_, i64>(0))
        .is_err();
    assert!(missing, "unselected table must not be created");
}

#[tokio::test]
async fn corrupted_artifact_fails_with_integrity_error_before_any_apply() {
    let h = harness();
    seed_store(&h.source_pool);
    let backup = run_backup(&h, true, true).await;

    // Flip one byte in the middle of the artifact
    let artifact = h.dir.path().join(&backup.file_path);
    let mut bytes = std::fs::read(&artifact).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    std::fs::write(&artifact, &bytes).unwrap();

    let (target, target_pool) = target_engine(&h);
    let restore_id = target
        .clone()
        .start_restore(CreateRestoreRequest {
            backup_job_id: backup.id.clone(),
            restore_type: RestoreType::Full,
            selected_tables: None,
            selected_modules: None,
            target_database: None,
            overwrite_existing: true,
            create_backup_before: false,
            user_id: "admin".into(),
        })
        .await
        .unwrap();
    let restore = wait_restore_terminal(&target, &restore_id).await;

    assert_eq!(restore.status, JobStatus::Failed);
    assert!(restore.error_message.unwrap().contains("integrity error"));

    // Nothing was applied to the target
    let conn = target_pool.get().unwrap();
    let table_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(table_count, 0);
}

#[tokio::test]
async fn restore_rejects_non_completed_backup() {
    let h = harness();
    seed_store(&h.source_pool);
    let config = h.engine.create_config(config_request(false, false)).await.unwrap();
    let pending = h
        .engine
        .registry
        .create_backup_job(&config.id, TriggeredBy::Manual, None, Default::default())
        .await
        .unwrap();

    let err = h
        .engine
        .clone()
        .start_restore(CreateRestoreRequest {
            backup_job_id: pending.id,
            restore_type: RestoreType::Full,
            selected_tables: None,
            selected_modules: None,
            target_database: None,
            overwrite_existing: false,
            create_backup_before: false,
            user_id: "admin".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
}

#[tokio::test]
async fn safety_snapshot_runs_before_restore() {
    let h = harness();
    seed_store(&h.source_pool);
    let backup = run_backup(&h, false, false).await;

    let restore_id = h
        .engine
        .clone()
        .start_restore(CreateRestoreRequest {
            backup_job_id: backup.id.clone(),
            restore_type: RestoreType::Full,
            selected_tables: None,
            selected_modules: None,
            target_database: None,
            overwrite_existing: true,
            create_backup_before: true,
            user_id: "admin".into(),
        })
        .await
        .unwrap();
    let restore = wait_restore_terminal(&h.engine, &restore_id).await;
    assert_eq!(restore.status, JobStatus::Completed, "error: {:?}", restore.error_message);

    // The original backup plus the snapshot
    let backups = h.engine.registry.backup_jobs().await.unwrap();
    assert_eq!(backups.len(), 2);
    assert!(backups.iter().all(|j| j.status == JobStatus::Completed));
}

// ── Retention ──

#[tokio::test]
async fn retention_sweep_deletes_expired_jobs_and_is_idempotent() {
    let h = harness();
    seed_store(&h.source_pool);
    let job = run_backup(&h, true, false).await;
    let artifact = h.dir.path().join(&job.file_path);
    assert!(artifact.exists());

    // Age the job past the 30-day window
    {
        let conn = h.records_pool.get().unwrap();
        conn.execute(
            "UPDATE backup_jobs SET start_time = '2020-01-01T00:00:00+00:00' WHERE id = ?",
            rusqlite::params![job.id],
        )
        .unwrap();
    }

    let first = retention::sweep(&h.engine).await;
    assert_eq!(first.jobs_deleted, 1);
    assert_eq!(first.artifacts_deleted, 1);
    assert!(!artifact.exists());
    assert!(h.engine.registry.backup_job(&job.id).await.unwrap().is_none());

    let second = retention::sweep(&h.engine).await;
    assert_eq!(second.jobs_deleted, 0);
    assert_eq!(second.artifacts_deleted, 0);
}

#[tokio::test]
async fn retention_keeps_jobs_inside_the_window() {
    let h = harness();
    seed_store(&h.source_pool);
    let job = run_backup(&h, false, false).await;

    let summary = retention::sweep(&h.engine).await;
    assert_eq!(summary.jobs_deleted, 0);
    assert!(h.engine.registry.backup_job(&job.id).await.unwrap().is_some());
}

// ── Scheduling ──

#[tokio::test]
async fn tick_fires_once_per_minute_and_rearms_after_update() {
    let h = harness();
    seed_store(&h.source_pool);

    let mut request = config_request(false, false);
    request.schedule = Schedule {
        enabled: true,
        frequency: Frequency::Daily,
        time: "02:00".into(),
        day_of_week: None,
        day_of_month: None,
    };
    let config = h.engine.create_config(request).await.unwrap();

    let clock = FixedClock::at(2026, 8, 7, 2, 0);
    let scheduler = Scheduler::with_clock(h.engine.clone(), clock.clone());

    scheduler.tick().await;
    assert_eq!(h.engine.registry.backup_jobs().await.unwrap().len(), 1);

    // Same minute, re-evaluated: zero additional jobs
    scheduler.tick().await;
    assert_eq!(h.engine.registry.backup_jobs().await.unwrap().len(), 1);

    // Off-schedule minute does not fire
    clock.set(2026, 8, 7, 2, 1);
    scheduler.tick().await;
    assert_eq!(h.engine.registry.backup_jobs().await.unwrap().len(), 1);

    // Let the first run finish so the next trigger is not skipped as an
    // overlapping run of the same config
    for _ in 0..1000 {
        let jobs = h.engine.registry.backup_jobs().await.unwrap();
        if jobs.iter().all(|j| j.status.is_terminal()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // Updating the schedule re-arms the trigger for the new time
    h.engine
        .update_config(
            &config.id,
            backup_engine::models::backup_config::UpdateBackupConfigRequest {
                schedule: Some(Schedule {
                    enabled: true,
                    frequency: Frequency::Daily,
                    time: "03:00".into(),
                    day_of_week: None,
                    day_of_month: None,
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    clock.set(2026, 8, 7, 3, 0);
    scheduler.tick().await;

    // Wait for both runs to settle before the harness tears down
    for _ in 0..1000 {
        let jobs = h.engine.registry.backup_jobs().await.unwrap();
        if jobs.len() == 2 && jobs.iter().all(|j| j.status.is_terminal()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let jobs = h.engine.registry.backup_jobs().await.unwrap();
    assert_eq!(jobs.len(), 2);
}

// ── Config validation ──

#[tokio::test]
async fn invalid_configs_are_rejected() {
    let h = harness();

    let mut bad_retention = config_request(false, false);
    bad_retention.retention_days = 0;
    assert!(matches!(
        h.engine.create_config(bad_retention).await,
        Err(EngineError::Configuration(_))
    ));

    let mut bad_schedule = config_request(false, false);
    bad_schedule.schedule = Schedule {
        enabled: true,
        frequency: Frequency::Weekly,
        time: "03:30".into(),
        day_of_week: None,
        day_of_month: None,
    };
    assert!(matches!(
        h.engine.create_config(bad_schedule).await,
        Err(EngineError::Configuration(_))
    ));

    let mut bad_destination = config_request(false, false);
    bad_destination.destination.path = String::new();
    assert!(matches!(
        h.engine.create_config(bad_destination).await,
        Err(EngineError::Configuration(_))
    ));
}

#[tokio::test]
async fn stats_reflect_job_outcomes() {
    let h = harness();
    seed_store(&h.source_pool);
    let job = run_backup(&h, true, false).await;

    let stats = h.engine.stats().await.unwrap();
    assert_eq!(stats.backup_jobs, 1);
    assert_eq!(stats.backups_completed, 1);
    assert_eq!(stats.artifact_bytes, job.file_size);
    assert_eq!(stats.restore_jobs, 0);
}
