use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Job state machine ──

/// Shared lifecycle for backup and restore jobs.
///
/// pending → running → {completed, failed, cancelled}. Terminal states are
/// final; transitions never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Schedule,
    Manual,
    Api,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Schedule => "schedule",
            TriggeredBy::Manual => "manual",
            TriggeredBy::Api => "api",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "schedule" => TriggeredBy::Schedule,
            "api" => TriggeredBy::Api,
            _ => TriggeredBy::Manual,
        }
    }
}

/// Artifact provenance recorded on every backup job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetadata {
    pub version: String,
    pub schema: String,
    pub modules: Vec<String>,
    pub compressed: bool,
    pub encrypted: bool,
}

// ── BackupJob ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub config_id: String,
    pub status: JobStatus,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_secs: Option<i64>,
    pub total_records: i64,
    pub processed_records: i64,
    pub file_size: i64,
    pub file_path: String,
    pub checksum: String,
    pub error_message: Option<String>,
    pub triggered_by: TriggeredBy,
    pub user_id: Option<String>,
    pub metadata: JobMetadata,
}

fn row_to_job(row: &Row) -> rusqlite::Result<BackupJob> {
    let status: String = row.get("status")?;
    let triggered_by: String = row.get("triggered_by")?;
    let metadata: String = row.get("metadata")?;
    Ok(BackupJob {
        id: row.get("id")?,
        config_id: row.get("config_id")?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        duration_secs: row.get("duration_secs")?,
        total_records: row.get("total_records")?,
        processed_records: row.get("processed_records")?,
        file_size: row.get("file_size")?,
        file_path: row.get("file_path")?,
        checksum: row.get("checksum")?,
        error_message: row.get("error_message")?,
        triggered_by: TriggeredBy::parse(&triggered_by),
        user_id: row.get("user_id")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<BackupJob>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_jobs ORDER BY start_time DESC")?;
    let rows = stmt.query_map([], |row| row_to_job(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupJob>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_jobs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_job(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_by_config_id(conn: &Connection, config_id: &str) -> anyhow::Result<Vec<BackupJob>> {
    let mut stmt =
        conn.prepare("SELECT * FROM backup_jobs WHERE config_id = ? ORDER BY start_time DESC")?;
    let rows = stmt.query_map(params![config_id], |row| row_to_job(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Jobs for one config whose start_time is strictly before the cutoff
/// (RFC 3339), oldest first. Retention candidates.
pub fn find_older_than(
    conn: &Connection,
    config_id: &str,
    cutoff: &str,
) -> anyhow::Result<Vec<BackupJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_jobs WHERE config_id = ? AND start_time < ? ORDER BY start_time",
    )?;
    let rows = stmt.query_map(params![config_id, cutoff], |row| row_to_job(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Jobs left in a non-terminal state, e.g. by an engine crash.
pub fn find_in_flight(conn: &Connection) -> anyhow::Result<Vec<BackupJob>> {
    let mut stmt =
        conn.prepare("SELECT * FROM backup_jobs WHERE status IN ('pending','running')")?;
    let rows = stmt.query_map([], |row| row_to_job(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn create(
    conn: &Connection,
    config_id: &str,
    triggered_by: TriggeredBy,
    user_id: Option<&str>,
    metadata: &JobMetadata,
) -> anyhow::Result<BackupJob> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO backup_jobs (id, config_id, status, start_time, triggered_by, user_id, metadata)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)",
        params![
            id,
            config_id,
            now,
            triggered_by.as_str(),
            user_id,
            serde_json::to_string(metadata)?,
        ],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created job"))
}

/// Transition a job's status, enforcing the monotonic state machine.
pub fn update_status(conn: &Connection, id: &str, next: JobStatus) -> anyhow::Result<BackupJob> {
    let job = find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Job not found: {}", id))?;
    if !job.status.can_transition_to(next) {
        anyhow::bail!(
            "Illegal status transition for job {}: {} -> {}",
            id,
            job.status.as_str(),
            next.as_str()
        );
    }
    conn.execute(
        "UPDATE backup_jobs SET status = ? WHERE id = ?",
        params![next.as_str(), id],
    )?;
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Job vanished during update: {}", id))
}

pub fn update_counts(
    conn: &Connection,
    id: &str,
    total_records: i64,
    processed_records: i64,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE backup_jobs SET total_records = ?, processed_records = ? WHERE id = ?",
        params![total_records, processed_records, id],
    )?;
    Ok(())
}

pub struct CompletionData {
    pub total_records: i64,
    pub processed_records: i64,
    pub file_size: i64,
    pub file_path: String,
    pub checksum: String,
    pub duration_secs: i64,
}

pub fn complete(conn: &Connection, id: &str, data: &CompletionData) -> anyhow::Result<BackupJob> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE backup_jobs SET total_records = ?, processed_records = ?, file_size = ?, file_path = ?, checksum = ?, end_time = ?, duration_secs = ? WHERE id = ?",
        params![
            data.total_records,
            data.processed_records,
            data.file_size,
            data.file_path,
            data.checksum,
            now,
            data.duration_secs,
            id
        ],
    )?;
    update_status(conn, id, JobStatus::Completed)
}

pub fn fail(
    conn: &Connection,
    id: &str,
    error_message: &str,
    duration_secs: i64,
) -> anyhow::Result<BackupJob> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE backup_jobs SET error_message = ?, end_time = ?, duration_secs = ? WHERE id = ?",
        params![error_message, now, duration_secs, id],
    )?;
    update_status(conn, id, JobStatus::Failed)
}

pub fn cancel(conn: &Connection, id: &str, duration_secs: i64) -> anyhow::Result<BackupJob> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE backup_jobs SET end_time = ?, duration_secs = ? WHERE id = ?",
        params![now, duration_secs, id],
    )?;
    update_status(conn, id, JobStatus::Cancelled)
}

pub fn set_file_path(conn: &Connection, id: &str, file_path: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE backup_jobs SET file_path = ? WHERE id = ?",
        params![file_path, id],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM backup_jobs WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_memory_pool;
    use crate::db::migrate::migrate_schema_only;

    fn seeded_conn() -> (crate::db::connection::DbPool, String) {
        let pool = create_memory_pool();
        migrate_schema_only(&pool).unwrap();
        let conn = pool.get().unwrap();
        let config = crate::models::backup_config::create(
            &conn,
            &crate::models::backup_config::CreateBackupConfigRequest {
                name: "nightly".into(),
                schedule: Default::default(),
                included_modules: vec![],
                included_tables: vec![],
                excluded_tables: vec![],
                compression: true,
                encryption: false,
                retention_days: 30,
                destination: crate::models::backup_config::DestinationSpec {
                    kind: "filesystem".into(),
                    path: "backups".into(),
                    credentials: None,
                },
                active: true,
                created_by: "admin".into(),
            },
        )
        .unwrap();
        (pool, config.id)
    }

    #[test]
    fn status_machine_is_monotonic() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn terminal_jobs_reject_updates() {
        let (pool, config_id) = seeded_conn();
        let conn = pool.get().unwrap();
        let job = create(
            &conn,
            &config_id,
            TriggeredBy::Manual,
            Some("admin"),
            &JobMetadata::default(),
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        update_status(&conn, &job.id, JobStatus::Running).unwrap();
        let done = complete(
            &conn,
            &job.id,
            &CompletionData {
                total_records: 10,
                processed_records: 10,
                file_size: 512,
                file_path: "cfg/a.sql.zst".into(),
                checksum: "abc".into(),
                duration_secs: 2,
            },
        )
        .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.end_time.is_some());

        assert!(update_status(&conn, &job.id, JobStatus::Running).is_err());
        assert!(update_status(&conn, &job.id, JobStatus::Cancelled).is_err());
    }

    #[test]
    fn retention_query_uses_cutoff() {
        let (pool, config_id) = seeded_conn();
        let conn = pool.get().unwrap();
        let job = create(
            &conn,
            &config_id,
            TriggeredBy::Schedule,
            None,
            &JobMetadata::default(),
        )
        .unwrap();
        conn.execute(
            "UPDATE backup_jobs SET start_time = '2020-01-01T00:00:00+00:00' WHERE id = ?",
            params![job.id],
        )
        .unwrap();

        let old = find_older_than(&conn, &config_id, "2021-01-01T00:00:00+00:00").unwrap();
        assert_eq!(old.len(), 1);
        let none = find_older_than(&conn, &config_id, "2019-01-01T00:00:00+00:00").unwrap();
        assert!(none.is_empty());
    }
}
