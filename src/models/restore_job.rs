use super::backup_job::JobStatus;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreType {
    Full,
    Partial,
    Selective,
}

impl RestoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreType::Full => "full",
            RestoreType::Partial => "partial",
            RestoreType::Selective => "selective",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "partial" => RestoreType::Partial,
            "selective" => RestoreType::Selective,
            _ => RestoreType::Full,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreProgress {
    pub current_table: String,
    pub tables_completed: i64,
    pub total_tables: i64,
    pub records_completed: i64,
    pub total_records: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreJob {
    pub id: String,
    /// Must reference a completed backup job
    pub backup_job_id: String,
    pub status: JobStatus,
    pub restore_type: RestoreType,
    pub selected_tables: Option<Vec<String>>,
    pub selected_modules: Option<Vec<String>>,
    pub target_database: Option<String>,
    pub overwrite_existing: bool,
    pub create_backup_before: bool,
    pub progress: RestoreProgress,
    pub start_time: String,
    pub end_time: Option<String>,
    pub error_message: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRestoreRequest {
    pub backup_job_id: String,
    #[serde(default = "default_restore_type")]
    pub restore_type: RestoreType,
    pub selected_tables: Option<Vec<String>>,
    pub selected_modules: Option<Vec<String>>,
    pub target_database: Option<String>,
    #[serde(default)]
    pub overwrite_existing: bool,
    #[serde(default)]
    pub create_backup_before: bool,
    #[serde(default)]
    pub user_id: String,
}

fn default_restore_type() -> RestoreType {
    RestoreType::Full
}

fn row_to_restore(row: &Row) -> rusqlite::Result<RestoreJob> {
    let status: String = row.get("status")?;
    let restore_type: String = row.get("restore_type")?;
    let progress: String = row.get("progress")?;
    let selected_tables: Option<String> = row.get("selected_tables")?;
    let selected_modules: Option<String> = row.get("selected_modules")?;
    Ok(RestoreJob {
        id: row.get("id")?,
        backup_job_id: row.get("backup_job_id")?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        restore_type: RestoreType::parse(&restore_type),
        selected_tables: selected_tables.and_then(|s| serde_json::from_str(&s).ok()),
        selected_modules: selected_modules.and_then(|s| serde_json::from_str(&s).ok()),
        target_database: row.get("target_database")?,
        overwrite_existing: row.get::<_, i64>("overwrite_existing")? != 0,
        create_backup_before: row.get::<_, i64>("create_backup_before")? != 0,
        progress: serde_json::from_str(&progress).unwrap_or_default(),
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        error_message: row.get("error_message")?,
        user_id: row.get("user_id")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<RestoreJob>> {
    let mut stmt = conn.prepare("SELECT * FROM restore_jobs ORDER BY start_time DESC")?;
    let rows = stmt.query_map([], |row| row_to_restore(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<RestoreJob>> {
    let mut stmt = conn.prepare("SELECT * FROM restore_jobs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_restore(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_by_backup_job_id(
    conn: &Connection,
    backup_job_id: &str,
) -> anyhow::Result<Vec<RestoreJob>> {
    let mut stmt = conn
        .prepare("SELECT * FROM restore_jobs WHERE backup_job_id = ? ORDER BY start_time DESC")?;
    let rows = stmt.query_map(params![backup_job_id], |row| row_to_restore(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_in_flight(conn: &Connection) -> anyhow::Result<Vec<RestoreJob>> {
    let mut stmt =
        conn.prepare("SELECT * FROM restore_jobs WHERE status IN ('pending','running')")?;
    let rows = stmt.query_map([], |row| row_to_restore(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn create(conn: &Connection, data: &CreateRestoreRequest) -> anyhow::Result<RestoreJob> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO restore_jobs (id, backup_job_id, status, restore_type, selected_tables, selected_modules, target_database, overwrite_existing, create_backup_before, progress, start_time, user_id)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id,
            data.backup_job_id,
            data.restore_type.as_str(),
            data.selected_tables
                .as_ref()
                .map(|t| serde_json::to_string(t))
                .transpose()?,
            data.selected_modules
                .as_ref()
                .map(|m| serde_json::to_string(m))
                .transpose()?,
            data.target_database,
            data.overwrite_existing as i64,
            data.create_backup_before as i64,
            serde_json::to_string(&RestoreProgress::default())?,
            now,
            data.user_id,
        ],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created restore job"))
}

/// Transition a restore job's status, enforcing the monotonic state machine.
pub fn update_status(conn: &Connection, id: &str, next: JobStatus) -> anyhow::Result<RestoreJob> {
    let job =
        find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Restore job not found: {}", id))?;
    if !job.status.can_transition_to(next) {
        anyhow::bail!(
            "Illegal status transition for restore job {}: {} -> {}",
            id,
            job.status.as_str(),
            next.as_str()
        );
    }
    conn.execute(
        "UPDATE restore_jobs SET status = ? WHERE id = ?",
        params![next.as_str(), id],
    )?;
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Restore job vanished during update: {}", id))
}

pub fn update_progress(
    conn: &Connection,
    id: &str,
    progress: &RestoreProgress,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE restore_jobs SET progress = ? WHERE id = ?",
        params![serde_json::to_string(progress)?, id],
    )?;
    Ok(())
}

pub fn complete(
    conn: &Connection,
    id: &str,
    progress: &RestoreProgress,
) -> anyhow::Result<RestoreJob> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE restore_jobs SET progress = ?, end_time = ? WHERE id = ?",
        params![serde_json::to_string(progress)?, now, id],
    )?;
    update_status(conn, id, JobStatus::Completed)
}

pub fn fail(conn: &Connection, id: &str, error_message: &str) -> anyhow::Result<RestoreJob> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE restore_jobs SET error_message = ?, end_time = ? WHERE id = ?",
        params![error_message, now, id],
    )?;
    update_status(conn, id, JobStatus::Failed)
}

pub fn cancel(conn: &Connection, id: &str) -> anyhow::Result<RestoreJob> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE restore_jobs SET end_time = ? WHERE id = ?",
        params![now, id],
    )?;
    update_status(conn, id, JobStatus::Cancelled)
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM restore_jobs WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
