use crate::db::connection::DbPool;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_configs (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  schedule TEXT NOT NULL DEFAULT '{}',
  included_modules TEXT NOT NULL DEFAULT '[]',
  included_tables TEXT NOT NULL DEFAULT '[]',
  excluded_tables TEXT NOT NULL DEFAULT '[]',
  compression INTEGER NOT NULL DEFAULT 1,
  encryption INTEGER NOT NULL DEFAULT 0,
  retention_days INTEGER NOT NULL DEFAULT 30,
  destination TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 1,
  created_by TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS backup_jobs (
  id TEXT PRIMARY KEY,
  config_id TEXT NOT NULL REFERENCES backup_configs(id) ON DELETE CASCADE,
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','completed','failed','cancelled')),
  start_time TEXT NOT NULL DEFAULT (datetime('now')),
  end_time TEXT,
  duration_secs INTEGER,
  total_records INTEGER NOT NULL DEFAULT 0,
  processed_records INTEGER NOT NULL DEFAULT 0,
  file_size INTEGER NOT NULL DEFAULT 0,
  file_path TEXT NOT NULL DEFAULT '',
  checksum TEXT NOT NULL DEFAULT '',
  error_message TEXT,
  triggered_by TEXT NOT NULL DEFAULT 'manual' CHECK(triggered_by IN ('schedule','manual','api')),
  user_id TEXT,
  metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS restore_jobs (
  id TEXT PRIMARY KEY,
  backup_job_id TEXT NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','completed','failed','cancelled')),
  restore_type TEXT NOT NULL DEFAULT 'full' CHECK(restore_type IN ('full','partial','selective')),
  selected_tables TEXT,
  selected_modules TEXT,
  target_database TEXT,
  overwrite_existing INTEGER NOT NULL DEFAULT 0,
  create_backup_before INTEGER NOT NULL DEFAULT 0,
  progress TEXT NOT NULL DEFAULT '{}',
  start_time TEXT NOT NULL DEFAULT (datetime('now')),
  end_time TEXT,
  error_message TEXT,
  user_id TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_backup_jobs_config_id ON backup_jobs(config_id);
CREATE INDEX IF NOT EXISTS idx_backup_jobs_start_time ON backup_jobs(start_time DESC);
CREATE INDEX IF NOT EXISTS idx_restore_jobs_backup_job_id ON restore_jobs(backup_job_id);
"#;

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for existing databases
    let has_column = |table: &str, column: &str| -> bool {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        columns.contains(&column.to_string())
    };

    if !has_column("backup_jobs", "metadata") {
        conn.execute_batch(
            "ALTER TABLE backup_jobs ADD COLUMN metadata TEXT NOT NULL DEFAULT '{}'",
        )?;
    }
    if !has_column("restore_jobs", "target_database") {
        conn.execute_batch("ALTER TABLE restore_jobs ADD COLUMN target_database TEXT")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

/// Migration entry point for pools that have no on-disk data directory
/// (in-memory record stores in tests).
pub fn migrate_schema_only(pool: &DbPool) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
