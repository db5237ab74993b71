use std::path::Path;

const MAX_COPIES: usize = 7;

/// Daily copy of the engine's own record store, one per calendar day,
/// rotating out the oldest beyond MAX_COPIES.
pub fn backup_record_store(db_path: &str, data_dir: &Path) -> anyhow::Result<()> {
    let backup_dir = data_dir.join("store-backups");
    std::fs::create_dir_all(&backup_dir)?;

    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let backup_name = format!("backup-engine-{}.db", today);
    let backup_path = backup_dir.join(&backup_name);

    if backup_path.exists() {
        tracing::info!("[DB Backup] Today's record store copy already exists, skipping");
        return Ok(());
    }

    std::fs::copy(db_path, &backup_path)?;
    tracing::info!("[DB Backup] Created record store copy: {}", backup_name);

    // Cleanup old copies
    let mut backups: Vec<_> = std::fs::read_dir(&backup_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("backup-engine-")
        })
        .collect();

    backups.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    for old in backups.into_iter().skip(MAX_COPIES) {
        let _ = std::fs::remove_file(old.path());
        tracing::info!("[DB Backup] Removed old copy: {}", old.file_name().to_string_lossy());
    }

    Ok(())
}
