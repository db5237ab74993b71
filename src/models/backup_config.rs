use crate::error::{EngineError, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub enabled: bool,
    pub frequency: Frequency,
    /// Local wall-clock trigger time, "HH:MM"
    pub time: String,
    /// 0 = Sunday .. 6 = Saturday, required for weekly schedules
    pub day_of_week: Option<u8>,
    /// 1..=31, required for monthly schedules
    pub day_of_month: Option<u8>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: Frequency::Daily,
            time: "02:00".into(),
            day_of_week: None,
            day_of_month: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationSpec {
    /// Destination kind; only "filesystem" ships today
    pub kind: String,
    pub path: String,
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub included_modules: Vec<String>,
    pub included_tables: Vec<String>,
    pub excluded_tables: Vec<String>,
    pub compression: bool,
    pub encryption: bool,
    pub retention_days: i64,
    pub destination: DestinationSpec,
    pub active: bool,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBackupConfigRequest {
    pub name: String,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub included_modules: Vec<String>,
    #[serde(default)]
    pub included_tables: Vec<String>,
    #[serde(default)]
    pub excluded_tables: Vec<String>,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default = "default_retention")]
    pub retention_days: i64,
    pub destination: DestinationSpec,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub created_by: String,
}

fn default_true() -> bool {
    true
}
fn default_retention() -> i64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBackupConfigRequest {
    pub name: Option<String>,
    pub schedule: Option<Schedule>,
    pub included_modules: Option<Vec<String>>,
    pub included_tables: Option<Vec<String>>,
    pub excluded_tables: Option<Vec<String>>,
    pub compression: Option<bool>,
    pub encryption: Option<bool>,
    pub retention_days: Option<i64>,
    pub destination: Option<DestinationSpec>,
    pub active: Option<bool>,
}

/// Validate the invariants a config must satisfy before it is persisted.
pub fn validate(
    schedule: &Schedule,
    retention_days: i64,
    destination: &DestinationSpec,
) -> Result<()> {
    if schedule.enabled {
        chrono::NaiveTime::parse_from_str(&schedule.time, "%H:%M").map_err(|_| {
            EngineError::Configuration(format!("schedule.time must be HH:MM, got {:?}", schedule.time))
        })?;
        match schedule.frequency {
            Frequency::Daily => {}
            Frequency::Weekly => match schedule.day_of_week {
                Some(0..=6) => {}
                _ => {
                    return Err(EngineError::Configuration(
                        "weekly schedule requires day_of_week in 0..=6".into(),
                    ))
                }
            },
            Frequency::Monthly => match schedule.day_of_month {
                Some(1..=31) => {}
                _ => {
                    return Err(EngineError::Configuration(
                        "monthly schedule requires day_of_month in 1..=31".into(),
                    ))
                }
            },
        }
    }
    if retention_days < 1 {
        return Err(EngineError::Configuration(
            "retention_days must be at least 1".into(),
        ));
    }
    if destination.path.is_empty() {
        return Err(EngineError::Configuration(
            "destination.path must not be empty".into(),
        ));
    }
    Ok(())
}

impl BackupConfig {
    /// Resolved table selection over the source's table list. Module and
    /// table inclusion union; exclusion always wins.
    pub fn resolve_tables(&self, available: &[crate::source::TableMeta]) -> Vec<String> {
        available
            .iter()
            .filter(|t| {
                let by_module = self.included_modules.is_empty()
                    || self.included_modules.contains(&t.module);
                let by_table = self.included_tables.contains(&t.name);
                (by_module || by_table) && !self.excluded_tables.contains(&t.name)
            })
            .map(|t| t.name.clone())
            .collect()
    }
}

fn row_to_config(row: &Row) -> rusqlite::Result<BackupConfig> {
    let schedule: String = row.get("schedule")?;
    let destination: String = row.get("destination")?;
    let included_modules: String = row.get("included_modules")?;
    let included_tables: String = row.get("included_tables")?;
    let excluded_tables: String = row.get("excluded_tables")?;
    Ok(BackupConfig {
        id: row.get("id")?,
        name: row.get("name")?,
        schedule: serde_json::from_str(&schedule).unwrap_or_default(),
        included_modules: serde_json::from_str(&included_modules).unwrap_or_default(),
        included_tables: serde_json::from_str(&included_tables).unwrap_or_default(),
        excluded_tables: serde_json::from_str(&excluded_tables).unwrap_or_default(),
        compression: row.get::<_, i64>("compression")? != 0,
        encryption: row.get::<_, i64>("encryption")? != 0,
        retention_days: row.get("retention_days")?,
        destination: serde_json::from_str(&destination).unwrap_or(DestinationSpec {
            kind: "filesystem".into(),
            path: String::new(),
            credentials: None,
        }),
        active: row.get::<_, i64>("active")? != 0,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<BackupConfig>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_configs ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], |row| row_to_config(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_active(conn: &Connection) -> anyhow::Result<Vec<BackupConfig>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_configs WHERE active = 1 ORDER BY created_at")?;
    let rows = stmt.query_map([], |row| row_to_config(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupConfig>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_configs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_config(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn create(conn: &Connection, data: &CreateBackupConfigRequest) -> anyhow::Result<BackupConfig> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO backup_configs (id, name, schedule, included_modules, included_tables, excluded_tables, compression, encryption, retention_days, destination, active, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id,
            data.name,
            serde_json::to_string(&data.schedule)?,
            serde_json::to_string(&data.included_modules)?,
            serde_json::to_string(&data.included_tables)?,
            serde_json::to_string(&data.excluded_tables)?,
            data.compression as i64,
            data.encryption as i64,
            data.retention_days,
            serde_json::to_string(&data.destination)?,
            data.active as i64,
            data.created_by,
            now,
            now,
        ],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created config"))
}

pub fn update(
    conn: &Connection,
    id: &str,
    data: &UpdateBackupConfigRequest,
) -> anyhow::Result<Option<BackupConfig>> {
    let existing = find_by_id(conn, id)?;
    if existing.is_none() {
        return Ok(None);
    }

    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref name) = data.name {
        sets.push("name = ?");
        values.push(Box::new(name.clone()));
    }
    if let Some(ref schedule) = data.schedule {
        sets.push("schedule = ?");
        values.push(Box::new(serde_json::to_string(schedule)?));
    }
    if let Some(ref modules) = data.included_modules {
        sets.push("included_modules = ?");
        values.push(Box::new(serde_json::to_string(modules)?));
    }
    if let Some(ref tables) = data.included_tables {
        sets.push("included_tables = ?");
        values.push(Box::new(serde_json::to_string(tables)?));
    }
    if let Some(ref tables) = data.excluded_tables {
        sets.push("excluded_tables = ?");
        values.push(Box::new(serde_json::to_string(tables)?));
    }
    if let Some(compression) = data.compression {
        sets.push("compression = ?");
        values.push(Box::new(compression as i64));
    }
    if let Some(encryption) = data.encryption {
        sets.push("encryption = ?");
        values.push(Box::new(encryption as i64));
    }
    if let Some(retention_days) = data.retention_days {
        sets.push("retention_days = ?");
        values.push(Box::new(retention_days));
    }
    if let Some(ref destination) = data.destination {
        sets.push("destination = ?");
        values.push(Box::new(serde_json::to_string(destination)?));
    }
    if let Some(active) = data.active {
        sets.push("active = ?");
        values.push(Box::new(active as i64));
    }

    if sets.is_empty() {
        return find_by_id(conn, id);
    }

    sets.push("updated_at = datetime('now')");
    values.push(Box::new(id.to_string()));

    let sql = format!("UPDATE backup_configs SET {} WHERE id = ?", sets.join(", "));
    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    conn.execute(&sql, params.as_slice())?;
    find_by_id(conn, id)
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM backup_configs WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TableMeta;

    fn table(name: &str, module: &str) -> TableMeta {
        TableMeta {
            name: name.into(),
            module: module.into(),
        }
    }

    #[test]
    fn exclusion_always_wins() {
        let config = BackupConfig {
            id: "c1".into(),
            name: "nightly".into(),
            schedule: Schedule::default(),
            included_modules: vec!["inventory".into()],
            included_tables: vec!["pos_sales".into()],
            excluded_tables: vec!["inventory_audit".into(), "pos_sales".into()],
            compression: true,
            encryption: false,
            retention_days: 30,
            destination: DestinationSpec {
                kind: "filesystem".into(),
                path: "backups".into(),
                credentials: None,
            },
            active: true,
            created_by: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let available = vec![
            table("inventory_items", "inventory"),
            table("inventory_audit", "inventory"),
            table("pos_sales", "pos"),
            table("hr_staff", "hr"),
        ];
        assert_eq!(config.resolve_tables(&available), vec!["inventory_items"]);
    }

    #[test]
    fn empty_module_selection_means_all_tables() {
        let mut config_tables = BackupConfig {
            id: "c1".into(),
            name: "full".into(),
            schedule: Schedule::default(),
            included_modules: vec![],
            included_tables: vec![],
            excluded_tables: vec![],
            compression: false,
            encryption: false,
            retention_days: 1,
            destination: DestinationSpec {
                kind: "filesystem".into(),
                path: "backups".into(),
                credentials: None,
            },
            active: true,
            created_by: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let available = vec![table("a_x", "a"), table("b_y", "b")];
        assert_eq!(config_tables.resolve_tables(&available), vec!["a_x", "b_y"]);

        config_tables.excluded_tables = vec!["b_y".into()];
        assert_eq!(config_tables.resolve_tables(&available), vec!["a_x"]);
    }

    #[test]
    fn validates_schedule_requirements() {
        let dest = DestinationSpec {
            kind: "filesystem".into(),
            path: "backups".into(),
            credentials: None,
        };

        let disabled = Schedule::default();
        assert!(validate(&disabled, 30, &dest).is_ok());

        let weekly_missing_day = Schedule {
            enabled: true,
            frequency: Frequency::Weekly,
            time: "03:30".into(),
            day_of_week: None,
            day_of_month: None,
        };
        assert!(validate(&weekly_missing_day, 30, &dest).is_err());

        let bad_time = Schedule {
            enabled: true,
            frequency: Frequency::Daily,
            time: "25:99".into(),
            day_of_week: None,
            day_of_month: None,
        };
        assert!(validate(&bad_time, 30, &dest).is_err());

        let monthly = Schedule {
            enabled: true,
            frequency: Frequency::Monthly,
            time: "01:15".into(),
            day_of_week: None,
            day_of_month: Some(31),
        };
        assert!(validate(&monthly, 30, &dest).is_ok());
    }

    #[test]
    fn rejects_bad_retention_and_empty_destination() {
        let dest = DestinationSpec {
            kind: "filesystem".into(),
            path: "backups".into(),
            credentials: None,
        };
        assert!(validate(&Schedule::default(), 0, &dest).is_err());

        let empty = DestinationSpec {
            kind: "filesystem".into(),
            path: String::new(),
            credentials: None,
        };
        assert!(validate(&Schedule::default(), 7, &empty).is_err());
    }
}
