use crate::db::connection::DbPool;
use crate::error::{EngineError, Result};
use crate::pipeline::sql::quote_ident;
use async_trait::async_trait;

/// A single column value in portable form, the unit the pipeline serializes.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct TableMeta {
    pub name: String,
    /// Owning module of the table, used for module-level selection.
    pub module: String,
}

/// Abstract relational source the engine exports from and restores into.
///
/// The engine never assumes a specific product behind this trait; the
/// shipped implementation is SQLite, tests may substitute their own.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<TableMeta>>;

    async fn table_columns(&self, table: &str) -> Result<Vec<String>>;

    /// The schema definition statement for a table, emitted once per table
    /// at the head of its section in the artifact.
    async fn schema_statement(&self, table: &str) -> Result<String>;

    /// One page of rows in stable order. An empty page means the table is
    /// exhausted.
    async fn read_rows(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<Vec<SqlValue>>>;

    /// Execute a single statement against the source (restore replay).
    async fn execute_statement(&self, sql: &str) -> Result<()>;
}

// ── SqliteDataSource ──

pub struct SqliteDataSource {
    pool: DbPool,
}

impl SqliteDataSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Module convention: table names are prefixed with their owning module,
/// e.g. `inventory_items` belongs to `inventory`. Unprefixed tables fall
/// back to `core`.
pub fn module_of(table: &str) -> String {
    match table.split_once('_') {
        Some((prefix, _)) => prefix.to_string(),
        None => "core".to_string(),
    }
}

#[async_trait]
impl DataSource for SqliteDataSource {
    async fn list_tables(&self) -> Result<Vec<TableMeta>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::SourceRead(e.to_string()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )
                .map_err(|e| EngineError::SourceRead(e.to_string()))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| EngineError::SourceRead(e.to_string()))?
                .filter_map(|r| r.ok());
            Ok(names
                .map(|name| TableMeta {
                    module: module_of(&name),
                    name,
                })
                .collect())
        })
        .await
        .map_err(|e| EngineError::SourceRead(e.to_string()))?
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        let table = table.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::SourceRead(e.to_string()))?;
            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))
                .map_err(|e| EngineError::SourceRead(e.to_string()))?;
            let cols: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(|e| EngineError::SourceRead(e.to_string()))?
                .filter_map(|r| r.ok())
                .collect();
            if cols.is_empty() {
                return Err(EngineError::SourceRead(format!("no such table: {}", table)));
            }
            Ok(cols)
        })
        .await
        .map_err(|e| EngineError::SourceRead(e.to_string()))?
    }

    async fn schema_statement(&self, table: &str) -> Result<String> {
        let pool = self.pool.clone();
        let table = table.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::SourceRead(e.to_string()))?;
            let sql: String = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?",
                    rusqlite::params![table],
                    |row| row.get(0),
                )
                .map_err(|e| EngineError::SourceRead(format!("schema for {}: {}", table, e)))?;
            Ok(format!("{};", sql.trim_end().trim_end_matches(';')))
        })
        .await
        .map_err(|e| EngineError::SourceRead(e.to_string()))?
    }

    async fn read_rows(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<Vec<SqlValue>>> {
        let pool = self.pool.clone();
        let table = table.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::SourceRead(e.to_string()))?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT * FROM {} ORDER BY rowid LIMIT ? OFFSET ?",
                    quote_ident(&table)
                ))
                .map_err(|e| EngineError::SourceRead(e.to_string()))?;
            let column_count = stmt.column_count();
            let rows = stmt
                .query_map(rusqlite::params![limit as i64, offset as i64], |row| {
                    let mut values = Vec::with_capacity(column_count);
                    for i in 0..column_count {
                        values.push(match row.get_ref(i)? {
                            rusqlite::types::ValueRef::Null => SqlValue::Null,
                            rusqlite::types::ValueRef::Integer(v) => SqlValue::Integer(v),
                            rusqlite::types::ValueRef::Real(v) => SqlValue::Real(v),
                            rusqlite::types::ValueRef::Text(v) => {
                                SqlValue::Text(String::from_utf8_lossy(v).into_owned())
                            }
                            rusqlite::types::ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
                        });
                    }
                    Ok(values)
                })
                .map_err(|e| EngineError::SourceRead(e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| EngineError::SourceRead(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::SourceRead(e.to_string()))?
    }

    async fn execute_statement(&self, sql: &str) -> Result<()> {
        let pool = self.pool.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::StatementExecution(e.to_string()))?;
            conn.execute_batch(&sql)
                .map_err(|e| EngineError::StatementExecution(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::StatementExecution(e.to_string()))?
    }
}
