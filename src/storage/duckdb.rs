use super::query::{
    build_aggregate_sql, derived_field_macros, total_pages, AggregatePage, AggregateQuery,
    AggregateRow, ClientName, StreamStats,
};
use super::traits::{Storage, StorageError};
use crate::tail::RawEntry;
use async_trait::async_trait;
use duckdb::Connection;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract PID from DuckDB lock error message, "... (PID 12345) ..."
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + "(PID ".len();
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

/// Remove the WAL and lock files left behind by a dead process
fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let stale = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if stale.exists() {
            std::fs::remove_file(&stale)?;
            tracing::info!(path = %stale.display(), "Removed stale {} file", suffix);
        }
    }
    Ok(())
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|e| StorageError::Database(format!("connection lock poisoned: {}", e)))
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Database(format!("Task join error: {}", e))
}

/// DuckDB implementation of the Storage trait
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    /// Open (or create) the database file, clearing a stale lock left by a
    /// crashed fetcher
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Database(format!(
                        "failed to create database directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let e = match Connection::open(path) {
            Ok(conn) => return Ok(Self::from_connection(conn)),
            Err(e) => e,
        };

        let error_msg = e.to_string();
        if !error_msg.contains("Could not set lock") {
            return Err(e.into());
        }

        tracing::warn!("Database lock detected: {}", error_msg);
        let Some(pid) = extract_pid_from_lock_error(&error_msg) else {
            return Err(e.into());
        };

        if is_process_running(pid) {
            tracing::error!(pid, "Lock holder is still running, cannot open database");
            return Err(e.into());
        }

        tracing::warn!(pid, "Lock holder is gone, removing stale lock files");
        if let Err(io_err) = remove_lock_files(path) {
            tracing::error!("Failed to remove lock files: {}", io_err);
            return Err(e.into());
        }

        let conn = Connection::open(path)?;
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

#[async_trait]
impl Storage for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS events (
                    event_id UUID PRIMARY KEY,
                    destination VARCHAR NOT NULL,
                    timestamp VARCHAR NOT NULL,
                    payload JSON NOT NULL,
                    ingestion_time TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_events_destination ON events(destination)",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS fetch_metadata (
                    key VARCHAR PRIMARY KEY,
                    value VARCHAR NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS client_names (
                    ip VARCHAR PRIMARY KEY,
                    hostname VARCHAR NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            for statement in derived_field_macros() {
                conn.execute(&statement, [])?;
            }

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn append_events(
        &self,
        destination: &str,
        entries: &[RawEntry],
    ) -> Result<usize, StorageError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.clone();
        let destination = destination.to_string();
        let rows: Vec<(String, String)> = entries
            .iter()
            .map(|entry| (entry.timestamp.clone(), entry.to_json()))
            .collect();

        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO events (event_id, destination, timestamp, payload, ingestion_time)
                     VALUES (?, ?, ?, ?, current_timestamp)",
                )?;
                for (timestamp, payload) in &rows {
                    stmt.execute(duckdb::params![
                        Uuid::new_v4().to_string(),
                        destination,
                        timestamp,
                        payload,
                    ])?;
                }
            }
            tx.commit()?;
            Ok::<usize, StorageError>(rows.len())
        })
        .await
        .map_err(join_error)?
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare("SELECT value FROM fetch_metadata WHERE key = ?")?;
            let mut rows = stmt.query(duckdb::params![key])?;

            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO fetch_metadata (key, value) VALUES (?, ?)",
                duckdb::params![key, value],
            )?;
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<AggregatePage, StorageError> {
        let sql = build_aggregate_sql(query)?;
        let conn = self.conn.clone();
        let group_by = query.group_by.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM ({}) AS grouped", sql.base),
                duckdb::params_from_iter(sql.params.clone()),
                |row| row.get(0),
            )?;
            let total = total as usize;

            let mut params = sql.params.clone();
            params.push(duckdb::types::Value::BigInt(sql.page_size as i64));
            params.push(duckdb::types::Value::BigInt(sql.offset() as i64));

            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM ({}) AS grouped ORDER BY {} LIMIT ? OFFSET ?",
                sql.base, sql.order_by
            ))?;
            let n = group_by.len();
            let mapped = stmt.query_map(duckdb::params_from_iter(params), |row| {
                let mut keys = BTreeMap::new();
                for (i, field) in group_by.iter().enumerate() {
                    keys.insert(field.clone(), row.get::<_, Option<String>>(i)?);
                }
                Ok(AggregateRow {
                    keys,
                    count: row.get(n)?,
                    sum: row.get(n + 1)?,
                    peak_daily_count: row.get(n + 2)?,
                    first_seen: row.get(n + 3)?,
                    last_seen: row.get(n + 4)?,
                })
            })?;

            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }

            Ok(AggregatePage {
                total,
                page: sql.page,
                page_size: sql.page_size,
                total_pages: total_pages(total, sql.page_size),
                rows,
            })
        })
        .await
        .map_err(join_error)?
    }

    async fn upsert_client_names(&self, names: &[ClientName]) -> Result<usize, StorageError> {
        if names.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.clone();
        let names = names.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO client_names (ip, hostname, updated_at)
                     VALUES (?, ?, current_timestamp)",
                )?;
                for name in &names {
                    stmt.execute(duckdb::params![name.ip, name.hostname])?;
                }
            }
            tx.commit()?;
            Ok::<usize, StorageError>(names.len())
        })
        .await
        .map_err(join_error)?
    }

    async fn client_names(&self) -> Result<Vec<ClientName>, StorageError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare("SELECT ip, hostname FROM client_names ORDER BY ip")?;
            let mapped = stmt.query_map([], |row| {
                Ok(ClientName {
                    ip: row.get(0)?,
                    hostname: row.get(1)?,
                })
            })?;

            let mut names = Vec::new();
            for row in mapped {
                names.push(row?);
            }
            Ok(names)
        })
        .await
        .map_err(join_error)?
    }

    async fn stats(&self) -> Result<Vec<StreamStats>, StorageError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT destination, COUNT(*), MIN(timestamp), MAX(timestamp)
                 FROM events GROUP BY destination ORDER BY destination",
            )?;

            let mapped = stmt.query_map([], |row| {
                Ok(StreamStats {
                    destination: row.get(0)?,
                    events: row.get(1)?,
                    first_timestamp: row.get(2)?,
                    last_timestamp: row.get(3)?,
                })
            })?;

            let mut stats = Vec::new();
            for row in mapped {
                stats.push(row?);
            }
            Ok(stats)
        })
        .await
        .map_err(join_error)?
    }
}
