//! Durable cycle table in SQLite
//!
//! Every write opens its own connection, upserts one row inside a short
//! transaction, and closes again, so no lock is held between ticks and other
//! readers of the file (reporting jobs) are never starved.

use crate::domain::CycleEvent;
use crate::infra::config::StorageSettings;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// How long a write waits on a lock held by another process
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to create directory {path}: {source}")]
    Directory { path: String, source: std::io::Error },
    #[error("failed to open event store {path}: {source}")]
    Open { path: String, source: rusqlite::Error },
    #[error("failed to prepare table {table}: {source}")]
    Schema { table: String, source: rusqlite::Error },
    #[error("failed to write cycle {id}: {source}")]
    Write { id: i64, source: rusqlite::Error },
    #[error("failed to read event store: {0}")]
    Read(#[from] rusqlite::Error),
}

impl PersistenceError {
    /// A busy/locked database may succeed on a later cycle; the row is still not retried
    pub fn is_retryable(&self) -> bool {
        let source = match self {
            PersistenceError::Open { source, .. }
            | PersistenceError::Schema { source, .. }
            | PersistenceError::Write { source, .. }
            | PersistenceError::Read(source) => source,
            PersistenceError::Directory { .. } => return false,
        };
        matches!(
            source.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}

/// Idempotent recorder of cycle events, keyed by cycle id
pub struct EventStore {
    path: PathBuf,
    table: String,
    schema_ready: bool,
}

impl EventStore {
    pub fn new(settings: &StorageSettings) -> Self {
        Self { path: PathBuf::from(&settings.path), table: settings.table.clone(), schema_ready: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Pick up a new path or table from a reloaded config
    pub fn apply_settings(&mut self, settings: &StorageSettings) {
        let path = Path::new(&settings.path);
        if path != self.path || settings.table != self.table {
            info!(path = %settings.path, table = %settings.table, "event_store_retargeted");
            self.path = path.to_path_buf();
            self.table = settings.table.clone();
            self.schema_ready = false;
        }
    }

    /// Insert or replace the row for `event.id`
    pub fn record(&mut self, event: &CycleEvent) -> Result<(), PersistenceError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(|source| PersistenceError::Write { id: event.id, source })?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, timestamp, cycle_length, part_1, part_2, inter_cycle_time, box_present)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                self.table
            ),
            params![
                event.id,
                event.start_ts,
                event.cycle_length,
                event.part_1,
                event.part_2,
                event.inter_cycle_time,
                event.box_present,
            ],
        )
        .map_err(|source| PersistenceError::Write { id: event.id, source })?;
        tx.commit().map_err(|source| PersistenceError::Write { id: event.id, source })?;
        debug!(id = %event.id, table = %self.table, "cycle_persisted");
        Ok(())
    }

    /// Read back one cycle by id
    pub fn fetch(&mut self, id: i64) -> Result<Option<CycleEvent>, PersistenceError> {
        let conn = self.connect()?;
        let event = conn
            .query_row(
                &format!(
                    "SELECT id, timestamp, cycle_length, part_1, part_2, inter_cycle_time, box_present
                     FROM {} WHERE id = ?1",
                    self.table
                ),
                params![id],
                |row| {
                    Ok(CycleEvent {
                        id: row.get(0)?,
                        start_ts: row.get(1)?,
                        cycle_length: row.get(2)?,
                        part_1: row.get(3)?,
                        part_2: row.get(4)?,
                        inter_cycle_time: row.get(5)?,
                        box_present: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(event)
    }

    /// Number of rows in the table
    pub fn count(&mut self) -> Result<u64, PersistenceError> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Open a connection and make sure the table exists
    fn connect(&mut self) -> Result<Connection, PersistenceError> {
        let display = self.path.display().to_string();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|source| PersistenceError::Directory { path: parent.display().to_string(), source })?;
        }
        let conn = Connection::open(&self.path).map_err(|source| PersistenceError::Open { path: display.clone(), source })?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(|source| PersistenceError::Open { path: display, source })?;

        if !self.schema_ready {
            let schema_err = |source| PersistenceError::Schema { table: self.table.clone(), source };
            conn.pragma_update(None, "journal_mode", "WAL").map_err(schema_err)?;
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY,
                    timestamp REAL NOT NULL,
                    cycle_length REAL,
                    part_1 INTEGER NOT NULL,
                    part_2 INTEGER NOT NULL,
                    inter_cycle_time REAL,
                    box_present INTEGER NOT NULL
                )",
                self.table
            ))
            .map_err(schema_err)?;
            self.schema_ready = true;
            info!(path = %self.path.display(), table = %self.table, "event_store_ready");
        }
        Ok(conn)
    }
}
