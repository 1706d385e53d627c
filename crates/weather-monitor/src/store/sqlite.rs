//! SQLite observation store.
//!
//! One table, `observations`, keyed by location id. The database lives at
//! `~/.weather-monitor/observations.db` unless configured otherwise.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{ObservationStore, Result, StoreError};
use crate::observation::Observation;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS observations (
    location_id TEXT PRIMARY KEY,
    timestamp   TEXT NOT NULL,
    temperature REAL NOT NULL,
    humidity    REAL NOT NULL,
    condition   TEXT NOT NULL
);";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::CannotOpen)
            | Some(ErrorCode::DiskFull)
            | Some(ErrorCode::SystemIoFailure) => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Fatal(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// SQLite-backed store.
///
/// `rusqlite::Connection` is `Send` but not `Sync`, so it sits behind a
/// `Mutex` that is held only for the synchronous statement.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Creates the parent directory and the table, enables WAL and sets
    /// the file mode to 0600.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                std::fs::set_permissions(path, perms)?;
            }
        }

        log::info!("[Store] opened {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Fatal(format!("connection lock poisoned: {}", e)))
    }

    /// Write `observation` unless a newer one is already stored.
    pub fn upsert_blocking(&self, observation: &Observation) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT INTO observations (location_id, timestamp, temperature, humidity, condition) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(location_id) DO UPDATE SET \
                timestamp = excluded.timestamp, \
                temperature = excluded.temperature, \
                humidity = excluded.humidity, \
                condition = excluded.condition \
             WHERE excluded.timestamp >= observations.timestamp",
            params![
                observation.location_id,
                format_timestamp(&observation.timestamp),
                observation.temperature,
                observation.humidity,
                observation.condition,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "newer observation already stored for {}",
                observation.location_id
            )));
        }
        Ok(())
    }

    /// Current row for a location, if any.
    pub fn latest(&self, location_id: &str) -> Result<Option<Observation>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT location_id, timestamp, temperature, humidity, condition \
                 FROM observations WHERE location_id = ?1",
                params![location_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(into_observation).transpose()
    }

    /// All current rows, ordered by location id.
    pub fn list(&self) -> Result<Vec<Observation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT location_id, timestamp, temperature, humidity, condition \
             FROM observations ORDER BY location_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let rows = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_observation).collect()
    }
}

impl ObservationStore for SqliteStore {
    async fn upsert(&self, observation: Observation) -> Result<()> {
        self.upsert_blocking(&observation)
    }
}

/// Fixed-width RFC 3339 so that text comparison orders by time.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn into_observation(
    (location_id, timestamp, temperature, humidity, condition): (String, String, f64, f64, String),
) -> Result<Observation> {
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| StoreError::Fatal(format!("bad timestamp '{}': {}", timestamp, e)))?
        .with_timezone(&Utc);
    Ok(Observation {
        location_id,
        timestamp,
        temperature,
        humidity,
        condition,
    })
}
