//! SQLite persistence for identities and access events.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::time::Duration;
use turnstile_core::{
    AccessEvent, Action, Embedding, EventStore, Identity, IdentityStore, IdentitySummary,
    NewAccessEvent, NewIdentity, StoreError,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id TEXT NOT NULL UNIQUE,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    faculty TEXT NOT NULL,
    embedding BLOB,
    model_version TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS access_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER REFERENCES identities(id) ON DELETE SET NULL,
    student_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    action TEXT NOT NULL CHECK (action IN ('Entry', 'Exit')),
    location TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_events_timestamp ON access_events(timestamp);
";

/// Bound on how long a call waits for a competing writer.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// One SQLite connection implementing both store seams.
///
/// The daemon opens one per owner (registry, event log) on the same file.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(unavailable)?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self { conn })
    }
}

impl IdentityStore for SqliteStore {
    fn create(&self, identity: &NewIdentity) -> Result<i64, StoreError> {
        let form = &identity.form;
        let result = self.conn.execute(
            "INSERT INTO identities (
                student_id, first_name, last_name, faculty, embedding, model_version, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                form.student_id,
                form.first_name,
                form.last_name,
                form.faculty,
                embedding_to_blob(&identity.embedding),
                identity.embedding.model_version,
                identity.created_at.timestamp_micros(),
            ],
        );

        match result {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(StoreError::Duplicate(form.student_id.clone()))
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    fn read_all_with_embedding(&self) -> Result<Vec<Identity>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, student_id, first_name, last_name, faculty, created_at,
                        embedding, model_version
                 FROM identities
                 WHERE embedding IS NOT NULL
                 ORDER BY id",
            )
            .map_err(unavailable)?;

        let identities = stmt
            .query_map([], |row| {
                let blob: Vec<u8> = row.get(6)?;
                let values = blob_to_values(&blob)
                    .ok_or_else(|| conversion_error(6, Type::Blob, "embedding blob length"))?;
                Ok(Identity {
                    id: row.get(0)?,
                    student_id: row.get(1)?,
                    first_name: row.get(2)?,
                    last_name: row.get(3)?,
                    faculty: row.get(4)?,
                    created_at: micros_to_datetime(row.get(5)?)
                        .ok_or_else(|| conversion_error(5, Type::Integer, "created_at"))?,
                    embedding: Some(Embedding {
                        values,
                        model_version: row.get(7)?,
                    }),
                })
            })
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;

        Ok(identities)
    }

    fn read_summaries(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, student_id, first_name, last_name, faculty, created_at
                 FROM identities
                 ORDER BY id DESC",
            )
            .map_err(unavailable)?;

        let summaries = stmt
            .query_map([], summary_from_row)
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;

        Ok(summaries)
    }

    fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM identities WHERE id = ?1", params![id])
            .map_err(unavailable)?;
        Ok(changed > 0)
    }
}

impl EventStore for SqliteStore {
    fn append(&self, event: NewAccessEvent) -> Result<AccessEvent, StoreError> {
        self.conn
            .execute(
                "INSERT INTO access_events (
                    identity_id, student_id, display_name, action, location, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.identity_id,
                    event.student_id,
                    event.display_name,
                    event.action.as_str(),
                    event.location,
                    event.timestamp.timestamp_micros(),
                ],
            )
            .map_err(unavailable)?;

        Ok(AccessEvent::from_new(self.conn.last_insert_rowid(), event))
    }

    fn read_recent(&self, limit: usize) -> Result<Vec<AccessEvent>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, identity_id, student_id, display_name, action, location, timestamp
                 FROM access_events
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?1",
            )
            .map_err(unavailable)?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let events = stmt
            .query_map(params![limit], event_from_row)
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;

        Ok(events)
    }
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<IdentitySummary> {
    Ok(IdentitySummary {
        id: row.get(0)?,
        student_id: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        faculty: row.get(4)?,
        created_at: micros_to_datetime(row.get(5)?)
            .ok_or_else(|| conversion_error(5, Type::Integer, "created_at"))?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AccessEvent> {
    let action: String = row.get(4)?;
    Ok(AccessEvent {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        student_id: row.get(2)?,
        display_name: row.get(3)?,
        action: action
            .parse::<Action>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        location: row.get(5)?,
        timestamp: micros_to_datetime(row.get(6)?)
            .ok_or_else(|| conversion_error(6, Type::Integer, "timestamp"))?,
    })
}

fn embedding_to_blob(embedding: &Embedding) -> Vec<u8> {
    embedding
        .values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn blob_to_values(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

fn conversion_error(column: usize, ty: Type, what: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, ty, format!("invalid {what}").into())
}

fn unavailable(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}
