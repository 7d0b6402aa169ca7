//! SQLite persistence for port assignments
//!
//! Durable storage for the app -> port-pair mapping that survives restarts.
//! The UNIQUE constraints on the port columns are the second line of defense
//! behind the in-process allocator: if another coordinator instance races us
//! to a port, the insert fails and the caller retries with the next
//! candidate pair.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// One durable row per deployed application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentRecord {
    pub app_id: String,
    pub public_port: u16,
    pub canvas_port: u16,
    pub backend_host: String,
    pub backend_port: u16,
    pub created_at: String,
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                from = current_version,
                to = SCHEMA_VERSION,
                "Running database migrations"
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: assignment table with range-scoped port uniqueness.
    /// The two ranges are disjoint, so a column-level UNIQUE is equivalent
    /// to a (port, range) constraint.
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: port assignments");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS port_assignments (
                app_id TEXT PRIMARY KEY,
                public_port INTEGER NOT NULL UNIQUE,
                canvas_port INTEGER NOT NULL UNIQUE,
                backend_host TEXT NOT NULL,
                backend_port INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Persist an assignment. A uniqueness violation on either port column
    /// maps to `PortConflict` carrying the colliding port.
    pub fn insert_assignment(
        &self,
        app_id: &str,
        public_port: u16,
        canvas_port: u16,
        backend_host: &str,
        backend_port: u16,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let result = conn.execute(
            "INSERT INTO port_assignments
                 (app_id, public_port, canvas_port, backend_host, backend_port)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![app_id, public_port, canvas_port, backend_host, backend_port],
        );

        match result {
            Ok(_) => {
                debug!(app = app_id, public_port, canvas_port, "Assignment persisted");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, Some(msg)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                if msg.contains("canvas_port") {
                    Err(Error::PortConflict { port: canvas_port })
                } else if msg.contains("public_port") {
                    Err(Error::PortConflict { port: public_port })
                } else {
                    // app_id primary-key violation or similar
                    Err(rusqlite::Error::SqliteFailure(e, Some(msg)).into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an app's assignment. Idempotent; returns whether a row existed.
    pub fn delete_assignment(&self, app_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM port_assignments WHERE app_id = ?1",
            params![app_id],
        )?;
        Ok(affected > 0)
    }

    pub fn get_assignment(&self, app_id: &str) -> Result<Option<AssignmentRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT app_id, public_port, canvas_port, backend_host, backend_port, created_at
                 FROM port_assignments WHERE app_id = ?1",
                params![app_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All assignments in app_id order, for startup restore
    pub fn list_assignments(&self) -> Result<Vec<AssignmentRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT app_id, public_port, canvas_port, backend_host, backend_port, created_at
             FROM port_assignments ORDER BY app_id",
        )?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssignmentRecord> {
    Ok(AssignmentRecord {
        app_id: row.get(0)?,
        public_port: row.get(1)?,
        canvas_port: row.get(2)?,
        backend_host: row.get(3)?,
        backend_port: row.get(4)?,
        created_at: row.get(5)?,
    })
}
