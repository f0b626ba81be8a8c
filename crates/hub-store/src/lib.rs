//! SQLite-backed persistence for users, devices, skills, sessions, and
//! messages.
//!
//! A single connection wrapped in a `Mutex` is sufficient for a
//! single-node deployment; the write load here is request-serialized
//! anyway (message appends are already locked per-session one level up).
//! A connection pool would be the next step for a multi-node Hub.

pub mod devices;
pub mod messages;
pub mod models;
pub mod schema;
pub mod sessions;
pub mod skills;
pub mod users;

use std::path::Path;
use std::sync::Mutex;

use hub_domain::error::{Error, Result};
use rusqlite::Connection;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory database, for tests in this crate and in the crates
    /// that build on it.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Convert a `rusqlite::Error` into the shared domain error type. Centralized
/// here so repo modules don't each decide how much detail to keep.
pub fn db_err(e: rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Error::NotFound("row not found".to_string()),
        other => Error::Internal(format!("sqlite: {other}")),
    }
}
