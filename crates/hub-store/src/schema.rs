//! Idempotent schema creation plus additive column migrations. The schema
//! is plain SQL with nullable foreign keys rather than engine-specific
//! constraints, so it isn't tied to SQLite's particular enforcement quirks.

use hub_domain::error::Result;
use rusqlite::Connection;

use crate::db_err;

pub fn init(conn: &Connection) -> Result<()> {
    create_users_table(conn)?;
    create_devices_table(conn)?;
    create_skills_table(conn)?;
    create_sessions_table(conn)?;
    create_messages_table(conn)?;
    migrate_additive_columns(conn)?;
    Ok(())
}

fn create_users_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY NOT NULL,
            username      TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_admin      INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            last_login    TEXT
        );",
    )
    .map_err(db_err)
}

fn create_devices_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS devices (
            id            TEXT PRIMARY KEY NOT NULL,
            user_id       TEXT NOT NULL REFERENCES users(id),
            display_name  TEXT NOT NULL,
            hashed_token  TEXT NOT NULL,
            is_active     INTEGER NOT NULL DEFAULT 1,
            last_seen     TEXT,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_devices_user ON devices (user_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_token ON devices (hashed_token);",
    )
    .map_err(db_err)
}

fn create_skills_table(conn: &Connection) -> Result<()> {
    // UNIQUE(device_id, class_name, method_name) backs the idempotent
    // register-replaces-full-set semantics.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS skills (
            id             TEXT PRIMARY KEY NOT NULL,
            device_id      TEXT NOT NULL REFERENCES devices(id),
            class_name     TEXT NOT NULL,
            method_name    TEXT NOT NULL,
            signature      TEXT NOT NULL,
            docstring      TEXT NOT NULL DEFAULT '',
            last_heartbeat TEXT NOT NULL,
            created_at     TEXT NOT NULL,
            UNIQUE(device_id, class_name, method_name)
        );
        CREATE INDEX IF NOT EXISTS idx_skills_device ON skills (device_id);",
    )
    .map_err(db_err)
}

fn create_sessions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id            TEXT PRIMARY KEY NOT NULL,
            device_id     TEXT NOT NULL REFERENCES devices(id),
            user_id       TEXT NOT NULL REFERENCES users(id),
            title         TEXT NOT NULL DEFAULT '',
            is_active     INTEGER NOT NULL DEFAULT 1,
            created_at    TEXT NOT NULL,
            last_activity TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions (user_id, last_activity);",
    )
    .map_err(db_err)
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT NOT NULL REFERENCES sessions(id),
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, created_at, id);",
    )
    .map_err(db_err)
}

/// Detect columns a previous schema version didn't have and add them with
/// a default, rather than forcing a destructive migration. Safe to run on
/// every startup.
fn migrate_additive_columns(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "skills", "docstring", "TEXT NOT NULL DEFAULT ''")?;
    add_column_if_missing(conn, "sessions", "title", "TEXT NOT NULL DEFAULT ''")?;
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(db_err)?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(db_err)?
        .collect::<rusqlite::Result<_>>()
        .map_err(db_err)?;

    if !existing.iter().any(|c| c == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))
            .map_err(db_err)?;
    }
    Ok(())
}
