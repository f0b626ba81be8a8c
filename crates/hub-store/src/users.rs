use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use hub_domain::error::Result;

use crate::db_err;
use crate::models::User;

const USER_SELECT_SQL: &str =
    "SELECT id, username, password_hash, is_admin, created_at, last_login FROM users";

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        is_admin: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
        last_login: row.get(5)?,
    })
}

/// Count users; used by `/auth/setup` to refuse once any user exists.
pub fn count_users(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
        .map_err(db_err)
}

pub fn create_user(
    conn: &Connection,
    id: &str,
    username: &str,
    password_hash: &str,
    is_admin: bool,
) -> Result<User> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO users (id, username, password_hash, is_admin, created_at, last_login)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
        params![id, username, password_hash, is_admin as i64, now],
    )
    .map_err(db_err)?;

    Ok(User {
        id: id.to_string(),
        username: username.to_string(),
        password_hash: password_hash.to_string(),
        is_admin,
        created_at: now,
        last_login: None,
    })
}

pub fn get_user(conn: &Connection, id: &str) -> Result<Option<User>> {
    conn.query_row(
        &format!("{USER_SELECT_SQL} WHERE id = ?1"),
        params![id],
        row_to_user,
    )
    .optional()
    .map_err(db_err)
}

pub fn get_user_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    conn.query_row(
        &format!("{USER_SELECT_SQL} WHERE username = ?1"),
        params![username],
        row_to_user,
    )
    .optional()
    .map_err(db_err)
}

pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn
        .prepare(&format!("{USER_SELECT_SQL} ORDER BY created_at"))
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], row_to_user)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

pub fn delete_user(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM users WHERE id = ?1", params![id])
        .map_err(db_err)?;
    Ok(())
}

pub fn record_login(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET last_login = ?2 WHERE id = ?1",
        params![id, Utc::now()],
    )
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init(&conn).unwrap();
        conn
    }

    #[test]
    fn create_and_fetch_user() {
        let conn = test_conn();
        assert_eq!(count_users(&conn).unwrap(), 0);

        create_user(&conn, "u1", "alice", "hash", true).unwrap();
        assert_eq!(count_users(&conn).unwrap(), 1);

        let fetched = get_user_by_username(&conn, "alice").unwrap().unwrap();
        assert_eq!(fetched.id, "u1");
        assert!(fetched.is_admin);
    }

    #[test]
    fn unknown_username_returns_none() {
        let conn = test_conn();
        assert!(get_user_by_username(&conn, "nobody").unwrap().is_none());
    }

    #[test]
    fn username_uniqueness_is_enforced() {
        let conn = test_conn();
        create_user(&conn, "u1", "alice", "hash", false).unwrap();
        let err = create_user(&conn, "u2", "alice", "hash2", false);
        assert!(err.is_err());
    }
}
