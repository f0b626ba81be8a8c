use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use hub_domain::error::Result;

use crate::db_err;
use crate::models::Session;

const SESSION_SELECT_SQL: &str =
    "SELECT id, device_id, user_id, title, is_active, created_at, last_activity FROM sessions";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        device_id: row.get(1)?,
        user_id: row.get(2)?,
        title: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        last_activity: row.get(6)?,
    })
}

pub fn create_session(
    conn: &Connection,
    id: &str,
    device_id: &str,
    user_id: &str,
) -> Result<Session> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO sessions (id, device_id, user_id, title, is_active, created_at, last_activity)
         VALUES (?1, ?2, ?3, '', 1, ?4, ?4)",
        params![id, device_id, user_id, now],
    )
    .map_err(db_err)?;

    Ok(Session {
        id: id.to_string(),
        device_id: device_id.to_string(),
        user_id: user_id.to_string(),
        title: String::new(),
        is_active: true,
        created_at: now,
        last_activity: now,
    })
}

pub fn get_session(conn: &Connection, id: &str) -> Result<Option<Session>> {
    conn.query_row(
        &format!("{SESSION_SELECT_SQL} WHERE id = ?1"),
        params![id],
        row_to_session,
    )
    .optional()
    .map_err(db_err)
}

/// Sessions for a user, most recently active first, capped at `limit`.
pub fn list_for_user(conn: &Connection, user_id: &str, limit: i64) -> Result<Vec<Session>> {
    let mut stmt = conn
        .prepare(&format!(
            "{SESSION_SELECT_SQL} WHERE user_id = ?1 ORDER BY last_activity DESC LIMIT ?2"
        ))
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![user_id, limit], row_to_session)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Set the title once, typically derived from the first user message.
/// Called unconditionally; callers only invoke it while the title is
/// still empty.
pub fn set_title(conn: &Connection, id: &str, title: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET title = ?2 WHERE id = ?1",
        params![id, title],
    )
    .map_err(db_err)?;
    Ok(())
}

pub fn touch_activity(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET last_activity = ?2 WHERE id = ?1",
        params![id, Utc::now()],
    )
    .map_err(db_err)?;
    Ok(())
}

pub fn delete_session(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM messages WHERE session_id = ?1", params![id])
        .map_err(db_err)?;
    conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])
        .map_err(db_err)?;
    Ok(())
}

/// Mark sessions idle for longer than `idle_secs` as inactive. Returns the
/// ids that were flipped, so the caller can log or trace what it swept.
pub fn sweep_idle(conn: &Connection, idle_secs: u64) -> Result<Vec<String>> {
    let cutoff = Utc::now() - chrono::Duration::seconds(idle_secs as i64);
    let mut stmt = conn
        .prepare("SELECT id FROM sessions WHERE is_active = 1 AND last_activity < ?1")
        .map_err(db_err)?;
    let ids = stmt
        .query_map(params![cutoff], |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;

    conn.execute(
        "UPDATE sessions SET is_active = 0 WHERE is_active = 1 AND last_activity < ?1",
        params![cutoff],
    )
    .map_err(db_err)?;

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::create_device;
    use crate::schema;
    use crate::users::create_user;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init(&conn).unwrap();
        create_user(&conn, "u1", "alice", "h", false).unwrap();
        create_device(&conn, "d1", "u1", "Kitchen", "tok1").unwrap();
        conn
    }

    #[test]
    fn create_and_fetch_round_trips() {
        let conn = seeded();
        let s = create_session(&conn, "s1", "d1", "u1").unwrap();
        assert_eq!(s.title, "");
        let fetched = get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(fetched.device_id, "d1");
    }

    #[test]
    fn list_orders_by_last_activity_descending() {
        let conn = seeded();
        create_session(&conn, "s1", "d1", "u1").unwrap();
        create_session(&conn, "s2", "d1", "u1").unwrap();
        touch_activity(&conn, "s1").unwrap();

        let listed = list_for_user(&conn, "u1", 10).unwrap();
        assert_eq!(listed[0].id, "s1");
    }

    #[test]
    fn set_title_persists() {
        let conn = seeded();
        create_session(&conn, "s1", "d1", "u1").unwrap();
        set_title(&conn, "s1", "Turn off the kitchen lights").unwrap();
        let fetched = get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(fetched.title, "Turn off the kitchen lights");
    }

    #[test]
    fn sweep_idle_deactivates_and_reports_stale_sessions() {
        let conn = seeded();
        create_session(&conn, "s1", "d1", "u1").unwrap();
        create_session(&conn, "s2", "d1", "u1").unwrap();
        conn.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE id = 's1'",
            params![Utc::now() - chrono::Duration::seconds(3600)],
        )
        .unwrap();

        let swept = sweep_idle(&conn, 900).unwrap();
        assert_eq!(swept, vec!["s1".to_string()]);
        assert!(!get_session(&conn, "s1").unwrap().unwrap().is_active);
        assert!(get_session(&conn, "s2").unwrap().unwrap().is_active);
    }

    #[test]
    fn sweep_idle_is_idempotent() {
        let conn = seeded();
        create_session(&conn, "s1", "d1", "u1").unwrap();
        conn.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE id = 's1'",
            params![Utc::now() - chrono::Duration::seconds(3600)],
        )
        .unwrap();

        assert_eq!(sweep_idle(&conn, 900).unwrap().len(), 1);
        assert!(sweep_idle(&conn, 900).unwrap().is_empty());
    }

    #[test]
    fn delete_cascades_messages() {
        let conn = seeded();
        create_session(&conn, "s1", "d1", "u1").unwrap();
        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at) VALUES ('s1', 'user', 'hi', ?1)",
            params![Utc::now()],
        )
        .unwrap();

        delete_session(&conn, "s1").unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages WHERE session_id = 's1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
