use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use hub_domain::error::Result;

use crate::db_err;
use crate::models::Device;

const DEVICE_SELECT_SQL: &str =
    "SELECT id, user_id, display_name, hashed_token, is_active, last_seen, created_at FROM devices";

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        user_id: row.get(1)?,
        display_name: row.get(2)?,
        hashed_token: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        last_seen: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Resolve display-name collisions within one user's devices:
/// `"Kitchen"`, `"Kitchen"`, `"Kitchen"` becomes `"Kitchen"`, `"kitchen_2"`,
/// `"kitchen_3"`.
pub fn disambiguate_display_name(
    conn: &Connection,
    user_id: &str,
    requested: &str,
) -> Result<String> {
    let existing = list_for_user(conn, user_id)?;
    let normalized = requested.to_lowercase();
    let taken: std::collections::HashSet<String> = existing
        .iter()
        .map(|d| d.display_name.to_lowercase())
        .collect();

    if !taken.contains(&normalized) {
        return Ok(requested.to_string());
    }

    let mut n = 2;
    loop {
        let candidate = format!("{normalized}_{n}");
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        n += 1;
    }
}

pub fn create_device(
    conn: &Connection,
    id: &str,
    user_id: &str,
    display_name: &str,
    hashed_token: &str,
) -> Result<Device> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO devices (id, user_id, display_name, hashed_token, is_active, last_seen, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, NULL, ?5)",
        params![id, user_id, display_name, hashed_token, now],
    )
    .map_err(db_err)?;

    Ok(Device {
        id: id.to_string(),
        user_id: user_id.to_string(),
        display_name: display_name.to_string(),
        hashed_token: hashed_token.to_string(),
        is_active: true,
        last_seen: None,
        created_at: now,
    })
}

pub fn get_device(conn: &Connection, id: &str) -> Result<Option<Device>> {
    conn.query_row(
        &format!("{DEVICE_SELECT_SQL} WHERE id = ?1"),
        params![id],
        row_to_device,
    )
    .optional()
    .map_err(db_err)
}

pub fn get_by_hashed_token(conn: &Connection, hashed_token: &str) -> Result<Option<Device>> {
    conn.query_row(
        &format!("{DEVICE_SELECT_SQL} WHERE hashed_token = ?1 AND is_active = 1"),
        params![hashed_token],
        row_to_device,
    )
    .optional()
    .map_err(db_err)
}

pub fn list_for_user(conn: &Connection, user_id: &str) -> Result<Vec<Device>> {
    let mut stmt = conn
        .prepare(&format!("{DEVICE_SELECT_SQL} WHERE user_id = ?1 ORDER BY created_at"))
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![user_id], row_to_device)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Resolve a device by its (case-insensitive) display name within one
/// user's devices, for `python_exec` target resolution.
pub fn find_by_display_name(
    conn: &Connection,
    user_id: &str,
    display_name: &str,
) -> Result<Option<Device>> {
    Ok(list_for_user(conn, user_id)?
        .into_iter()
        .find(|d| d.display_name.eq_ignore_ascii_case(display_name)))
}

pub fn touch_last_seen(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE devices SET last_seen = ?2 WHERE id = ?1",
        params![id, Utc::now()],
    )
    .map_err(db_err)?;
    Ok(())
}

pub fn delete_device(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM skills WHERE device_id = ?1", params![id])
        .map_err(db_err)?;
    conn.execute("DELETE FROM devices WHERE id = ?1", params![id])
        .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use crate::users::create_user;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init(&conn).unwrap();
        create_user(&conn, "u1", "alice", "hash", false).unwrap();
        conn
    }

    #[test]
    fn disambiguation_suffixes_collisions() {
        let conn = test_conn();
        let n1 = disambiguate_display_name(&conn, "u1", "Kitchen").unwrap();
        assert_eq!(n1, "Kitchen");
        create_device(&conn, "d1", "u1", &n1, "tok1").unwrap();

        let n2 = disambiguate_display_name(&conn, "u1", "Kitchen").unwrap();
        assert_eq!(n2, "kitchen_2");
        create_device(&conn, "d2", "u1", &n2, "tok2").unwrap();

        let n3 = disambiguate_display_name(&conn, "u1", "Kitchen").unwrap();
        assert_eq!(n3, "kitchen_3");
    }

    #[test]
    fn disambiguation_is_case_insensitive() {
        let conn = test_conn();
        create_device(&conn, "d1", "u1", "Office", "tok1").unwrap();
        let n = disambiguate_display_name(&conn, "u1", "office").unwrap();
        assert_eq!(n, "office_2");
    }

    #[test]
    fn lookup_by_hashed_token_round_trips() {
        let conn = test_conn();
        create_device(&conn, "d1", "u1", "Living Room", "deadbeef").unwrap();
        let found = get_by_hashed_token(&conn, "deadbeef").unwrap().unwrap();
        assert_eq!(found.id, "d1");
    }

    #[test]
    fn find_by_display_name_is_case_insensitive() {
        let conn = test_conn();
        create_device(&conn, "d1", "u1", "Living Room", "tok1").unwrap();
        let found = find_by_display_name(&conn, "u1", "living room").unwrap().unwrap();
        assert_eq!(found.id, "d1");
        assert!(find_by_display_name(&conn, "u1", "Garage").unwrap().is_none());
    }
}
