use chrono::Utc;
use rusqlite::{params, Connection};

use hub_domain::error::Result;

use crate::db_err;
use crate::models::{Message, MessageRole};

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::from_str(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

pub fn append(
    conn: &Connection,
    session_id: &str,
    role: MessageRole,
    content: &str,
) -> Result<Message> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![session_id, role.as_str(), content, now],
    )
    .map_err(db_err)?;
    let id = conn.last_insert_rowid();

    Ok(Message {
        id,
        session_id: session_id.to_string(),
        role,
        content: content.to_string(),
        created_at: now,
    })
}

/// Full transcript for a session, oldest first. `id` breaks ties between
/// rows that share a timestamp.
pub fn list_for_session(conn: &Connection, session_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, session_id, role, content, created_at FROM messages
             WHERE session_id = ?1 ORDER BY created_at, id",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![session_id], row_to_message)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::create_device;
    use crate::schema;
    use crate::sessions::create_session;
    use crate::users::create_user;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init(&conn).unwrap();
        create_user(&conn, "u1", "alice", "h", false).unwrap();
        create_device(&conn, "d1", "u1", "Kitchen", "tok1").unwrap();
        create_session(&conn, "s1", "d1", "u1").unwrap();
        conn
    }

    #[test]
    fn append_and_list_preserves_order() {
        let conn = seeded();
        append(&conn, "s1", MessageRole::User, "turn off the lights").unwrap();
        append(&conn, "s1", MessageRole::Assistant, "done").unwrap();

        let transcript = list_for_session(&conn, "s1").unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, MessageRole::User);
        assert_eq!(transcript[1].role, MessageRole::Assistant);
    }

    #[test]
    fn empty_session_has_empty_transcript() {
        let conn = seeded();
        assert!(list_for_session(&conn, "s1").unwrap().is_empty());
    }
}
