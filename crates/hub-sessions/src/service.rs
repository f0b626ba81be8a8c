//! CRUD over Sessions and Messages, plus idle-timeout sweeping.
//!
//! Sessions are created explicitly by device+user (there is no cross-channel
//! session-key computation here — a Spoke device and the user it belongs to
//! fully determine a session's owner). The one piece of derived state is the
//! title: the first user message in a session becomes its title, truncated
//! and cleaned up by [`crate::title::derive_title`].

use std::sync::Arc;

use hub_domain::config::SessionsConfig;
use hub_domain::error::Result;
use hub_domain::trace::TraceEvent;
use hub_store::models::{Message, MessageRole, Session};
use hub_store::{messages, sessions, Db};

use crate::title::derive_title;

pub struct SessionService {
    db: Arc<Db>,
    config: SessionsConfig,
}

impl SessionService {
    pub fn new(db: Arc<Db>, config: SessionsConfig) -> Self {
        Self { db, config }
    }

    pub fn create(&self, device_id: &str, user_id: &str) -> Result<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.db.lock();
        let session = sessions::create_session(&conn, &id, device_id, user_id)?;
        TraceEvent::SessionCreated { session_id: session.id.clone(), device_id: device_id.to_owned() }.emit();
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.db.lock();
        sessions::get_session(&conn, id)
    }

    /// Sessions for a user, most recently active first, bounded by `limit`.
    pub fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Session>> {
        let conn = self.db.lock();
        sessions::list_for_user(&conn, user_id, limit)
    }

    /// Explicit rename, e.g. via a user-facing edit — always overwrites,
    /// unlike the auto-title derived from the first message.
    pub fn rename(&self, id: &str, title: &str) -> Result<()> {
        let conn = self.db.lock();
        sessions::set_title(&conn, id, title)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.db.lock();
        sessions::delete_session(&conn, id)
    }

    pub fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.db.lock();
        messages::list_for_session(&conn, session_id)
    }

    /// Append a message, touch the session's activity timestamp, and — the
    /// first time a user message lands in an untitled session — derive its
    /// title from that message.
    pub fn append_message(&self, session: &Session, role: MessageRole, content: &str) -> Result<Message> {
        let conn = self.db.lock();
        let message = messages::append(&conn, &session.id, role, content)?;
        sessions::touch_activity(&conn, &session.id)?;
        if role == MessageRole::User && session.title.is_empty() {
            let title = derive_title(content, self.config.title_max_chars);
            sessions::set_title(&conn, &session.id, &title)?;
        }
        Ok(message)
    }

    /// Mark sessions idle past the configured timeout as inactive. Intended
    /// to run on a periodic interval from the process driving this crate.
    pub fn sweep_idle(&self) -> Result<Vec<String>> {
        let conn = self.db.lock();
        let swept = sessions::sweep_idle(&conn, self.config.idle_timeout_secs)?;
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "swept idle sessions");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_store::devices::create_device;
    use hub_store::users::create_user;

    fn seeded() -> (Arc<Db>, SessionService) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        {
            let conn = db.lock();
            create_user(&conn, "u1", "alice", "h", false).unwrap();
            create_device(&conn, "d1", "u1", "Kitchen", "tok1").unwrap();
        }
        let svc = SessionService::new(db.clone(), SessionsConfig { idle_timeout_secs: 900, title_max_chars: 20 });
        (db, svc)
    }

    #[test]
    fn create_and_get_round_trips() {
        let (_db, svc) = seeded();
        let session = svc.create("d1", "u1").unwrap();
        let fetched = svc.get(&session.id).unwrap().unwrap();
        assert_eq!(fetched.user_id, "u1");
        assert_eq!(fetched.title, "");
    }

    #[test]
    fn first_user_message_sets_title() {
        let (_db, svc) = seeded();
        let session = svc.create("d1", "u1").unwrap();
        svc.append_message(&session, MessageRole::User, "turn off the kitchen lights please").unwrap();

        let fetched = svc.get(&session.id).unwrap().unwrap();
        assert!(fetched.title.starts_with("turn off the kitchen"));
        assert!(fetched.title.ends_with('…'));
    }

    #[test]
    fn later_user_messages_do_not_overwrite_title() {
        let (_db, svc) = seeded();
        let session = svc.create("d1", "u1").unwrap();
        svc.append_message(&session, MessageRole::User, "first message here").unwrap();
        let after_first = svc.get(&session.id).unwrap().unwrap();

        svc.append_message(&after_first, MessageRole::User, "a completely different second message").unwrap();
        let after_second = svc.get(&session.id).unwrap().unwrap();
        assert_eq!(after_first.title, after_second.title);
    }

    #[test]
    fn assistant_message_does_not_set_title() {
        let (_db, svc) = seeded();
        let session = svc.create("d1", "u1").unwrap();
        svc.append_message(&session, MessageRole::Assistant, "hello, how can I help?").unwrap();
        let fetched = svc.get(&session.id).unwrap().unwrap();
        assert_eq!(fetched.title, "");
    }

    #[test]
    fn list_for_user_orders_by_activity() {
        let (db, svc) = seeded();
        let s1 = svc.create("d1", "u1").unwrap();
        let _s2 = svc.create("d1", "u1").unwrap();
        {
            let conn = db.lock();
            sessions::touch_activity(&conn, &s1.id).unwrap();
        }
        let listed = svc.list_for_user("u1", 10).unwrap();
        assert_eq!(listed[0].id, s1.id);
    }

    #[test]
    fn delete_removes_session() {
        let (_db, svc) = seeded();
        let session = svc.create("d1", "u1").unwrap();
        svc.delete(&session.id).unwrap();
        assert!(svc.get(&session.id).unwrap().is_none());
    }

    #[test]
    fn sweep_idle_deactivates_stale_sessions() {
        let (db, svc) = seeded();
        let session = svc.create("d1", "u1").unwrap();
        {
            let conn = db.lock();
            conn.execute(
                "UPDATE sessions SET last_activity = ?1 WHERE id = ?2",
                rusqlite::params![chrono::Utc::now() - chrono::Duration::hours(1), session.id],
            )
            .unwrap();
        }
        let swept = svc.sweep_idle().unwrap();
        assert_eq!(swept, vec![session.id]);
    }
}
