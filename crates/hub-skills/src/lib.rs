//! The skill registry: what each device claims it can do, and how fresh
//! that claim is.
//!
//! A skill is "live" only when both halves agree: the database row's
//! heartbeat is within the TTL, and the device's channel is presently
//! `OPEN`. This crate owns the first half; the second is supplied by the
//! caller through [`DevicePresence`] so that this crate doesn't need to
//! depend on whatever transport the Spoke channel happens to use.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use hub_domain::error::{Error, Result};
use hub_domain::trace::TraceEvent;
use hub_store::skills::{NewSkill, SkillHit};
use hub_store::Db;

/// Whether a device currently has an open Spoke channel. Implemented by
/// whatever owns that channel registry.
pub trait DevicePresence: Send + Sync {
    fn is_online(&self, device_id: &str) -> bool;
}

/// A `DevicePresence` that always answers yes — useful for tests and for
/// describing skills before any channel layer exists.
pub struct AlwaysOnline;

impl DevicePresence for AlwaysOnline {
    fn is_online(&self, _device_id: &str) -> bool {
        true
    }
}

pub struct RegisterResult {
    pub registered: usize,
    pub resolved_display_name: String,
}

pub struct SkillRegistry {
    db: Arc<Db>,
    ttl: Duration,
}

impl SkillRegistry {
    pub fn new(db: Arc<Db>, ttl_secs: i64) -> Self {
        Self {
            db,
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Idempotent full replacement of a device's skill set.
    pub fn register(&self, device_id: &str, skills: Vec<NewSkill>) -> Result<RegisterResult> {
        let mut conn = self.db.lock();
        let inserted = hub_store::skills::replace_skills(&mut conn, device_id, &skills)?;
        let device = hub_store::devices::get_device(&conn, device_id)?
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;

        TraceEvent::SkillsRegistered {
            device_id: device_id.to_string(),
            count: inserted.len(),
        }
        .emit();

        Ok(RegisterResult {
            registered: inserted.len(),
            resolved_display_name: device.display_name,
        })
    }

    /// Bump the heartbeat on all of a device's skill rows. Called both on
    /// an explicit `heartbeat` frame and implicitly on any other traffic
    /// over the channel.
    pub fn heartbeat(&self, device_id: &str) -> Result<usize> {
        let conn = self.db.lock();
        hub_store::skills::heartbeat(&conn, device_id)
    }

    pub fn search(
        &self,
        user_id: &str,
        query: &str,
        current_device_id: Option<&str>,
        presence: &dyn DevicePresence,
    ) -> Result<Vec<SkillHit>> {
        let conn = self.db.lock();
        let hits = hub_store::skills::search(&conn, user_id, query, self.ttl, current_device_id)?;
        let live: Vec<SkillHit> = hits
            .into_iter()
            .filter(|h| presence.is_online(&h.device_id))
            .collect();

        TraceEvent::SkillSearch {
            user_id: user_id.to_string(),
            query: query.to_string(),
            hits: live.len(),
        }
        .emit();

        Ok(live)
    }

    /// `path` is `"DeviceName.ClassName.method"` when a user has more than
    /// one device exposing the same (class, method), or plain
    /// `"ClassName.method"` otherwise.
    pub fn describe(
        &self,
        user_id: &str,
        path: &str,
        presence: &dyn DevicePresence,
    ) -> Result<Option<SkillHit>> {
        let (device_filter, class_name, method_name) = parse_path(path)?;

        let conn = self.db.lock();
        let rows = hub_store::skills::list_fresh_for_user(&conn, user_id, self.ttl)?;
        let hit = rows
            .into_iter()
            .filter(|(skill, _)| skill.class_name == class_name && skill.method_name == method_name)
            .filter(|(_, display_name)| {
                device_filter.map_or(true, |d| d.eq_ignore_ascii_case(display_name))
            })
            .find(|(skill, _)| presence.is_online(&skill.device_id));

        Ok(hit.map(|(skill, device_display_name)| {
            let device_id = skill.device_id.clone();
            SkillHit {
                skill,
                device_id,
                device_display_name,
                score: 0,
            }
        }))
    }

    /// Delete skill rows past their TTL. Meant to be driven by a
    /// low-frequency `tokio::time::interval` loop in the process that
    /// owns this registry.
    pub fn sweep_expired(&self) -> Result<usize> {
        let conn = self.db.lock();
        hub_store::skills::sweep_expired(&conn, self.ttl)
    }
}

fn parse_path(path: &str) -> Result<(Option<&str>, &str, &str)> {
    let parts: Vec<&str> = path.split('.').collect();
    match parts.as_slice() {
        [device, class, method] => Ok((Some(*device), *class, *method)),
        [class, method] => Ok((None, *class, *method)),
        _ => Err(Error::ValidationFailed(format!(
            "expected \"Class.method\" or \"Device.Class.method\", got {path:?}"
        ))),
    }
}

/// Default interval between TTL sweeps, for callers wiring up the
/// background task.
pub fn default_sweep_interval() -> StdDuration {
    StdDuration::from_secs(300)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (SkillRegistry, String, String) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        {
            let conn = db.lock();
            hub_store::users::create_user(&conn, "u1", "alice", "hash", false).unwrap();
            hub_store::devices::create_device(&conn, "d1", "u1", "Kitchen", "tok1").unwrap();
        }
        (SkillRegistry::new(db, 1800), "u1".to_string(), "d1".to_string())
    }

    fn skill(class: &str, method: &str) -> NewSkill {
        NewSkill {
            class_name: class.to_string(),
            method_name: method.to_string(),
            signature: format!("{method}()"),
            docstring: String::new(),
        }
    }

    #[test]
    fn register_reports_resolved_display_name() {
        let (reg, _, device_id) = registry();
        let result = reg.register(&device_id, vec![skill("MusicSkill", "pause")]).unwrap();
        assert_eq!(result.registered, 1);
        assert_eq!(result.resolved_display_name, "Kitchen");
    }

    #[test]
    fn offline_devices_are_excluded_from_search() {
        let (reg, user_id, device_id) = registry();
        reg.register(&device_id, vec![skill("MusicSkill", "pause")]).unwrap();

        struct NoneOnline;
        impl DevicePresence for NoneOnline {
            fn is_online(&self, _: &str) -> bool {
                false
            }
        }

        assert!(reg.search(&user_id, "pause", None, &AlwaysOnline).unwrap().len() == 1);
        assert!(reg.search(&user_id, "pause", None, &NoneOnline).unwrap().is_empty());
    }

    #[test]
    fn describe_resolves_two_and_three_segment_paths() {
        let (reg, user_id, device_id) = registry();
        reg.register(&device_id, vec![skill("MusicSkill", "pause")]).unwrap();

        let short = reg.describe(&user_id, "MusicSkill.pause", &AlwaysOnline).unwrap();
        assert!(short.is_some());

        let qualified = reg
            .describe(&user_id, "Kitchen.MusicSkill.pause", &AlwaysOnline)
            .unwrap();
        assert!(qualified.is_some());

        let wrong_device = reg
            .describe(&user_id, "Office.MusicSkill.pause", &AlwaysOnline)
            .unwrap();
        assert!(wrong_device.is_none());
    }

    #[test]
    fn describe_rejects_malformed_path() {
        let (reg, user_id, _) = registry();
        assert!(reg.describe(&user_id, "justonepart", &AlwaysOnline).is_err());
    }

    #[test]
    fn sweep_removes_rows_past_ttl() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        {
            let conn = db.lock();
            hub_store::users::create_user(&conn, "u1", "alice", "hash", false).unwrap();
            hub_store::devices::create_device(&conn, "d1", "u1", "Kitchen", "tok1").unwrap();
        }
        let reg = SkillRegistry::new(db, 0); // zero-second TTL: everything is immediately stale
        reg.register("d1", vec![skill("A", "b")]).unwrap();
        assert_eq!(reg.sweep_expired().unwrap(), 1);
    }
}
