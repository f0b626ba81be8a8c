use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use hub_domain::error::Result;

use crate::db_err;
use crate::models::Skill;

const SKILL_SELECT_SQL: &str = "SELECT id, device_id, class_name, method_name, signature, docstring, last_heartbeat, created_at FROM skills";

fn row_to_skill(row: &rusqlite::Row<'_>) -> rusqlite::Result<Skill> {
    Ok(Skill {
        id: row.get(0)?,
        device_id: row.get(1)?,
        class_name: row.get(2)?,
        method_name: row.get(3)?,
        signature: row.get(4)?,
        docstring: row.get(5)?,
        last_heartbeat: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub struct NewSkill {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
    pub docstring: String,
}

/// Idempotent full replacement: delete every row for the device, insert
/// the new set, set `last_heartbeat = now` on all of them.
pub fn replace_skills(
    conn: &mut Connection,
    device_id: &str,
    skills: &[NewSkill],
) -> Result<Vec<Skill>> {
    let now = Utc::now();
    let tx = conn.transaction().map_err(db_err)?;
    tx.execute("DELETE FROM skills WHERE device_id = ?1", params![device_id])
        .map_err(db_err)?;

    let mut inserted = Vec::with_capacity(skills.len());
    for s in skills {
        let id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO skills (id, device_id, class_name, method_name, signature, docstring, last_heartbeat, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![id, device_id, s.class_name, s.method_name, s.signature, s.docstring, now],
        )
        .map_err(db_err)?;
        inserted.push(Skill {
            id,
            device_id: device_id.to_string(),
            class_name: s.class_name.clone(),
            method_name: s.method_name.clone(),
            signature: s.signature.clone(),
            docstring: s.docstring.clone(),
            last_heartbeat: now,
            created_at: now,
        });
    }
    tx.commit().map_err(db_err)?;
    Ok(inserted)
}

/// Bump `last_heartbeat` for every skill row owned by a device. Returns
/// the number of rows touched.
pub fn heartbeat(conn: &Connection, device_id: &str) -> Result<usize> {
    let n = conn
        .execute(
            "UPDATE skills SET last_heartbeat = ?2 WHERE device_id = ?1",
            params![device_id, Utc::now()],
        )
        .map_err(db_err)?;
    Ok(n)
}

/// All skills belonging to a user's devices whose heartbeat is within
/// `ttl`. Channel-openness (the other half of "live") is layered on top
/// by the caller, since the DB has no notion of an open socket.
pub fn list_fresh_for_user(
    conn: &Connection,
    user_id: &str,
    ttl: Duration,
) -> Result<Vec<(Skill, String)>> {
    let cutoff: DateTime<Utc> = Utc::now() - ttl;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.device_id, s.class_name, s.method_name, s.signature, s.docstring,
                    s.last_heartbeat, s.created_at, d.display_name
             FROM skills s JOIN devices d ON d.id = s.device_id
             WHERE d.user_id = ?1 AND s.last_heartbeat >= ?2",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![user_id, cutoff], |row| {
            Ok((
                Skill {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    class_name: row.get(2)?,
                    method_name: row.get(3)?,
                    signature: row.get(4)?,
                    docstring: row.get(5)?,
                    last_heartbeat: row.get(6)?,
                    created_at: row.get(7)?,
                },
                row.get::<_, String>(8)?,
            ))
        })
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Delete skill rows whose heartbeat is older than `ttl`. Run by a
/// low-frequency sweeper; also enforced on every read via
/// [`list_fresh_for_user`].
pub fn sweep_expired(conn: &Connection, ttl: Duration) -> Result<usize> {
    let cutoff: DateTime<Utc> = Utc::now() - ttl;
    let n = conn
        .execute("DELETE FROM skills WHERE last_heartbeat < ?1", params![cutoff])
        .map_err(db_err)?;
    Ok(n)
}

/// One ranked hit from [`search`].
#[derive(Debug, Clone)]
pub struct SkillHit {
    pub skill: Skill,
    pub device_id: String,
    pub device_display_name: String,
    pub score: i32,
}

/// Rank a user's live skills against a free-text query: exact match on
/// `method_name` (+10), exact on `class_name` (+5), substring on
/// `method_name` (+3), substring on `class_name` (+2), substring on
/// `docstring` (+1). Ties go to `current_device_id` first, then
/// alphabetically by class then method name. Zero-score rows are dropped.
pub fn search(
    conn: &Connection,
    user_id: &str,
    query: &str,
    ttl: Duration,
    current_device_id: Option<&str>,
) -> Result<Vec<SkillHit>> {
    let q = query.to_lowercase();
    let mut hits: Vec<SkillHit> = list_fresh_for_user(conn, user_id, ttl)?
        .into_iter()
        .filter_map(|(skill, display_name)| {
            let method = skill.method_name.to_lowercase();
            let class = skill.class_name.to_lowercase();
            let doc = skill.docstring.to_lowercase();

            let mut score = 0;
            if method == q {
                score += 10;
            } else if method.contains(&q) {
                score += 3;
            }
            if class == q {
                score += 5;
            } else if class.contains(&q) {
                score += 2;
            }
            if doc.contains(&q) {
                score += 1;
            }

            if score == 0 {
                None
            } else {
                Some(SkillHit { device_id: skill.device_id.clone(), device_display_name: display_name, skill, score })
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| {
                let a_current = current_device_id == Some(a.device_id.as_str());
                let b_current = current_device_id == Some(b.device_id.as_str());
                b_current.cmp(&a_current)
            })
            .then_with(|| a.skill.class_name.cmp(&b.skill.class_name))
            .then_with(|| a.skill.method_name.cmp(&b.skill.method_name))
    });
    Ok(hits)
}

/// Look up a single skill by `ClassName.method_name` among a user's live
/// devices, for `describe_function`.
pub fn describe(
    conn: &Connection,
    user_id: &str,
    class_name: &str,
    method_name: &str,
    ttl: Duration,
) -> Result<Option<SkillHit>> {
    Ok(list_fresh_for_user(conn, user_id, ttl)?
        .into_iter()
        .find(|(skill, _)| skill.class_name == class_name && skill.method_name == method_name)
        .map(|(skill, display_name)| SkillHit {
            device_id: skill.device_id.clone(),
            device_display_name: display_name,
            skill,
            score: 0,
        }))
}

pub fn list_all_raw(conn: &Connection) -> Result<Vec<Skill>> {
    let mut stmt = conn.prepare(SKILL_SELECT_SQL).map_err(db_err)?;
    let rows = stmt
        .query_map([], row_to_skill)
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
    use crate::users::create_user;

    fn seeded() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        schema::init(&conn).unwrap();
        create_user(&conn, "u1", "alice", "h", false).unwrap();
        create_device(&conn, "d1", "u1", "Kitchen", "tok1").unwrap();
        let _ = &mut conn;
        conn
    }

    #[test]
    fn replace_is_idempotent() {
        let mut conn = seeded();
        let set = vec![NewSkill {
            class_name: "MusicSkill".into(),
            method_name: "set_volume".into(),
            signature: "set_volume(volume: int)".into(),
            docstring: "Set playback volume".into(),
        }];
        let first = replace_skills(&mut conn, "d1", &set).unwrap();
        assert_eq!(first.len(), 1);

        let second = replace_skills(&mut conn, "d1", &set).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(list_all_raw(&conn).unwrap().len(), 1);
    }

    #[test]
    fn replace_with_subset_removes_difference() {
        let mut conn = seeded();
        let two = vec![
            NewSkill {
                class_name: "MusicSkill".into(),
                method_name: "set_volume".into(),
                signature: "set_volume(volume: int)".into(),
                docstring: String::new(),
            },
            NewSkill {
                class_name: "MusicSkill".into(),
                method_name: "pause".into(),
                signature: "pause()".into(),
                docstring: String::new(),
            },
        ];
        replace_skills(&mut conn, "d1", &two).unwrap();
        assert_eq!(list_all_raw(&conn).unwrap().len(), 2);

        let one = vec![two[0].clone_for_test()];
        replace_skills(&mut conn, "d1", &one).unwrap();
        assert_eq!(list_all_raw(&conn).unwrap().len(), 1);
    }

    impl NewSkill {
        fn clone_for_test(&self) -> NewSkill {
            NewSkill {
                class_name: self.class_name.clone(),
                method_name: self.method_name.clone(),
                signature: self.signature.clone(),
                docstring: self.docstring.clone(),
            }
        }
    }

    #[test]
    fn heartbeat_bumps_all_rows_for_device() {
        let mut conn = seeded();
        let set = vec![NewSkill {
            class_name: "A".into(),
            method_name: "b".into(),
            signature: "b()".into(),
            docstring: String::new(),
        }];
        replace_skills(&mut conn, "d1", &set).unwrap();
        assert_eq!(heartbeat(&conn, "d1").unwrap(), 1);
    }

    #[test]
    fn stale_skills_are_excluded_from_fresh_list() {
        let mut conn = seeded();
        let set = vec![NewSkill {
            class_name: "A".into(),
            method_name: "b".into(),
            signature: "b()".into(),
            docstring: String::new(),
        }];
        replace_skills(&mut conn, "d1", &set).unwrap();

        // Fresh: TTL of an hour comfortably covers "just inserted".
        let fresh = list_fresh_for_user(&conn, "u1", Duration::hours(1)).unwrap();
        assert_eq!(fresh.len(), 1);

        // Stale: TTL of zero excludes everything.
        let stale = list_fresh_for_user(&conn, "u1", Duration::zero()).unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn search_ranks_exact_method_above_substring_class() {
        let mut conn = seeded();
        let set = vec![
            NewSkill {
                class_name: "MusicSkill".into(),
                method_name: "pause".into(),
                signature: "pause()".into(),
                docstring: "Stop playback".into(),
            },
            NewSkill {
                class_name: "PauseMenu".into(),
                method_name: "open".into(),
                signature: "open()".into(),
                docstring: String::new(),
            },
        ];
        replace_skills(&mut conn, "d1", &set).unwrap();

        let hits = search(&conn, "u1", "pause", Duration::hours(1), None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].skill.method_name, "pause");
        assert_eq!(hits[1].skill.class_name, "PauseMenu");
    }

    #[test]
    fn search_ties_prefer_current_device() {
        let mut conn = seeded();
        create_device(&conn, "d2", "u1", "Office", "tok2").unwrap();
        replace_skills(
            &mut conn,
            "d1",
            &[NewSkill {
                class_name: "A".into(),
                method_name: "ping".into(),
                signature: "ping()".into(),
                docstring: String::new(),
            }],
        )
        .unwrap();
        replace_skills(
            &mut conn,
            "d2",
            &[NewSkill {
                class_name: "A".into(),
                method_name: "ping".into(),
                signature: "ping()".into(),
                docstring: String::new(),
            }],
        )
        .unwrap();

        let hits = search(&conn, "u1", "ping", Duration::hours(1), Some("d2")).unwrap();
        assert_eq!(hits[0].device_id, "d2");
    }

    #[test]
    fn describe_finds_by_class_and_method() {
        let mut conn = seeded();
        replace_skills(
            &mut conn,
            "d1",
            &[NewSkill {
                class_name: "MusicSkill".into(),
                method_name: "set_volume".into(),
                signature: "set_volume(volume: int)".into(),
                docstring: String::new(),
            }],
        )
        .unwrap();

        let hit = describe(&conn, "u1", "MusicSkill", "set_volume", Duration::hours(1))
            .unwrap()
            .unwrap();
        assert_eq!(hit.device_display_name, "Kitchen");
        assert!(describe(&conn, "u1", "MusicSkill", "nope", Duration::hours(1))
            .unwrap()
            .is_none());
    }
}
