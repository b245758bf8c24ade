//! Persistence layer: a single-writer SQLite store with an in-memory
//! name-to-container cache kept in lockstep with the rows.

mod models;

pub use models::{
    Alert, Container, ContainerState, Event, HealthStatus, Healthcheck, Role, Severity,
};

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
}

const CONTAINER_COLUMNS: &str = "id, name, container_id, image, image_tag, image_id, \
    created_at_container, registered_at, started_at, status, role, caps, read_only, \
    no_new_privileges, user, last_event_id, updated_at, present, health_status, \
    health_failing_streak, unhealthy_since, restart_loop, restart_streak, \
    restart_loop_since, healthcheck";

const EVENT_COLUMNS: &str = "id, container_pk, container_name, container_id, event_type, \
    severity, message, ts, old_image, new_image, old_image_id, new_image_id, reason, \
    details, exit_code";

const ALERT_COLUMNS: &str = "id, container_pk, container_name, container_id, alert_type, \
    severity, message, ts, old_image, new_image, old_image_id, new_image_id, reason, \
    details, exit_code";

pub struct Store {
    conn: Mutex<Connection>,
    containers: RwLock<HashMap<String, Container>>,
}

impl Store {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            containers: RwLock::new(HashMap::new()),
        }
    }

    /// Hydrate the cache from the containers table, then repair event and
    /// alert rows whose surrogate pointer disagrees with the container that
    /// currently owns their name. Engine container-ids rotate on recreate,
    /// so rows inserted under a stale mapping are healed here.
    pub fn load(&self) -> Result<(), StoreError> {
        let mut cache = self.containers.write().expect("container cache lock poisoned");
        let conn = self.conn.lock().expect("store connection lock poisoned");

        cache.clear();
        {
            let mut stmt = conn.prepare(&format!("SELECT {CONTAINER_COLUMNS} FROM containers"))?;
            let rows = stmt
                .query_map([], ContainerRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for row in rows {
                let container = row.into_container()?;
                cache.insert(container.name.clone(), container);
            }
        }

        let repaired_events = conn.execute(
            "UPDATE events SET container_pk = \
                 (SELECT c.id FROM containers c WHERE c.name = events.container_name) \
             WHERE EXISTS (SELECT 1 FROM containers c \
                 WHERE c.name = events.container_name AND c.id <> events.container_pk)",
            [],
        )?;
        let repaired_alerts = conn.execute(
            "UPDATE alerts SET container_pk = \
                 (SELECT c.id FROM containers c WHERE c.name = alerts.container_name) \
             WHERE EXISTS (SELECT 1 FROM containers c \
                 WHERE c.name = alerts.container_name AND c.id <> alerts.container_pk)",
            [],
        )?;
        if repaired_events > 0 || repaired_alerts > 0 {
            log::info!(
                "repaired {} event and {} alert container associations",
                repaired_events,
                repaired_alerts
            );
        }
        Ok(())
    }

    /// Present containers only, in no particular order.
    pub fn list_containers(&self) -> Vec<Container> {
        let cache = self.containers.read().expect("container cache lock poisoned");
        cache.values().filter(|c| c.present).cloned().collect()
    }

    pub fn container_names(&self) -> Vec<String> {
        let cache = self.containers.read().expect("container cache lock poisoned");
        let mut names: Vec<String> = cache
            .values()
            .filter(|c| c.present)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn get_container(&self, name: &str) -> Option<Container> {
        let cache = self.containers.read().expect("container cache lock poisoned");
        cache.get(name).cloned()
    }

    /// Cache-only lookup by engine container id.
    pub fn find_container_by_id(&self, container_id: &str) -> Option<Container> {
        if container_id.is_empty() {
            return None;
        }
        let cache = self.containers.read().expect("container cache lock poisoned");
        cache
            .values()
            .find(|c| c.container_id == container_id)
            .cloned()
    }

    /// Lookup by engine container id, falling back to the database and
    /// refilling the cache on a hit.
    pub fn get_container_by_container_id(
        &self,
        container_id: &str,
    ) -> Result<Option<Container>, StoreError> {
        if container_id.is_empty() {
            return Ok(None);
        }
        if let Some(hit) = self.find_container_by_id(container_id) {
            return Ok(Some(hit));
        }

        let row = {
            let conn = self.conn.lock().expect("store connection lock poisoned");
            conn.query_row(
                &format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE container_id = ?1"),
                [container_id],
                ContainerRow::from_row,
            )
            .optional()?
        };
        let Some(row) = row else {
            return Ok(None);
        };
        let container = row.into_container()?;
        let mut cache = self.containers.write().expect("container cache lock poisoned");
        cache.insert(container.name.clone(), container.clone());
        Ok(Some(container))
    }

    /// Insert-or-update by name. Retains the earliest registration and the
    /// latest event pointer when the incoming row leaves them unset, forces
    /// `present`, and returns the stable surrogate id. The row and the
    /// cache entry change under the same write lock.
    pub fn upsert_container(&self, mut c: Container) -> Result<i64, StoreError> {
        let mut cache = self.containers.write().expect("container cache lock poisoned");
        let conn = self.conn.lock().expect("store connection lock poisoned");

        let now = Utc::now();
        if c.registered_at.is_none() {
            if let Some(existing) = cache.get(&c.name).and_then(|e| e.registered_at) {
                c.registered_at = Some(existing);
            } else if let Some(created) = c.created_at.filter(|t| *t < now) {
                c.registered_at = Some(created);
            } else {
                c.registered_at = Some(now);
            }
        }
        if c.started_at.is_none() {
            c.started_at = cache.get(&c.name).and_then(|e| e.started_at);
        }
        if c.last_event_id == 0 {
            if let Some(existing) = cache.get(&c.name) {
                if existing.last_event_id > 0 {
                    c.last_event_id = existing.last_event_id;
                }
            }
        }
        c.present = true;

        let caps_json = serde_json::to_string(&c.caps)?;
        let healthcheck_json = c
            .healthcheck
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let id: i64 = conn.query_row(
            "INSERT INTO containers (name, container_id, image, image_tag, image_id, \
                 created_at_container, registered_at, started_at, status, role, caps, \
                 read_only, no_new_privileges, user, last_event_id, updated_at, present, \
                 health_status, health_failing_streak, unhealthy_since, restart_loop, \
                 restart_streak, restart_loop_since, healthcheck) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24) \
             ON CONFLICT(name) DO UPDATE SET \
                 container_id = excluded.container_id, \
                 image = excluded.image, \
                 image_tag = excluded.image_tag, \
                 image_id = excluded.image_id, \
                 created_at_container = excluded.created_at_container, \
                 registered_at = excluded.registered_at, \
                 started_at = excluded.started_at, \
                 status = excluded.status, \
                 role = excluded.role, \
                 caps = excluded.caps, \
                 read_only = excluded.read_only, \
                 no_new_privileges = excluded.no_new_privileges, \
                 user = excluded.user, \
                 last_event_id = excluded.last_event_id, \
                 updated_at = excluded.updated_at, \
                 present = excluded.present, \
                 health_status = excluded.health_status, \
                 health_failing_streak = excluded.health_failing_streak, \
                 unhealthy_since = excluded.unhealthy_since, \
                 restart_loop = excluded.restart_loop, \
                 restart_streak = excluded.restart_streak, \
                 restart_loop_since = excluded.restart_loop_since, \
                 healthcheck = excluded.healthcheck \
             RETURNING id",
            params![
                c.name,
                c.container_id,
                c.image,
                c.image_tag,
                c.image_id,
                format_time(c.created_at),
                format_time(c.registered_at),
                format_time(c.started_at),
                c.status.as_ref(),
                c.role.as_ref(),
                caps_json,
                c.read_only as i64,
                c.no_new_privileges as i64,
                c.user,
                null_id(c.last_event_id),
                format_time(c.updated_at),
                1i64,
                c.health_status.as_ref(),
                c.health_failing_streak,
                format_time(c.unhealthy_since),
                c.restart_loop as i64,
                c.restart_streak,
                format_time(c.restart_loop_since),
                healthcheck_json,
            ],
            |row| row.get(0),
        )?;

        c.id = id;
        cache.insert(c.name.clone(), c);
        Ok(id)
    }

    /// Append an event; moves the owning container's `last_event_id` and
    /// `updated_at` in the same logical write.
    pub fn add_event(&self, e: &Event) -> Result<i64, StoreError> {
        let mut cache = self.containers.write().expect("container cache lock poisoned");
        let conn = self.conn.lock().expect("store connection lock poisoned");

        conn.execute(
            "INSERT INTO events (container_pk, container_name, container_id, event_type, \
                 severity, message, ts, old_image, new_image, old_image_id, new_image_id, \
                 reason, details, exit_code) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                e.container_pk,
                e.container,
                e.container_id,
                e.event_type,
                e.severity.as_ref(),
                e.message,
                format_ts(e.timestamp),
                e.old_image,
                e.new_image,
                e.old_image_id,
                e.new_image_id,
                e.reason,
                e.details,
                e.exit_code,
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE containers SET last_event_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![id, format_ts(e.timestamp), e.container_pk],
        )?;
        if let Some(c) = cache.get_mut(&e.container) {
            c.last_event_id = id;
            c.updated_at = Some(e.timestamp);
        }
        Ok(id)
    }

    pub fn add_alert(&self, a: &Alert) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("store connection lock poisoned");
        conn.execute(
            "INSERT INTO alerts (container_pk, container_name, container_id, alert_type, \
                 severity, message, ts, old_image, new_image, old_image_id, new_image_id, \
                 reason, details, exit_code) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                a.container_pk,
                a.container,
                a.container_id,
                a.alert_type,
                a.severity.as_ref(),
                a.message,
                format_ts(a.timestamp),
                a.old_image,
                a.new_image,
                a.old_image_id,
                a.new_image_id,
                a.reason,
                a.details,
                a.exit_code,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_events(
        &self,
        container: &str,
        before_id: i64,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let Some(info) = self.get_container(container) else {
            return Ok(Vec::new());
        };
        let (before_id, limit) = page_cursor(before_id, limit);
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE container_pk = ?1 AND id < ?2 ORDER BY id DESC LIMIT ?3"
        ))?;
        let items = stmt
            .query_map(params![info.id, before_id, limit], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn list_all_events(&self, before_id: i64, limit: i64) -> Result<Vec<Event>, StoreError> {
        let (before_id, limit) = page_cursor(before_id, limit);
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id < ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let items = stmt
            .query_map(params![before_id, limit], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn list_all_alerts(&self, before_id: i64, limit: i64) -> Result<Vec<Alert>, StoreError> {
        let (before_id, limit) = page_cursor(before_id, limit);
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE id < ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let items = stmt
            .query_map(params![before_id, limit], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn count_events_by_container(&self, container: &str) -> Result<i64, StoreError> {
        let Some(info) = self.get_container(container) else {
            return Ok(0);
        };
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let total = conn.query_row(
            "SELECT COUNT(1) FROM events WHERE container_pk = ?1",
            [info.id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn count_all_events(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let total = conn.query_row("SELECT COUNT(1) FROM events", [], |row| row.get(0))?;
        Ok(total)
    }

    pub fn count_all_alerts(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let total = conn.query_row("SELECT COUNT(1) FROM alerts", [], |row| row.get(0))?;
        Ok(total)
    }

    /// Timestamp of the latest `restart` event for a container, consumed by
    /// the heal scanner.
    pub fn latest_restart_timestamp(
        &self,
        container_pk: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let ts: Option<String> = conn
            .query_row(
                "SELECT ts FROM events \
                 WHERE container_pk = ?1 AND event_type = 'restart' \
                 ORDER BY id DESC LIMIT 1",
                [container_pk],
                |row| row.get(0),
            )
            .optional()?;
        Ok(parse_time(ts.as_deref()))
    }

    /// Most recent `restart_loop` / `restart_healed` alert, consumed by the
    /// startup reconciliation to restore loop flags.
    pub fn latest_restart_loop_alert(
        &self,
        container_pk: i64,
    ) -> Result<Option<Alert>, StoreError> {
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let alert = conn
            .query_row(
                &format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts \
                     WHERE container_pk = ?1 AND alert_type IN ('restart_loop', 'restart_healed') \
                     ORDER BY id DESC LIMIT 1"
                ),
                [container_pk],
                alert_from_row,
            )
            .optional()?;
        Ok(alert)
    }

    pub fn set_container_present(&self, name: &str, present: bool) -> Result<(), StoreError> {
        if name.is_empty() {
            return Ok(());
        }
        let mut cache = self.containers.write().expect("container cache lock poisoned");
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let now = Utc::now();
        conn.execute(
            "UPDATE containers SET present = ?1, updated_at = ?2 WHERE name = ?3",
            params![present as i64, format_ts(now), name],
        )?;
        if let Some(c) = cache.get_mut(name) {
            c.present = present;
            c.updated_at = Some(now);
        }
        Ok(())
    }

    /// Flip every tracked container not named in `present_names` to absent
    /// and resurrect any named one previously marked absent.
    pub fn mark_absent_except(&self, present_names: &HashSet<String>) -> Result<(), StoreError> {
        let mut cache = self.containers.write().expect("container cache lock poisoned");
        let conn = self.conn.lock().expect("store connection lock poisoned");
        let now = Utc::now();
        for c in cache.values_mut() {
            let should_be_present = present_names.contains(&c.name);
            if c.present == should_be_present {
                continue;
            }
            c.present = should_be_present;
            c.updated_at = Some(now);
            conn.execute(
                "UPDATE containers SET present = ?1, updated_at = ?2 WHERE name = ?3",
                params![should_be_present as i64, format_ts(now), c.name],
            )?;
        }
        Ok(())
    }

    /// Apply an engine rename. When the new name is already tracked (a
    /// collision with a logically-replaced container), historical events and
    /// alerts move to the surviving surrogate id and the old row goes
    /// absent; otherwise the row is renamed in place.
    pub fn rename_container(
        &self,
        old_name: &str,
        new_name: &str,
        mut info: Container,
    ) -> Result<(), StoreError> {
        if old_name.is_empty() || new_name.is_empty() || old_name == new_name {
            return Ok(());
        }
        let mut cache = self.containers.write().expect("container cache lock poisoned");
        let conn = self.conn.lock().expect("store connection lock poisoned");

        let old = match cache.get(old_name) {
            Some(c) => c.clone(),
            None => {
                let by_id = (!info.container_id.is_empty())
                    .then(|| {
                        cache
                            .values()
                            .find(|c| c.container_id == info.container_id)
                            .cloned()
                    })
                    .flatten();
                match by_id {
                    Some(c) => c,
                    None => return Ok(()),
                }
            }
        };
        let old_key = old.name.clone();

        info.name = new_name.to_string();
        if info.registered_at.is_none() {
            info.registered_at = old.registered_at;
        }
        if info.started_at.is_none() {
            info.started_at = old.started_at;
        }
        if info.last_event_id == 0 {
            info.last_event_id = old.last_event_id;
        }
        info.present = true;

        let caps_json = serde_json::to_string(&info.caps)?;
        let healthcheck_json = info
            .healthcheck
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now();

        match cache.get(new_name).cloned() {
            None => {
                conn.execute(
                    "UPDATE containers SET name = ?1, container_id = ?2, image = ?3, \
                         image_tag = ?4, image_id = ?5, created_at_container = ?6, \
                         registered_at = ?7, started_at = ?8, status = ?9, role = ?10, \
                         caps = ?11, read_only = ?12, no_new_privileges = ?13, user = ?14, \
                         last_event_id = ?15, updated_at = ?16, present = 1, \
                         health_status = ?17, health_failing_streak = ?18, \
                         unhealthy_since = ?19, restart_loop = ?20, restart_streak = ?21, \
                         restart_loop_since = ?22, healthcheck = ?23 \
                     WHERE name = ?24",
                    params![
                        new_name,
                        info.container_id,
                        info.image,
                        info.image_tag,
                        info.image_id,
                        format_time(info.created_at),
                        format_time(info.registered_at),
                        format_time(info.started_at),
                        info.status.as_ref(),
                        info.role.as_ref(),
                        caps_json,
                        info.read_only as i64,
                        info.no_new_privileges as i64,
                        info.user,
                        null_id(info.last_event_id),
                        format_time(info.updated_at),
                        info.health_status.as_ref(),
                        info.health_failing_streak,
                        format_time(info.unhealthy_since),
                        info.restart_loop as i64,
                        info.restart_streak,
                        format_time(info.restart_loop_since),
                        healthcheck_json,
                        old_key,
                    ],
                )?;
                conn.execute(
                    "UPDATE events SET container_name = ?1 WHERE container_pk = ?2",
                    params![new_name, old.id],
                )?;
                conn.execute(
                    "UPDATE alerts SET container_name = ?1 WHERE container_pk = ?2",
                    params![new_name, old.id],
                )?;
                cache.remove(&old_key);
                info.id = old.id;
                cache.insert(new_name.to_string(), info);
            }
            Some(target) => {
                conn.execute(
                    "UPDATE events SET container_pk = ?1, container_name = ?2 \
                     WHERE container_pk = ?3",
                    params![target.id, new_name, old.id],
                )?;
                conn.execute(
                    "UPDATE alerts SET container_pk = ?1, container_name = ?2 \
                     WHERE container_pk = ?3",
                    params![target.id, new_name, old.id],
                )?;
                conn.execute(
                    "UPDATE containers SET container_id = ?1, image = ?2, image_tag = ?3, \
                         image_id = ?4, created_at_container = ?5, registered_at = ?6, \
                         started_at = ?7, status = ?8, role = ?9, caps = ?10, \
                         read_only = ?11, no_new_privileges = ?12, user = ?13, \
                         updated_at = ?14, present = 1, health_status = ?15, \
                         health_failing_streak = ?16, unhealthy_since = ?17, \
                         restart_loop = ?18, restart_streak = ?19, restart_loop_since = ?20, \
                         healthcheck = ?21 \
                     WHERE id = ?22",
                    params![
                        info.container_id,
                        info.image,
                        info.image_tag,
                        info.image_id,
                        format_time(info.created_at),
                        format_time(info.registered_at),
                        format_time(info.started_at),
                        info.status.as_ref(),
                        info.role.as_ref(),
                        caps_json,
                        info.read_only as i64,
                        info.no_new_privileges as i64,
                        info.user,
                        format_time(info.updated_at),
                        info.health_status.as_ref(),
                        info.health_failing_streak,
                        format_time(info.unhealthy_since),
                        info.restart_loop as i64,
                        info.restart_streak,
                        format_time(info.restart_loop_since),
                        healthcheck_json,
                        target.id,
                    ],
                )?;
                let latest_id: Option<i64> = conn.query_row(
                    "SELECT MAX(id) FROM events WHERE container_pk = ?1",
                    [target.id],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "UPDATE containers SET last_event_id = ?1 WHERE id = ?2",
                    params![latest_id, target.id],
                )?;
                conn.execute(
                    "UPDATE containers SET present = 0, updated_at = ?1 WHERE id = ?2",
                    params![format_ts(now), old.id],
                )?;

                info.id = target.id;
                info.last_event_id = latest_id.unwrap_or(0);
                cache.insert(new_name.to_string(), info);
                if let Some(c) = cache.get_mut(&old_key) {
                    c.present = false;
                    c.updated_at = Some(now);
                    c.last_event_id = 0;
                }
            }
        }
        Ok(())
    }
}

fn page_cursor(before_id: i64, limit: i64) -> (i64, i64) {
    let before_id = if before_id <= 0 { i64::MAX } else { before_id };
    let limit = if limit <= 0 { 50 } else { limit };
    (before_id, limit)
}

fn null_id(val: i64) -> Option<i64> {
    (val > 0).then_some(val)
}

fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_time(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(format_ts)
}

fn parse_time(val: Option<&str>) -> Option<DateTime<Utc>> {
    let val = val?.trim();
    if val.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(val)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

struct ContainerRow {
    id: i64,
    name: String,
    container_id: String,
    image: String,
    image_tag: String,
    image_id: String,
    created_at: Option<String>,
    registered_at: Option<String>,
    started_at: Option<String>,
    status: String,
    role: String,
    caps: String,
    read_only: i64,
    no_new_privileges: i64,
    user: String,
    last_event_id: Option<i64>,
    updated_at: Option<String>,
    present: i64,
    health_status: String,
    health_failing_streak: i64,
    unhealthy_since: Option<String>,
    restart_loop: i64,
    restart_streak: i64,
    restart_loop_since: Option<String>,
    healthcheck: Option<String>,
}

impl ContainerRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            container_id: row.get(2)?,
            image: row.get(3)?,
            image_tag: row.get(4)?,
            image_id: row.get(5)?,
            created_at: row.get(6)?,
            registered_at: row.get(7)?,
            started_at: row.get(8)?,
            status: row.get(9)?,
            role: row.get(10)?,
            caps: row.get(11)?,
            read_only: row.get(12)?,
            no_new_privileges: row.get(13)?,
            user: row.get(14)?,
            last_event_id: row.get(15)?,
            updated_at: row.get(16)?,
            present: row.get(17)?,
            health_status: row.get(18)?,
            health_failing_streak: row.get(19)?,
            unhealthy_since: row.get(20)?,
            restart_loop: row.get(21)?,
            restart_streak: row.get(22)?,
            restart_loop_since: row.get(23)?,
            healthcheck: row.get(24)?,
        })
    }

    fn into_container(self) -> Result<Container, StoreError> {
        let caps: Vec<String> = serde_json::from_str(&self.caps)?;
        let healthcheck = match self.healthcheck.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(serde_json::from_str(raw)?),
            _ => None,
        };
        Ok(Container {
            id: self.id,
            name: self.name,
            container_id: self.container_id,
            image: self.image,
            image_tag: self.image_tag,
            image_id: self.image_id,
            created_at: parse_time(self.created_at.as_deref()),
            registered_at: parse_time(self.registered_at.as_deref()),
            started_at: parse_time(self.started_at.as_deref()),
            status: ContainerState::parse(&self.status),
            role: Role::parse(&self.role),
            caps,
            read_only: self.read_only != 0,
            no_new_privileges: self.no_new_privileges != 0,
            user: self.user,
            last_event_id: self.last_event_id.unwrap_or(0),
            updated_at: parse_time(self.updated_at.as_deref()),
            present: self.present != 0,
            health_status: HealthStatus::parse(&self.health_status),
            health_failing_streak: self.health_failing_streak,
            unhealthy_since: parse_time(self.unhealthy_since.as_deref()),
            restart_loop: self.restart_loop != 0,
            restart_streak: self.restart_streak,
            restart_loop_since: parse_time(self.restart_loop_since.as_deref()),
            healthcheck,
        })
    }
}

fn event_from_row(row: &Row) -> rusqlite::Result<Event> {
    let severity: String = row.get(5)?;
    let ts: String = row.get(7)?;
    Ok(Event {
        id: row.get(0)?,
        container_pk: row.get(1)?,
        container: row.get(2)?,
        container_id: row.get(3)?,
        event_type: row.get(4)?,
        severity: Severity::parse(&severity),
        message: row.get(6)?,
        timestamp: parse_time(Some(&ts)).unwrap_or(DateTime::<Utc>::MIN_UTC),
        old_image: row.get(8)?,
        new_image: row.get(9)?,
        old_image_id: row.get(10)?,
        new_image_id: row.get(11)?,
        reason: row.get(12)?,
        details: row.get(13)?,
        exit_code: row.get(14)?,
    })
}

fn alert_from_row(row: &Row) -> rusqlite::Result<Alert> {
    let severity: String = row.get(5)?;
    let ts: String = row.get(7)?;
    Ok(Alert {
        id: row.get(0)?,
        container_pk: row.get(1)?,
        container: row.get(2)?,
        container_id: row.get(3)?,
        alert_type: row.get(4)?,
        severity: Severity::parse(&severity),
        message: row.get(6)?,
        timestamp: parse_time(Some(&ts)).unwrap_or(DateTime::<Utc>::MIN_UTC),
        old_image: row.get(8)?,
        new_image: row.get(9)?,
        old_image_id: row.get(10)?,
        new_image_id: row.get(11)?,
        reason: row.get(12)?,
        details: row.get(13)?,
        exit_code: row.get(14)?,
    })
}
